//! Automation rules. A rule is attached to a project, a dataset, or both;
//! every reference present on the source must be mapped.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    created_id, items_from_page, pick_fields, DestinationPayload, MigratorContext, ResourceKind,
    ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/runs/rules";

const FIELDS: &[&str] = &[
    "description",
    "rule_type",
    "filter",
    "trace_filter",
    "tree_filter",
    "evaluators",
    "code_evaluators",
    "add_to_annotation_queue_id",
    "add_to_dataset_prefer_correction",
    "use_corrections_dataset",
    "num_few_shot_examples",
    "extend_only",
    "transient",
    "backfill_from",
];

pub struct RuleMigrator {
    ctx: MigratorContext,
}

impl RuleMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

/// Rules are named by `display_name`; older payloads only carry `name`.
fn display_name(body: &Value) -> Option<String> {
    body.get("display_name")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Map an optional reference, failing if it is present but unmapped.
fn remap(
    src: &Value,
    field: &str,
    kind: ResourceKind,
    lookup: &dyn MappingLookup,
) -> Result<Option<String>> {
    match src.get(field).and_then(Value::as_str) {
        Some(source_id) => lookup.require(kind, source_id).map(Some),
        None => Ok(None),
    }
}

#[async_trait]
impl ResourceMigrator for RuleMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Rule
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let page = self
            .ctx
            .source
            .fetch_page(PATH, &[], cursor, self.ctx.config.batch_size)
            .await?;
        let mut page = items_from_page(page, cursor);
        for item in page.items.iter_mut() {
            item.name = display_name(&item.body);
        }
        Ok(page)
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        let src = &item.body;
        let session_id = remap(src, "session_id", ResourceKind::Project, lookup)?;
        let dataset_id = remap(src, "dataset_id", ResourceKind::Dataset, lookup)?;
        if session_id.is_none() && dataset_id.is_none() {
            return Err(MigrateError::Validation(format!(
                "rule {} is attached to neither a project nor a dataset",
                item.source_id
            )));
        }

        let mut body = pick_fields(src, FIELDS);
        body.insert(
            "display_name".into(),
            json!(item.name.clone().unwrap_or_else(|| format!("Rule {}", item.source_id))),
        );
        body.insert(
            "sampling_rate".into(),
            src.get("sampling_rate").filter(|v| !v.is_null()).cloned().unwrap_or(json!(1.0)),
        );
        body.insert(
            "is_enabled".into(),
            src.get("is_enabled")
                .or_else(|| src.get("enabled"))
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or(json!(true)),
        );
        if let Some(id) = session_id {
            body.insert("session_id".into(), json!(id));
        }
        if let Some(id) = dataset_id {
            body.insert("dataset_id".into(), json!(id));
        }
        Ok(DestinationPayload::new(item, Value::Object(body)))
    }

    async fn load(&self, payload: &DestinationPayload) -> Result<String> {
        let response = self
            .ctx
            .destination
            .send_once(&ApiRequest::post_json(PATH, payload.body.clone()))
            .await?;
        created_id(&response, PATH)
    }

    /// A rule with the same display name attached to the same project and dataset.
    async fn find_existing(&self, payload: &DestinationPayload) -> Result<Option<String>> {
        let Some(name) = payload.name.as_deref() else {
            return Ok(None);
        };
        let same_target = |rule: &Value| {
            display_name(rule).as_deref() == Some(name)
                && rule.get("session_id") == payload.body.get("session_id")
                && rule.get("dataset_id") == payload.body.get("dataset_id")
        };

        let mut cursor = None;
        loop {
            let page = self
                .ctx
                .destination
                .fetch_page(PATH, &[], cursor.as_ref(), self.ctx.config.batch_size)
                .await?;
            if let Some(found) = page.items.iter().find(|r| same_target(r)) {
                return Ok(found.get("id").and_then(Value::as_str).map(String::from));
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn update(&self, destination_id: &str, payload: &DestinationPayload) -> Result<()> {
        self.ctx
            .destination
            .send_once(&ApiRequest::patch_json(
                format!("{}/{}", PATH, destination_id),
                payload.body.clone(),
            ))
            .await?;
        Ok(())
    }
}
