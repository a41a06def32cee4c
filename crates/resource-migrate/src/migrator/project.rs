//! Tracing projects (`/sessions` on the wire).

use async_trait::async_trait;
use serde_json::Value;

use super::{
    created_id, find_by_name, items_from_page, pick_fields, DestinationPayload, MigratorContext,
    ResourceKind, ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/sessions";

const FIELDS: &[&str] = &[
    "name",
    "description",
    "metadata",
    "start_time",
    "end_time",
    "extra",
];

/// Experiments share the `/sessions` listing with tracing projects.
pub(crate) fn is_experiment(body: &Value) -> bool {
    body.get("reference_dataset_id").map_or(false, |v| !v.is_null())
}

pub struct ProjectMigrator {
    ctx: MigratorContext,
}

impl ProjectMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceMigrator for ProjectMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Project
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let page = self
            .ctx
            .source
            .fetch_page(PATH, &[], cursor, self.ctx.config.batch_size)
            .await?;
        let mut page = items_from_page(page, cursor);
        // Sessions that reference a dataset are experiments, migrated as their own kind
        page.items.retain(|item| !is_experiment(&item.body));
        Ok(page)
    }

    fn transform(&self, item: &SourceItem, _lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        if item.name.is_none() {
            return Err(MigrateError::Validation(format!(
                "project {} has no name",
                item.source_id
            )));
        }
        let body = pick_fields(&item.body, FIELDS);
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

    async fn find_existing(&self, payload: &DestinationPayload) -> Result<Option<String>> {
        find_by_name(&self.ctx.destination, PATH, payload.name.as_deref()).await
    }

    async fn update(&self, destination_id: &str, payload: &DestinationPayload) -> Result<()> {
        let path = format!("{}/{}", PATH, destination_id);
        self.ctx
            .destination
            .send_once(&ApiRequest::patch_json(path, payload.body.clone()))
            .await?;
        Ok(())
    }
}
