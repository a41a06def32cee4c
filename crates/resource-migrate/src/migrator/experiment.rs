//! Experiments: sessions that reference a dataset, listed per mapped dataset.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::walk::{ChildListing, ParentWalk};
use super::{
    created_id, find_by_name, pick_fields, DestinationPayload, MigratorContext, ResourceKind,
    ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/sessions";

const FIELDS: &[&str] = &["name", "description", "start_time", "end_time", "extra", "trace_tier"];

const LISTING: ChildListing<'static> = ChildListing {
    path: PATH,
    parent_param: "reference_dataset",
    parent_field: "reference_dataset_id",
    extra_query: &[],
};

pub struct ExperimentMigrator {
    ctx: MigratorContext,
}

impl ExperimentMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceMigrator for ExperimentMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Experiment
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        ParentWalk::new(&self.ctx.registry, ResourceKind::Dataset)
            .fetch_offset_page(&self.ctx.source, &LISTING, cursor, self.ctx.config.batch_size)
            .await
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        if item.name.is_none() {
            return Err(MigrateError::Validation(format!(
                "experiment {} has no name",
                item.source_id
            )));
        }
        let src = &item.body;
        let source_dataset = src
            .get("reference_dataset_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MigrateError::Validation(format!(
                    "experiment {} references no dataset",
                    item.source_id
                ))
            })?;
        let dataset_id = lookup.require(ResourceKind::Dataset, source_dataset)?;

        let mut body = pick_fields(src, FIELDS);
        body.insert("reference_dataset_id".into(), json!(dataset_id));
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
        let patch = pick_fields(&payload.body, &["name", "description", "end_time", "extra"]);
        self.ctx
            .destination
            .send_once(&ApiRequest::patch_json(
                format!("{}/{}", PATH, destination_id),
                Value::Object(patch),
            ))
            .await?;
        Ok(())
    }
}
