//! Annotation queues. The default dataset reference is optional: when the
//! dataset was not migrated the queue is created without one.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    created_id, find_by_name, items_from_page, pick_fields, DestinationPayload, MigratorContext,
    ResourceKind, ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/annotation-queues";

const FIELDS: &[&str] = &[
    "name",
    "description",
    "created_at",
    "updated_at",
    "rubric_instructions",
];

pub struct AnnotationQueueMigrator {
    ctx: MigratorContext,
}

impl AnnotationQueueMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceMigrator for AnnotationQueueMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::AnnotationQueue
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let page = self
            .ctx
            .source
            .fetch_page(PATH, &[], cursor, self.ctx.config.batch_size)
            .await?;
        Ok(items_from_page(page, cursor))
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        if item.name.is_none() {
            return Err(MigrateError::Validation(format!(
                "annotation queue {} has no name",
                item.source_id
            )));
        }
        let src = &item.body;
        let mut body = pick_fields(src, FIELDS);

        let default_dataset = src
            .get("default_dataset")
            .and_then(Value::as_str)
            .and_then(|dataset| {
                let mapped = lookup.lookup(ResourceKind::Dataset, dataset);
                if mapped.is_none() {
                    debug!(
                        "Annotation queue {}: default dataset {} not migrated, dropping reference",
                        item.source_id, dataset
                    );
                }
                mapped
            });
        body.insert("default_dataset".into(), json!(default_dataset));
        body.insert(
            "num_reviewers_per_item".into(),
            src.get("num_reviewers_per_item").filter(|v| !v.is_null()).cloned().unwrap_or(json!(1)),
        );
        body.insert(
            "enable_reservations".into(),
            src.get("enable_reservations").cloned().unwrap_or(json!(false)),
        );
        body.insert(
            "reservation_minutes".into(),
            src.get("reservation_minutes").filter(|v| !v.is_null()).cloned().unwrap_or(json!(60)),
        );
        body.insert(
            "rubric_items".into(),
            src.get("rubric_items").filter(|v| !v.is_null()).cloned().unwrap_or(json!([])),
        );
        // Queue contents (runs) are not migrated
        body.insert("session_ids".into(), json!([]));

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
        let mut patch = payload.body.clone();
        if let Some(fields) = patch.as_object_mut() {
            fields.remove("session_ids");
            fields.remove("created_at");
        }
        self.ctx
            .destination
            .send_once(&ApiRequest::patch_json(
                format!("{}/{}", PATH, destination_id),
                patch,
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, map};
    use super::*;

    fn queue(default_dataset: Option<&str>) -> SourceItem {
        SourceItem::from_value(json!({
            "id": "q-1",
            "name": "triage",
            "default_dataset": default_dataset,
            "rubric_items": [{"feedback_key": "correct"}],
            "enable_reservations": true,
        }))
        .unwrap()
    }

    #[test]
    fn test_default_dataset_is_remapped() {
        let ctx = context("http://127.0.0.1:9");
        map(&ctx, ResourceKind::Dataset, "d-1", "new-d-1");
        let migrator = AnnotationQueueMigrator::new(ctx.clone());

        let body = migrator
            .transform(&queue(Some("d-1")), ctx.registry.as_ref())
            .unwrap()
            .body;
        assert_eq!(body["default_dataset"], "new-d-1");
        assert_eq!(body["num_reviewers_per_item"], 1);
        assert_eq!(body["reservation_minutes"], 60);
        assert_eq!(body["enable_reservations"], true);
        assert_eq!(body["rubric_items"][0]["feedback_key"], "correct");
    }

    #[test]
    fn test_unmapped_default_dataset_is_dropped() {
        let ctx = context("http://127.0.0.1:9");
        let migrator = AnnotationQueueMigrator::new(ctx.clone());

        let payload = migrator
            .transform(&queue(Some("d-gone")), ctx.registry.as_ref())
            .unwrap();
        assert!(payload.body["default_dataset"].is_null());

        let payload = migrator.transform(&queue(None), ctx.registry.as_ref()).unwrap();
        assert!(payload.body["default_dataset"].is_null());
    }
}
