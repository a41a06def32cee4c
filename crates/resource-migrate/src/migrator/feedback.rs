//! Feedback on experiment runs, listed per mapped experiment.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::walk::{ChildListing, ParentWalk};
use super::{
    created_id, pick_fields, DestinationPayload, MigratorContext, ResourceKind, ResourceMigrator,
    SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/feedback";

const FIELDS: &[&str] = &["score", "value", "comment", "correction", "feedback_source"];

const LISTING: ChildListing<'static> = ChildListing {
    path: PATH,
    parent_param: "session",
    parent_field: "session_id",
    extra_query: &[],
};

pub struct FeedbackMigrator {
    ctx: MigratorContext,
}

impl FeedbackMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceMigrator for FeedbackMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Feedback
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let mut page = ParentWalk::new(&self.ctx.registry, ResourceKind::Experiment)
            .fetch_offset_page(&self.ctx.source, &LISTING, cursor, self.ctx.config.batch_size)
            .await?;
        for item in page.items.iter_mut() {
            item.name = item.body.get("key").and_then(Value::as_str).map(String::from);
        }
        Ok(page)
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        let Some(key) = &item.name else {
            return Err(MigrateError::Validation(format!(
                "feedback {} has no key",
                item.source_id
            )));
        };
        let src = &item.body;
        let mut body = pick_fields(src, FIELDS);
        body.insert("key".into(), json!(key));
        if let Some(run) = src.get("run_id").and_then(Value::as_str) {
            body.insert("run_id".into(), json!(lookup.require(ResourceKind::Run, run)?));
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

    /// Feedback has no natural key on the destination.
    async fn find_existing(&self, _payload: &DestinationPayload) -> Result<Option<String>> {
        Ok(None)
    }

    async fn update(&self, destination_id: &str, payload: &DestinationPayload) -> Result<()> {
        let patch = pick_fields(&payload.body, &["score", "value", "comment", "correction"]);
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

#[cfg(test)]
mod tests {
    use super::super::testing::{context, map, serve};
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};

    #[test]
    fn test_transform_remaps_run() {
        let ctx = context("http://127.0.0.1:9");
        map(&ctx, ResourceKind::Run, "r-1", "r-1");
        let migrator = FeedbackMigrator::new(ctx.clone());
        let mut item = SourceItem::from_value(json!({
            "id": "f-1",
            "key": "correctness",
            "score": 1,
            "comment": null,
            "run_id": "r-1",
        }))
        .unwrap();
        item.name = Some("correctness".into());

        let payload = migrator.transform(&item, ctx.registry.as_ref()).unwrap();
        assert_eq!(payload.body, json!({"key": "correctness", "score": 1, "run_id": "r-1"}));

        item.body["run_id"] = json!("r-404");
        assert!(matches!(
            migrator.transform(&item, ctx.registry.as_ref()),
            Err(MigrateError::DependencyUnresolved { kind: ResourceKind::Run, .. })
        ));

        item.name = None;
        assert!(matches!(
            migrator.transform(&item, ctx.registry.as_ref()),
            Err(MigrateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_lists_feedback_per_experiment() {
        let app = Router::new().route(
            "/api/v1/feedback",
            get(|Query(q): Query<Vec<(String, String)>>| async move {
                let session = q
                    .iter()
                    .find(|(k, _)| k == "session")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                Json(json!({"feedback": [{"id": format!("f-{}", session), "key": "helpful"}]}))
            }),
        );
        let base = serve(app).await;
        let ctx = context(&base);
        map(&ctx, ResourceKind::Experiment, "x-1", "new-x-1");
        let migrator = FeedbackMigrator::new(ctx);

        let page = migrator.extract_page(None).await.unwrap();
        assert_eq!(page.items[0].source_id, "f-x-1");
        assert_eq!(page.items[0].name.as_deref(), Some("helpful"));
        assert_eq!(page.items[0].body["session_id"], "x-1");
        assert!(page.is_last());
    }
}
