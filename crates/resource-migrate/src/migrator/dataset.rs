//! Datasets. Examples are migrated separately by [`super::ExampleMigrator`].

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    created_id, find_by_name, items_from_page, pick_fields, DestinationPayload, MigratorContext,
    ResourceKind, ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, Page};

const PATH: &str = "/datasets";

const FIELDS: &[&str] = &[
    "name",
    "created_at",
    "inputs_schema_definition",
    "outputs_schema_definition",
];

pub struct DatasetMigrator {
    ctx: MigratorContext,
}

impl DatasetMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ResourceMigrator for DatasetMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Dataset
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let page = self
            .ctx
            .source
            .fetch_page(PATH, &[], cursor, self.ctx.config.batch_size)
            .await?;
        Ok(items_from_page(page, cursor))
    }

    fn transform(&self, item: &SourceItem, _lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        if item.name.is_none() {
            return Err(MigrateError::Validation(format!(
                "dataset {} has no name",
                item.source_id
            )));
        }
        let src = &item.body;
        let mut body = pick_fields(src, FIELDS);
        body.insert(
            "description".into(),
            src.get("description").filter(|v| !v.is_null()).cloned().unwrap_or(json!("")),
        );
        body.insert(
            "externally_managed".into(),
            src.get("externally_managed").cloned().unwrap_or(json!(false)),
        );
        body.insert(
            "transformations".into(),
            src.get("transformations").filter(|v| !v.is_null()).cloned().unwrap_or(json!([])),
        );
        body.insert(
            "data_type".into(),
            src.get("data_type").filter(|v| !v.is_null()).cloned().unwrap_or(json!("kv")),
        );
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

    /// Only name and description can change after creation.
    async fn update(&self, destination_id: &str, payload: &DestinationPayload) -> Result<()> {
        let patch = pick_fields(&payload.body, &["name", "description"]);
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
    use super::super::testing::{context, serve};
    use super::*;
    use crate::mapping::IdMappingRegistry;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, patch};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_transform_fills_defaults() {
        let migrator = DatasetMigrator::new(context("http://127.0.0.1:9"));
        let item = SourceItem::from_value(json!({
            "id": "d-1",
            "name": "qa-pairs",
            "description": null,
            "example_count": 12,
        }))
        .unwrap();

        let body = migrator
            .transform(&item, &IdMappingRegistry::new())
            .unwrap()
            .body;
        assert_eq!(body["description"], "");
        assert_eq!(body["data_type"], "kv");
        assert_eq!(body["externally_managed"], false);
        assert_eq!(body["transformations"], json!([]));
        assert!(body.get("example_count").is_none());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let migrator = DatasetMigrator::new(context("http://127.0.0.1:9"));
        let registry = IdMappingRegistry::new();
        let a = SourceItem::from_value(json!({"id": "d-1", "name": "x", "description": "one"})).unwrap();
        let b = SourceItem::from_value(json!({"id": "d-1", "name": "x", "description": "two"})).unwrap();
        let fa = migrator.transform(&a, &registry).unwrap().fingerprint;
        let fa2 = migrator.transform(&a, &registry).unwrap().fingerprint;
        let fb = migrator.transform(&b, &registry).unwrap().fingerprint;
        assert_eq!(fa, fa2);
        assert_ne!(fa, fb);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_conflict() {
        let app = Router::new().route(
            "/api/v1/datasets",
            get(|| async { Json(json!([])) }).post(|| async {
                (StatusCode::CONFLICT, Json(json!({"detail": "Dataset already exists"})))
            }),
        );
        let base = serve(app).await;
        let migrator = DatasetMigrator::new(context(&base));
        let item = SourceItem::from_value(json!({"id": "d-1", "name": "qa"})).unwrap();
        let payload = migrator.transform(&item, &IdMappingRegistry::new()).unwrap();

        let err = migrator.load(&payload).await.unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(ref m) if m.contains("already exists")));
    }

    #[tokio::test]
    async fn test_update_patches_name_and_description() {
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let sink = seen.clone();
        let app = Router::new().route(
            "/api/v1/datasets/:id",
            patch(move |Path(id): Path<String>, Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((id, body));
                    Json(json!({}))
                }
            }),
        );
        let base = serve(app).await;
        let migrator = DatasetMigrator::new(context(&base));
        let item = SourceItem::from_value(json!({"id": "d-1", "name": "qa", "description": "new"})).unwrap();
        let payload = migrator.transform(&item, &IdMappingRegistry::new()).unwrap();

        migrator.update("dest-1", &payload).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "dest-1");
        assert_eq!(seen[0].1, json!({"name": "qa", "description": "new"}));
    }
}
