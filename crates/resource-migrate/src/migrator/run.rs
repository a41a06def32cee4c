//! Experiment runs.
//!
//! Runs keep their source ids on the destination, so trace ids and dotted
//! orders stay valid. A child run names its parent through `parent_run_id`
//! and is ordered after it by `dotted_order`.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::walk::ParentWalk;
use super::{
    pick_fields, DestinationPayload, MigratorContext, ResourceKind, ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{extract_items, ApiRequest, Cursor, Page};

const QUERY_PATH: &str = "/runs/query";
const BATCH_PATH: &str = "/runs/batch";

const FIELDS: &[&str] = &[
    "name",
    "run_type",
    "inputs",
    "outputs",
    "start_time",
    "end_time",
    "extra",
    "error",
    "trace_id",
    "dotted_order",
];

pub struct RunMigrator {
    ctx: MigratorContext,
}

impl RunMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        Self { ctx }
    }
}

fn run_item(raw: Value, position: String) -> SourceItem {
    let mut item = SourceItem::from_listing(raw, position);
    if let Some(order) = item.body.get("dotted_order").and_then(Value::as_str) {
        item.order_key = order.to_string();
    }
    let parent = item
        .body
        .get("parent_run_id")
        .and_then(Value::as_str)
        .map(String::from);
    match parent {
        Some(parent) => {
            let order_key = item.order_key.clone();
            item.with_parent(parent, order_key)
        }
        None => item,
    }
}

#[async_trait]
impl ResourceMigrator for RunMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Run
    }

    /// `POST /runs/query` per mapped experiment; the inner cursor is the
    /// server's opaque `cursors.next`.
    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        let walk = ParentWalk::new(&self.ctx.registry, ResourceKind::Experiment);
        let Some(at) = walk.position(cursor) else {
            return Ok(Page::last(Vec::new()));
        };

        let mut query = json!({
            "session": [at.parent],
            "limit": self.ctx.config.batch_size,
        });
        if let Some(inner) = &at.inner {
            query["cursor"] = json!(inner.as_str());
        }
        let response = self
            .ctx
            .source
            .send(&ApiRequest::post_json(QUERY_PATH, query))
            .await?;

        let next = response
            .get("cursors")
            .and_then(|c| c.get("next"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Cursor::new);
        let page_start = at.inner.as_ref().map(Cursor::to_string).unwrap_or_default();
        let items = extract_items(response)
            .into_iter()
            .enumerate()
            .map(|(i, raw)| run_item(raw, format!("{}/{}+{}", at.parent, page_start, i)))
            .collect();

        Ok(Page {
            items,
            next_cursor: walk.next(&at, next),
        })
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        let src = &item.body;
        if item.name.is_none() || src.get("run_type").map_or(true, Value::is_null) {
            return Err(MigrateError::Validation(format!(
                "run {} needs a name and a run_type",
                item.source_id
            )));
        }
        let experiment = src
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MigrateError::Validation(format!("run {} belongs to no experiment", item.source_id))
            })?;

        let mut body = pick_fields(src, FIELDS);
        body.insert("id".into(), json!(item.source_id));
        body.insert(
            "session_id".into(),
            json!(lookup.require(ResourceKind::Experiment, experiment)?),
        );
        if let Some(parent) = &item.parent_id {
            body.insert(
                "parent_run_id".into(),
                json!(lookup.require(ResourceKind::Run, parent)?),
            );
        }
        // Examples that were not migrated leave the run unlinked
        if let Some(example) = src
            .get("reference_example_id")
            .and_then(Value::as_str)
            .and_then(|id| lookup.lookup(ResourceKind::Example, id))
        {
            body.insert("reference_example_id".into(), json!(example));
        }
        for (field, default) in [("serialized", json!({})), ("events", json!([])), ("tags", json!([]))] {
            body.insert(
                field.into(),
                src.get(field).filter(|v| !v.is_null()).cloned().unwrap_or(default),
            );
        }
        Ok(DestinationPayload::new(item, Value::Object(body)))
    }

    async fn load(&self, payload: &DestinationPayload) -> Result<String> {
        self.ctx
            .destination
            .send_once(&ApiRequest::post_json(
                BATCH_PATH,
                json!({ "post": [payload.body.clone()] }),
            ))
            .await?;
        Ok(payload.source_id.clone())
    }

    async fn find_existing(&self, payload: &DestinationPayload) -> Result<Option<String>> {
        let path = format!("/runs/{}", payload.source_id);
        match self.ctx.destination.send_once(&ApiRequest::get(path)).await {
            Ok(_) => Ok(Some(payload.source_id.clone())),
            Err(MigrateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, map, serve};
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    fn run(id: &str, parent: Option<&str>, dotted: &str) -> Value {
        json!({
            "id": id,
            "name": format!("step {}", id),
            "run_type": "chain",
            "session_id": "x-1",
            "trace_id": "r-root",
            "parent_run_id": parent,
            "dotted_order": dotted,
            "reference_example_id": "e-1",
        })
    }

    #[test]
    fn test_child_runs_name_their_parent() {
        let child = run_item(run("r-2", Some("r-root"), "20240101T000000Z.r-root.r-2"), "p".into());
        assert_eq!(child.parent_id.as_deref(), Some("r-root"));
        assert_eq!(child.order_key, "20240101T000000Z.r-root.r-2");
        let root = run_item(run("r-root", None, "20240101T000000Z.r-root"), "p".into());
        assert_eq!(root.parent_id, None);
        assert!(root.order_key < child.order_key);
    }

    #[test]
    fn test_transform_maps_experiment_parent_and_example() {
        let ctx = context("http://127.0.0.1:9");
        map(&ctx, ResourceKind::Experiment, "x-1", "new-x-1");
        map(&ctx, ResourceKind::Run, "r-root", "r-root");
        let migrator = RunMigrator::new(ctx.clone());
        let item = run_item(run("r-2", Some("r-root"), "a.b"), "p".into());

        let payload = migrator.transform(&item, ctx.registry.as_ref()).unwrap();
        assert_eq!(payload.body["id"], "r-2");
        assert_eq!(payload.body["session_id"], "new-x-1");
        assert_eq!(payload.body["parent_run_id"], "r-root");
        assert_eq!(payload.body["tags"], json!([]));
        // e-1 was never migrated
        assert!(payload.body.get("reference_example_id").is_none());

        map(&ctx, ResourceKind::Example, "e-1", "new-e-1");
        let payload = migrator.transform(&item, ctx.registry.as_ref()).unwrap();
        assert_eq!(payload.body["reference_example_id"], "new-e-1");
    }

    #[test]
    fn test_unmapped_parent_run_is_dependency_error() {
        let ctx = context("http://127.0.0.1:9");
        map(&ctx, ResourceKind::Experiment, "x-1", "new-x-1");
        let item = run_item(run("r-2", Some("r-root"), "a.b"), "p".into());
        assert!(matches!(
            RunMigrator::new(ctx.clone()).transform(&item, ctx.registry.as_ref()),
            Err(MigrateError::DependencyUnresolved { kind: ResourceKind::Run, .. })
        ));
    }

    #[tokio::test]
    async fn test_query_follows_server_cursor() {
        let queries: Arc<Mutex<Vec<Value>>> = Arc::default();
        let seen = queries.clone();
        let app = Router::new().route(
            "/api/v1/runs/query",
            post(move |Json(query): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(query.clone());
                    match query.get("cursor").and_then(Value::as_str) {
                        None => Json(json!({
                            "runs": [run("r-root", None, "a"), run("r-2", Some("r-root"), "a.b")],
                            "cursors": {"next": "tok:2"},
                        })),
                        Some(_) => Json(json!({"runs": [run("r-3", None, "c")], "cursors": {"next": null}})),
                    }
                }
            }),
        );
        let base = serve(app).await;
        let ctx = context(&base);
        map(&ctx, ResourceKind::Experiment, "x-1", "new-x-1");
        let migrator = RunMigrator::new(ctx);

        let first = migrator.extract_page(None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor, Some(Cursor::new("x-1:tok:2")));

        let second = migrator.extract_page(first.next_cursor.as_ref()).await.unwrap();
        assert_eq!(second.items[0].source_id, "r-3");
        assert!(second.is_last());

        let queries = queries.lock().unwrap();
        assert_eq!(queries[0]["session"], json!(["x-1"]));
        assert_eq!(queries[1]["cursor"], "tok:2");
    }

    #[tokio::test]
    async fn test_load_keeps_id_and_find_checks_destination() {
        let posted: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = posted.clone();
        let app = Router::new()
            .route(
                "/api/v1/runs/batch",
                post(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(body);
                        StatusCode::ACCEPTED
                    }
                }),
            )
            .route(
                "/api/v1/runs/:id",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    if id == "r-known" {
                        Json(json!({"id": id})).into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                }),
            );
        let base = serve(app).await;
        let ctx = context(&base);
        map(&ctx, ResourceKind::Experiment, "x-1", "new-x-1");
        let migrator = RunMigrator::new(ctx.clone());

        let item = run_item(run("r-known", None, "a"), "p".into());
        let payload = migrator.transform(&item, ctx.registry.as_ref()).unwrap();
        assert_eq!(migrator.load(&payload).await.unwrap(), "r-known");
        assert_eq!(posted.lock().unwrap()[0]["post"][0]["id"], "r-known");
        assert_eq!(
            migrator.find_existing(&payload).await.unwrap().as_deref(),
            Some("r-known")
        );

        let other = run_item(run("r-new", None, "b"), "p".into());
        let payload = migrator.transform(&other, ctx.registry.as_ref()).unwrap();
        assert_eq!(migrator.find_existing(&payload).await.unwrap(), None);
    }
}
