//! Resource kinds and the extract/transform/load contract the scheduler drives.
//!
//! Each [`ResourceKind`] has one migrator implementing [`ResourceMigrator`].
//! The scheduler is generic over the trait and only looks at the kind to
//! pick the dependency order.

mod annotation_queue;
mod dataset;
mod example;
mod experiment;
mod feedback;
mod project;
mod rule;
mod run;
mod walk;

pub use annotation_queue::AnnotationQueueMigrator;
pub use dataset::DatasetMigrator;
pub use example::ExampleMigrator;
pub use experiment::ExperimentMigrator;
pub use feedback::FeedbackMigrator;
pub use project::ProjectMigrator;
pub use rule::RuleMigrator;
pub use run::RunMigrator;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::mapping::{content_fingerprint, IdMappingRegistry, MappingLookup};
use crate::transport::{extract_items, ApiRequest, Cursor, Page, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// The closed set of migrated resource kinds, declared in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Dataset,
    Example,
    Experiment,
    Run,
    Feedback,
    AnnotationQueue,
    Rule,
}

impl ResourceKind {
    /// Every kind, in the order they are migrated.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Project,
        ResourceKind::Dataset,
        ResourceKind::Example,
        ResourceKind::Experiment,
        ResourceKind::Run,
        ResourceKind::Feedback,
        ResourceKind::AnnotationQueue,
        ResourceKind::Rule,
    ];

    /// Kinds migrated when none are selected explicitly.
    pub const DEFAULT: [ResourceKind; 5] = [
        ResourceKind::Project,
        ResourceKind::Dataset,
        ResourceKind::Example,
        ResourceKind::AnnotationQueue,
        ResourceKind::Rule,
    ];

    /// Experiment results, added to the default selection on request.
    pub const EXPERIMENTS: [ResourceKind; 3] = [
        ResourceKind::Experiment,
        ResourceKind::Run,
        ResourceKind::Feedback,
    ];

    /// Kinds whose mappings this kind reads while listing or transforming.
    pub fn dependencies(self) -> &'static [ResourceKind] {
        match self {
            ResourceKind::Project | ResourceKind::Dataset => &[],
            ResourceKind::Example => &[ResourceKind::Dataset],
            ResourceKind::Experiment => &[ResourceKind::Dataset],
            ResourceKind::Run => &[ResourceKind::Experiment, ResourceKind::Example],
            ResourceKind::Feedback => &[ResourceKind::Experiment, ResourceKind::Run],
            ResourceKind::AnnotationQueue => &[ResourceKind::Dataset],
            ResourceKind::Rule => &[ResourceKind::Project, ResourceKind::Dataset],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Project => "project",
            ResourceKind::Dataset => "dataset",
            ResourceKind::Example => "example",
            ResourceKind::Experiment => "experiment",
            ResourceKind::Run => "run",
            ResourceKind::Feedback => "feedback",
            ResourceKind::AnnotationQueue => "annotation_queue",
            ResourceKind::Rule => "rule",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "project" | "projects" => Ok(ResourceKind::Project),
            "dataset" | "datasets" => Ok(ResourceKind::Dataset),
            "example" | "examples" => Ok(ResourceKind::Example),
            "experiment" | "experiments" => Ok(ResourceKind::Experiment),
            "run" | "runs" => Ok(ResourceKind::Run),
            "feedback" | "feedbacks" => Ok(ResourceKind::Feedback),
            "annotation_queue" | "annotation_queues" | "queue" | "queues" => {
                Ok(ResourceKind::AnnotationQueue)
            }
            "rule" | "rules" => Ok(ResourceKind::Rule),
            other => Err(MigrateError::Config(format!("Unknown resource kind: {}", other))),
        }
    }
}

/// Order `kinds` so every kind follows the selected kinds it depends on.
pub fn dependency_order(kinds: &[ResourceKind]) -> Result<Vec<ResourceKind>> {
    order_by(kinds, |k| k.dependencies())
}

/// Kahn's algorithm restricted to `nodes`; ties keep declaration order.
fn order_by<K, F>(nodes: &[K], deps: F) -> Result<Vec<K>>
where
    K: Copy + Ord + fmt::Display + 'static,
    F: Fn(K) -> &'static [K],
{
    let selected: BTreeSet<K> = nodes.iter().copied().collect();
    let mut remaining: Vec<K> = selected.iter().copied().collect();

    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|node| {
            deps(*node)
                .iter()
                .all(|dep| !selected.contains(dep) || ordered.contains(dep))
        });
        match ready {
            Some(idx) => ordered.push(remaining.remove(idx)),
            None => {
                let names: Vec<String> = remaining.iter().map(|k| k.to_string()).collect();
                return Err(MigrateError::Config(format!(
                    "Cyclic dependency between resource kinds: {}",
                    names.join(", ")
                )));
            }
        }
    }
    Ok(ordered)
}

/// One object read from the source instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub source_id: String,
    /// Display name; also used to find existing destination objects.
    pub name: Option<String>,
    /// Source id of a parent of the same kind, if any.
    pub parent_id: Option<String>,
    /// Structural sort key; a parent's key sorts before its children's.
    pub order_key: String,
    pub body: Value,
    /// Why the listed object cannot be migrated; the worker fails it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<String>,
}

fn listed_id(body: &Value) -> Option<&str> {
    body.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

impl SourceItem {
    /// Build an item from a raw API object with an `id` field.
    pub fn from_value(body: Value) -> Result<Self> {
        let source_id = listed_id(&body)
            .ok_or_else(|| MigrateError::Validation("source object has no id".into()))?
            .to_string();
        Ok(Self::build(source_id, body))
    }

    /// Build an item from the object at `position` of a listing.
    ///
    /// Objects without an id get `#<position>` as id and are marked invalid,
    /// so they are accounted for as failures instead of failing the page.
    pub fn from_listing(body: Value, position: impl fmt::Display) -> Self {
        if let Some(id) = listed_id(&body) {
            let id = id.to_string();
            return Self::build(id, body);
        }
        let reason = if body.is_object() {
            "source object has no id"
        } else {
            "source entry is not a JSON object"
        };
        warn!("Listing entry at position {}: {}", position, reason);
        let mut item = Self::build(format!("#{}", position), body);
        item.invalid = Some(reason.to_string());
        item
    }

    fn build(source_id: String, body: Value) -> Self {
        let name = body.get("name").and_then(Value::as_str).map(String::from);
        Self {
            order_key: source_id.clone(),
            source_id,
            name,
            parent_id: None,
            body,
            invalid: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>, order_key: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self.order_key = order_key.into();
        self
    }
}

/// A binary file to copy alongside an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Form field / file name on the destination.
    pub name: String,
    /// Source download URL (usually presigned).
    pub url: String,
    /// Declared content type from the source metadata.
    pub content_type: Option<String>,
}

/// What `load` sends to the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationPayload {
    pub source_id: String,
    pub name: Option<String>,
    pub body: Value,
    /// Fingerprint of `body`; attachments are not part of it.
    pub fingerprint: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl DestinationPayload {
    pub fn new(item: &SourceItem, body: Value) -> Self {
        let fingerprint = content_fingerprint(&body);
        Self {
            source_id: item.source_id.clone(),
            name: item.name.clone(),
            body,
            fingerprint,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Extract/transform/load capability for one resource kind.
#[async_trait]
pub trait ResourceMigrator: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Read one page of source items starting at `cursor` (None = beginning).
    /// The page's `next_cursor` is None on the last page.
    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>>;

    /// Build the destination payload. Pure: no network I/O.
    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload>;

    /// Create the object on the destination with a single attempt and return its id.
    /// The scheduler owns retries and conflict resolution.
    async fn load(&self, payload: &DestinationPayload) -> Result<String>;

    /// Look up an object equivalent to `payload` that already exists on the destination.
    async fn find_existing(&self, payload: &DestinationPayload) -> Result<Option<String>>;

    /// Bring an already-mapped destination object up to date. Kinds that cannot
    /// be updated keep the existing object.
    async fn update(&self, _destination_id: &str, _payload: &DestinationPayload) -> Result<()> {
        Ok(())
    }
}

/// Shared handles every concrete migrator is built from.
#[derive(Clone)]
pub struct MigratorContext {
    pub source: Arc<Transport>,
    pub destination: Arc<Transport>,
    pub registry: Arc<IdMappingRegistry>,
    pub config: Arc<MigrationConfig>,
}

/// Build the migrator for `kind`.
pub fn build_migrator(kind: ResourceKind, ctx: &MigratorContext) -> Arc<dyn ResourceMigrator> {
    match kind {
        ResourceKind::Project => Arc::new(ProjectMigrator::new(ctx.clone())),
        ResourceKind::Dataset => Arc::new(DatasetMigrator::new(ctx.clone())),
        ResourceKind::Example => Arc::new(ExampleMigrator::new(ctx.clone())),
        ResourceKind::Experiment => Arc::new(ExperimentMigrator::new(ctx.clone())),
        ResourceKind::Run => Arc::new(RunMigrator::new(ctx.clone())),
        ResourceKind::Feedback => Arc::new(FeedbackMigrator::new(ctx.clone())),
        ResourceKind::AnnotationQueue => Arc::new(AnnotationQueueMigrator::new(ctx.clone())),
        ResourceKind::Rule => Arc::new(RuleMigrator::new(ctx.clone())),
    }
}

/// Copy the listed fields from `source` into a new JSON object, skipping absent ones.
pub(crate) fn pick_fields(source: &Value, fields: &[&str]) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for field in fields {
        if let Some(value) = source.get(*field) {
            if !value.is_null() {
                out.insert((*field).to_string(), value.clone());
            }
        }
    }
    out
}

/// Name-based lookup shared by the migrators: `GET {path}?name=...` on the destination.
///
/// Single attempt; the worker's policy retries the lookup as a whole.
pub(crate) async fn find_by_name(
    destination: &Transport,
    path: &str,
    name: Option<&str>,
) -> Result<Option<String>> {
    let Some(name) = name else {
        return Ok(None);
    };
    let request = ApiRequest::get(path).query("name", name).query("limit", 2);
    let items = match destination.send_once(&request).await {
        Ok(response) => extract_items(response),
        Err(MigrateError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let matches: Vec<&Value> = items
        .iter()
        .filter(|v| v.get("name").and_then(Value::as_str) == Some(name))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.get("id").and_then(Value::as_str).map(String::from)),
        [] => Ok(None),
        _ => {
            tracing::warn!("Multiple objects named '{}' at {}, not mapping", name, path);
            Ok(None)
        }
    }
}

/// Decode a page of raw objects fetched at `cursor` into source items.
pub(crate) fn items_from_page(page: Page<Value>, cursor: Option<&Cursor>) -> Page<SourceItem> {
    let offset = cursor.map(Cursor::as_offset).unwrap_or(0);
    let items = page
        .items
        .into_iter()
        .enumerate()
        .map(|(i, raw)| SourceItem::from_listing(raw, offset + i))
        .collect();
    Page {
        items,
        next_cursor: page.next_cursor,
    }
}

/// Destination id from a create response.
///
/// Accepts `{"id": ..}`, `{"example_ids": [..]}` and a bare list of created objects.
pub(crate) fn created_id(response: &Value, path: &str) -> Result<String> {
    let id = match response {
        Value::Array(items) => items.first().and_then(|v| v.get("id")),
        other => other
            .get("id")
            .or_else(|| other.get("example_ids").and_then(|ids| ids.get(0))),
    };
    id.and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
    .ok_or_else(|| MigrateError::Validation(format!("Create response from {} has no id", path)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_order_matches_declaration() {
        let order = dependency_order(&ResourceKind::ALL).unwrap();
        assert_eq!(order, ResourceKind::ALL.to_vec());
    }

    #[test]
    fn test_order_reorders_selection() {
        let order =
            dependency_order(&[ResourceKind::Rule, ResourceKind::Example, ResourceKind::Dataset])
                .unwrap();
        assert_eq!(
            order,
            vec![ResourceKind::Dataset, ResourceKind::Example, ResourceKind::Rule]
        );
    }

    #[test]
    fn test_unselected_dependencies_are_not_added() {
        let order = dependency_order(&[ResourceKind::Example]).unwrap();
        assert_eq!(order, vec![ResourceKind::Example]);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Node {
        A,
        B,
    }

    impl fmt::Display for Node {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[test]
    fn test_cycle_is_config_error() {
        let err = order_by(&[Node::A, Node::B], |n| match n {
            Node::A => &[Node::B],
            Node::B => &[Node::A],
        })
        .unwrap_err();
        assert!(matches!(err, MigrateError::Config(ref m) if m.contains("Cyclic")));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("datasets".parse::<ResourceKind>().unwrap(), ResourceKind::Dataset);
        assert_eq!(
            "annotation-queue".parse::<ResourceKind>().unwrap(),
            ResourceKind::AnnotationQueue
        );
        assert!("charts".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_source_item_requires_id() {
        assert!(SourceItem::from_value(json!({"name": "x"})).is_err());
        let item = SourceItem::from_value(json!({"id": "d-1", "name": "x"})).unwrap();
        assert_eq!(item.source_id, "d-1");
        assert_eq!(item.name.as_deref(), Some("x"));
        assert_eq!(item.order_key, "d-1");
    }

    #[test]
    fn test_listing_keeps_objects_without_id() {
        let page = Page {
            items: vec![json!({"id": "d1"}), json!({"name": "no id here"}), json!("d2"), json!({"id": "d3"})],
            next_cursor: Some(Cursor::offset(14)),
        };
        let items = items_from_page(page, Some(&Cursor::offset(10))).items;

        let ids: Vec<&str> = items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "#11", "#12", "d3"]);
        assert!(items[0].invalid.is_none());
        assert_eq!(items[1].invalid.as_deref(), Some("source object has no id"));
        assert_eq!(items[1].name.as_deref(), Some("no id here"));
        assert!(items[2].invalid.is_some());
        assert!(items[3].invalid.is_none());
    }

    #[test]
    fn test_experiment_kinds_follow_their_parents() {
        let order = dependency_order(&[
            ResourceKind::Feedback,
            ResourceKind::Run,
            ResourceKind::Experiment,
            ResourceKind::Example,
            ResourceKind::Dataset,
        ])
        .unwrap();
        assert_eq!(
            order,
            vec![
                ResourceKind::Dataset,
                ResourceKind::Example,
                ResourceKind::Experiment,
                ResourceKind::Run,
                ResourceKind::Feedback,
            ]
        );
        assert_eq!("runs".parse::<ResourceKind>().unwrap(), ResourceKind::Run);
        for kind in ResourceKind::EXPERIMENTS {
            assert!(!ResourceKind::DEFAULT.contains(&kind));
        }
    }

    #[test]
    fn test_created_id_shapes() {
        assert_eq!(created_id(&json!({"id": "a"}), "/x").unwrap(), "a");
        assert_eq!(created_id(&json!({"example_ids": ["b"], "count": 1}), "/x").unwrap(), "b");
        assert_eq!(created_id(&json!([{"id": "c"}]), "/x").unwrap(), "c");
        assert!(created_id(&json!({"ok": true}), "/x").is_err());
    }

    #[test]
    fn test_pick_fields_skips_nulls() {
        let picked = pick_fields(&json!({"a": 1, "b": null}), &["a", "b", "c"]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked["a"], json!(1));
    }
}
