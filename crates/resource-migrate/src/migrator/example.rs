//! Dataset examples, including their attachments.
//!
//! Examples are listed per mapped dataset (see [`super::walk`]); the cursor
//! is `<dataset id>:<offset>`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::walk::{ChildListing, ParentWalk};
use super::{
    created_id, pick_fields, AttachmentRef, DestinationPayload, MigratorContext, ResourceKind,
    ResourceMigrator, SourceItem,
};
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::transport::{ApiRequest, Cursor, DownloadLimits, FormPart, Page};

const PATH: &str = "/examples";

/// Split used when the source example does not name one.
const DEFAULT_SPLIT: &str = "base";

const ATTACHMENT_PREFIX: &str = "attachment.";

const LISTING: ChildListing<'static> = ChildListing {
    path: PATH,
    parent_param: "dataset",
    parent_field: "dataset_id",
    extra_query: &[("select", "attachment_urls"), ("select", "outputs")],
};

pub struct ExampleMigrator {
    ctx: MigratorContext,
    limits: DownloadLimits,
}

impl ExampleMigrator {
    pub fn new(ctx: MigratorContext) -> Self {
        let limits = DownloadLimits::from_config(&ctx.config);
        Self { ctx, limits }
    }
}

/// Attachment references from `attachment_urls`, sorted by name.
fn attachment_refs(body: &Value) -> Vec<AttachmentRef> {
    let Some(urls) = body.get("attachment_urls").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut refs: Vec<AttachmentRef> = urls
        .iter()
        .filter_map(|(key, info)| {
            let url = info.get("presigned_url").and_then(Value::as_str);
            if url.is_none() {
                debug!("Attachment '{}' has no download URL, skipping", key);
            }
            Some(AttachmentRef {
                name: key.strip_prefix(ATTACHMENT_PREFIX).unwrap_or(key).to_string(),
                url: url?.to_string(),
                content_type: info
                    .get("mime_type")
                    .or_else(|| info.get("content_type"))
                    .and_then(Value::as_str)
                    .map(String::from),
            })
        })
        .collect();
    refs.sort_by(|a, b| a.name.cmp(&b.name));
    refs
}

#[async_trait]
impl ResourceMigrator for ExampleMigrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Example
    }

    async fn extract_page(&self, cursor: Option<&Cursor>) -> Result<Page<SourceItem>> {
        ParentWalk::new(&self.ctx.registry, ResourceKind::Dataset)
            .fetch_offset_page(&self.ctx.source, &LISTING, cursor, self.ctx.config.batch_size)
            .await
    }

    fn transform(&self, item: &SourceItem, lookup: &dyn MappingLookup) -> Result<DestinationPayload> {
        let src = &item.body;
        let source_dataset = src
            .get("dataset_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MigrateError::Validation(format!("example {} has no dataset_id", item.source_id))
            })?;
        let dataset_id = lookup.require(ResourceKind::Dataset, source_dataset)?;

        let split = src
            .get("metadata")
            .and_then(|m| m.get("dataset_split"))
            .and_then(|s| match s {
                Value::String(s) if !s.is_empty() => Some(json!(s)),
                Value::Array(a) if !a.is_empty() => Some(s.clone()),
                _ => None,
            })
            .unwrap_or(json!(DEFAULT_SPLIT));

        let mut body = pick_fields(src, &["created_at"]);
        body.insert("dataset_id".into(), json!(dataset_id));
        for field in ["inputs", "outputs", "metadata"] {
            body.insert(
                field.into(),
                src.get(field).filter(|v| !v.is_null()).cloned().unwrap_or(json!({})),
            );
        }
        body.insert("split".into(), split);

        let attachments = if self.ctx.config.include_attachments {
            attachment_refs(src)
        } else {
            Vec::new()
        };
        Ok(DestinationPayload::new(item, Value::Object(body)).with_attachments(attachments))
    }

    async fn load(&self, payload: &DestinationPayload) -> Result<String> {
        if payload.attachments.is_empty() {
            let response = self
                .ctx
                .destination
                .send_once(&ApiRequest::post_json(PATH, payload.body.clone()))
                .await?;
            return created_id(&response, PATH);
        }

        let mut parts = vec![FormPart::Text {
            name: "example".into(),
            value: payload.body.to_string(),
        }];
        // One download per create attempt; the scheduler's policy owns the retries
        for attachment in &payload.attachments {
            let file = self
                .ctx
                .source
                .download_once(&attachment.url, &self.limits)
                .await?;
            debug!(
                "Example {}: attachment '{}' ({} bytes)",
                payload.source_id,
                attachment.name,
                file.data.len()
            );
            parts.push(FormPart::File {
                name: format!("{}{}", ATTACHMENT_PREFIX, attachment.name),
                file_name: attachment.name.clone(),
                content_type: attachment.content_type.clone().or(file.content_type),
                data: file.data,
            });
        }

        let dataset_id = payload.body["dataset_id"].as_str().unwrap_or_default();
        let path = format!("/datasets/{}/examples", dataset_id);
        let response = self
            .ctx
            .destination
            .send_once(&ApiRequest::post_multipart(path.as_str(), parts))
            .await?;
        created_id(&response, &path)
    }

    /// Examples have no natural key on the destination.
    async fn find_existing(&self, _payload: &DestinationPayload) -> Result<Option<String>> {
        Ok(None)
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
