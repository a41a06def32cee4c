//! Bounded attachment downloads.

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// Size ceiling and content-type allowlist applied to every download.
#[derive(Debug, Clone)]
pub struct DownloadLimits {
    pub max_bytes: u64,
    /// Accepted content-type prefixes; empty accepts everything.
    pub allowed_content_types: Vec<String>,
}

impl DownloadLimits {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_bytes: config.max_attachment_bytes,
            allowed_content_types: config.allowed_content_types.clone(),
        }
    }

    /// Reject a declared content type outside the allowlist.
    ///
    /// A missing content type is only accepted when the allowlist is empty.
    pub fn check_content_type(&self, url: &str, content_type: Option<&str>) -> Result<()> {
        if self.allowed_content_types.is_empty() {
            return Ok(());
        }
        let declared = content_type.unwrap_or("").trim().to_lowercase();
        let allowed = self
            .allowed_content_types
            .iter()
            .any(|prefix| !declared.is_empty() && declared.starts_with(&prefix.to_lowercase()));
        if allowed {
            Ok(())
        } else {
            Err(MigrateError::DisallowedContentType {
                url: url.to_string(),
                content_type: if declared.is_empty() {
                    "<none>".to_string()
                } else {
                    declared
                },
            })
        }
    }

    /// Reject a declared length above the ceiling before reading the body.
    pub fn check_length(&self, url: &str, content_length: Option<u64>) -> Result<()> {
        match content_length {
            Some(len) if len > self.max_bytes => Err(self.oversize(url)),
            _ => Ok(()),
        }
    }

    fn oversize(&self, url: &str) -> MigrateError {
        MigrateError::Oversize {
            url: url.to_string(),
            limit: self.max_bytes,
        }
    }
}

/// A fully buffered download.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Buffer a body stream, failing as soon as it passes the ceiling.
pub async fn collect_limited<S>(mut stream: S, url: &str, limits: &DownloadLimits) -> Result<Bytes>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buffer.len() + chunk.len()) as u64 > limits.max_bytes {
            return Err(limits.oversize(url));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}
