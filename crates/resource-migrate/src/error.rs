//! Error types for the migration library.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::migrator::ResourceKind;
use crate::orchestrator::MigrationReport;

/// Exit code for configuration errors (invalid YAML, missing fields, etc.)
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for authentication failures against either endpoint.
pub const EXIT_AUTH_ERROR: u8 = 2;
/// Exit code for a resource kind that could not be migrated at all.
pub const EXIT_KIND_FAILED: u8 = 3;
/// Exit code for a run stopped by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 4;
/// Exit code for unreadable or tampered session state.
pub const EXIT_STATE_ERROR: u8 = 5;
/// Exit code for transport failures outside of item processing.
pub const EXIT_TRANSPORT_ERROR: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection reset, DNS failure, or per-call timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials rejected by the remote service (401/403).
    #[error("Authentication failed for {endpoint}: {message}. Check the API key for this endpoint.")]
    Authentication { endpoint: String, message: String },

    /// Create rejected because the object already exists (409).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Remote service is throttling requests (429).
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Payload rejected by the remote service or by a transform.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote service returned a 5xx status.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A referenced mapping from an earlier kind (or a parent) is missing.
    #[error("Dependency unresolved: no {kind} mapping for source id {source_id}")]
    DependencyUnresolved {
        kind: ResourceKind,
        source_id: String,
    },

    /// A second, different destination id was offered for a mapped key.
    #[error("Mapping conflict for {kind} {source_id}: already mapped to {existing}, refusing {offered}")]
    MappingConflict {
        kind: ResourceKind,
        source_id: String,
        existing: String,
        offered: String,
    },

    /// Download exceeded the configured byte ceiling.
    #[error("Payload too large: {url} exceeds {limit} bytes")]
    Oversize { url: String, limit: u64 },

    /// Download declared a content type outside the allowed list.
    #[error("Disallowed content type '{content_type}' for {url}")]
    DisallowedContentType { url: String, content_type: String },

    /// Listing the source items of a kind failed; the kind is aborted.
    #[error("Migration of {kind} aborted: {message}")]
    KindFailed { kind: ResourceKind, message: String },

    /// Retry budget exhausted; wraps the last error.
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<MigrateError>,
    },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Session endpoints differ from the configured endpoints
    #[error("Endpoints have changed since the session was created - cannot resume. Start a new run instead.")]
    ConfigChanged,

    /// HTTP client error not classified from a response status
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// A run that stopped early, with the report of what it did.
    #[error("Session {} stopped: {error}", .report.session_id)]
    Aborted {
        report: Box<MigrationReport>,
        error: Box<MigrateError>,
    },
}

/// Serializable classification of an error, stored with failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    RateLimit,
    Authentication,
    Conflict,
    Validation,
    NotFound,
    Server,
    DependencyUnresolved,
    MappingConflict,
    Oversize,
    Internal,
}

impl MigrateError {
    /// Create a dependency-unresolved error.
    pub fn dependency(kind: ResourceKind, source_id: impl Into<String>) -> Self {
        MigrateError::DependencyUnresolved {
            kind,
            source_id: source_id.into(),
        }
    }

    /// Create a kind-level failure.
    pub fn kind_failed(kind: ResourceKind, message: impl Into<String>) -> Self {
        MigrateError::KindFailed {
            kind,
            message: message.into(),
        }
    }

    /// Classify a reqwest transport error.
    ///
    /// A body cut off mid-read surfaces as a decode error and is retried
    /// like any other dropped connection.
    pub fn transport(err: reqwest::Error) -> Self {
        if err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || err.is_body()
            || err.is_decode()
        {
            MigrateError::Network(err.to_string())
        } else {
            MigrateError::Http(err)
        }
    }

    /// Whether the retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::Network(_) | MigrateError::RateLimited { .. } | MigrateError::Server { .. }
        )
    }

    /// Server-provided delay, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MigrateError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classification stored in session state for failed items.
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrateError::Network(_) | MigrateError::Http(_) => ErrorClass::Network,
            MigrateError::RateLimited { .. } => ErrorClass::RateLimit,
            MigrateError::Authentication { .. } => ErrorClass::Authentication,
            MigrateError::Conflict(_) => ErrorClass::Conflict,
            MigrateError::Validation(_) | MigrateError::DisallowedContentType { .. } => {
                ErrorClass::Validation
            }
            MigrateError::NotFound(_) => ErrorClass::NotFound,
            MigrateError::Server { .. } => ErrorClass::Server,
            MigrateError::DependencyUnresolved { .. } => ErrorClass::DependencyUnresolved,
            MigrateError::MappingConflict { .. } => ErrorClass::MappingConflict,
            MigrateError::Oversize { .. } => ErrorClass::Oversize,
            MigrateError::Exhausted { last, .. } => last.class(),
            MigrateError::Aborted { error, .. } => error.class(),
            _ => ErrorClass::Internal,
        }
    }

    /// Errors that must abort the whole kind rather than a single item.
    pub fn is_fatal(&self) -> bool {
        match self {
            MigrateError::Authentication { .. } | MigrateError::Cancelled => true,
            MigrateError::State(_) | MigrateError::Io(_) => true,
            MigrateError::Exhausted { last, .. } => last.is_fatal(),
            MigrateError::Aborted { .. } => true,
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged => EXIT_CONFIG_ERROR,
            MigrateError::Authentication { .. } => EXIT_AUTH_ERROR,
            MigrateError::KindFailed { .. } => EXIT_KIND_FAILED,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::State(_) | MigrateError::Json(_) => EXIT_STATE_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Exhausted { last, .. } => last.exit_code(),
            MigrateError::Aborted { error, .. } => error.exit_code(),
            _ => EXIT_TRANSPORT_ERROR,
        }
    }

    /// The error that stopped an aborted run, or `self`.
    pub fn cause(&self) -> &MigrateError {
        match self {
            MigrateError::Aborted { error, .. } => error.cause(),
            other => other,
        }
    }

    /// Report of an aborted run.
    pub fn report(&self) -> Option<&MigrationReport> {
        match self {
            MigrateError::Aborted { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(MigrateError::Network("reset".into()).is_retryable());
        assert!(MigrateError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(MigrateError::RateLimited {
            message: "slow down".into(),
            retry_after: None
        }
        .is_retryable());

        assert!(!MigrateError::Validation("bad".into()).is_retryable());
        assert!(!MigrateError::NotFound("gone".into()).is_retryable());
        assert!(!MigrateError::Conflict("exists".into()).is_retryable());
        assert!(!MigrateError::Authentication {
            endpoint: "src".into(),
            message: "401".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_exhausted_keeps_inner_class() {
        let err = MigrateError::Exhausted {
            attempts: 3,
            last: Box::new(MigrateError::Server {
                status: 502,
                message: "bad gateway".into(),
            }),
        };
        assert_eq!(err.class(), ErrorClass::Server);
        assert!(!err.is_retryable());
        assert!(err.format_detailed().contains("Caused by"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(MigrateError::Cancelled.exit_code(), EXIT_CANCELLED);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::from(io).exit_code(), EXIT_IO_ERROR);
        assert_eq!(
            MigrateError::kind_failed(ResourceKind::Dataset, "listing failed").exit_code(),
            EXIT_KIND_FAILED
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/", axum::routing::get(|| async { "{\"truncated\": " }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = reqwest::get(format!("http://{}/", addr))
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap_err();
        assert!(err.is_decode());

        let classified = MigrateError::transport(err);
        assert!(matches!(classified, MigrateError::Network(_)));
        assert!(classified.is_retryable());
        assert_eq!(classified.class(), ErrorClass::Network);
    }

    #[test]
    fn test_auth_is_fatal() {
        let err = MigrateError::Authentication {
            endpoint: "destination".into(),
            message: "invalid key".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Check the API key"));
        assert!(!MigrateError::Validation("bad".into()).is_fatal());
    }
}
