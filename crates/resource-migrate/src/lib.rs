//! # resource-migrate
//!
//! Resumable migration of resources between two instances of a remote
//! tracing/evaluation service.
//!
//! This library copies projects, datasets, examples, annotation queues and
//! rules from a source instance to a destination instance, and on request
//! experiments with their runs and feedback, with support for:
//!
//! - **Dependency ordering** so referenced objects exist before their referrers
//! - **Identifier remapping** from source ids to destination ids
//! - **Bounded parallelism** with a fixed worker pool per resource kind
//! - **Rate limiting and retries** with exponential backoff and jitter
//! - **Resume capability** via signed JSON session snapshots and outcome journals
//!
//! ## Example
//!
//! ```rust,no_run
//! use resource_migrate::{Config, FileStateBackend, Orchestrator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> resource_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let backend = Arc::new(FileStateBackend::new(".resource-migrate/state"));
//!     let orchestrator = Orchestrator::new(config, backend)?;
//!     let report = orchestrator.run(&CancellationToken::new()).await?;
//!     println!("Migrated {} items", report.succeeded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mapping;
pub mod migrator;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-exports for convenient access
pub use config::{Config, EndpointConfig, MigrationConfig};
pub use error::{MigrateError, Result};
pub use mapping::{IdMappingRegistry, MappingLookup};
pub use migrator::{ResourceKind, ResourceMigrator};
pub use orchestrator::{HealthCheckResult, KindReport, MigrationReport, Orchestrator};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use state::{
    FileStateBackend, NoOpStateBackend, SessionStatus, SessionStore, SessionSummary, StateBackend,
};
pub use transport::Transport;
