//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

use crate::migrator::ResourceKind;

/// Hard upper bound on the worker pool size.
pub const MAX_WORKERS: usize = 10;

/// Hard upper bound on the page/batch size.
pub const MAX_BATCH_SIZE: usize = 1000;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();

        Self {
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!("System resources: {} CPU cores", self.cpu_cores);
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Instance resources are read from.
    pub source: EndpointConfig,

    /// Instance resources are created in.
    pub destination: EndpointConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Connection settings for one instance of the remote service.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL; `/api/v1` is appended when missing.
    pub base_url: String,

    /// API key sent as `X-API-Key`. May be supplied via environment instead.
    #[serde(default)]
    pub api_key: String,

    /// Verify TLS certificates (default: true).
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EndpointConfig {
    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Migration behavior configuration.
/// `workers` uses Option<T> to distinguish between "not set" (auto-tuned)
/// and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Number of parallel workers per resource kind. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Items per page and per accounting batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Largest attachment accepted from the source, in bytes.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Accepted attachment content types (prefix match). Empty accepts all.
    #[serde(default)]
    pub allowed_content_types: Vec<String>,

    /// Run extract and transform only; never create anything.
    #[serde(default)]
    pub dry_run: bool,

    /// Map objects that already exist on the destination (by name) instead of recreating them.
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// On resume, reprocess items that failed in an earlier attempt.
    #[serde(default)]
    pub retry_failed: bool,

    /// Copy example attachments.
    #[serde(default = "default_true")]
    pub include_attachments: bool,

    /// Also migrate experiments, their runs and run feedback when no kinds
    /// are listed explicitly.
    #[serde(default)]
    pub include_experiments: bool,

    /// Minimum spacing between requests to one endpoint, in milliseconds.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,

    /// First retry delay, in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Largest single retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Total time budget for retrying one operation, in seconds.
    #[serde(default = "default_max_retry_elapsed_secs")]
    pub max_retry_elapsed_secs: u64,

    /// Resource kinds to migrate. Empty means all kinds.
    #[serde(default)]
    pub resource_kinds: Vec<ResourceKind>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            batch_size: default_batch_size(),
            max_attachment_bytes: default_max_attachment_bytes(),
            allowed_content_types: Vec::new(),
            dry_run: false,
            skip_existing: true,
            retry_failed: false,
            include_attachments: true,
            include_experiments: false,
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            max_retry_elapsed_secs: default_max_retry_elapsed_secs(),
            resource_kinds: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Workers: half the cores, at least 2, never above the pool ceiling.
        // The remote service is the bottleneck, not local CPU.
        if self.workers.is_none() {
            let workers = (resources.cpu_cores / 2).clamp(2, MAX_WORKERS);
            self.workers = Some(workers);
        }

        info!(
            "Auto-tuned config: workers={}, batch_size={}, rate_limit_delay={}ms",
            self.get_workers(),
            self.batch_size,
            self.rate_limit_delay_ms,
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_retry_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_retry_elapsed_secs)
    }

    /// Selected kinds, or the default set when none were selected.
    pub fn selected_kinds(&self) -> Vec<ResourceKind> {
        if !self.resource_kinds.is_empty() {
            return self.resource_kinds.clone();
        }
        let mut kinds = ResourceKind::DEFAULT.to_vec();
        if self.include_experiments {
            kinds.extend(ResourceKind::EXPERIMENTS);
        }
        kinds
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attachment_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_rate_limit_delay_ms() -> u64 {
    100
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_retry_elapsed_secs() -> u64 {
    300
}
