//! Migration orchestrator - runs every selected kind in dependency order.

use crate::config::Config;
use crate::error::{ErrorClass, MigrateError, Result};
use crate::mapping::IdMappingRegistry;
use crate::migrator::{build_migrator, MigratorContext, ResourceKind};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::state::{
    KindStatus, NoOpStateBackend, ResourceMigrationRecord, Session, SessionStatus, SessionStore,
    StateBackend,
};
use crate::transport::{StatsSnapshot, Transport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    backend: Arc<dyn StateBackend>,
    source: Arc<Transport>,
    destination: Arc<Transport>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub session_id: String,

    pub status: SessionStatus,

    pub dry_run: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Wall time of this attempt (not of the whole session).
    pub duration_seconds: f64,

    pub kinds: Vec<KindReport>,

    /// Items created or updated, across kinds.
    pub succeeded: usize,

    pub failed: usize,

    /// Items mapped to existing objects or left unchanged.
    pub skipped: usize,

    pub source_requests: StatsSnapshot,

    pub destination_requests: StatsSnapshot,
}

/// Per-kind part of a [`MigrationReport`].
#[derive(Debug, Clone, Serialize)]
pub struct KindReport {
    pub kind: ResourceKind,
    pub status: KindStatus,
    pub total: Option<u64>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub failures: Vec<FailureReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub source_id: String,
    pub class: ErrorClass,
    pub message: String,
    pub attempts: u32,
}

impl KindReport {
    fn from_record(record: &ResourceMigrationRecord) -> Self {
        let skipped = record.skipped_count();
        Self {
            kind: record.kind,
            status: record.status,
            total: record.total,
            succeeded: record.succeeded.len() - skipped,
            failed: record.failed.len(),
            skipped,
            error: record.error.clone(),
            failures: record
                .failed
                .iter()
                .map(|(source_id, failure)| FailureReport {
                    source_id: source_id.clone(),
                    class: failure.class,
                    message: failure.message.clone(),
                    attempts: failure.attempts,
                })
                .collect(),
        }
    }
}

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub api_url: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source: EndpointHealth,
    pub destination: EndpointHealth,
    pub healthy: bool,
}

impl Orchestrator {
    /// Create an orchestrator. Dry runs never persist state, whatever backend is passed.
    pub fn new(config: Config, backend: Arc<dyn StateBackend>) -> Result<Self> {
        config.validate()?;

        let source = Transport::new("source", &config.source, &config.migration)?;
        let destination = Transport::new("destination", &config.destination, &config.migration)?;
        let backend: Arc<dyn StateBackend> = if config.migration.dry_run {
            Arc::new(NoOpStateBackend::new())
        } else {
            backend
        };

        Ok(Self {
            config,
            backend,
            source: Arc::new(source),
            destination: Arc::new(destination),
        })
    }

    /// Start a new session and run it.
    ///
    /// A run stopped by a kind-level failure or cancellation returns
    /// [`MigrateError::Aborted`] carrying the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let store = SessionStore::create_session(self.backend.clone(), &self.config).await?;
        info!(
            "Starting migration session {}{}",
            store.session_id(),
            if self.config.migration.dry_run { " (dry run)" } else { "" }
        );
        self.execute(Arc::new(store), IdMappingRegistry::new(), cancel)
            .await
    }

    /// Continue an earlier session. Kinds already completed are skipped and
    /// the identifier mappings are restored from the session.
    pub async fn resume(&self, session_id: &str, cancel: &CancellationToken) -> Result<MigrationReport> {
        let store = SessionStore::load_session(self.backend.clone(), session_id, &self.config).await?;
        let session = store.snapshot().await;
        let registry = IdMappingRegistry::from_snapshot(&session.mappings);
        info!(
            "Resuming session {} with {} restored mappings",
            session_id,
            session.mappings.values().map(|m| m.len()).sum::<usize>()
        );
        self.execute(Arc::new(store), registry, cancel).await
    }

    async fn execute(
        &self,
        store: Arc<SessionStore>,
        registry: IdMappingRegistry,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let migration = &self.config.migration;
        let registry = Arc::new(registry);

        let ctx = MigratorContext {
            source: self.source.clone(),
            destination: self.destination.clone(),
            registry: registry.clone(),
            config: Arc::new(migration.clone()),
        };
        let scheduler = Scheduler::new(
            store.clone(),
            registry,
            RetryPolicy::from_config(migration),
            SchedulerOptions::from_config(migration),
        );

        // Session records are stored in dependency order
        let kinds: Vec<ResourceKind> = store
            .snapshot()
            .await
            .kinds
            .iter()
            .map(|r| r.kind)
            .collect();

        // Kinds that gained mappings in this attempt
        let mut grew: HashSet<ResourceKind> = HashSet::new();
        let mut outcome: Result<()> = Ok(());
        for kind in kinds {
            if cancel.is_cancelled() {
                outcome = Err(MigrateError::Cancelled);
                break;
            }
            if kind.dependencies().iter().any(|d| grew.contains(d)) {
                if let Err(e) = self.reopen(&store, kind).await {
                    outcome = Err(e);
                    break;
                }
            }
            if !store.needs_work(kind, migration.retry_failed).await {
                info!("{}: already completed in this session, skipping", kind);
                continue;
            }

            let mapped_before = ctx.registry.count(kind);
            let migrator = build_migrator(kind, &ctx);
            let result = scheduler.migrate_kind(migrator, cancel).await;
            if ctx.registry.count(kind) > mapped_before {
                grew.insert(kind);
            }
            match result {
                Ok(record) => {
                    info!(
                        "{}: {} succeeded, {} failed, {} skipped",
                        kind,
                        record.succeeded.len() - record.skipped_count(),
                        record.failed.len(),
                        record.skipped_count()
                    );
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let closed = match &outcome {
            Ok(()) => store.mark_completed().await,
            Err(_) => store.mark_aborted().await,
        };
        if let Err(e) = closed {
            warn!("Failed to persist final session status: {}", e);
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }

        let report = self.report(&store.snapshot().await, started_at);
        self.log_report(&report);

        match outcome {
            Ok(()) => Ok(report),
            Err(error) => Err(MigrateError::Aborted {
                report: Box::new(report),
                error: Box::new(error),
            }),
        }
    }

    /// A dependency gained mappings, so parents the listing of `kind` walks
    /// may now sit before its saved cursor. List it again from the start;
    /// items that already succeeded are skipped.
    async fn reopen(&self, store: &SessionStore, kind: ResourceKind) -> Result<()> {
        let Some(record) = store.record(kind).await else {
            return Ok(());
        };
        if record.cursor.is_some() || record.status == KindStatus::Completed {
            info!("{}: dependencies gained mappings, listing again from the start", kind);
            store.reset_cursor(kind).await?;
        }
        Ok(())
    }

    fn report(&self, session: &Session, started_at: DateTime<Utc>) -> MigrationReport {
        let completed_at = Utc::now();
        let kinds: Vec<KindReport> = session.kinds.iter().map(KindReport::from_record).collect();
        MigrationReport {
            session_id: session.session_id.clone(),
            status: session.status,
            dry_run: session.dry_run,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            succeeded: kinds.iter().map(|k| k.succeeded).sum(),
            failed: kinds.iter().map(|k| k.failed).sum(),
            skipped: kinds.iter().map(|k| k.skipped).sum(),
            kinds,
            source_requests: self.source.stats(),
            destination_requests: self.destination.stats(),
        }
    }

    fn log_report(&self, report: &MigrationReport) {
        info!(
            "Session {} {}: {} succeeded, {} failed, {} skipped in {:.1}s",
            report.session_id,
            report.status,
            report.succeeded,
            report.failed,
            report.skipped,
            report.duration_seconds
        );
        for (label, stats) in [
            ("source", &report.source_requests),
            ("destination", &report.destination_requests),
        ] {
            info!(
                "{}: {} requests, {} errors ({:.1}% success)",
                label,
                stats.requests,
                stats.errors,
                stats.success_rate * 100.0
            );
        }
    }

    /// Probe both endpoints concurrently.
    pub async fn health_check(&self) -> HealthCheckResult {
        let (source, destination) = tokio::join!(
            probe(&self.source),
            probe(&self.destination)
        );
        let healthy = source.connected && destination.connected;
        HealthCheckResult {
            source,
            destination,
            healthy,
        }
    }
}

async fn probe(transport: &Transport) -> EndpointHealth {
    let started = std::time::Instant::now();
    match transport.probe().await {
        Ok(latency) => EndpointHealth {
            api_url: transport.api_url().to_string(),
            connected: true,
            latency_ms: latency.as_millis() as u64,
            error: None,
        },
        Err(e) => EndpointHealth {
            api_url: transport.api_url().to_string(),
            connected: false,
            latency_ms: started.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    }
}

impl MigrationReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
