//! Bounded-concurrency execution of one resource kind.
//!
//! A reader task pulls pages from the migrator ahead of the workers
//! (bounded look-ahead). Each page is split into lanes and fed to a fixed
//! pool of workers over a multi-consumer channel. The page's cursor is
//! persisted only after every lane of the page is done, so a resumed run
//! restarts at the first page that was not fully processed.

mod lanes;
mod worker;

pub use lanes::{build_lanes, Lane};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MigrationConfig, MAX_WORKERS};
use crate::error::{MigrateError, Result};
use crate::mapping::IdMappingRegistry;
use crate::migrator::{ResourceKind, ResourceMigrator, SourceItem};
use crate::retry::RetryPolicy;
use crate::state::{FailedItem, ResourceMigrationRecord, SessionStore, SucceededItem};
use crate::transport::{Cursor, Page};
use worker::WorkerContext;

/// Pages fetched ahead of the page being processed.
const LOOK_AHEAD_PAGES: usize = 1;

/// Knobs that change how items are processed.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub dry_run: bool,
    pub retry_failed: bool,
    pub skip_existing: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            workers: config.get_workers(),
            dry_run: config.dry_run,
            retry_failed: config.retry_failed,
            skip_existing: config.skip_existing,
        }
    }
}

/// Outcome of one item in a batch.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub source_id: String,
    pub result: std::result::Result<SucceededItem, FailedItem>,
}

/// Outcomes of the items submitted from one page.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub items: Vec<BatchItemResult>,
}

impl BatchResult {
    pub fn submitted(&self) -> usize {
        self.items.len()
    }

    pub fn successes(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failures(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_err()).count()
    }

    fn extend(&mut self, other: Vec<BatchItemResult>) {
        self.items.extend(other);
    }
}

/// Runs resource kinds against a shared registry and session store.
pub struct Scheduler {
    store: Arc<SessionStore>,
    registry: Arc<IdMappingRegistry>,
    policy: RetryPolicy,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<IdMappingRegistry>,
        policy: RetryPolicy,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            options,
        }
    }

    fn worker_count(&self) -> usize {
        self.options.workers.clamp(1, MAX_WORKERS)
    }

    /// Migrate every item of one kind and return its final record.
    ///
    /// Item failures are recorded and do not stop the kind. A listing
    /// failure marks the kind failed and returns a kind-level error.
    pub async fn migrate_kind(
        &self,
        migrator: Arc<dyn ResourceMigrator>,
        cancel: &CancellationToken,
    ) -> Result<ResourceMigrationRecord> {
        let kind = migrator.kind();
        let resume = self.store.begin_kind(kind).await?;
        let done: Arc<HashSet<String>> = Arc::new(resume.succeeded.keys().cloned().collect());
        let prior_failed: Arc<HashSet<String>> = Arc::new(resume.failed.keys().cloned().collect());

        // Failures can sit on pages before the cursor; succeeded ids are skipped anyway.
        let start = if self.options.retry_failed && !prior_failed.is_empty() {
            info!("{}: relisting from the start to retry {} failed items", kind, prior_failed.len());
            None
        } else {
            resume.cursor.clone()
        };

        info!(
            "{}: starting with {} workers{}",
            kind,
            self.worker_count(),
            match &start {
                Some(cursor) => format!(" from cursor {} ({} already done)", cursor, done.len()),
                None => String::new(),
            }
        );

        let reader_cancel = cancel.child_token();
        let (page_tx, mut page_rx) = mpsc::channel(LOOK_AHEAD_PAGES);
        let reader = tokio::spawn(read_pages(
            migrator.clone(),
            start,
            page_tx,
            reader_cancel.clone(),
        ));

        let mut totals = BatchResult::default();
        let mut pages = 0u64;
        let mut outcome: Result<()> = Ok(());

        while let Some(fetched) = page_rx.recv().await {
            let page = match fetched {
                Ok(page) => page,
                Err(e) => {
                    error!("{}: listing failed: {}", kind, e);
                    outcome = Err(e);
                    break;
                }
            };
            if cancel.is_cancelled() {
                break;
            }

            pages += 1;
            let next_cursor = page.next_cursor.clone();
            let ctx = Arc::new(WorkerContext {
                migrator: migrator.clone(),
                registry: self.registry.clone(),
                store: self.store.clone(),
                policy: self.policy.clone(),
                options: self.options.clone(),
                done: done.clone(),
                prior_failed: prior_failed.clone(),
                abort: cancel.child_token(),
                fatal: Mutex::new(None),
            });

            let (batch, complete) = self.run_page(ctx.clone(), page.items).await;
            debug!(
                "{}: page {}: {} submitted, {} succeeded, {} failed",
                kind,
                pages,
                batch.submitted(),
                batch.successes(),
                batch.failures()
            );
            totals.extend(batch.items);

            if let Some(fatal) = ctx.take_fatal() {
                outcome = Err(fatal);
                break;
            }
            if !complete {
                break;
            }
            if let Err(e) = self.store.complete_page(kind, next_cursor).await {
                outcome = Err(e);
                break;
            }
        }

        reader_cancel.cancel();
        drop(page_rx);
        if let Err(e) = reader.await {
            warn!("{}: page reader ended abnormally: {}", kind, e);
        }

        info!(
            "{}: {} items submitted in {} pages, {} succeeded, {} failed",
            kind,
            totals.submitted(),
            pages,
            totals.successes(),
            totals.failures()
        );

        match outcome {
            Err(e) => {
                if !matches!(e, MigrateError::State(_) | MigrateError::Io(_)) {
                    self.store.finish_kind(kind, Some(&e.to_string())).await?;
                }
                Err(kind_error(kind, e))
            }
            Ok(()) if cancel.is_cancelled() => {
                info!("{}: cancelled, state kept for resume", kind);
                Err(MigrateError::Cancelled)
            }
            Ok(()) => self.store.finish_kind(kind, None).await,
        }
    }

    /// Run one page: split into lanes, dispatch to the pool, wait for all.
    ///
    /// The flag is false when some lane was not fully processed.
    async fn run_page(&self, ctx: Arc<WorkerContext>, items: Vec<SourceItem>) -> (BatchResult, bool) {
        let lanes = build_lanes(items);
        let lane_count = lanes.len();
        if lane_count == 0 {
            return (BatchResult::default(), true);
        }

        let workers = self.worker_count().min(lane_count);
        let (lane_tx, lane_rx) = async_channel::bounded::<Lane>(workers * 2);
        let lanes_done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let lane_rx = lane_rx.clone();
            let ctx = ctx.clone();
            let lanes_done = lanes_done.clone();
            handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                while let Ok(lane) = lane_rx.recv().await {
                    if ctx.abort.is_cancelled() {
                        break;
                    }
                    let (lane_results, finished) = ctx.run_lane(lane).await;
                    results.extend(lane_results);
                    if finished {
                        lanes_done.fetch_add(1, Ordering::SeqCst);
                    }
                }
                debug!("Worker {} finished", worker_id);
                results
            }));
        }
        // Drop our copy of lane_rx so the channel closes when workers stop
        drop(lane_rx);

        for lane in lanes {
            if ctx.abort.is_cancelled() {
                break;
            }
            if lane_tx.send(lane).await.is_err() {
                break;
            }
        }
        drop(lane_tx);

        let mut batch = BatchResult::default();
        for handle in handles {
            match handle.await {
                Ok(results) => batch.extend(results),
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    ctx.abort.cancel();
                }
            }
        }

        let complete = lanes_done.load(Ordering::SeqCst) == lane_count;
        (batch, complete)
    }
}

/// Fetch pages ahead of the workers until the listing ends or fails.
async fn read_pages(
    migrator: Arc<dyn ResourceMigrator>,
    mut cursor: Option<Cursor>,
    tx: mpsc::Sender<Result<Page<SourceItem>>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match migrator.extract_page(cursor.as_ref()).await {
            Ok(page) => {
                let next = page.next_cursor.clone();
                if tx.send(Ok(page)).await.is_err() {
                    return;
                }
                match next {
                    Some(next) => cursor = Some(next),
                    None => return,
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

/// Errors that keep their own identity; everything else becomes `KindFailed`.
fn kind_error(kind: ResourceKind, err: MigrateError) -> MigrateError {
    match err {
        MigrateError::Authentication { .. }
        | MigrateError::Cancelled
        | MigrateError::State(_)
        | MigrateError::Io(_)
        | MigrateError::KindFailed { .. } => err,
        other => MigrateError::kind_failed(kind, other.to_string()),
    }
}
