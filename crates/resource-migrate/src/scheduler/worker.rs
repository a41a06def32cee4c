//! Per-item migration steps executed by pool workers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BatchItemResult, SchedulerOptions};
use crate::error::{MigrateError, Result};
use crate::mapping::{IdMappingRegistry, MappingEntry};
use crate::migrator::{DestinationPayload, ResourceKind, ResourceMigrator, SourceItem};
use crate::retry::RetryPolicy;
use crate::state::{FailedItem, ItemAction, ItemOutcome, SessionStore, SucceededItem};

/// Everything a worker needs for one kind; shared by all workers of a page.
pub(crate) struct WorkerContext {
    pub migrator: Arc<dyn ResourceMigrator>,
    pub registry: Arc<IdMappingRegistry>,
    pub store: Arc<SessionStore>,
    pub policy: RetryPolicy,
    pub options: SchedulerOptions,
    /// Items that already succeeded in this session.
    pub done: Arc<HashSet<String>>,
    /// Items that failed in an earlier attempt of this session.
    pub prior_failed: Arc<HashSet<String>>,
    /// Stops workers taking new work; set by the caller or by a fatal error.
    pub abort: CancellationToken,
    pub fatal: Mutex<Option<MigrateError>>,
}

impl WorkerContext {
    fn kind(&self) -> ResourceKind {
        self.migrator.kind()
    }

    /// Keep the first fatal error and stop the page.
    fn set_fatal(&self, err: MigrateError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.cancel();
    }

    pub fn take_fatal(&self) -> Option<MigrateError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Run one lane in order. Returns results and whether every item was handled.
    pub async fn run_lane(&self, lane: Vec<SourceItem>) -> (Vec<BatchItemResult>, bool) {
        let mut results = Vec::with_capacity(lane.len());
        for item in &lane {
            if self.abort.is_cancelled() {
                return (results, false);
            }
            match self.process(item).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(fatal) => {
                    self.set_fatal(fatal);
                    return (results, false);
                }
            }
        }
        (results, true)
    }

    /// Migrate one item and persist its outcome.
    ///
    /// `Ok(None)` means the item needed no work in this attempt. `Err` is
    /// reserved for errors that must stop the kind.
    async fn process(&self, item: &SourceItem) -> Result<Option<BatchItemResult>> {
        let kind = self.kind();
        let source_id = item.source_id.as_str();

        if self.done.contains(source_id) {
            return Ok(None);
        }
        if self.prior_failed.contains(source_id) && !self.options.retry_failed {
            debug!("{} {}: failed earlier, not retrying", kind, source_id);
            return Ok(None);
        }

        let (outcome, fatal) = match self.migrate(item).await {
            Ok((item_result, mapping)) => (
                ItemOutcome::Succeeded {
                    item: item_result,
                    mapping,
                },
                None,
            ),
            Err((err, attempts)) => {
                warn!("{} {}: {}", kind, source_id, err);
                let failure = FailedItem::from_error(&err, attempts);
                let fatal = err.is_fatal().then_some(err);
                (ItemOutcome::Failed(failure), fatal)
            }
        };

        self.store
            .record_item_outcome(kind, source_id, outcome.clone())
            .await?;

        if let Some(err) = fatal {
            return Err(err);
        }

        let result = match outcome {
            ItemOutcome::Succeeded { item, .. } => Ok(item),
            ItemOutcome::Failed(failure) => Err(failure),
        };
        Ok(Some(BatchItemResult {
            source_id: source_id.to_string(),
            result,
        }))
    }

    /// Transform, check the registry, then create (or map) on the destination.
    async fn migrate(
        &self,
        item: &SourceItem,
    ) -> std::result::Result<(SucceededItem, Option<MappingEntry>), (MigrateError, u32)> {
        let kind = self.kind();
        let source_id = item.source_id.as_str();

        if let Some(reason) = &item.invalid {
            return Err((
                MigrateError::Validation(format!("{} {}: {}", kind, source_id, reason)),
                0,
            ));
        }

        let payload = self
            .migrator
            .transform(item, self.registry.as_ref())
            .map_err(|e| (e, 0))?;

        if let Some(existing) = self.registry.get(kind, source_id) {
            return self.refresh(existing, &payload).await;
        }

        // Another worker may map the key first; the registry then wins with Unchanged.
        let mut action = ItemAction::Unchanged;
        let mut attempts = 0;
        let resolved = {
            let (payload, action, attempts) = (&payload, &mut action, &mut attempts);
            self.registry
                .resolve_or_create(kind, source_id, &payload.fingerprint, move || {
                    self.create(payload, action, attempts)
                })
                .await
        };
        let destination_id = resolved.map_err(|e| (e, attempts))?;

        // Dry-run placeholders live in the registry only, never in the session.
        if self.options.dry_run {
            return Ok((
                SucceededItem {
                    action,
                    destination_id: None,
                    attempts,
                },
                None,
            ));
        }
        Ok((
            SucceededItem {
                action,
                destination_id: Some(destination_id.clone()),
                attempts,
            },
            Some(MappingEntry {
                destination_id,
                fingerprint: payload.fingerprint.clone(),
            }),
        ))
    }

    /// Produce the destination id for an unmapped item, recording how it was
    /// obtained in `action` and the create attempts in `attempts`.
    ///
    /// A dry run answers with a `dry-run-<source id>` placeholder so dependent
    /// kinds can still be listed and transformed.
    async fn create(
        &self,
        payload: &DestinationPayload,
        action: &mut ItemAction,
        attempts: &mut u32,
    ) -> Result<String> {
        let kind = self.kind();
        let source_id = payload.source_id.as_str();

        if self.options.dry_run {
            *action = ItemAction::WouldCreate;
            return Ok(format!("dry-run-{}", source_id));
        }

        if self.options.skip_existing {
            let found = self
                .policy
                .call(&format!("find {} {}", kind, source_id), |_| {
                    self.migrator.find_existing(payload)
                })
                .await?;
            if let Some(destination_id) = found {
                debug!("{} {}: already on destination as {}", kind, source_id, destination_id);
                *action = ItemAction::Mapped;
                return Ok(destination_id);
            }
        }

        let attempted = self
            .policy
            .run(&format!("create {} {}", kind, source_id), |_| {
                self.migrator.load(payload)
            })
            .await;
        *attempts = attempted.attempts;

        match attempted.result {
            Ok(destination_id) => {
                *action = ItemAction::Created;
                Ok(destination_id)
            }
            Err(MigrateError::Conflict(message)) => {
                let found = self
                    .policy
                    .call(&format!("resolve conflict {} {}", kind, source_id), |_| {
                        self.migrator.find_existing(payload)
                    })
                    .await?;
                match found {
                    Some(destination_id) => {
                        debug!(
                            "{} {}: conflict resolved to existing {}",
                            kind, source_id, destination_id
                        );
                        *action = ItemAction::Mapped;
                        Ok(destination_id)
                    }
                    None => Err(MigrateError::Conflict(format!(
                        "{} (no matching destination object found)",
                        message
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Item already mapped: skip when unchanged, otherwise update in place.
    async fn refresh(
        &self,
        existing: MappingEntry,
        payload: &DestinationPayload,
    ) -> std::result::Result<(SucceededItem, Option<MappingEntry>), (MigrateError, u32)> {
        if existing.fingerprint == payload.fingerprint {
            return Ok((
                SucceededItem {
                    action: ItemAction::Unchanged,
                    destination_id: Some(existing.destination_id.clone()),
                    attempts: 0,
                },
                Some(existing),
            ));
        }
        if self.options.dry_run {
            return Ok((
                SucceededItem {
                    action: ItemAction::WouldCreate,
                    destination_id: Some(existing.destination_id),
                    attempts: 0,
                },
                None,
            ));
        }

        let kind = self.kind();
        let attempted = self
            .policy
            .run(&format!("update {} {}", kind, payload.source_id), |_| {
                self.migrator.update(&existing.destination_id, payload)
            })
            .await;
        match attempted.result {
            Ok(()) => self.store_mapping(
                payload,
                existing.destination_id,
                ItemAction::Updated,
                attempted.attempts,
            ),
            Err(e) => Err((e, attempted.attempts)),
        }
    }

    fn store_mapping(
        &self,
        payload: &DestinationPayload,
        destination_id: String,
        action: ItemAction,
        attempts: u32,
    ) -> std::result::Result<(SucceededItem, Option<MappingEntry>), (MigrateError, u32)> {
        self.registry
            .put(
                self.kind(),
                &payload.source_id,
                &destination_id,
                &payload.fingerprint,
            )
            .map_err(|e| (e, attempts))?;
        Ok((
            SucceededItem {
                action,
                destination_id: Some(destination_id.clone()),
                attempts,
            },
            Some(MappingEntry {
                destination_id,
                fingerprint: payload.fingerprint.clone(),
            }),
        ))
    }
}
