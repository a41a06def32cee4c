//! Durable session state for resume capability.
//!
//! A [`Session`] records one migration run: which kinds have been processed,
//! which items succeeded or failed, the listing cursor of every kind and the
//! full identifier mapping table. Item outcomes are appended to a signed
//! per-session journal as they happen; everything else, and the journal
//! itself at page and kind boundaries, is folded into the signed snapshot.

mod backend;
mod file;
mod noop;
mod store;

pub use backend::StateBackend;
pub use file::FileStateBackend;
pub use noop::NoOpStateBackend;
pub use store::SessionStore;

use crate::error::{ErrorClass, MigrateError, Result};
use crate::mapping::MappingEntry;
use crate::migrator::ResourceKind;
use crate::transport::Cursor;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Current on-disk schema version. Files with a newer version are rejected.
pub const SCHEMA_VERSION: u32 = 1;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        })
    }
}

/// Per-kind status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for KindStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KindStatus::Pending => "pending",
            KindStatus::InProgress => "in_progress",
            KindStatus::Completed => "completed",
            KindStatus::Failed => "failed",
        })
    }
}

/// What happened to an item that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    /// Created on the destination.
    Created,
    /// Mapping existed with different content; destination object updated.
    Updated,
    /// An equivalent destination object already existed and was mapped.
    Mapped,
    /// Mapping existed with identical content; nothing sent.
    Unchanged,
    /// Dry run; nothing sent.
    WouldCreate,
}

impl ItemAction {
    /// Whether the item counts as skipped in reports.
    pub fn is_skip(self) -> bool {
        matches!(self, ItemAction::Mapped | ItemAction::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SucceededItem {
    pub action: ItemAction,
    pub destination_id: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub class: ErrorClass,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailedItem {
    pub fn from_error(err: &MigrateError, attempts: u32) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Outcome reported by a worker for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded {
        item: SucceededItem,
        /// Mapping to persist alongside the outcome.
        mapping: Option<MappingEntry>,
    },
    Failed(FailedItem),
}

/// Progress of one resource kind within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMigrationRecord {
    pub kind: ResourceKind,
    pub status: KindStatus,

    /// Items seen so far; final once the listing is exhausted.
    #[serde(default)]
    pub total: Option<u64>,

    /// Items with a recorded outcome. Never decreases.
    pub processed: u64,

    #[serde(default)]
    pub succeeded: BTreeMap<String, SucceededItem>,

    #[serde(default)]
    pub failed: BTreeMap<String, FailedItem>,

    /// Start of the first page not yet fully processed.
    #[serde(default)]
    pub cursor: Option<Cursor>,

    #[serde(default)]
    pub pages_completed: u64,

    /// Kind-level error that aborted the kind.
    #[serde(default)]
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResourceMigrationRecord {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            status: KindStatus::Pending,
            total: None,
            processed: 0,
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
            cursor: None,
            pages_completed: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Record an outcome. An id moves between the succeeded and failed sets
    /// but is never in both.
    pub fn apply(&mut self, source_id: &str, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded { item, .. } => {
                self.failed.remove(source_id);
                self.succeeded.insert(source_id.to_string(), item.clone());
            }
            ItemOutcome::Failed(failure) => {
                self.succeeded.remove(source_id);
                self.failed.insert(source_id.to_string(), failure.clone());
            }
        }
        let recorded = (self.succeeded.len() + self.failed.len()) as u64;
        self.processed = self.processed.max(recorded);
    }

    pub fn is_succeeded(&self, source_id: &str) -> bool {
        self.succeeded.contains_key(source_id)
    }

    pub fn is_failed(&self, source_id: &str) -> bool {
        self.failed.contains_key(source_id)
    }

    pub fn skipped_count(&self) -> usize {
        self.succeeded.values().filter(|s| s.action.is_skip()).count()
    }

    pub fn mark_in_progress(&mut self) {
        self.status = KindStatus::InProgress;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = KindStatus::Completed;
        self.cursor = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = KindStatus::Failed;
        self.error = Some(error.to_string());
    }
}

/// One migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,

    pub session_id: String,

    /// Resume hash of the endpoint pair; also the signing key.
    pub config_hash: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub source_fingerprint: String,
    pub destination_fingerprint: String,

    pub status: SessionStatus,

    #[serde(default)]
    pub dry_run: bool,

    /// One record per selected kind, in migration order.
    pub kinds: Vec<ResourceMigrationRecord>,

    /// Full identifier mapping table.
    #[serde(default)]
    pub mappings: BTreeMap<ResourceKind, BTreeMap<String, MappingEntry>>,

    /// Sequence number of the last journal entry applied.
    #[serde(default)]
    pub journal_seq: u64,

    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized session (without this field), keyed
    /// by `config_hash`. Unsigned files are accepted with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Session {
    pub fn new(
        session_id: String,
        config_hash: String,
        source_fingerprint: String,
        destination_fingerprint: String,
        kinds: &[ResourceKind],
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id,
            config_hash,
            created_at: now,
            updated_at: now,
            source_fingerprint,
            destination_fingerprint,
            status: SessionStatus::Active,
            dry_run: false,
            kinds: kinds.iter().map(|k| ResourceMigrationRecord::new(*k)).collect(),
            mappings: BTreeMap::new(),
            journal_seq: 0,
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize session for HMAC: {}", e)))?;
        sign(&self.config_hash, &content)
    }

    /// Sign and serialize as pretty JSON.
    pub fn to_signed_json(&self) -> Result<String> {
        let mut signed = self.clone();
        signed.hmac = Some(self.compute_hmac()?);
        serde_json::to_string_pretty(&signed)
            .map_err(|e| MigrateError::State(format!("Failed to serialize session: {}", e)))
    }

    /// Parse and verify a serialized session.
    pub fn from_json(content: &str) -> Result<Self> {
        let session: Self = serde_json::from_str(content)
            .map_err(|e| MigrateError::State(format!("Unreadable session file: {}", e)))?;

        if session.schema_version > SCHEMA_VERSION {
            return Err(MigrateError::State(format!(
                "Session {} uses schema version {}, this build supports up to {}",
                session.session_id, session.schema_version, SCHEMA_VERSION
            )));
        }

        match &session.hmac {
            Some(stored) => {
                if stored != &session.compute_hmac()? {
                    return Err(MigrateError::State(format!(
                        "Session {} failed integrity check: HMAC mismatch (possible tampering)",
                        session.session_id
                    )));
                }
            }
            None => tracing::warn!(
                "Session {} has no HMAC signature, integrity cannot be verified",
                session.session_id
            ),
        }

        Ok(session)
    }

    /// Fail unless the session was created for the same endpoint pair.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    pub fn record(&self, kind: ResourceKind) -> Option<&ResourceMigrationRecord> {
        self.kinds.iter().find(|r| r.kind == kind)
    }

    /// Record for `kind`, appended if the session did not select it before.
    pub fn record_mut(&mut self, kind: ResourceKind) -> &mut ResourceMigrationRecord {
        let idx = match self.kinds.iter().position(|r| r.kind == kind) {
            Some(idx) => idx,
            None => {
                self.kinds.push(ResourceMigrationRecord::new(kind));
                self.kinds.len() - 1
            }
        };
        &mut self.kinds[idx]
    }

    /// Apply an item outcome and its mapping.
    pub fn apply_outcome(&mut self, kind: ResourceKind, source_id: &str, outcome: &ItemOutcome) {
        if let ItemOutcome::Succeeded {
            mapping: Some(entry),
            ..
        } = outcome
        {
            self.mappings
                .entry(kind)
                .or_default()
                .insert(source_id.to_string(), entry.clone());
        }
        self.record_mut(kind).apply(source_id, outcome);
        self.touch();
    }

    /// Apply an outcome and return the journal entry that records it.
    pub fn journal_outcome(
        &mut self,
        kind: ResourceKind,
        source_id: &str,
        outcome: ItemOutcome,
    ) -> Result<JournalEntry> {
        self.apply_outcome(kind, source_id, &outcome);
        self.journal_seq += 1;
        JournalEntry::signed(self.journal_seq, kind, source_id, outcome, &self.config_hash)
    }

    /// Apply a journal entry written after this snapshot. Entries the
    /// snapshot already holds are ignored.
    pub fn replay(&mut self, entry: JournalEntry) -> Result<()> {
        entry.verify(&self.config_hash)?;
        if entry.seq <= self.journal_seq {
            return Ok(());
        }
        self.apply_outcome(entry.kind, &entry.source_id, &entry.outcome);
        self.journal_seq = entry.seq;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_aborted(&mut self) {
        self.status = SessionStatus::Aborted;
        self.touch();
    }

    /// Sessions that did not complete can be resumed.
    pub fn can_resume(&self) -> bool {
        self.status != SessionStatus::Completed && !self.dry_run
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            status: self.status,
            can_resume: self.can_resume(),
            kinds: self
                .kinds
                .iter()
                .map(|r| KindSummary {
                    kind: r.kind,
                    status: r.status,
                    total: r.total,
                    processed: r.processed,
                    succeeded: r.succeeded.len() as u64,
                    failed: r.failed.len() as u64,
                })
                .collect(),
        }
    }
}

fn sign(key: &str, content: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// One item outcome appended to a session's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub kind: ResourceKind,
    pub source_id: String,
    pub outcome: ItemOutcome,
    /// HMAC-SHA256 over the entry without this field, keyed like the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl JournalEntry {
    fn signed(
        seq: u64,
        kind: ResourceKind,
        source_id: &str,
        outcome: ItemOutcome,
        key: &str,
    ) -> Result<Self> {
        let mut entry = Self {
            seq,
            kind,
            source_id: source_id.to_string(),
            outcome,
            hmac: None,
        };
        entry.hmac = Some(entry.compute_hmac(key)?);
        Ok(entry)
    }

    fn compute_hmac(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize journal entry: {}", e)))?;
        sign(key, &content)
    }

    fn verify(&self, key: &str) -> Result<()> {
        if self.hmac.as_deref() != Some(self.compute_hmac(key)?.as_str()) {
            return Err(MigrateError::State(format!(
                "Journal entry {} failed integrity check: HMAC mismatch",
                self.seq
            )));
        }
        Ok(())
    }

    /// Serialize as one journal line, newline included.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize journal entry: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

/// Listing view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub can_resume: bool,
    pub kinds: Vec<KindSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub kind: ResourceKind,
    pub status: KindStatus,
    pub total: Option<u64>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}
