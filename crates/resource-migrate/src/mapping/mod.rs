//! Source to destination identifier mapping shared by all workers.
//!
//! The registry is the only structure every worker writes to. The lock is
//! held for a map lookup or insert and never across an await point.

use crate::error::{MigrateError, Result};
use crate::migrator::ResourceKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Destination id plus fingerprint of the content it was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub destination_id: String,
    pub fingerprint: String,
}

/// Read-only view used by transforms to resolve references.
pub trait MappingLookup: Send + Sync {
    /// Destination id for `(kind, source_id)`, if mapped.
    fn lookup(&self, kind: ResourceKind, source_id: &str) -> Option<String>;

    /// Destination id or a dependency-unresolved error.
    fn require(&self, kind: ResourceKind, source_id: &str) -> Result<String> {
        self.lookup(kind, source_id)
            .ok_or_else(|| MigrateError::dependency(kind, source_id))
    }
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Same destination id was already stored; fingerprint refreshed.
    Unchanged,
}

/// Synchronized (kind, source id) -> destination id table.
#[derive(Debug, Default)]
pub struct IdMappingRegistry {
    entries: Mutex<HashMap<(ResourceKind, String), MappingEntry>>,
}

impl IdMappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a persisted mapping table.
    pub fn from_snapshot(snapshot: &BTreeMap<ResourceKind, BTreeMap<String, MappingEntry>>) -> Self {
        let mut entries = HashMap::new();
        for (kind, table) in snapshot {
            for (source_id, entry) in table {
                entries.insert((*kind, source_id.clone()), entry.clone());
            }
        }
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<(ResourceKind, String), MappingEntry>> {
        // A panicking worker cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a mapping. Re-putting the same destination id is a no-op that
    /// refreshes the fingerprint; a different destination id is an error.
    pub fn put(
        &self,
        kind: ResourceKind,
        source_id: &str,
        destination_id: &str,
        fingerprint: &str,
    ) -> Result<PutOutcome> {
        let mut table = self.table();
        match table.get_mut(&(kind, source_id.to_string())) {
            Some(existing) if existing.destination_id == destination_id => {
                existing.fingerprint = fingerprint.to_string();
                Ok(PutOutcome::Unchanged)
            }
            Some(existing) => Err(MigrateError::MappingConflict {
                kind,
                source_id: source_id.to_string(),
                existing: existing.destination_id.clone(),
                offered: destination_id.to_string(),
            }),
            None => {
                table.insert(
                    (kind, source_id.to_string()),
                    MappingEntry {
                        destination_id: destination_id.to_string(),
                        fingerprint: fingerprint.to_string(),
                    },
                );
                Ok(PutOutcome::Inserted)
            }
        }
    }

    /// Full entry for a key.
    pub fn get(&self, kind: ResourceKind, source_id: &str) -> Option<MappingEntry> {
        self.table().get(&(kind, source_id.to_string())).cloned()
    }

    /// Return the mapped id, or run `create` and store what it returns.
    ///
    /// `create` runs without the lock held. If another worker maps the same
    /// key meanwhile, the `put` conflict check decides which id wins.
    pub async fn resolve_or_create<F, Fut>(
        &self,
        kind: ResourceKind,
        source_id: &str,
        fingerprint: &str,
        create: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(entry) = self.get(kind, source_id) {
            return Ok(entry.destination_id);
        }

        let destination_id = create().await?;
        self.put(kind, source_id, &destination_id, fingerprint)?;
        debug!("Mapped {} {} -> {}", kind, source_id, destination_id);
        Ok(destination_id)
    }

    /// Number of mappings stored for a kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.table().keys().filter(|(k, _)| *k == kind).count()
    }

    /// Source ids mapped for a kind, sorted.
    pub fn source_ids(&self, kind: ResourceKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Copy of the full table, grouped by kind, for persistence.
    pub fn snapshot(&self) -> BTreeMap<ResourceKind, BTreeMap<String, MappingEntry>> {
        let mut out: BTreeMap<ResourceKind, BTreeMap<String, MappingEntry>> = BTreeMap::new();
        for ((kind, source_id), entry) in self.table().iter() {
            out.entry(*kind)
                .or_default()
                .insert(source_id.clone(), entry.clone());
        }
        out
    }
}

impl MappingLookup for IdMappingRegistry {
    fn lookup(&self, kind: ResourceKind, source_id: &str) -> Option<String> {
        self.get(kind, source_id).map(|e| e.destination_id)
    }
}

/// SHA256 over the canonical JSON of a payload body.
///
/// serde_json orders object keys, so equal bodies always hash equally.
pub fn content_fingerprint(body: &serde_json::Value) -> String {
    let canonical = body.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_put_and_get() {
        let registry = IdMappingRegistry::new();
        assert_eq!(
            registry.put(ResourceKind::Dataset, "src-1", "dst-1", "fp").unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(
            registry.lookup(ResourceKind::Dataset, "src-1"),
            Some("dst-1".to_string())
        );
        assert_eq!(registry.lookup(ResourceKind::Project, "src-1"), None);
    }

    #[test]
    fn test_same_put_is_idempotent() {
        let registry = IdMappingRegistry::new();
        registry.put(ResourceKind::Dataset, "src-1", "dst-1", "fp-a").unwrap();
        assert_eq!(
            registry.put(ResourceKind::Dataset, "src-1", "dst-1", "fp-b").unwrap(),
            PutOutcome::Unchanged
        );
        assert_eq!(
            registry.get(ResourceKind::Dataset, "src-1").unwrap().fingerprint,
            "fp-b"
        );
        assert_eq!(registry.count(ResourceKind::Dataset), 1);
    }

    #[test]
    fn test_conflicting_put_fails_loudly() {
        let registry = IdMappingRegistry::new();
        registry.put(ResourceKind::Dataset, "src-1", "dst-1", "fp").unwrap();
        let err = registry
            .put(ResourceKind::Dataset, "src-1", "dst-2", "fp")
            .unwrap_err();
        assert!(matches!(err, MigrateError::MappingConflict { .. }));
        assert_eq!(
            registry.lookup(ResourceKind::Dataset, "src-1"),
            Some("dst-1".to_string())
        );
    }

    #[test]
    fn test_require_reports_unresolved_dependency() {
        let registry = IdMappingRegistry::new();
        let err = registry.require(ResourceKind::Project, "missing").unwrap_err();
        assert!(matches!(
            err,
            MigrateError::DependencyUnresolved {
                kind: ResourceKind::Project,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resolve_or_create_only_creates_once() {
        let registry = IdMappingRegistry::new();
        let creates = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let creates = creates.clone();
            let id = registry
                .resolve_or_create(ResourceKind::Project, "p-1", "fp", || async move {
                    creates.fetch_add(1, Ordering::SeqCst);
                    Ok("dest-p-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(id, "dest-p-1");
        }

        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let registry = IdMappingRegistry::new();
        registry.put(ResourceKind::Dataset, "d-1", "n-1", "fp1").unwrap();
        registry.put(ResourceKind::Example, "e-1", "n-2", "fp2").unwrap();

        let restored = IdMappingRegistry::from_snapshot(&registry.snapshot());
        assert_eq!(restored.lookup(ResourceKind::Dataset, "d-1"), Some("n-1".into()));
        assert_eq!(restored.lookup(ResourceKind::Example, "e-1"), Some("n-2".into()));
        assert_eq!(restored.source_ids(ResourceKind::Dataset), vec!["d-1".to_string()]);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"name": "x", "description": "y"});
        let b = json!({"description": "y", "name": "x"});
        assert_eq!(content_fingerprint(&a), content_fingerprint(&b));
        assert_ne!(content_fingerprint(&a), content_fingerprint(&json!({"name": "z"})));
    }
}
