//! Session store: the single writer of session state.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{
    ItemOutcome, KindStatus, ResourceMigrationRecord, Session, SessionStatus, SessionSummary,
    StateBackend,
};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::migrator::{dependency_order, ResourceKind};
use crate::transport::Cursor;

/// Owns the in-memory session and persists every change through the backend
/// before returning.
///
/// Item outcomes go to the backend's journal; page and kind boundaries write
/// a full snapshot. The session lock only covers the in-memory change. The
/// `io` lock orders backend writes, so a snapshot always includes every
/// entry appended before it.
pub struct SessionStore {
    backend: Arc<dyn StateBackend>,
    session_id: String,
    session: Mutex<Session>,
    io: Mutex<()>,
}

impl SessionStore {
    /// Start a new session for `config` and persist it.
    pub async fn create_session(backend: Arc<dyn StateBackend>, config: &Config) -> Result<Self> {
        backend.init().await?;

        let kinds = dependency_order(&config.migration.selected_kinds())?;
        let mut session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            config.resume_hash(),
            config.source.fingerprint(),
            config.destination.fingerprint(),
            &kinds,
        );
        session.dry_run = config.migration.dry_run;
        backend.save(&session).await?;

        info!(
            "Created session {} ({} backend)",
            session.session_id,
            backend.backend_type()
        );
        Ok(Self::from_session(backend, session))
    }

    /// Load an existing session for resume.
    ///
    /// Fails with `ConfigChanged` when the session was created for a
    /// different pair of endpoints.
    pub async fn load_session(
        backend: Arc<dyn StateBackend>,
        session_id: &str,
        config: &Config,
    ) -> Result<Self> {
        backend.init().await?;

        let mut session = backend
            .load(session_id)
            .await?
            .ok_or_else(|| MigrateError::State(format!("Session {} not found", session_id)))?;

        session.validate_config(&config.resume_hash())?;
        if session.source_fingerprint != config.source.fingerprint()
            || session.destination_fingerprint != config.destination.fingerprint()
        {
            return Err(MigrateError::ConfigChanged);
        }
        if session.dry_run {
            return Err(MigrateError::State(format!(
                "Session {} was a dry run and cannot be resumed",
                session_id
            )));
        }

        session.status = SessionStatus::Active;
        session.touch();
        backend.save(&session).await?;

        info!("Resuming session {}", session_id);
        Ok(Self::from_session(backend, session))
    }

    fn from_session(backend: Arc<dyn StateBackend>, session: Session) -> Self {
        Self {
            backend,
            session_id: session.session_id.clone(),
            session: Mutex::new(session),
            io: Mutex::new(()),
        }
    }

    /// Apply `change` and save the resulting snapshot.
    async fn persist<T>(&self, change: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let _io = self.io.lock().await;
        let (snapshot, value) = {
            let mut session = self.session.lock().await;
            let value = change(&mut session);
            (session.clone(), value)
        };
        self.backend.save(&snapshot).await?;
        Ok(value)
    }

    /// Sessions that can be resumed, most recently updated first.
    pub async fn list_resumable_sessions(backend: &dyn StateBackend) -> Result<Vec<SessionSummary>> {
        Ok(backend
            .list()
            .await?
            .into_iter()
            .filter(Session::can_resume)
            .map(|s| s.summary())
            .collect())
    }

    /// Every stored session, most recently updated first.
    pub async fn list_sessions(backend: &dyn StateBackend) -> Result<Vec<SessionSummary>> {
        Ok(backend
            .list()
            .await?
            .iter()
            .map(Session::summary)
            .collect())
    }

    /// Most recently updated resumable session created for `config`'s endpoints.
    pub async fn latest_resumable(
        backend: &dyn StateBackend,
        config: &Config,
    ) -> Result<Option<String>> {
        let hash = config.resume_hash();
        Ok(backend
            .list()
            .await?
            .into_iter()
            .find(|s| s.can_resume() && s.config_hash == hash)
            .map(|s| s.session_id))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Copy of the current session.
    pub async fn snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Record for `kind` as currently stored.
    pub async fn record(&self, kind: ResourceKind) -> Option<ResourceMigrationRecord> {
        self.session.lock().await.record(kind).cloned()
    }

    /// Record one item's outcome (and its mapping) and persist it.
    pub async fn record_item_outcome(
        &self,
        kind: ResourceKind,
        source_id: &str,
        outcome: ItemOutcome,
    ) -> Result<()> {
        let _io = self.io.lock().await;
        let entry = self
            .session
            .lock()
            .await
            .journal_outcome(kind, source_id, outcome)?;
        self.backend.append_outcome(&self.session_id, &entry).await
    }

    /// Mark `kind` in progress and return its record as resume context.
    pub async fn begin_kind(&self, kind: ResourceKind) -> Result<ResourceMigrationRecord> {
        self.persist(|session| {
            let record = session.record_mut(kind);
            record.mark_in_progress();
            let record = record.clone();
            session.touch();
            record
        })
        .await
    }

    /// Persist the cursor after every item of a page has an outcome.
    pub async fn complete_page(&self, kind: ResourceKind, next_cursor: Option<Cursor>) -> Result<()> {
        self.persist(|session| {
            let record = session.record_mut(kind);
            record.pages_completed += 1;
            if next_cursor.is_none() {
                record.total = Some(record.succeeded.len() as u64 + record.failed.len() as u64);
            }
            record.cursor = next_cursor;
            session.touch();
        })
        .await
    }

    /// Forget where the listing of `kind` stopped, so its next run lists
    /// from the start. Recorded outcomes are kept.
    pub async fn reset_cursor(&self, kind: ResourceKind) -> Result<()> {
        self.persist(|session| {
            let record = session.record_mut(kind);
            record.cursor = None;
            if record.status == KindStatus::Completed {
                record.status = KindStatus::Pending;
            }
            session.touch();
        })
        .await
    }

    /// Close out `kind`: completed, or failed with the kind-level error.
    pub async fn finish_kind(&self, kind: ResourceKind, error: Option<&str>) -> Result<ResourceMigrationRecord> {
        self.persist(|session| {
            let record = session.record_mut(kind);
            match error {
                None => record.mark_completed(),
                Some(message) => record.mark_failed(message),
            }
            let record = record.clone();
            session.touch();
            record
        })
        .await
    }

    /// Kinds whose record still needs work on resume.
    pub async fn needs_work(&self, kind: ResourceKind, retry_failed: bool) -> bool {
        match self.session.lock().await.record(kind) {
            None => true,
            Some(record) => {
                record.status != KindStatus::Completed || (retry_failed && !record.failed.is_empty())
            }
        }
    }

    pub async fn mark_completed(&self) -> Result<()> {
        self.persist(Session::mark_completed).await
    }

    pub async fn mark_aborted(&self) -> Result<()> {
        self.persist(Session::mark_aborted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, MigrationConfig};
    use crate::mapping::MappingEntry;
    use crate::state::{FileStateBackend, ItemAction, SucceededItem};
    use tempfile::TempDir;

    fn config() -> Config {
        let endpoint = |url: &str| EndpointConfig {
            base_url: url.to_string(),
            api_key: "key".to_string(),
            verify_ssl: true,
            timeout_secs: 30,
        };
        Config {
            source: endpoint("https://old.example.com"),
            destination: endpoint("https://new.example.com"),
            migration: MigrationConfig::default(),
        }
    }

    fn created(dest: &str) -> ItemOutcome {
        ItemOutcome::Succeeded {
            item: SucceededItem {
                action: ItemAction::Created,
                destination_id: Some(dest.into()),
                attempts: 1,
            },
            mapping: Some(MappingEntry {
                destination_id: dest.into(),
                fingerprint: "fp".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_outcome_persisted_before_return() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let store = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();

        store
            .record_item_outcome(ResourceKind::Dataset, "d-1", created("n-1"))
            .await
            .unwrap();

        // Read straight from disk, not from the store
        let on_disk = backend.load(store.session_id()).await.unwrap().unwrap();
        let record = on_disk.record(ResourceKind::Dataset).unwrap();
        assert!(record.is_succeeded("d-1"));
        assert_eq!(on_disk.mappings[&ResourceKind::Dataset]["d-1"].destination_id, "n-1");
    }

    #[tokio::test]
    async fn test_outcomes_journaled_until_page_completes() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let store = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();
        let snapshot = dir.path().join(format!("{}.json", store.session_id()));
        let journal = snapshot.with_extension("journal");

        store.begin_kind(ResourceKind::Dataset).await.unwrap();
        let before = std::fs::read_to_string(&snapshot).unwrap();
        for i in 0..3 {
            store
                .record_item_outcome(ResourceKind::Dataset, &format!("d-{}", i), created("n"))
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read_to_string(&snapshot).unwrap(), before);
        assert_eq!(std::fs::read_to_string(&journal).unwrap().lines().count(), 3);

        store.complete_page(ResourceKind::Dataset, None).await.unwrap();
        assert!(!journal.exists());
        let on_disk = backend.load(store.session_id()).await.unwrap().unwrap();
        assert_eq!(on_disk.record(ResourceKind::Dataset).unwrap().succeeded.len(), 3);
        assert_eq!(on_disk.journal_seq, 3);
    }

    #[tokio::test]
    async fn test_reset_cursor_reopens_completed_kind() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let store = SessionStore::create_session(backend, &config()).await.unwrap();

        store.begin_kind(ResourceKind::Example).await.unwrap();
        store
            .record_item_outcome(ResourceKind::Example, "e-1", created("n-1"))
            .await
            .unwrap();
        store.complete_page(ResourceKind::Example, None).await.unwrap();
        store.finish_kind(ResourceKind::Example, None).await.unwrap();
        assert!(!store.needs_work(ResourceKind::Example, false).await);

        store.reset_cursor(ResourceKind::Example).await.unwrap();
        assert!(store.needs_work(ResourceKind::Example, false).await);
        let record = store.record(ResourceKind::Example).await.unwrap();
        assert!(record.cursor.is_none());
        assert!(record.is_succeeded("e-1"));
    }

    #[tokio::test]
    async fn test_resume_rejects_other_endpoints() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let store = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();
        let id = store.session_id().to_string();

        let mut other = config();
        other.destination.base_url = "https://elsewhere.example.com".into();
        let err = SessionStore::load_session(backend.clone(), &id, &other)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MigrateError::ConfigChanged));

        assert!(SessionStore::load_session(backend, &id, &config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cursor_and_completion() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let store = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();

        store.begin_kind(ResourceKind::Project).await.unwrap();
        store
            .record_item_outcome(ResourceKind::Project, "p-1", created("n-1"))
            .await
            .unwrap();
        store
            .complete_page(ResourceKind::Project, Some(Cursor::offset(1)))
            .await
            .unwrap();
        assert_eq!(
            store.record(ResourceKind::Project).await.unwrap().cursor,
            Some(Cursor::offset(1))
        );
        assert!(store.needs_work(ResourceKind::Project, false).await);

        store.complete_page(ResourceKind::Project, None).await.unwrap();
        let record = store.finish_kind(ResourceKind::Project, None).await.unwrap();
        assert_eq!(record.status, KindStatus::Completed);
        assert_eq!(record.total, Some(1));
        assert!(!store.needs_work(ResourceKind::Project, true).await);
    }

    #[tokio::test]
    async fn test_list_resumable_and_latest() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir.path()));
        let done = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();
        done.mark_completed().await.unwrap();
        let open = SessionStore::create_session(backend.clone(), &config())
            .await
            .unwrap();

        let resumable = SessionStore::list_resumable_sessions(backend.as_ref())
            .await
            .unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].session_id, open.session_id());

        let latest = SessionStore::latest_resumable(backend.as_ref(), &config())
            .await
            .unwrap();
        assert_eq!(latest.as_deref(), Some(open.session_id()));

        let all = SessionStore::list_sessions(backend.as_ref()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
