//! State backend trait for session storage.
//!
//! The [`StateBackend`] trait decouples session persistence from the
//! orchestrator, which works with `Arc<dyn StateBackend>` without knowing the
//! concrete type:
//!
//! - **File**: one signed JSON snapshot plus an append-only journal per
//!   session, in `file.rs`
//! - **No-op**: nothing persisted (dry runs), in `noop.rs`

use async_trait::async_trait;

use super::{JournalEntry, Session};
use crate::error::Result;

/// Trait for session persistence backends.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(dir));
/// backend.init().await?;
/// backend.save(&session).await?;
/// let loaded = backend.load(&session.session_id).await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Prepare the storage location. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Persist the complete session. Returns only once the write is durable.
    ///
    /// The snapshot supersedes every journal entry written before it.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Append one item outcome to the session's journal. Returns only once
    /// the entry is durable.
    async fn append_outcome(&self, session_id: &str, entry: &JournalEntry) -> Result<()>;

    /// Load a session by id with its journal replayed, `None` if it does not exist.
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// All stored sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<Session>>;

    /// Delete a session. Returns whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}
