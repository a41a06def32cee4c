//! No-op state backend for runs without resume capability.
//!
//! Used for dry runs, which create nothing and therefore have nothing to
//! resume.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::error::Result;
use crate::state::backend::StateBackend;
use crate::state::{JournalEntry, Session};

/// State backend that doesn't persist anything. Logs a warning on first use.
pub struct NoOpStateBackend {
    warned: AtomicBool,
}

impl NoOpStateBackend {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                "Using no-op state backend: session state will not be persisted. \
                 This run cannot be resumed if interrupted."
            );
        }
    }
}

impl Default for NoOpStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for NoOpStateBackend {
    async fn init(&self) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    async fn append_outcome(&self, _session_id: &str, _entry: &JournalEntry) -> Result<()> {
        Ok(())
    }

    async fn load(&self, _session_id: &str) -> Result<Option<Session>> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _session_id: &str) -> Result<bool> {
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
