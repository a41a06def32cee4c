//! JSON file state backend: `<state_dir>/<session_id>.json` holds the signed
//! snapshot, `<state_dir>/<session_id>.journal` the item outcomes recorded
//! since, one signed JSON entry per line.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::state::backend::StateBackend;
use crate::state::{JournalEntry, Session};

/// Stores each session as a signed, pretty-printed JSON file.
pub struct FileStateBackend {
    dir: PathBuf,
}

impl FileStateBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MigrateError::State(format!(
                "Invalid session id '{}'",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    fn journal_for(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.path_for(session_id)?.with_extension("journal"))
    }

    /// Parse a snapshot and replay its journal on top.
    async fn read_session(&self, content: &str) -> Result<Session> {
        let mut session = Session::from_json(content)?;
        let path = self.journal_for(&session.session_id)?;
        let journal = match tokio::fs::read_to_string(&path).await {
            Ok(journal) => journal,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(session),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = journal.lines().filter(|l| !l.trim().is_empty()).collect();
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => session.replay(entry)?,
                // A crash mid-append leaves at most the last line torn
                Err(e) if i + 1 == lines.len() => {
                    warn!(
                        "Ignoring torn last journal entry of session {}: {}",
                        session.session_id, e
                    );
                }
                Err(e) => {
                    return Err(MigrateError::State(format!(
                        "Unreadable journal {} at line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(session)
    }

    async fn remove_if_present(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.session_id)?;
        let content = session.to_signed_json()?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content.as_bytes()).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Self::remove_if_present(&self.journal_for(&session.session_id)?).await?;

        debug!("Saved session {} to {}", session.session_id, path.display());
        Ok(())
    }

    async fn append_outcome(&self, session_id: &str, entry: &JournalEntry) -> Result<()> {
        let path = self.journal_for(session_id)?;
        let line = entry.to_line()?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.path_for(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.read_session(&content).await.map(Some)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match self.read_session(&content).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Self::remove_if_present(&self.journal_for(session_id)?).await?;
        Self::remove_if_present(&self.path_for(session_id)?).await
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
