//! Durable append-only log of processed item identifiers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::ItemId;
use crate::errors::Result;

/// Protocol for the done-item log backend.
///
/// Entries are only ever added. `append` must not return `Ok` before the
/// identifiers are durable.
#[async_trait]
pub trait DoneLog: Send + Sync {
    /// Rebuilds the set of identifiers from the log. Empty if nothing was logged.
    async fn load(&self) -> Result<BTreeSet<ItemId>>;

    /// Durably appends identifiers to the log.
    async fn append(&self, ids: &[ItemId]) -> Result<()>;
}

/// File-backed done log: one decimal identifier per line.
///
/// A trailing line without its newline is a torn write from an interrupted
/// append; `load` truncates it so the next append starts on a clean line.
#[derive(Debug, Clone)]
pub struct FileDoneLog {
    path: PathBuf,
}

impl FileDoneLog {
    /// Creates a done log at the given path. The file is created lazily.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn truncate_torn_tail(&self, valid_len: usize) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await?;
        file.set_len(valid_len as u64).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl DoneLog for FileDoneLog {
    async fn load(&self) -> Result<BTreeSet<ItemId>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let valid_len = content.rfind('\n').map_or(0, |pos| pos + 1);
        if valid_len < content.len() {
            warn!(
                path = %self.path.display(),
                torn_bytes = content.len() - valid_len,
                "Discarding torn trailing entry in done log"
            );
            self.truncate_torn_tail(valid_len).await?;
        }

        let mut ids = BTreeSet::new();
        for (lineno, line) in content[..valid_len].lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<u64>() {
                Ok(id) => {
                    ids.insert(ItemId(id));
                }
                Err(_) => {
                    warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        entry = trimmed,
                        "Skipping unparsable done log entry"
                    );
                }
            }
        }

        debug!(path = %self.path.display(), count = ids.len(), "Loaded done log");
        Ok(ids)
    }

    async fn append(&self, ids: &[ItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let buf: String = ids.iter().map(|id| format!("{id}\n")).collect();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// In-memory done log.
///
/// Clones share the same entries, so a test can drop a reconciler and build
/// a new one over the same log to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDoneLog {
    entries: Arc<Mutex<Vec<ItemId>>>,
}

impl InMemoryDoneLog {
    /// Creates a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every logged entry in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<ItemId> {
        self.entries.lock().clone()
    }

    /// Returns the number of logged entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DoneLog for InMemoryDoneLog {
    async fn load(&self) -> Result<BTreeSet<ItemId>> {
        Ok(self.entries.lock().iter().copied().collect())
    }

    async fn append(&self, ids: &[ItemId]) -> Result<()> {
        self.entries.lock().extend_from_slice(ids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_done_log_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileDoneLog::new(dir.path().join("done.txt"));

        assert!(log.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_done_log_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileDoneLog::new(dir.path().join("nested").join("done.txt"));

        log.append(&[ItemId(1), ItemId(2)]).await.unwrap();
        log.append(&[ItemId(5)]).await.unwrap();

        let ids = log.load().await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![ItemId(1), ItemId(2), ItemId(5)]);
    }

    #[tokio::test]
    async fn test_file_done_log_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.txt");
        std::fs::write(&path, "1\n2\n12").unwrap();

        let log = FileDoneLog::new(&path);
        let ids = log.load().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&ItemId(12)));

        log.append(&[ItemId(3)]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n3\n");
    }

    #[tokio::test]
    async fn test_file_done_log_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.txt");
        std::fs::write(&path, "1\nnot-an-id\n4\n").unwrap();

        let ids = FileDoneLog::new(&path).load().await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_log_shared_between_clones() {
        let log = InMemoryDoneLog::new();
        let restarted = log.clone();

        log.append(&[ItemId(7)]).await.unwrap();

        assert!(restarted.load().await.unwrap().contains(&ItemId(7)));
        assert_eq!(restarted.len(), 1);
    }
}
