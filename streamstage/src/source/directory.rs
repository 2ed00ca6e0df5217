//! Stream source watching a directory filled by an acquisition process.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use super::StreamSource;
use crate::config::DirectorySourceConfig;
use crate::core::{ItemId, WorkItem};
use crate::errors::{Result, StreamStageError};

#[derive(Debug)]
struct WatchState {
    sizes: HashMap<PathBuf, u64>,
    last_new_file: Instant,
}

/// Lists files matching a pattern as work items.
///
/// The item id is the first group of digits in the file name, so ids are
/// stable across restarts. A file is ready once its size is non-zero and
/// unchanged since the previous listing. The stream closes when the
/// sentinel file appears or when no new file was seen for the timeout.
#[derive(Debug)]
pub struct DirectoryStreamSource {
    config: DirectorySourceConfig,
    pattern: Regex,
    digits: Regex,
    state: Mutex<WatchState>,
}

impl DirectoryStreamSource {
    /// Creates a source from its configuration.
    pub fn new(config: DirectorySourceConfig) -> Result<Self> {
        let pattern = Regex::new(&config.pattern).map_err(|e| {
            StreamStageError::Config(format!("invalid pattern '{}': {e}", config.pattern))
        })?;
        let digits = Regex::new(r"\d+")
            .map_err(|e| StreamStageError::Internal(e.to_string()))?;

        Ok(Self {
            config,
            pattern,
            digits,
            state: Mutex::new(WatchState {
                sizes: HashMap::new(),
                last_new_file: Instant::now(),
            }),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DirectorySourceConfig {
        &self.config
    }

    fn item_id(&self, file_name: &str) -> Option<ItemId> {
        self.digits
            .find(file_name)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(ItemId)
    }

    fn matching_files(&self) -> Result<Vec<(PathBuf, String, u64)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.config.directory)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if self.config.sentinel_file.as_deref() == Some(file_name.as_str()) {
                continue;
            }
            if self.pattern.is_match(&file_name) {
                files.push((entry.path(), file_name, metadata.len()));
            }
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(files)
    }

    fn sentinel_present(&self) -> bool {
        self.config
            .sentinel_file
            .as_ref()
            .is_some_and(|name| Path::new(&self.config.directory).join(name).exists())
    }
}

impl StreamSource for DirectoryStreamSource {
    fn list_known_items(&self) -> Result<Vec<WorkItem>> {
        let files = self.matching_files()?;
        let mut state = self.state.lock();
        let mut items: BTreeMap<ItemId, WorkItem> = BTreeMap::new();

        for (path, file_name, size) in files {
            let Some(id) = self.item_id(&file_name) else {
                debug!(file = %file_name, "Ignoring file without numeric id");
                continue;
            };
            if items.contains_key(&id) {
                warn!(file = %file_name, item_id = %id, "Duplicate item id in directory, keeping first file");
                continue;
            }

            let previous = state.sizes.insert(path.clone(), size);
            if previous.is_none() {
                state.last_new_file = Instant::now();
                debug!(file = %file_name, item_id = %id, "Discovered new file");
            }
            let ready = size > 0 && previous == Some(size);

            items.insert(
                id,
                WorkItem::new(id)
                    .with_params(serde_json::json!({
                        "path": path.display().to_string(),
                        "size": size,
                    }))
                    .with_part(path)
                    .with_ready(ready),
            );
        }

        Ok(items.into_values().collect())
    }

    fn is_closed(&self) -> bool {
        self.sentinel_present() || self.state.lock().last_new_file.elapsed() >= self.config.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, bytes: usize) {
        std::fs::write(dir.join(name), vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = DirectoryStreamSource::new(DirectorySourceConfig::new("/tmp").with_pattern("(")).unwrap_err();
        assert!(matches!(err, StreamStageError::Config(_)));
    }

    #[test]
    fn test_files_become_ready_once_stable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "movie000002.mrcs", 10);
        write(dir.path(), "movie000001.mrcs", 10);
        write(dir.path(), "notes.txt", 5);

        let source = DirectoryStreamSource::new(
            DirectorySourceConfig::new(dir.path()).with_pattern(r"movie\d+\.mrcs"),
        )
        .unwrap();

        let first = source.list_known_items().unwrap();
        let ids: Vec<ItemId> = first.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![ItemId(1), ItemId(2)]);
        assert!(first.iter().all(|i| !i.is_ready()));

        write(dir.path(), "movie000002.mrcs", 20);
        let second = source.list_known_items().unwrap();
        assert!(second[0].is_ready());
        assert!(!second[1].is_ready());

        let third = source.list_known_items().unwrap();
        assert!(third.iter().all(WorkItem::is_ready));
        assert_eq!(third[0].parts.len(), 1);
    }

    #[test]
    fn test_closed_by_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryStreamSource::new(
            DirectorySourceConfig::new(dir.path())
                .with_timeout_seconds(3600.0)
                .with_sentinel("ACQUISITION_DONE"),
        )
        .unwrap();

        assert!(!source.is_closed());
        write(dir.path(), "ACQUISITION_DONE", 0);
        assert!(source.is_closed());
        assert!(source.list_known_items().unwrap().is_empty());
    }

    #[test]
    fn test_closed_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryStreamSource::new(
            DirectorySourceConfig::new(dir.path()).with_timeout_seconds(0.0),
        )
        .unwrap();

        assert!(source.is_closed());
    }

    #[test]
    fn test_missing_directory_is_transient_io() {
        let source = DirectoryStreamSource::new(DirectorySourceConfig::new("/nonexistent/streamstage")).unwrap();
        let err = source.list_known_items().unwrap_err();
        assert!(err.is_retryable());
    }
}
