//! Durable ordered-artifact storage for output collections.
//!
//! A store persists three things: a header written once at creation, the
//! artifact records in creation order, and the latest stream-state marker.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::core::{CollectionInfo, DerivedArtifact, StreamState};
use crate::errors::{Result, StreamStageError};

/// Header written when a collection is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionHeader {
    /// Collection name.
    pub name: String,
    /// Metadata copied forward from the source collection.
    pub info: CollectionInfo,
    /// Creation time (ISO 8601).
    pub created_at: String,
}

/// A persisted artifact with its creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Zero-based creation order inside the collection.
    pub seq: u64,
    /// The artifact.
    pub artifact: DerivedArtifact,
}

/// Everything a store holds for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    /// The creation header.
    pub header: CollectionHeader,
    /// Records in creation order.
    pub records: Vec<ArtifactRecord>,
    /// The latest stream-state marker.
    pub state: StreamState,
}

/// Protocol for output collection storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable location, used in logs.
    fn location(&self) -> String;

    /// Loads the collection, or `None` if it was never created.
    async fn load(&self) -> Result<Option<CollectionSnapshot>>;

    /// Creates the collection with its header and an OPEN marker.
    async fn create(&self, header: &CollectionHeader) -> Result<()>;

    /// Durably appends records after the existing ones.
    async fn append(&self, records: &[ArtifactRecord]) -> Result<()>;

    /// Durably records a new stream-state marker.
    async fn set_state(&self, state: StreamState) -> Result<()>;

    /// Returns true if the collection exists.
    async fn exists(&self) -> Result<bool> {
        Ok(self.load().await?.is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreLine {
    Header(CollectionHeader),
    /// `data` is the serialized [`ArtifactRecord`], hashed byte for byte.
    Record {
        checksum: String,
        data: String,
    },
    State {
        state: StreamState,
    },
}

impl StoreLine {
    fn record(record: &ArtifactRecord) -> Result<Self> {
        let data = serde_json::to_string(record)?;
        Ok(Self::Record {
            checksum: data_checksum(&data),
            data,
        })
    }
}

fn data_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

fn encode_lines(lines: &[StoreLine]) -> Result<String> {
    let mut buf = String::new();
    for line in lines {
        buf.push_str(&serde_json::to_string(line)?);
        buf.push('\n');
    }
    Ok(buf)
}

/// Length of the prefix made of complete, newline-terminated lines.
fn complete_len(content: &[u8]) -> usize {
    content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1)
}

async fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// JSON-lines file store.
///
/// Every write ends with a newline, so only the last line can be torn by an
/// interrupted append. A torn last line is ignored on load and cut off
/// before the next append. Any complete line that fails to parse or whose
/// record data does not match its checksum is corruption and fails the
/// load. The file is created atomically with its header. The last state
/// line wins.
#[derive(Debug, Clone)]
pub struct JsonlArtifactStore {
    path: PathBuf,
}

impl JsonlArtifactStore {
    /// Creates a store at the given path. Nothing is written until `create`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the store path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(OsString::from).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn corrupt(&self, lineno: usize, reason: &str) -> StreamStageError {
        StreamStageError::Serialization(format!(
            "collection file {} is corrupt at line {}: {reason}",
            self.path.display(),
            lineno + 1
        ))
    }

    async fn append_lines(&self, lines: &[StoreLine]) -> Result<()> {
        let buf = encode_lines(lines)?;

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(std::io::SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                let mut content = Vec::new();
                file.seek(std::io::SeekFrom::Start(0)).await?;
                file.read_to_end(&mut content).await?;
                let valid_len = complete_len(&content);
                warn!(
                    path = %self.path.display(),
                    torn_bytes = content.len() - valid_len,
                    "Discarding torn trailing line before append"
                );
                file.set_len(valid_len as u64).await?;
            }
        }

        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for JsonlArtifactStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<CollectionSnapshot>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let valid_len = complete_len(&content);
        if valid_len < content.len() {
            warn!(
                path = %self.path.display(),
                torn_bytes = content.len() - valid_len,
                "Ignoring torn trailing line in collection file"
            );
        }
        let complete = std::str::from_utf8(&content[..valid_len])
            .map_err(|e| StreamStageError::Serialization(e.to_string()))?;

        let mut header = None;
        let mut records = Vec::new();
        let mut state = StreamState::Open;

        for (lineno, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<StoreLine>(line)
                .map_err(|e| self.corrupt(lineno, &e.to_string()))?;
            match parsed {
                StoreLine::Header(h) => header = Some(h),
                StoreLine::Record { checksum, data } => {
                    if data_checksum(&data) != checksum {
                        return Err(self.corrupt(lineno, "record checksum mismatch"));
                    }
                    let record = serde_json::from_str::<ArtifactRecord>(&data)
                        .map_err(|e| self.corrupt(lineno, &e.to_string()))?;
                    records.push(record);
                }
                StoreLine::State { state: s } => state = s,
            }
        }

        let Some(header) = header else {
            if records.is_empty() {
                warn!(
                    path = %self.path.display(),
                    "Collection file has no header, treating it as never created"
                );
                return Ok(None);
            }
            return Err(StreamStageError::Serialization(format!(
                "collection file {} has records but no header",
                self.path.display()
            )));
        };

        debug!(
            path = %self.path.display(),
            records = records.len(),
            state = %state,
            "Loaded collection"
        );
        Ok(Some(CollectionSnapshot {
            header,
            records,
            state,
        }))
    }

    async fn create(&self, header: &CollectionHeader) -> Result<()> {
        let dir = self.parent_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let buf = encode_lines(&[
            StoreLine::Header(header.clone()),
            StoreLine::State {
                state: StreamState::Open,
            },
        ])?;

        let tmp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        sync_dir(&dir).await
    }

    async fn append(&self, records: &[ArtifactRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let lines = records
            .iter()
            .map(StoreLine::record)
            .collect::<Result<Vec<_>>>()?;
        self.append_lines(&lines).await
    }

    async fn set_state(&self, state: StreamState) -> Result<()> {
        self.append_lines(&[StoreLine::State { state }]).await
    }
}

/// In-memory store. Clones share the same collection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArtifactStore {
    name: String,
    snapshot: Arc<Mutex<Option<CollectionSnapshot>>>,
}

impl InMemoryArtifactStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the current snapshot without going through the trait.
    #[must_use]
    pub fn snapshot(&self) -> Option<CollectionSnapshot> {
        self.snapshot.lock().clone()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.snapshot.lock().as_ref().map_or(0, |s| s.records.len())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn load(&self) -> Result<Option<CollectionSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn create(&self, header: &CollectionHeader) -> Result<()> {
        *self.snapshot.lock() = Some(CollectionSnapshot {
            header: header.clone(),
            records: Vec::new(),
            state: StreamState::Open,
        });
        Ok(())
    }

    async fn append(&self, records: &[ArtifactRecord]) -> Result<()> {
        let mut guard = self.snapshot.lock();
        let snapshot = guard.as_mut().ok_or_else(|| {
            StreamStageError::Internal(format!("append to uncreated collection '{}'", self.name))
        })?;
        snapshot.records.extend_from_slice(records);
        Ok(())
    }

    async fn set_state(&self, state: StreamState) -> Result<()> {
        let mut guard = self.snapshot.lock();
        let snapshot = guard.as_mut().ok_or_else(|| {
            StreamStageError::Internal(format!("state change on uncreated collection '{}'", self.name))
        })?;
        snapshot.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkItem;
    use pretty_assertions::assert_eq;

    fn header() -> CollectionHeader {
        CollectionHeader {
            name: "micrographs".to_string(),
            info: CollectionInfo::new("micrographs").with_sampling_rate(1.77),
            created_at: "2024-01-01T00:00:00.000000+00:00".to_string(),
        }
    }

    fn record(seq: u64, id: u64) -> ArtifactRecord {
        ArtifactRecord {
            seq,
            artifact: DerivedArtifact::for_item(
                &WorkItem::new(id),
                "micrographs",
                serde_json::json!({"shift": [0.5, -1.25]}),
            ),
        }
    }

    #[tokio::test]
    async fn test_jsonl_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlArtifactStore::new(dir.path().join("micrographs.jsonl"));

        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_jsonl_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlArtifactStore::new(dir.path().join("out").join("micrographs.jsonl"));

        store.create(&header()).await.unwrap();
        store.append(&[record(0, 1), record(1, 2)]).await.unwrap();
        store.set_state(StreamState::Closed).await.unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.header, header());
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[1].artifact.id, 2);
        assert_eq!(snapshot.state, StreamState::Closed);
    }

    #[tokio::test]
    async fn test_jsonl_store_discards_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("micrographs.jsonl");
        let store = JsonlArtifactStore::new(&path);

        store.create(&header()).await.unwrap();
        store.append(&[record(0, 1)]).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"kind":"record","checksum":"ab"#);
        std::fs::write(&path, content).unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 1);

        store.append(&[record(1, 2)]).await.unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        let ids: Vec<u64> = snapshot.records.iter().map(|r| r.artifact.id).collect();
        assert_eq!(ids, vec![1, 2]);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_jsonl_store_keeps_payloads_that_reformat() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlArtifactStore::new(dir.path().join("micrographs.jsonl"));

        store.create(&header()).await.unwrap();
        let artifact = DerivedArtifact::for_item(
            &WorkItem::new(1),
            "micrographs",
            serde_json::json!([1.5e-300, {"defocus": 1.2}]),
        );
        store
            .append(&[ArtifactRecord { seq: 0, artifact }])
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].artifact.id, 1);
        let tiny = snapshot.records[0].artifact.payload[0].as_f64().unwrap();
        assert!((tiny / 1.5e-300 - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_jsonl_store_rejects_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("micrographs.jsonl");
        let store = JsonlArtifactStore::new(&path);

        store.create(&header()).await.unwrap();
        store.append(&[record(0, 1), record(1, 2)]).await.unwrap();

        let content = std::fs::read_to_string(&path)
            .unwrap()
            .replacen(r#""checksum":""#, r#""checksum":"00"#, 1);
        std::fs::write(&path, content).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StreamStageError::Serialization(_)));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_jsonl_store_torn_header_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("micrographs.jsonl");
        std::fs::write(&path, r#"{"kind":"header","name":"microg"#).unwrap();
        let store = JsonlArtifactStore::new(&path);

        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await.unwrap());

        store.create(&header()).await.unwrap();
        store.append(&[record(0, 1)]).await.unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.header, header());
        assert_eq!(snapshot.records.len(), 1);
        assert!(!dir.path().join("micrographs.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_jsonl_store_records_without_header_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("micrographs.jsonl");
        let line = serde_json::to_string(&StoreLine::record(&record(0, 1)).unwrap()).unwrap();
        std::fs::write(&path, format!("{line}\n")).unwrap();

        let err = JsonlArtifactStore::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("no header"));
    }

    #[tokio::test]
    async fn test_in_memory_store_shared() {
        let store = InMemoryArtifactStore::new("movies");
        let reopened = store.clone();

        assert!(store.append(&[record(0, 1)]).await.is_err());

        store.create(&header()).await.unwrap();
        store.append(&[record(0, 1)]).await.unwrap();

        assert_eq!(reopened.record_count(), 1);
        assert_eq!(reopened.location(), "memory://movies");
    }
}
