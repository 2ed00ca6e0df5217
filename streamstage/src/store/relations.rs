//! Provenance edges between output collections and their sources.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::core::RelationKind;
use crate::errors::Result;

/// A provenance edge `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEdge {
    /// Edge kind.
    pub kind: RelationKind,
    /// Source collection name.
    pub source: String,
    /// Target (output) collection name.
    pub target: String,
}

impl RelationEdge {
    /// Creates a new edge.
    #[must_use]
    pub fn new(kind: RelationKind, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Protocol for recording provenance edges.
///
/// Recorders do not deduplicate; callers guarantee each edge is recorded once.
#[async_trait]
pub trait RelationRecorder: Send + Sync {
    /// Records an edge.
    async fn record(&self, edge: &RelationEdge) -> Result<()>;

    /// Returns every recorded edge in order.
    async fn edges(&self) -> Result<Vec<RelationEdge>>;
}

/// In-memory recorder. Clones share the same edges.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelationRecorder {
    edges: Arc<Mutex<Vec<RelationEdge>>>,
}

impl InMemoryRelationRecorder {
    /// Creates a new recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }
}

#[async_trait]
impl RelationRecorder for InMemoryRelationRecorder {
    async fn record(&self, edge: &RelationEdge) -> Result<()> {
        self.edges.lock().push(edge.clone());
        Ok(())
    }

    async fn edges(&self) -> Result<Vec<RelationEdge>> {
        Ok(self.edges.lock().clone())
    }
}

/// JSON-lines file recorder, one edge per line.
#[derive(Debug, Clone)]
pub struct JsonlRelationRecorder {
    path: PathBuf,
}

impl JsonlRelationRecorder {
    /// Creates a recorder at the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RelationRecorder for JsonlRelationRecorder {
    async fn record(&self, edge: &RelationEdge) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(edge)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
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
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn edges(&self) -> Result<Vec<RelationEdge>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut edges = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RelationEdge>(line) {
                Ok(edge) => edges.push(edge),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping torn relation line"
                ),
            }
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_recorder() {
        let recorder = InMemoryRelationRecorder::new();
        assert!(recorder.is_empty());

        recorder
            .record(&RelationEdge::new(RelationKind::Transform, "movies", "aligned"))
            .await
            .unwrap();

        let edges = recorder.edges().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "aligned");
    }

    #[tokio::test]
    async fn test_jsonl_recorder_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relations.jsonl");

        let recorder = JsonlRelationRecorder::new(&path);
        assert!(recorder.edges().await.unwrap().is_empty());

        recorder
            .record(&RelationEdge::new(RelationKind::Source, "movies", "micrographs"))
            .await
            .unwrap();

        let reopened = JsonlRelationRecorder::new(&path);
        let edges = reopened.edges().await.unwrap();
        assert_eq!(edges, vec![RelationEdge::new(RelationKind::Source, "movies", "micrographs")]);
    }

    #[tokio::test]
    async fn test_jsonl_recorder_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relations.jsonl");
        std::fs::write(&path, r#"{"kind":"transform","sour"#).unwrap();

        let recorder = JsonlRelationRecorder::new(&path);
        assert!(recorder.edges().await.unwrap().is_empty());

        let edge = RelationEdge::new(RelationKind::Transform, "movies", "aligned");
        recorder.record(&edge).await.unwrap();
        assert_eq!(recorder.edges().await.unwrap(), vec![edge]);
    }
}
