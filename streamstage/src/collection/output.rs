//! Append-only output collection with an explicit stream state.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::OutputFactory;
use crate::core::{
    CollectionInfo, DerivedArtifact, RelationKind, SourceCollection, StreamState,
};
use crate::errors::{ClosedCollectionError, Result};
use crate::store::{
    ArtifactRecord, ArtifactStore, CollectionHeader, RelationEdge, RelationRecorder,
};

/// How a collection was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new collection was created.
    Created,
    /// An existing collection was loaded for append.
    Resumed,
}

/// Result of appending one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The artifact was stored.
    Appended,
    /// An artifact with the same id is already stored; nothing was written.
    Duplicate,
}

/// Counts from a batch append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSummary {
    /// Artifacts written.
    pub appended: usize,
    /// Artifacts skipped because their id was already present.
    pub duplicates: usize,
}

/// Read-only view of a collection's stream state.
///
/// Clones observe the same collection; used by join gates and readers.
#[derive(Debug, Clone)]
pub struct CollectionStateHandle {
    name: Arc<str>,
    state: Arc<RwLock<StreamState>>,
}

impl CollectionStateHandle {
    /// Creates a handle for a collection that has not been opened yet.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            state: Arc::new(RwLock::new(StreamState::Open)),
        }
    }

    fn set(&self, state: StreamState) {
        *self.state.write() = state;
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current stream state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    /// Returns true if the collection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }
}

/// An append-only, identity-preserving collection of derived artifacts.
pub struct OutputCollection {
    name: String,
    store: Arc<dyn ArtifactStore>,
    info: CollectionInfo,
    ids: BTreeSet<u64>,
    next_seq: u64,
    handle: CollectionStateHandle,
    outcome: OpenOutcome,
    relation_recorded: bool,
}

impl OutputCollection {
    /// Opens the collection stored in `store`, creating it if absent.
    ///
    /// A new collection copies its metadata from `source` through `factory`
    /// and starts OPEN. An existing collection is loaded with its records
    /// and its metadata is not recopied. It is reopened for appends unless
    /// its last persisted marker is CLOSED: a closed collection stays
    /// closed, and appending to it fails with [`ClosedCollectionError`].
    pub async fn open_or_create(
        name: impl Into<String>,
        store: Arc<dyn ArtifactStore>,
        source: &SourceCollection,
        factory: &dyn OutputFactory,
    ) -> Result<Self> {
        let name = name.into();
        let handle = CollectionStateHandle::new(&name);
        Self::open_with_handle(name, store, source, factory, handle).await
    }

    /// Like [`open_or_create`](Self::open_or_create), publishing the stream
    /// state through an existing handle so observers registered before the
    /// collection existed see it.
    pub async fn open_with_handle(
        name: impl Into<String>,
        store: Arc<dyn ArtifactStore>,
        source: &SourceCollection,
        factory: &dyn OutputFactory,
        handle: CollectionStateHandle,
    ) -> Result<Self> {
        let name = name.into();

        if let Some(snapshot) = store.load().await? {
            let ids = snapshot.records.iter().map(|r| r.artifact.id).collect();
            let next_seq = snapshot
                .records
                .iter()
                .map(|r| r.seq + 1)
                .max()
                .unwrap_or(0);
            info!(
                collection = %name,
                location = %store.location(),
                records = snapshot.records.len(),
                state = %snapshot.state,
                "Resumed output collection"
            );
            handle.set(snapshot.state);
            return Ok(Self {
                handle,
                name,
                store,
                info: snapshot.header.info,
                ids,
                next_seq,
                outcome: OpenOutcome::Resumed,
                relation_recorded: false,
            });
        }

        let mut info = factory.derive_info(&source.info);
        if !info.provenance.contains(&source.name) {
            info.provenance.push(source.name.clone());
        }
        let header = CollectionHeader {
            name: name.clone(),
            info: info.clone(),
            created_at: crate::utils::iso_timestamp(),
        };
        store.create(&header).await?;
        info!(
            collection = %name,
            location = %store.location(),
            source = %source.name,
            "Created output collection"
        );

        handle.set(StreamState::Open);
        Ok(Self {
            handle,
            name,
            store,
            info,
            ids: BTreeSet::new(),
            next_seq: 0,
            outcome: OpenOutcome::Created,
            relation_recorded: false,
        })
    }

    /// Appends one artifact.
    ///
    /// Fails with [`ClosedCollectionError`] once closed. An artifact whose
    /// id is already present is skipped, which keeps re-appends after an
    /// interrupted commit from duplicating output.
    pub async fn append(&mut self, artifact: DerivedArtifact) -> Result<AppendOutcome> {
        let summary = self.append_all(vec![artifact]).await?;
        Ok(if summary.appended == 1 {
            AppendOutcome::Appended
        } else {
            AppendOutcome::Duplicate
        })
    }

    /// Appends artifacts in order with a single durable write.
    pub async fn append_all(&mut self, artifacts: Vec<DerivedArtifact>) -> Result<AppendSummary> {
        if self.is_closed() {
            let artifact_id = artifacts.first().map_or(0, |a| a.id);
            return Err(ClosedCollectionError::new(&self.name, artifact_id).into());
        }

        let mut summary = AppendSummary::default();
        let mut batch_ids = BTreeSet::new();
        let mut records = Vec::with_capacity(artifacts.len());
        let mut seq = self.next_seq;

        for artifact in artifacts {
            if self.ids.contains(&artifact.id) || !batch_ids.insert(artifact.id) {
                debug!(collection = %self.name, artifact_id = artifact.id, "Skipping duplicate artifact");
                summary.duplicates += 1;
                continue;
            }
            records.push(ArtifactRecord { seq, artifact });
            seq += 1;
        }

        if records.is_empty() {
            return Ok(summary);
        }

        self.store.append(&records).await?;
        self.ids.extend(batch_ids);
        self.next_seq = seq;
        summary.appended = records.len();
        Ok(summary)
    }

    /// Closes the collection. Returns false if it was already closed.
    pub async fn close(&mut self) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        self.store.set_state(StreamState::Closed).await?;
        self.handle.set(StreamState::Closed);
        info!(collection = %self.name, artifacts = self.len(), "Closed output collection");
        Ok(true)
    }

    /// Records the provenance edge to `source` at most once.
    ///
    /// A local flag guards repeat calls, but it is not trusted alone: the
    /// flag starts unset in every process, and the first call checks the
    /// recorder's persisted edges before writing. A collection resumed
    /// after a crash between its first append and the relation write
    /// therefore still gets its edge, and one that already has it is not
    /// recorded twice. Later calls return false without touching the
    /// recorder.
    pub async fn record_relation_once(
        &mut self,
        kind: RelationKind,
        source: &SourceCollection,
        recorder: &dyn RelationRecorder,
    ) -> Result<bool> {
        if self.relation_recorded {
            return Ok(false);
        }
        let edge = RelationEdge::new(kind, &source.name, &self.name);
        if recorder.edges().await?.contains(&edge) {
            self.relation_recorded = true;
            return Ok(false);
        }
        recorder.record(&edge).await?;
        self.relation_recorded = true;
        debug!(collection = %self.name, source = %source.name, kind = %kind, "Recorded relation");
        Ok(true)
    }

    /// Loads every stored artifact in creation order.
    pub async fn artifacts(&self) -> Result<Vec<DerivedArtifact>> {
        Ok(self
            .store
            .load()
            .await?
            .map(|snapshot| snapshot.records.into_iter().map(|r| r.artifact).collect())
            .unwrap_or_default())
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the collection metadata.
    #[must_use]
    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    /// Returns the current stream state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    /// Returns true if the collection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Returns the number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns true if the collection holds an artifact with this id.
    #[must_use]
    pub fn contains(&self, artifact_id: u64) -> bool {
        self.ids.contains(&artifact_id)
    }

    /// Returns how the collection was opened.
    #[must_use]
    pub fn open_outcome(&self) -> OpenOutcome {
        self.outcome
    }

    /// Returns a shareable view of the stream state.
    #[must_use]
    pub fn state_handle(&self) -> CollectionStateHandle {
        self.handle.clone()
    }
}

impl std::fmt::Debug for OutputCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCollection")
            .field("name", &self.name)
            .field("location", &self.store.location())
            .field("len", &self.ids.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CopyInfoFactory, ScaledSamplingFactory};
    use crate::core::WorkItem;
    use crate::errors::StreamStageError;
    use crate::store::{InMemoryArtifactStore, InMemoryRelationRecorder, JsonlArtifactStore};

    fn source() -> SourceCollection {
        SourceCollection::new(
            "import.movies",
            CollectionInfo::new("movies").with_sampling_rate(1.0),
        )
    }

    fn artifact(id: u64) -> DerivedArtifact {
        DerivedArtifact::for_item(&WorkItem::new(id), "micrographs", serde_json::json!({"id": id}))
    }

    async fn open(store: &InMemoryArtifactStore) -> OutputCollection {
        OutputCollection::open_or_create(
            "micrographs",
            Arc::new(store.clone()),
            &source(),
            &ScaledSamplingFactory::new(2.0),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_copies_info() {
        let store = InMemoryArtifactStore::new("micrographs");
        let collection = open(&store).await;

        assert_eq!(collection.open_outcome(), OpenOutcome::Created);
        assert_eq!(collection.state(), StreamState::Open);
        assert_eq!(collection.info().sampling_rate, Some(2.0));
        assert_eq!(collection.info().provenance, vec!["import.movies".to_string()]);
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_identity_and_order() {
        let store = InMemoryArtifactStore::new("micrographs");
        let mut collection = open(&store).await;

        assert_eq!(collection.append(artifact(5)).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(collection.append(artifact(2)).await.unwrap(), AppendOutcome::Appended);

        let ids: Vec<u64> = collection.artifacts().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![5, 2]);

        let seqs: Vec<u64> = store.snapshot().unwrap().records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_noop() {
        let store = InMemoryArtifactStore::new("micrographs");
        let mut collection = open(&store).await;

        collection.append(artifact(1)).await.unwrap();
        assert_eq!(collection.append(artifact(1)).await.unwrap(), AppendOutcome::Duplicate);

        let summary = collection
            .append_all(vec![artifact(2), artifact(2), artifact(1)])
            .await
            .unwrap();
        assert_eq!(summary, AppendSummary { appended: 1, duplicates: 2 });
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let store = InMemoryArtifactStore::new("micrographs");
        let mut collection = open(&store).await;
        collection.append(artifact(1)).await.unwrap();

        assert!(collection.close().await.unwrap());
        assert!(!collection.close().await.unwrap());

        let err = collection.append(artifact(2)).await.unwrap_err();
        assert!(matches!(err, StreamStageError::ClosedCollection(_)));
        assert_eq!(collection.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_loads_existing_records() {
        let store = InMemoryArtifactStore::new("micrographs");
        {
            let mut collection = open(&store).await;
            collection.append(artifact(1)).await.unwrap();
            collection.append(artifact(2)).await.unwrap();
        }

        let mut resumed = open(&store).await;
        assert_eq!(resumed.open_outcome(), OpenOutcome::Resumed);
        assert_eq!(resumed.len(), 2);
        assert!(resumed.contains(2));

        resumed.append(artifact(3)).await.unwrap();
        let seqs: Vec<u64> = store.snapshot().unwrap().records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_resume_honours_closed_marker() {
        let store = InMemoryArtifactStore::new("micrographs");
        {
            let mut collection = open(&store).await;
            collection.close().await.unwrap();
        }

        let resumed = open(&store).await;
        assert!(resumed.is_closed());
    }

    #[tokio::test]
    async fn test_relation_recorded_once() {
        let store = InMemoryArtifactStore::new("micrographs");
        let recorder = InMemoryRelationRecorder::new();
        let mut collection = open(&store).await;

        assert!(collection
            .record_relation_once(RelationKind::Source, &source(), &recorder)
            .await
            .unwrap());
        assert!(!collection
            .record_relation_once(RelationKind::Source, &source(), &recorder)
            .await
            .unwrap());

        let mut resumed = open(&store).await;
        assert!(!resumed
            .record_relation_once(RelationKind::Source, &source(), &recorder)
            .await
            .unwrap());
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_collection_records_missing_relation() {
        let store = InMemoryArtifactStore::new("micrographs");
        drop(open(&store).await);

        let recorder = InMemoryRelationRecorder::new();
        let mut resumed = open(&store).await;
        assert!(resumed
            .record_relation_once(RelationKind::Transform, &source(), &recorder)
            .await
            .unwrap());
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_state_handle_tracks_close() {
        let store = InMemoryArtifactStore::new("micrographs");
        let mut collection = open(&store).await;
        let handle = collection.state_handle();

        assert_eq!(handle.name(), "micrographs");
        assert!(!handle.is_closed());
        collection.close().await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_file_backed_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movies.jsonl");
        {
            let mut collection = OutputCollection::open_or_create(
                "movies",
                Arc::new(JsonlArtifactStore::new(&path)),
                &source(),
                &CopyInfoFactory::new(),
            )
            .await
            .unwrap();
            collection.append(artifact(1)).await.unwrap();
        }

        let resumed = OutputCollection::open_or_create(
            "movies",
            Arc::new(JsonlArtifactStore::new(&path)),
            &source(),
            &CopyInfoFactory::new(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.open_outcome(), OpenOutcome::Resumed);
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed.info().sampling_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_torn_creation_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("micrographs.jsonl");
        std::fs::write(&path, r#"{"kind":"header","name":"microg"#).unwrap();

        let mut collection = OutputCollection::open_or_create(
            "micrographs",
            Arc::new(JsonlArtifactStore::new(&path)),
            &source(),
            &ScaledSamplingFactory::new(2.0),
        )
        .await
        .unwrap();
        assert_eq!(collection.open_outcome(), OpenOutcome::Created);
        collection.append(artifact(1)).await.unwrap();

        let resumed = OutputCollection::open_or_create(
            "micrographs",
            Arc::new(JsonlArtifactStore::new(&path)),
            &source(),
            &ScaledSamplingFactory::new(2.0),
        )
        .await
        .unwrap();
        assert_eq!(resumed.open_outcome(), OpenOutcome::Resumed);
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed.info().sampling_rate, Some(2.0));
    }
}
