//! An in-memory stage wired for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::mocks::ManualStreamSource;
use crate::config::ReconcilerConfig;
use crate::core::{CollectionInfo, RelationKind, SourceCollection};
use crate::errors::Result;
use crate::events::CollectingEventSink;
use crate::gate::JoinGate;
use crate::reconcile::{Reconciler, ReconcilerBuilder, StageBinding};
use crate::store::{DoneLog, InMemoryArtifactStore, InMemoryDoneLog, InMemoryRelationRecorder};
use crate::transform::DomainTransform;

/// A stage whose storage lives in memory and survives reconciler restarts.
///
/// Every call to [`TestStage::reconciler`] builds a fresh reconciler over
/// the same done log, stores, gate and event sink, which is how tests
/// simulate a process restart. The first output is related to the source
/// by a TRANSFORM edge, the others by SOURCE edges.
#[derive(Clone)]
pub struct TestStage {
    /// The hand-driven source.
    pub source: Arc<ManualStreamSource>,
    /// The source collection the outputs derive from.
    pub source_collection: SourceCollection,
    /// Shared done log.
    pub done_log: InMemoryDoneLog,
    /// Output stores by tag, in binding order.
    pub stores: Vec<(String, InMemoryArtifactStore)>,
    /// Shared provenance recorder.
    pub relations: InMemoryRelationRecorder,
    /// Gate released when every output closes.
    pub gate: Arc<JoinGate>,
    /// Collected events across restarts.
    pub events: Arc<CollectingEventSink>,
    /// Reconciler configuration.
    pub config: ReconcilerConfig,
}

impl TestStage {
    /// Creates a stage with one output per tag.
    #[must_use]
    pub fn new(tags: &[&str]) -> Self {
        Self {
            source: Arc::new(ManualStreamSource::new()),
            source_collection: SourceCollection::new(
                "import_movies",
                CollectionInfo::new("movies").with_sampling_rate(1.0),
            ),
            done_log: InMemoryDoneLog::new(),
            stores: tags
                .iter()
                .map(|tag| ((*tag).to_string(), InMemoryArtifactStore::new(*tag)))
                .collect(),
            relations: InMemoryRelationRecorder::new(),
            gate: Arc::new(JoinGate::new("join")),
            events: Arc::new(CollectingEventSink::new()),
            config: ReconcilerConfig::new()
                .with_stage_name("test_stage")
                .with_poll_interval_ms(1),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the store behind `tag`.
    #[must_use]
    pub fn store(&self, tag: &str) -> Option<&InMemoryArtifactStore> {
        self.stores.iter().find(|(t, _)| t == tag).map(|(_, s)| s)
    }

    /// Returns stored artifact ids for `tag` in creation order.
    #[must_use]
    pub fn stored_ids(&self, tag: &str) -> Vec<u64> {
        self.store(tag)
            .and_then(InMemoryArtifactStore::snapshot)
            .map(|snapshot| snapshot.records.iter().map(|r| r.artifact.id).collect())
            .unwrap_or_default()
    }

    /// Returns a builder over this stage's storage, ready for `build`.
    pub fn builder(&self, transform: Arc<dyn DomainTransform>) -> ReconcilerBuilder {
        self.builder_with_log(transform, Arc::new(self.done_log.clone()))
    }

    /// Like [`builder`](Self::builder) with a different done log, usually a
    /// [`FlakyDoneLog`](super::FlakyDoneLog) wrapping the shared one.
    pub fn builder_with_log(
        &self,
        transform: Arc<dyn DomainTransform>,
        done_log: Arc<dyn DoneLog>,
    ) -> ReconcilerBuilder {
        let mut builder = ReconcilerBuilder::new(
            self.source.clone(),
            self.source_collection.clone(),
            transform,
            done_log,
        )
        .relations(Arc::new(self.relations.clone()))
        .gate(self.gate.clone())
        .event_sink(self.events.clone())
        .config(self.config.clone());

        for (index, (tag, store)) in self.stores.iter().enumerate() {
            let relation = if index == 0 {
                RelationKind::Transform
            } else {
                RelationKind::Source
            };
            builder = builder.output(
                StageBinding::new(tag.as_str(), Arc::new(store.clone())).with_relation(relation),
            );
        }
        builder
    }

    /// Builds a reconciler over this stage's storage.
    pub async fn reconciler(&self, transform: Arc<dyn DomainTransform>) -> Result<Reconciler> {
        self.builder(transform).build().await
    }

    /// Returns stored record counts by tag.
    #[must_use]
    pub fn record_counts(&self) -> BTreeMap<String, usize> {
        self.stores
            .iter()
            .map(|(tag, store)| (tag.clone(), store.record_count()))
            .collect()
    }
}
