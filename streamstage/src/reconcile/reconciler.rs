use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::binding::StageBinding;
use super::report::{PassReport, StallDetector};
use crate::cancellation::CancellationToken;
use crate::collection::{CollectionStateHandle, FactoryRegistry, OpenOutcome, OutputCollection};
use crate::config::ReconcilerConfig;
use crate::core::{DerivedArtifact, ItemId, OutputTag, SourceCollection, WorkItem};
use crate::done_set::DoneSet;
use crate::errors::{InconsistentDoneSetError, Result, StreamStageError, TransformError};
use crate::events::{types, EventSink, NoOpEventSink, StageEvent};
use crate::gate::JoinGate;
use crate::observability::SpanTimer;
use crate::source::StreamSource;
use crate::store::{DoneLog, InMemoryRelationRecorder, RelationRecorder};
use crate::transform::DomainTransform;
use crate::utils::{generate_run_id, jittered};

type TransformOutcome = (ItemId, std::result::Result<Vec<DerivedArtifact>, TransformError>);

struct OutputSlot {
    binding: StageBinding,
    handle: CollectionStateHandle,
    collection: Option<OutputCollection>,
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    source: Arc<dyn StreamSource>,
    source_collection: SourceCollection,
    transform: Arc<dyn DomainTransform>,
    done_log: Arc<dyn DoneLog>,
    bindings: Vec<StageBinding>,
    factories: FactoryRegistry,
    relations: Arc<dyn RelationRecorder>,
    gate: Option<Arc<JoinGate>>,
    events: Arc<dyn EventSink>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Starts a builder for a stage reading `source`, whose metadata is
    /// described by `source_collection`.
    pub fn new(
        source: Arc<dyn StreamSource>,
        source_collection: SourceCollection,
        transform: Arc<dyn DomainTransform>,
        done_log: Arc<dyn DoneLog>,
    ) -> Self {
        Self {
            source,
            source_collection,
            transform,
            done_log,
            bindings: Vec::new(),
            factories: FactoryRegistry::default(),
            relations: Arc::new(InMemoryRelationRecorder::new()),
            gate: None,
            events: Arc::new(NoOpEventSink),
            config: ReconcilerConfig::default(),
        }
    }

    /// Adds an output collection.
    #[must_use]
    pub fn output(mut self, binding: StageBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Sets the factory registry used to derive output metadata.
    #[must_use]
    pub fn factories(mut self, registry: FactoryRegistry) -> Self {
        self.factories = registry;
        self
    }

    /// Sets the provenance recorder.
    #[must_use]
    pub fn relations(mut self, recorder: Arc<dyn RelationRecorder>) -> Self {
        self.relations = recorder;
        self
    }

    /// Sets the gate released when every output is closed.
    #[must_use]
    pub fn gate(mut self, gate: Arc<JoinGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads the DoneSet, resumes outputs that already exist in storage and
    /// registers every output with the gate.
    pub async fn build(self) -> Result<Reconciler> {
        self.config.validate()?;
        if self.bindings.is_empty() {
            return Err(StreamStageError::Config(format!(
                "stage '{}' has no outputs",
                self.config.stage_name
            )));
        }

        let mut tags = BTreeSet::new();
        let mut names = BTreeSet::new();
        for binding in &self.bindings {
            if !tags.insert(binding.tag.clone()) {
                return Err(StreamStageError::Config(format!(
                    "duplicate output tag '{}'",
                    binding.tag
                )));
            }
            if !names.insert(binding.collection_name.clone()) {
                return Err(StreamStageError::Config(format!(
                    "duplicate output collection '{}'",
                    binding.collection_name
                )));
            }
        }

        let done = DoneSet::load(self.done_log).await?;

        let slots: Vec<OutputSlot> = self
            .bindings
            .into_iter()
            .map(|binding| OutputSlot {
                handle: CollectionStateHandle::new(&binding.collection_name),
                binding,
                collection: None,
            })
            .collect();

        if let Some(gate) = &self.gate {
            gate.register(slots.iter().map(|slot| slot.handle.clone()));
        }

        let mut reconciler = Reconciler {
            stall: StallDetector::new(self.config.stall_threshold_passes),
            config: self.config,
            source: self.source,
            source_collection: self.source_collection,
            transform: self.transform,
            done,
            slots,
            factories: self.factories,
            relations: self.relations,
            gate: self.gate,
            events: self.events,
            run_id: generate_run_id(),
            passes: 0,
            last_stray: Vec::new(),
        };

        for index in 0..reconciler.slots.len() {
            if reconciler.slots[index].binding.store.exists().await? {
                reconciler.ensure_open(index).await?;
            }
        }

        info!(
            stage = %reconciler.config.stage_name,
            run_id = %reconciler.run_id,
            outputs = reconciler.slots.len(),
            done = reconciler.done.len(),
            "Reconciler ready"
        );
        Ok(reconciler)
    }
}

/// Drives one stage through repeated reconciliation passes.
///
/// Passes must not overlap; `run_pass` takes `&mut self` so a single
/// reconciler is the only writer of its DoneSet and collections.
pub struct Reconciler {
    config: ReconcilerConfig,
    source: Arc<dyn StreamSource>,
    source_collection: SourceCollection,
    transform: Arc<dyn DomainTransform>,
    done: DoneSet,
    slots: Vec<OutputSlot>,
    factories: FactoryRegistry,
    relations: Arc<dyn RelationRecorder>,
    gate: Option<Arc<JoinGate>>,
    events: Arc<dyn EventSink>,
    stall: StallDetector,
    run_id: Uuid,
    passes: u64,
    last_stray: Vec<ItemId>,
}

impl Reconciler {
    /// Runs one pass: discover, transform, apply, commit, record relations,
    /// evaluate the finished predicate and finalize.
    ///
    /// A cancellation observed after the transform step discards every
    /// result and returns [`StreamStageError::Cancelled`] before anything is
    /// appended or committed.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassReport> {
        self.passes += 1;
        let timer = SpanTimer::start("reconcile.pass");
        self.emit(types::PASS_STARTED, json!({ "done": self.done.len() }));

        match self.execute_pass(cancel).await {
            Ok(mut report) => {
                report.duration_ms = timer.finish();
                info!(
                    stage = %self.config.stage_name,
                    pass = report.pass_number,
                    discovered = report.discovered,
                    appended = report.appended,
                    duplicates = report.duplicates_skipped,
                    committed = report.committed,
                    failed = report.failed.len(),
                    finished = report.finished,
                    duration_ms = report.duration_ms,
                    "Pass completed"
                );
                self.emit(
                    types::PASS_COMPLETED,
                    serde_json::to_value(&report).unwrap_or(Value::Null),
                );
                Ok(report)
            }
            Err(err) => {
                if err.is_fatal() {
                    error!(stage = %self.config.stage_name, pass = self.passes, error = %err, "Pass failed");
                } else if matches!(err, StreamStageError::Cancelled(_)) {
                    info!(stage = %self.config.stage_name, pass = self.passes, error = %err, "Pass cancelled");
                } else {
                    warn!(stage = %self.config.stage_name, pass = self.passes, error = %err, "Pass aborted");
                }
                Err(err)
            }
        }
    }

    /// Runs passes until the stage is finished, sleeping the configured
    /// poll interval (with jitter) between them.
    ///
    /// Retryable errors are logged and the next pass retries. Fatal errors
    /// and cancellation end the loop. With `max_passes` set, the report of
    /// the last successful pass is returned once the limit is reached.
    pub async fn run_until_finished(&mut self, cancel: &CancellationToken) -> Result<PassReport> {
        let mut attempts: u64 = 0;
        let mut last = None;

        loop {
            if cancel.is_cancelled() {
                return Err(StreamStageError::Cancelled(cancel_reason(cancel)));
            }

            attempts += 1;
            match self.run_pass(cancel).await {
                Ok(report) if report.finished => return Ok(report),
                Ok(report) => last = Some(report),
                Err(StreamStageError::Cancelled(reason)) => {
                    return Err(StreamStageError::Cancelled(reason))
                }
                Err(err) if err.is_retryable() => {
                    debug!(stage = %self.config.stage_name, error = %err, "Retrying next pass");
                }
                Err(err) => return Err(err),
            }

            if self.config.max_passes.is_some_and(|max| attempts >= max) {
                return last.ok_or_else(|| {
                    StreamStageError::Internal(format!(
                        "stage '{}' had no successful pass within {attempts} passes",
                        self.config.stage_name
                    ))
                });
            }

            let delay = jittered(self.config.poll_interval(), self.config.poll_jitter);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {}
            }
        }
    }

    async fn execute_pass(&mut self, cancel: &CancellationToken) -> Result<PassReport> {
        let mut report = PassReport {
            pass_number: self.passes,
            ..PassReport::default()
        };

        // Read before listing: once closed, the listing that follows is complete.
        let source_closed = self.source.is_closed();
        let known = self.source.list_known_items()?;

        report.stray_done_ids = self.done.stray_ids(&known);
        self.report_stray_ids(&report.stray_done_ids);

        let candidates = self.discover(&known);
        report.discovered = candidates.len();

        let outcomes = self.transform_all(candidates).await;
        if cancel.is_cancelled() {
            return Err(StreamStageError::Cancelled(cancel_reason(cancel)));
        }

        let mut routed: Vec<Vec<DerivedArtifact>> = vec![Vec::new(); self.slots.len()];
        let mut succeeded = Vec::new();
        for (item_id, outcome) in outcomes {
            match outcome.and_then(|artifacts| self.route(item_id, artifacts)) {
                Ok(placed) => {
                    for (index, artifact) in placed {
                        routed[index].push(artifact);
                    }
                    succeeded.push(item_id);
                }
                Err(err) => {
                    warn!(stage = %self.config.stage_name, item_id = %item_id, error = %err, "Transform failed, item retried next pass");
                    self.emit(
                        types::ITEM_FAILED,
                        json!({ "item_id": item_id, "error": err.to_string() }),
                    );
                    report.failed.push(item_id);
                }
            }
        }

        for (index, artifacts) in routed.into_iter().enumerate() {
            if artifacts.is_empty() {
                continue;
            }
            let collection = self.ensure_open(index).await?;
            let summary = collection.append_all(artifacts).await?;
            report.appended += summary.appended;
            report.duplicates_skipped += summary.duplicates;
        }

        report.committed = self.done.mark_done(&succeeded).await?;

        self.record_relations().await?;

        report.finished = source_closed && self.done.count_known_done(&known) == known.len();
        if report.finished {
            report.gate_released = self.finalize().await?;
        }

        if self.stall.observe(report.made_progress(), report.finished) {
            warn!(
                stage = %self.config.stage_name,
                idle_passes = self.stall.idle_passes(),
                source_closed,
                known = known.len(),
                done = self.done.len(),
                "Stage stalled"
            );
            self.emit(
                types::STAGE_STALLED,
                json!({
                    "idle_passes": self.stall.idle_passes(),
                    "source_closed": source_closed,
                    "known": known.len(),
                    "done": self.done.len(),
                }),
            );
        }
        report.stalled = self.stall.is_stalled();

        Ok(report)
    }

    fn discover(&self, known: &[WorkItem]) -> Vec<WorkItem> {
        let mut candidates: Vec<WorkItem> = known
            .iter()
            .filter(|item| item.is_ready() && !self.done.contains(item.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|item| item.id);
        candidates.dedup_by_key(|item| item.id);
        for item in &candidates {
            debug!(stage = %self.config.stage_name, item_id = %item.id, "Candidate discovered");
        }
        candidates
    }

    async fn transform_all(&self, candidates: Vec<WorkItem>) -> Vec<TransformOutcome> {
        let limit = self.config.max_concurrent_transforms.max(1);
        let transform = self.transform.clone();

        stream::iter(candidates)
            .map(move |item| {
                let transform = transform.clone();
                let item_id = item.id;
                let task = tokio::spawn(async move { transform.transform(&item).await });
                async move {
                    match task.await {
                        Ok(result) => (item_id, result),
                        Err(e) => (
                            item_id,
                            Err(TransformError::failed(item_id, format!("transform task aborted: {e}"))),
                        ),
                    }
                }
            })
            .buffered(limit)
            .collect()
            .await
    }

    fn route(
        &self,
        item_id: ItemId,
        artifacts: Vec<DerivedArtifact>,
    ) -> std::result::Result<Vec<(usize, DerivedArtifact)>, TransformError> {
        artifacts
            .into_iter()
            .map(|artifact| match self.slot_index(&artifact.target) {
                Some(index) => Ok((index, artifact)),
                None => Err(TransformError::unknown_target(item_id, artifact.target.as_str())),
            })
            .collect()
    }

    fn slot_index(&self, tag: &OutputTag) -> Option<usize> {
        self.slots.iter().position(|slot| &slot.binding.tag == tag)
    }

    async fn ensure_open(&mut self, index: usize) -> Result<&mut OutputCollection> {
        if self.slots[index].collection.is_none() {
            let slot = &self.slots[index];
            let factory = slot
                .binding
                .factory
                .clone()
                .unwrap_or_else(|| self.factories.resolve(self.source_collection.kind()));
            let collection = OutputCollection::open_with_handle(
                slot.binding.collection_name.clone(),
                slot.binding.store.clone(),
                &self.source_collection,
                factory.as_ref(),
                slot.handle.clone(),
            )
            .await?;

            let event_type = match collection.open_outcome() {
                OpenOutcome::Created => types::COLLECTION_CREATED,
                OpenOutcome::Resumed => types::COLLECTION_RESUMED,
            };
            self.emit(
                event_type,
                json!({
                    "collection": collection.name(),
                    "state": collection.state(),
                    "artifacts": collection.len(),
                }),
            );
            self.slots[index].collection = Some(collection);
        }

        self.slots[index].collection.as_mut().ok_or_else(|| {
            StreamStageError::Internal(format!("output slot {index} failed to open"))
        })
    }

    async fn record_relations(&mut self) -> Result<()> {
        let mut recorded = Vec::new();
        for slot in &mut self.slots {
            let Some(collection) = slot.collection.as_mut() else {
                continue;
            };
            if collection.is_empty() {
                continue;
            }
            if collection
                .record_relation_once(slot.binding.relation, &self.source_collection, self.relations.as_ref())
                .await?
            {
                recorded.push(json!({
                    "kind": slot.binding.relation,
                    "source": self.source_collection.name,
                    "target": collection.name(),
                }));
            }
        }
        for data in recorded {
            self.emit(types::RELATION_RECORDED, data);
        }
        Ok(())
    }

    /// Closes every output, creating empty ones so downstream joins see a
    /// closed collection, then polls the gate. Returns true if the gate
    /// moved to RUNNABLE in this call.
    async fn finalize(&mut self) -> Result<bool> {
        for index in 0..self.slots.len() {
            let collection = self.ensure_open(index).await?;
            if collection.close().await? {
                let data = json!({ "collection": collection.name(), "artifacts": collection.len() });
                self.emit(types::COLLECTION_CLOSED, data);
            }
        }

        let Some(gate) = &self.gate else {
            return Ok(false);
        };
        let was_runnable = gate.is_runnable();
        let released = gate.poll() && !was_runnable;
        if released {
            let data = json!({ "gate": gate.name(), "dependencies": gate.dependency_names() });
            self.emit(types::GATE_RUNNABLE, data);
        }
        Ok(released)
    }

    fn report_stray_ids(&mut self, stray: &[ItemId]) {
        if stray == self.last_stray.as_slice() {
            return;
        }
        self.last_stray = stray.to_vec();
        if stray.is_empty() {
            return;
        }
        let err = InconsistentDoneSetError::new(&self.config.stage_name, stray.to_vec());
        warn!(stage = %self.config.stage_name, stray = stray.len(), error = %err, "DoneSet holds unknown ids, treating them as processed");
        self.emit(
            types::DONE_SET_INCONSISTENT,
            json!({ "stray_ids": stray, "error": StreamStageError::from(err).to_dict() }),
        );
    }

    fn emit(&self, event_type: &str, data: Value) {
        self.events.emit(StageEvent::new(
            event_type,
            &self.config.stage_name,
            self.run_id.to_string(),
            self.passes,
            data,
        ));
    }

    /// Returns read-only state handles for every output, in binding order.
    #[must_use]
    pub fn state_handles(&self) -> Vec<CollectionStateHandle> {
        self.slots.iter().map(|slot| slot.handle.clone()).collect()
    }

    /// Returns the output collection for `tag` if it was opened.
    #[must_use]
    pub fn collection(&self, tag: &str) -> Option<&OutputCollection> {
        self.slots
            .iter()
            .find(|slot| slot.binding.tag.as_str() == tag)
            .and_then(|slot| slot.collection.as_ref())
    }

    /// Returns the DoneSet.
    #[must_use]
    pub fn done_set(&self) -> &DoneSet {
        &self.done
    }

    /// Returns the gate, if one was configured.
    #[must_use]
    pub fn gate(&self) -> Option<&Arc<JoinGate>> {
        self.gate.as_ref()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Returns the number of passes started.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Returns the run identifier carried by emitted events.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns true while the stage is in a stall episode.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.stall.is_stalled()
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("stage", &self.config.stage_name)
            .field("run_id", &self.run_id)
            .field("passes", &self.passes)
            .field("done", &self.done)
            .field(
                "outputs",
                &self
                    .slots
                    .iter()
                    .map(|slot| slot.binding.collection_name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn cancel_reason(cancel: &CancellationToken) -> String {
    cancel
        .reason()
        .unwrap_or_else(|| "cancellation requested".to_string())
}
