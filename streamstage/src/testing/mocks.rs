//! Hand-driven sources and transforms.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{DerivedArtifact, ItemId, OutputTag, WorkItem};
use crate::errors::{Result, TransformError};
use crate::source::StreamSource;
use crate::transform::DomainTransform;

/// A stream source whose items and closed flag are set by the test.
#[derive(Debug, Default)]
pub struct ManualStreamSource {
    items: Mutex<BTreeMap<ItemId, WorkItem>>,
    closed: AtomicBool,
    failing_lists: AtomicUsize,
    list_calls: AtomicUsize,
}

impl ManualStreamSource {
    /// Creates an open source with no items.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an open source with ready items for `ids`.
    #[must_use]
    pub fn with_ready(ids: impl IntoIterator<Item = u64>) -> Self {
        let source = Self::new();
        source.push_ready(ids);
        source
    }

    /// Adds or replaces an item.
    pub fn push(&self, item: WorkItem) {
        self.items.lock().insert(item.id, item);
    }

    /// Adds ready items for `ids`.
    pub fn push_ready(&self, ids: impl IntoIterator<Item = u64>) {
        let mut items = self.items.lock();
        for id in ids {
            items.insert(ItemId(id), WorkItem::new(id));
        }
    }

    /// Adds items for `ids` that are not ready yet.
    pub fn push_pending(&self, ids: impl IntoIterator<Item = u64>) {
        let mut items = self.items.lock();
        for id in ids {
            items.insert(ItemId(id), WorkItem::pending(id));
        }
    }

    /// Changes the readiness of a known item.
    pub fn set_ready(&self, id: u64, ready: bool) {
        if let Some(item) = self.items.lock().get_mut(&ItemId(id)) {
            item.ready = ready;
        }
    }

    /// Forgets an item, as a producer that dropped it would.
    pub fn remove(&self, id: u64) {
        self.items.lock().remove(&ItemId(id));
    }

    /// Declares that no new items will arrive.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Makes the next `n` listings fail with an IO error.
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    /// Returns how many times the source was listed.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl StreamSource for ManualStreamSource {
    fn list_known_items(&self) -> Result<Vec<WorkItem>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_lists) {
            return Err(io::Error::other("injected listing failure").into());
        }
        Ok(self.items.lock().values().cloned().collect())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn artifacts_for(item: &WorkItem, tags: &[OutputTag]) -> Vec<DerivedArtifact> {
    tags.iter()
        .map(|tag| {
            DerivedArtifact::for_item(
                item,
                tag.clone(),
                serde_json::json!({ "source_item": item.id, "output": tag.as_str() }),
            )
        })
        .collect()
}

/// A transform that emits one artifact per configured tag and records
/// every item it saw.
#[derive(Debug)]
pub struct RecordingTransform {
    tags: Vec<OutputTag>,
    calls: Mutex<Vec<ItemId>>,
    delay: Option<Duration>,
}

impl RecordingTransform {
    /// Creates a transform producing one artifact for each of `tags`.
    #[must_use]
    pub fn new(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| OutputTag::new(*t)).collect(),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleeps before every transform.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the transformed item ids, sorted. Concurrent transforms
    /// within a pass start in no fixed order.
    #[must_use]
    pub fn calls(&self) -> Vec<ItemId> {
        let mut calls = self.calls.lock().clone();
        calls.sort_unstable();
        calls
    }

    /// Returns how many transforms ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl DomainTransform for RecordingTransform {
    async fn transform(&self, item: &WorkItem) -> std::result::Result<Vec<DerivedArtifact>, TransformError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(item.id);
        Ok(artifacts_for(item, &self.tags))
    }
}

/// A transform that fails for selected items until they are healed.
#[derive(Debug)]
pub struct FailingTransform {
    tags: Vec<OutputTag>,
    failing: Mutex<BTreeSet<ItemId>>,
}

impl FailingTransform {
    /// Creates a transform failing for `ids` and producing one artifact per
    /// tag for every other item.
    #[must_use]
    pub fn new(tags: &[&str], ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            tags: tags.iter().map(|t| OutputTag::new(*t)).collect(),
            failing: Mutex::new(ids.into_iter().map(ItemId).collect()),
        }
    }

    /// Stops failing for `id`.
    pub fn heal(&self, id: u64) {
        self.failing.lock().remove(&ItemId(id));
    }
}

#[async_trait]
impl DomainTransform for FailingTransform {
    async fn transform(&self, item: &WorkItem) -> std::result::Result<Vec<DerivedArtifact>, TransformError> {
        if self.failing.lock().contains(&item.id) {
            return Err(TransformError::failed(item.id, "injected transform failure"));
        }
        Ok(artifacts_for(item, &self.tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StreamStageError;

    #[test]
    fn test_manual_source_listing() {
        let source = ManualStreamSource::with_ready([2, 1]);
        source.push_pending([3]);

        let items = source.list_known_items().unwrap();
        let ids: Vec<u64> = items.iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!items[2].is_ready());

        source.set_ready(3, true);
        assert!(source.list_known_items().unwrap()[2].is_ready());
        assert_eq!(source.list_calls(), 2);
    }

    #[test]
    fn test_manual_source_injected_failure() {
        let source = ManualStreamSource::new();
        source.fail_next_lists(1);
        let err = source.list_known_items().unwrap_err();
        assert!(matches!(err, StreamStageError::TransientIo(_)));
        assert!(source.list_known_items().is_ok());
    }

    #[tokio::test]
    async fn test_failing_transform_heals() {
        let transform = FailingTransform::new(&["movies"], [1]);
        assert!(transform.transform(&WorkItem::new(1u64)).await.is_err());
        assert_eq!(transform.transform(&WorkItem::new(2u64)).await.unwrap().len(), 1);

        transform.heal(1);
        assert!(transform.transform(&WorkItem::new(1u64)).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_transform_records_calls() {
        let transform = RecordingTransform::new(&["movies", "micrographs"]);
        let artifacts = transform.transform(&WorkItem::new(7u64)).await.unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].target.as_str(), "micrographs");
        assert_eq!(transform.calls(), vec![ItemId(7)]);
    }
}
