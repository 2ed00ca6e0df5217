//! Storage wrappers that fail on demand, for crash-injection tests.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use super::mocks::take_failure;
use crate::core::{ItemId, StreamState};
use crate::errors::Result;
use crate::store::{ArtifactRecord, ArtifactStore, CollectionHeader, CollectionSnapshot, DoneLog};

/// Wraps a done log and fails the next `n` appends.
pub struct FlakyDoneLog {
    inner: Arc<dyn DoneLog>,
    failing_appends: AtomicUsize,
}

impl FlakyDoneLog {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn DoneLog>) -> Self {
        Self {
            inner,
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` appends fail without touching the inner log.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl DoneLog for FlakyDoneLog {
    async fn load(&self) -> Result<BTreeSet<ItemId>> {
        self.inner.load().await
    }

    async fn append(&self, ids: &[ItemId]) -> Result<()> {
        if take_failure(&self.failing_appends) {
            return Err(io::Error::other("injected done log failure").into());
        }
        self.inner.append(ids).await
    }
}

/// Wraps an artifact store and fails selected writes.
pub struct FlakyArtifactStore {
    inner: Arc<dyn ArtifactStore>,
    failing_appends: AtomicUsize,
    failing_state_changes: AtomicUsize,
}

impl FlakyArtifactStore {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn ArtifactStore>) -> Self {
        Self {
            inner,
            failing_appends: AtomicUsize::new(0),
            failing_state_changes: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` record appends fail.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes the next `n` state marker writes fail.
    pub fn fail_next_state_changes(&self, n: usize) {
        self.failing_state_changes
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    fn location(&self) -> String {
        format!("flaky+{}", self.inner.location())
    }

    async fn load(&self) -> Result<Option<CollectionSnapshot>> {
        self.inner.load().await
    }

    async fn create(&self, header: &CollectionHeader) -> Result<()> {
        self.inner.create(header).await
    }

    async fn append(&self, records: &[ArtifactRecord]) -> Result<()> {
        if take_failure(&self.failing_appends) {
            return Err(io::Error::other("injected artifact append failure").into());
        }
        self.inner.append(records).await
    }

    async fn set_state(&self, state: StreamState) -> Result<()> {
        if take_failure(&self.failing_state_changes) {
            return Err(io::Error::other("injected state marker failure").into());
        }
        self.inner.set_state(state).await
    }
}
