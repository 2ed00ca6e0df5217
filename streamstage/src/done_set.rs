//! The set of work items whose outputs are durably committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::{ItemId, WorkItem};
use crate::errors::Result;
use crate::store::DoneLog;

/// Durable record of processed work items.
///
/// An identifier is only inserted into the in-memory set after the log
/// append succeeded, so memory never runs ahead of disk.
pub struct DoneSet {
    log: Arc<dyn DoneLog>,
    ids: BTreeSet<ItemId>,
}

impl DoneSet {
    /// Rebuilds the set from its log.
    pub async fn load(log: Arc<dyn DoneLog>) -> Result<Self> {
        let ids = log.load().await?;
        Ok(Self { log, ids })
    }

    /// Durably marks identifiers as done.
    ///
    /// Must only be called once every artifact for `ids` is appended.
    /// Identifiers already present are ignored. Returns how many were new.
    pub async fn mark_done(&mut self, ids: &[ItemId]) -> Result<usize> {
        let mut fresh: Vec<ItemId> = ids
            .iter()
            .copied()
            .filter(|id| !self.ids.contains(id))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();

        if fresh.is_empty() {
            return Ok(0);
        }

        self.log.append(&fresh).await?;
        self.ids.extend(fresh.iter().copied());
        Ok(fresh.len())
    }

    /// Returns true if the item was processed.
    #[must_use]
    pub fn contains(&self, id: ItemId) -> bool {
        self.ids.contains(&id)
    }

    /// Returns the number of processed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if nothing was processed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates over processed ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.ids.iter().copied()
    }

    /// Returns done ids that no known item carries.
    #[must_use]
    pub fn stray_ids(&self, known: &[WorkItem]) -> Vec<ItemId> {
        let known: BTreeSet<ItemId> = known.iter().map(|item| item.id).collect();
        self.ids.difference(&known).copied().collect()
    }

    /// Counts known items that are done.
    #[must_use]
    pub fn count_known_done(&self, known: &[WorkItem]) -> usize {
        known.iter().filter(|item| self.ids.contains(&item.id)).count()
    }
}

impl std::fmt::Debug for DoneSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoneSet")
            .field("len", &self.ids.len())
            .finish()
    }
}
