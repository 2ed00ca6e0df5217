use serde::Serialize;

use crate::core::ItemId;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    /// Pass number within this reconciler, starting at 1.
    pub pass_number: u64,
    /// Candidates found: ready and not yet done.
    pub discovered: usize,
    /// Artifacts appended across all output collections.
    pub appended: usize,
    /// Artifacts skipped because their id was already stored.
    pub duplicates_skipped: usize,
    /// Items newly marked done.
    pub committed: usize,
    /// Candidates whose transform failed; retried next pass.
    pub failed: Vec<ItemId>,
    /// Done ids the source no longer reports.
    pub stray_done_ids: Vec<ItemId>,
    /// Whether the finished predicate held.
    pub finished: bool,
    /// Whether this pass moved the join gate to RUNNABLE.
    pub gate_released: bool,
    /// Whether the stage is in a stall episode.
    pub stalled: bool,
    /// Wall time of the pass.
    pub duration_ms: f64,
}

impl PassReport {
    /// Returns true if the pass appended or committed anything.
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.appended > 0 || self.committed > 0
    }
}

/// Counts consecutive unfinished passes without progress.
///
/// Reports a stall once per episode, when the count reaches the threshold.
/// Any progress or a finished pass ends the episode.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: u32,
    idle_passes: u32,
}

impl StallDetector {
    /// Creates a detector that reports after `threshold` idle passes.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            idle_passes: 0,
        }
    }

    /// Feeds one pass. Returns true exactly when a new stall episode starts.
    pub fn observe(&mut self, progressed: bool, finished: bool) -> bool {
        if progressed || finished {
            self.idle_passes = 0;
            return false;
        }
        self.idle_passes = self.idle_passes.saturating_add(1);
        self.idle_passes == self.threshold
    }

    /// Returns true while the idle count is at or past the threshold.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.idle_passes >= self.threshold
    }

    /// Consecutive idle passes so far.
    #[must_use]
    pub fn idle_passes(&self) -> u32 {
        self.idle_passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_reported_once_per_episode() {
        let mut detector = StallDetector::new(3);

        assert!(!detector.observe(false, false));
        assert!(!detector.observe(false, false));
        assert!(detector.observe(false, false));
        assert!(detector.is_stalled());
        assert!(!detector.observe(false, false));
        assert_eq!(detector.idle_passes(), 4);

        assert!(!detector.observe(true, false));
        assert!(!detector.is_stalled());

        assert!(!detector.observe(false, false));
        assert!(!detector.observe(false, false));
        assert!(detector.observe(false, false));
    }

    #[test]
    fn test_finished_pass_is_never_a_stall() {
        let mut detector = StallDetector::new(1);
        assert!(!detector.observe(false, true));
        assert!(!detector.is_stalled());
        assert!(detector.observe(false, false));
    }

    #[test]
    fn test_report_progress() {
        let mut report = PassReport::default();
        assert!(!report.made_progress());
        report.committed = 1;
        assert!(report.made_progress());
    }
}
