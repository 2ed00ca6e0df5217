//! Lifecycle events emitted by reconcilers.
//!
//! Events complement `tracing` logs: they carry a stable type name and a
//! JSON payload so callers can route them to dashboards or tests.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, StageEvent};

/// Event type names.
pub mod types {
    /// A pass began.
    pub const PASS_STARTED: &str = "reconcile.pass_started";
    /// A pass finished without a fatal error.
    pub const PASS_COMPLETED: &str = "reconcile.pass_completed";
    /// A single candidate failed its transform.
    pub const ITEM_FAILED: &str = "reconcile.item_failed";
    /// The DoneSet holds ids the source does not know.
    pub const DONE_SET_INCONSISTENT: &str = "reconcile.done_set_inconsistent";
    /// An output collection was created.
    pub const COLLECTION_CREATED: &str = "collection.created";
    /// An output collection was reopened from storage.
    pub const COLLECTION_RESUMED: &str = "collection.resumed";
    /// An output collection was closed.
    pub const COLLECTION_CLOSED: &str = "collection.closed";
    /// A provenance edge was persisted.
    pub const RELATION_RECORDED: &str = "relation.recorded";
    /// A join gate became runnable.
    pub const GATE_RUNNABLE: &str = "gate.runnable";
    /// The stage made no progress for too many passes.
    pub const STAGE_STALLED: &str = "stage.stalled";
}
