//! The reconciliation pass.
//!
//! A [`Reconciler`] owns one stage: its DoneSet, its output collections and
//! the join gate downstream stages wait on. Each call to
//! [`Reconciler::run_pass`] discovers ready items, transforms them, appends
//! the results, commits the processed ids and, once the source is closed
//! and fully processed, closes every output and releases the gate.

mod binding;
mod reconciler;
mod report;


pub use binding::StageBinding;
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use report::{PassReport, StallDetector};
