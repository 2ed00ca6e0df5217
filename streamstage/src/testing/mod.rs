//! Test doubles for reconciler tests.
//!
//! This module provides:
//! - A hand-driven stream source
//! - Recording and failing transforms
//! - Done logs and artifact stores that fail on demand
//! - A fixture wiring an in-memory stage together

mod faults;
mod fixtures;
mod mocks;

pub use faults::{FlakyArtifactStore, FlakyDoneLog};
pub use fixtures::TestStage;
pub use mocks::{FailingTransform, ManualStreamSource, RecordingTransform};
