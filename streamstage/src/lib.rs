//! # Streamstage
//!
//! Incremental reconciliation for streaming pipeline stages.
//!
//! A stage consumes work items that an upstream producer reports over time
//! and turns each one into derived artifacts. Streamstage runs the stage as
//! repeated, idempotent passes with:
//!
//! - **At-most-once output**: artifacts are appended before their item is
//!   durably marked done, and re-appends of an existing artifact id are no-ops
//! - **Restart recovery**: the DoneSet and output collections reload from
//!   durable storage and resume where the previous process stopped
//! - **Completion propagation**: once the producer is closed and every
//!   known item is done, outputs are closed and a join gate is released
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use streamstage::prelude::*;
//!
//! let mut reconciler = ReconcilerBuilder::new(source, movies, transform, done_log)
//!     .output(StageBinding::new("micrographs", micrographs_store))
//!     .output(
//!         StageBinding::new("power_spectra", spectra_store)
//!             .with_relation(RelationKind::Source),
//!     )
//!     .gate(join_gate)
//!     .build()
//!     .await?;
//!
//! let report = reconciler.run_until_finished(&CancellationToken::new()).await?;
//! assert!(report.finished);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod collection;
pub mod config;
pub mod core;
pub mod done_set;
pub mod errors;
pub mod events;
pub mod gate;
pub mod observability;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod testing;
pub mod transform;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::collection::{
        CollectionStateHandle, CopyInfoFactory, FactoryRegistry, OutputCollection,
        OutputFactory, ScaledSamplingFactory,
    };
    pub use crate::config::{DirectorySourceConfig, ReconcilerConfig};
    pub use crate::core::{
        CollectionInfo, CollectionKind, DerivedArtifact, GateState, ItemId, OutputTag,
        RelationKind, SourceCollection, StreamState, WorkItem,
    };
    pub use crate::done_set::DoneSet;
    pub use crate::errors::{
        ClosedCollectionError, InconsistentDoneSetError, StreamStageError, TransformError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, StageEvent};
    pub use crate::gate::JoinGate;
    pub use crate::reconcile::{PassReport, Reconciler, ReconcilerBuilder, StageBinding};
    #[cfg(feature = "directory-source")]
    pub use crate::source::DirectoryStreamSource;
    pub use crate::source::StreamSource;
    pub use crate::store::{
        ArtifactStore, DoneLog, FileDoneLog, InMemoryArtifactStore, InMemoryDoneLog,
        InMemoryRelationRecorder, JsonlArtifactStore, JsonlRelationRecorder, RelationRecorder,
    };
    pub use crate::transform::{DomainTransform, FnTransform};
}
