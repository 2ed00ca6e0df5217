//! Persistence layer.
//!
//! This module provides:
//! - `DoneLog` for the append-only log of processed item ids
//! - `ArtifactStore` for ordered, resumable output collections
//! - `RelationRecorder` for provenance edges

mod artifact_store;
mod done_log;
mod relations;

pub use artifact_store::{
    ArtifactRecord, ArtifactStore, CollectionHeader, CollectionSnapshot, InMemoryArtifactStore,
    JsonlArtifactStore,
};
pub use done_log::{DoneLog, FileDoneLog, InMemoryDoneLog};
pub use relations::{
    InMemoryRelationRecorder, JsonlRelationRecorder, RelationEdge, RelationRecorder,
};
