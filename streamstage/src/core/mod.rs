//! Core domain model types for streamstage.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Work items and their identifiers
//! - Derived artifacts and output tags
//! - Collection metadata
//! - Stream, gate and relation state enums

mod artifact;
mod info;
mod item;
mod status;

pub use artifact::{DerivedArtifact, OutputTag};
pub use info::{CollectionInfo, CollectionKind, SourceCollection};
pub use item::{ItemId, WorkItem};
pub use status::{GateState, RelationKind, StreamState};
