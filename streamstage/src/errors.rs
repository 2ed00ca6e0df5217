//! Error types for streamstage.
//!
//! The taxonomy separates failures a later pass can recover from
//! (persistence hiccups, per-item transform failures) from ordering bugs
//! that must be surfaced and never retried.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::ItemId;

/// Convenience alias used across the crate.
pub type Result<T, E = StreamStageError> = std::result::Result<T, E>;

/// The main error type for streamstage operations.
#[derive(Debug, Error)]
pub enum StreamStageError {
    /// A persistence read or write failed. The pass aborts and the next
    /// invocation retries from the durably committed state.
    #[error("Transient IO error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// An append was attempted on a collection that is already closed.
    #[error("{0}")]
    ClosedCollection(#[from] ClosedCollectionError),

    /// The done set references identifiers no known item carries.
    #[error("{0}")]
    InconsistentDoneSet(#[from] InconsistentDoneSetError),

    /// The domain transform failed for an item.
    #[error("{0}")]
    Transform(#[from] TransformError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pass was cancelled before commit.
    #[error("Pass cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StreamStageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl StreamStageError {
    /// Returns true if a later pass may succeed where this one failed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::Transform(_) | Self::Cancelled(_)
        )
    }

    /// Returns true for errors that indicate a bug in pass ordering or setup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ClosedCollection(_) | Self::Config(_) | Self::Internal(_)
        )
    }

    /// Short machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "TransientIOError",
            Self::ClosedCollection(_) => "ClosedCollectionError",
            Self::InconsistentDoneSet(_) => "InconsistentDoneSetError",
            Self::Transform(_) => "TransformError",
            Self::Serialization(_) => "SerializationError",
            Self::Config(_) => "ConfigError",
            Self::Cancelled(_) => "Cancelled",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        map
    }
}

/// Error raised when appending to a closed collection.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Collection '{collection}' is closed: cannot append artifact {artifact_id}")]
pub struct ClosedCollectionError {
    /// The collection name.
    pub collection: String,
    /// The rejected artifact identifier.
    pub artifact_id: u64,
}

impl ClosedCollectionError {
    /// Creates a new closed collection error.
    #[must_use]
    pub fn new(collection: impl Into<String>, artifact_id: u64) -> Self {
        Self {
            collection: collection.into(),
            artifact_id,
        }
    }
}

/// Error raised when the done set holds identifiers absent from the known items.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Done set for stage '{stage}' references unknown items: {}", format_ids(.stray_ids))]
pub struct InconsistentDoneSetError {
    /// The stage name.
    pub stage: String,
    /// Identifiers present in the done set but in no known item.
    pub stray_ids: Vec<ItemId>,
}

impl InconsistentDoneSetError {
    /// Creates a new inconsistent done set error.
    #[must_use]
    pub fn new(stage: impl Into<String>, stray_ids: Vec<ItemId>) -> Self {
        Self {
            stage: stage.into(),
            stray_ids,
        }
    }
}

fn format_ids(ids: &[ItemId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by a domain transform.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TransformError {
    /// The transform failed but may succeed on a later pass.
    #[error("Transform failed for item {item_id}: {reason}")]
    Failed {
        /// The item identifier.
        item_id: ItemId,
        /// The reason for failure.
        reason: String,
    },

    /// The item's inputs are not usable yet.
    #[error("Item {item_id} not usable yet: {reason}")]
    NotReady {
        /// The item identifier.
        item_id: ItemId,
        /// Why the item could not be transformed.
        reason: String,
    },

    /// An artifact was tagged with a collection the stage does not write.
    #[error("Item {item_id} produced an artifact for unknown collection '{target}'")]
    UnknownTarget {
        /// The item identifier.
        item_id: ItemId,
        /// The unknown target tag.
        target: String,
    },
}

impl TransformError {
    /// Creates a failed transform error.
    #[must_use]
    pub fn failed(item_id: ItemId, reason: impl Into<String>) -> Self {
        Self::Failed {
            item_id,
            reason: reason.into(),
        }
    }

    /// Creates a not-ready transform error.
    #[must_use]
    pub fn not_ready(item_id: ItemId, reason: impl Into<String>) -> Self {
        Self::NotReady {
            item_id,
            reason: reason.into(),
        }
    }

    /// Creates an unknown target error.
    #[must_use]
    pub fn unknown_target(item_id: ItemId, target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            item_id,
            target: target.into(),
        }
    }

    /// Returns the item the error refers to.
    #[must_use]
    pub fn item_id(&self) -> ItemId {
        match self {
            Self::Failed { item_id, .. }
            | Self::NotReady { item_id, .. }
            | Self::UnknownTarget { item_id, .. } => *item_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_collection_error_message() {
        let err = ClosedCollectionError::new("micrographs", 7);
        assert_eq!(
            err.to_string(),
            "Collection 'micrographs' is closed: cannot append artifact 7"
        );
    }

    #[test]
    fn test_inconsistent_done_set_lists_ids() {
        let err = InconsistentDoneSetError::new("align", vec![ItemId(4), ItemId(9)]);
        assert!(err.to_string().contains("4, 9"));
    }

    #[test]
    fn test_retryable_classification() {
        let io = StreamStageError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_fatal());

        let closed = StreamStageError::from(ClosedCollectionError::new("movies", 1));
        assert!(!closed.is_retryable());
        assert!(closed.is_fatal());
    }

    #[test]
    fn test_to_dict() {
        let err = StreamStageError::from(TransformError::failed(ItemId(3), "bad frame"));
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "TransformError");
        assert_eq!(dict.get("retryable").unwrap(), true);
    }

    #[test]
    fn test_transform_error_item_id() {
        assert_eq!(TransformError::not_ready(ItemId(5), "parts").item_id(), ItemId(5));
        assert_eq!(TransformError::unknown_target(ItemId(6), "x").item_id(), ItemId(6));
    }
}
