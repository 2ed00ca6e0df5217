//! Derived artifacts produced by the domain transform.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{ItemId, WorkItem};

/// Names the output collection an artifact is destined for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputTag(pub String);

impl OutputTag {
    /// Creates a new tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OutputTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OutputTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An artifact derived from one work item.
///
/// The artifact identifier is assigned once, from the producing item, and
/// never reassigned by a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedArtifact {
    /// Identifier inside the target collection.
    pub id: u64,
    /// The work item this artifact was derived from.
    pub item_id: ItemId,
    /// The target collection.
    pub target: OutputTag,
    /// Human-readable name (e.g. output file name).
    pub name: String,
    /// The artifact content.
    pub payload: serde_json::Value,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the artifact was created (ISO 8601).
    pub created_at: String,
}

impl DerivedArtifact {
    /// Creates an artifact for an item, copying the item id as artifact id.
    #[must_use]
    pub fn for_item(item: &WorkItem, target: impl Into<OutputTag>, payload: serde_json::Value) -> Self {
        Self {
            id: item.id.0,
            item_id: item.id,
            target: target.into(),
            name: format!("item{:06}", item.id.0),
            payload,
            metadata: BTreeMap::new(),
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_copies_item_id() {
        let item = WorkItem::new(12u64);
        let artifact = DerivedArtifact::for_item(&item, "micrographs", serde_json::json!({"defocus": 1.2}));

        assert_eq!(artifact.id, 12);
        assert_eq!(artifact.item_id, ItemId(12));
        assert_eq!(artifact.target.as_str(), "micrographs");
        assert_eq!(artifact.name, "item000012");
    }

    #[test]
    fn test_artifact_with_metadata() {
        let item = WorkItem::new(1u64);
        let artifact = DerivedArtifact::for_item(&item, "movies", serde_json::json!(null))
            .with_name("movie000001_aligned_mic.mrc")
            .with_metadata("first_frame", serde_json::json!(3));

        assert_eq!(artifact.name, "movie000001_aligned_mic.mrc");
        assert_eq!(artifact.metadata.get("first_frame"), Some(&serde_json::json!(3)));
    }
}
