//! Work items discovered from a stream source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable identifier of a work item.
///
/// Identifiers survive restarts and order discovery deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A unit of input reported by a [`StreamSource`](crate::source::StreamSource).
///
/// `ready` is the readiness predicate as evaluated by the source when it
/// listed the item: a multi-part item only becomes ready once all its parts
/// are present and stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier.
    pub id: ItemId,
    /// Parameters handed to the domain transform.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Files making up the item, if any.
    #[serde(default)]
    pub parts: Vec<PathBuf>,
    /// Whether the item is fully available for processing.
    pub ready: bool,
}

impl WorkItem {
    /// Creates a ready item with no parameters.
    #[must_use]
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            params: serde_json::Value::Null,
            parts: Vec::new(),
            ready: true,
        }
    }

    /// Creates an item that is not ready yet.
    #[must_use]
    pub fn pending(id: impl Into<ItemId>) -> Self {
        Self::new(id).with_ready(false)
    }

    /// Sets the transform parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Adds a part file.
    #[must_use]
    pub fn with_part(mut self, part: impl Into<PathBuf>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Sets the readiness flag.
    #[must_use]
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Readiness predicate.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns a parameter by key, if params is an object.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.as_object().and_then(|obj| obj.get(key))
    }
}
