//! Collection metadata copied forward from a source collection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of items a collection holds (e.g. "movies", "micrographs").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKind(pub String);

impl CollectionKind {
    /// Creates a new kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata describing a collection as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Kind of items held.
    pub kind: Option<CollectionKind>,
    /// Sampling rate of the items, if meaningful.
    pub sampling_rate: Option<f64>,
    /// Free-form acquisition properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Names of the collections this one was derived from.
    #[serde(default)]
    pub provenance: Vec<String>,
}

impl CollectionInfo {
    /// Creates empty info of a given kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(CollectionKind::new(kind)),
            ..Self::default()
        }
    }

    /// Sets the sampling rate.
    #[must_use]
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = Some(rate);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Copies sampling and properties from another collection, keeping this
    /// collection's kind.
    pub fn copy_from(&mut self, other: &Self) {
        self.sampling_rate = other.sampling_rate;
        self.properties = other.properties.clone();
        self.provenance = other.provenance.clone();
    }
}

/// The designated source collection a stage reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCollection {
    /// Collection name (used for provenance edges).
    pub name: String,
    /// Collection metadata.
    pub info: CollectionInfo,
}

impl SourceCollection {
    /// Creates a new source collection descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, info: CollectionInfo) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }

    /// Returns the source kind, if declared.
    #[must_use]
    pub fn kind(&self) -> Option<&CollectionKind> {
        self.info.kind.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_from_keeps_kind() {
        let source = CollectionInfo::new("movies")
            .with_sampling_rate(3.54)
            .with_property("voltage", serde_json::json!(300));

        let mut output = CollectionInfo::new("micrographs");
        output.copy_from(&source);

        assert_eq!(output.kind, Some(CollectionKind::new("micrographs")));
        assert_eq!(output.sampling_rate, Some(3.54));
        assert_eq!(output.properties.get("voltage"), Some(&serde_json::json!(300)));
    }

    #[test]
    fn test_source_collection_kind() {
        let source = SourceCollection::new("import.movies", CollectionInfo::new("movies"));
        assert_eq!(source.kind().map(ToString::to_string), Some("movies".to_string()));
    }
}
