use std::fmt;
use std::sync::Arc;

use crate::collection::OutputFactory;
use crate::core::{OutputTag, RelationKind};
use crate::store::ArtifactStore;

/// Binds an output tag to the collection that receives its artifacts.
#[derive(Clone)]
pub struct StageBinding {
    /// Tag the transform puts on artifacts for this output.
    pub tag: OutputTag,
    /// Name of the output collection.
    pub collection_name: String,
    /// Storage backing the collection.
    pub store: Arc<dyn ArtifactStore>,
    /// Provenance relation recorded from the source collection.
    pub relation: RelationKind,
    /// Factory overriding the registry lookup for this output.
    pub factory: Option<Arc<dyn OutputFactory>>,
}

impl StageBinding {
    /// Creates a binding whose collection is named after the tag and
    /// related to the source by a TRANSFORM edge.
    pub fn new(tag: impl Into<OutputTag>, store: Arc<dyn ArtifactStore>) -> Self {
        let tag = tag.into();
        Self {
            collection_name: tag.as_str().to_string(),
            tag,
            store,
            relation: RelationKind::Transform,
            factory: None,
        }
    }

    /// Sets the collection name.
    #[must_use]
    pub fn with_collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    /// Sets the relation kind.
    #[must_use]
    pub fn with_relation(mut self, relation: RelationKind) -> Self {
        self.relation = relation;
        self
    }

    /// Uses `factory` instead of the registry entry for the source kind.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn OutputFactory>) -> Self {
        self.factory = Some(factory);
        self
    }
}

impl fmt::Debug for StageBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBinding")
            .field("tag", &self.tag)
            .field("collection_name", &self.collection_name)
            .field("store", &self.store.location())
            .field("relation", &self.relation)
            .field("factory", &self.factory)
            .finish()
    }
}
