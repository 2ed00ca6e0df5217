//! Output collection factories keyed by source collection kind.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{CollectionInfo, CollectionKind};

/// Derives the metadata of a new output collection from its source.
pub trait OutputFactory: Send + Sync + Debug {
    /// Builds the output info from the source info.
    fn derive_info(&self, source: &CollectionInfo) -> CollectionInfo;
}

/// Copies the source info, optionally relabelling the kind.
#[derive(Debug, Clone, Default)]
pub struct CopyInfoFactory {
    kind: Option<CollectionKind>,
}

impl CopyInfoFactory {
    /// Creates a factory that keeps the source kind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory producing collections of another kind.
    #[must_use]
    pub fn with_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(CollectionKind::new(kind)),
        }
    }
}

impl OutputFactory for CopyInfoFactory {
    fn derive_info(&self, source: &CollectionInfo) -> CollectionInfo {
        let mut info = CollectionInfo {
            kind: self.kind.clone().or_else(|| source.kind.clone()),
            ..CollectionInfo::default()
        };
        info.copy_from(source);
        info
    }
}

/// Copies the source info and scales the sampling rate, e.g. when the
/// transform bins its input.
#[derive(Debug, Clone)]
pub struct ScaledSamplingFactory {
    inner: CopyInfoFactory,
    factor: f64,
}

impl ScaledSamplingFactory {
    /// Creates a factory scaling the sampling rate by `factor`.
    #[must_use]
    pub fn new(factor: f64) -> Self {
        Self {
            inner: CopyInfoFactory::new(),
            factor,
        }
    }

    /// Sets the output kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.inner = CopyInfoFactory::with_kind(kind);
        self
    }
}

impl OutputFactory for ScaledSamplingFactory {
    fn derive_info(&self, source: &CollectionInfo) -> CollectionInfo {
        let mut info = self.inner.derive_info(source);
        info.sampling_rate = source.sampling_rate.map(|rate| rate * self.factor);
        info
    }
}

/// Explicit mapping from source kind to output factory.
#[derive(Debug, Clone)]
pub struct FactoryRegistry {
    factories: HashMap<CollectionKind, Arc<dyn OutputFactory>>,
    fallback: Arc<dyn OutputFactory>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
            fallback: Arc::new(CopyInfoFactory::new()),
        }
    }
}

impl FactoryRegistry {
    /// Creates a registry that copies info for every kind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a source kind.
    #[must_use]
    pub fn with_factory(mut self, kind: impl Into<String>, factory: Arc<dyn OutputFactory>) -> Self {
        self.factories.insert(CollectionKind::new(kind), factory);
        self
    }

    /// Replaces the fallback factory.
    #[must_use]
    pub fn with_fallback(mut self, factory: Arc<dyn OutputFactory>) -> Self {
        self.fallback = factory;
        self
    }

    /// Resolves the factory for a source kind.
    #[must_use]
    pub fn resolve(&self, kind: Option<&CollectionKind>) -> Arc<dyn OutputFactory> {
        kind.and_then(|k| self.factories.get(k))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Returns the number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if only the fallback is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movies() -> CollectionInfo {
        CollectionInfo::new("movies")
            .with_sampling_rate(1.5)
            .with_property("voltage", serde_json::json!(300))
    }

    #[test]
    fn test_copy_info_factory() {
        let info = CopyInfoFactory::with_kind("micrographs").derive_info(&movies());

        assert_eq!(info.kind, Some(CollectionKind::new("micrographs")));
        assert_eq!(info.sampling_rate, Some(1.5));
        assert_eq!(info.properties.len(), 1);
    }

    #[test]
    fn test_scaled_sampling_factory() {
        let info = ScaledSamplingFactory::new(2.0).derive_info(&movies());

        assert_eq!(info.kind, Some(CollectionKind::new("movies")));
        assert_eq!(info.sampling_rate, Some(3.0));
    }

    #[test]
    fn test_registry_resolves_by_kind() {
        let registry = FactoryRegistry::new()
            .with_factory("movies", Arc::new(ScaledSamplingFactory::new(2.0)));

        let source = movies();
        let scaled = registry.resolve(source.kind.as_ref()).derive_info(&source);
        assert_eq!(scaled.sampling_rate, Some(3.0));

        let other = CollectionInfo::new("particles").with_sampling_rate(1.0);
        let copied = registry.resolve(other.kind.as_ref()).derive_info(&other);
        assert_eq!(copied.sampling_rate, Some(1.0));

        assert_eq!(registry.resolve(None).derive_info(&other).sampling_rate, Some(1.0));
    }
}
