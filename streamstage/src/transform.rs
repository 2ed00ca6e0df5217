//! The per-item domain transform supplied by a stage.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::core::{DerivedArtifact, WorkItem};
use crate::errors::TransformError;

/// Turns one ready work item into zero or more artifacts, each tagged with
/// the output collection it belongs to.
///
/// Transforms may run concurrently for different items and must not touch
/// output collections themselves.
#[async_trait]
pub trait DomainTransform: Send + Sync + Debug {
    /// Transforms an item.
    async fn transform(&self, item: &WorkItem) -> Result<Vec<DerivedArtifact>, TransformError>;
}

/// A simple function-based transform.
pub struct FnTransform<F>
where
    F: Fn(&WorkItem) -> Result<Vec<DerivedArtifact>, TransformError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&WorkItem) -> Result<Vec<DerivedArtifact>, TransformError> + Send + Sync,
{
    /// Creates a new function-based transform.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }

    /// Returns the transform name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F> Debug for FnTransform<F>
where
    F: Fn(&WorkItem) -> Result<Vec<DerivedArtifact>, TransformError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> DomainTransform for FnTransform<F>
where
    F: Fn(&WorkItem) -> Result<Vec<DerivedArtifact>, TransformError> + Send + Sync,
{
    async fn transform(&self, item: &WorkItem) -> Result<Vec<DerivedArtifact>, TransformError> {
        (self.func)(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemId;

    #[tokio::test]
    async fn test_fn_transform_fans_out() {
        let transform = FnTransform::new("align", |item: &WorkItem| {
            Ok(vec![
                DerivedArtifact::for_item(item, "movies", serde_json::json!({"aligned": true})),
                DerivedArtifact::for_item(item, "micrographs", serde_json::json!({})),
            ])
        });

        assert_eq!(transform.name(), "align");
        let artifacts = transform.transform(&WorkItem::new(4u64)).await.unwrap();
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts.iter().all(|a| a.item_id == ItemId(4)));
    }

    #[tokio::test]
    async fn test_fn_transform_error() {
        let transform = FnTransform::new("broken", |item: &WorkItem| {
            Err(TransformError::failed(item.id, "no frames"))
        });

        let err = transform.transform(&WorkItem::new(1u64)).await.unwrap_err();
        assert_eq!(err.item_id(), ItemId(1));
    }
}
