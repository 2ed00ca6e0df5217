//! Producer-side interface: where work items come from.

#[cfg(feature = "directory-source")]
mod directory;

#[cfg(feature = "directory-source")]
pub use directory::DirectoryStreamSource;

use crate::core::WorkItem;
use crate::errors::Result;

/// An external producer that reports work items incrementally.
///
/// Both calls must be bounded: the reconciler invokes them once per pass.
#[cfg_attr(test, mockall::automock)]
pub trait StreamSource: Send + Sync {
    /// Lists every item known so far, with readiness evaluated now.
    fn list_known_items(&self) -> Result<Vec<WorkItem>>;

    /// Returns true once the producer will emit no new items.
    fn is_closed(&self) -> bool;
}
