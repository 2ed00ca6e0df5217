//! Output collections and the factories that configure them.

mod factory;
mod output;

pub use factory::{CopyInfoFactory, FactoryRegistry, OutputFactory, ScaledSamplingFactory};
pub use output::{
    AppendOutcome, AppendSummary, CollectionStateHandle, OpenOutcome, OutputCollection,
};
