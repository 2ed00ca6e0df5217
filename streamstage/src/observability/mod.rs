//! Tracing setup and timing helpers.

mod tracing;

pub use self::tracing::{init_tracing, init_tracing_json, SpanTimer};
