//! Stream, gate and relation state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream state of an output collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// More artifacts may still be appended.
    Open,
    /// The collection is complete and immutable.
    Closed,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::Open
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl StreamState {
    /// Returns true if the state is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// State of a downstream join gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// At least one dependency is still open.
    Waiting,
    /// Every dependency closed; the downstream step may run.
    Runnable,
}

impl Default for GateState {
    fn default() -> Self {
        Self::Waiting
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Runnable => write!(f, "runnable"),
        }
    }
}

/// Kind of provenance edge between an output collection and its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// The output derives new values from the source (e.g. aligned movies).
    Transform,
    /// The output is a same-domain product of the source (e.g. summed micrographs).
    Source,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform => write!(f, "transform"),
            Self::Source => write!(f, "source"),
        }
    }
}
