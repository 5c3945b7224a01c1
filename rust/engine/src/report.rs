//! Flat tree renderings for external consumers (visualizers, tests).

use std::time::Duration;

use crate::task::TaskStatus;
use crate::tree::Branch;

/// An immutable rendering of the live tree at a point in time.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

/// One node of a [`TreeSnapshot`].
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Arena index.
    pub id: usize,
    /// Arena index of the parent, if any.
    pub parent: Option<usize>,
    /// Which slot of the parent this node occupies.
    pub branch: Option<Branch>,
    /// Task status; `None` for an empty placeholder.
    pub status: Option<TaskStatus>,
    /// Candidate size in bytes (0 for a placeholder).
    pub size: u64,
    /// Recorded predicate wall time.
    pub elapsed: Duration,
    /// Distance from the root.
    pub depth: usize,
}

impl TreeSnapshot {
    /// Number of nodes carrying a resolved or pending task.
    #[must_use]
    pub fn materialized(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_some()).count()
    }
}
