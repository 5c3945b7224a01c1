//! The speculative decision tree.
//!
//! A binary tree over an arena: nodes are indices into a flat vector, child
//! links are indices, and the parent is stored alongside. Each node carries
//! at most one [`Task`]; a node without a task is an *empty placeholder*
//! reserving the branch opposite the predicted one, so that when a
//! prediction turns out wrong the driver can insert work at the correct
//! position without restructuring the tree.
//!
//! Nodes are never deallocated. Path compression unlinks finalized failure
//! tails from the live tree and records them in a retired list, keeping
//! indices held by in-flight workers valid without per-node reference
//! counting. All structural mutation happens under the tree lock owned by
//! the driver.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::report::{NodeSnapshot, TreeSnapshot};
use crate::task::{ChunkParams, Task, TaskStatus};

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// The raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// The two child slots of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Failure,
    Success,
}

impl Branch {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Failure => 0,
            Self::Success => 1,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Failure => Self::Success,
            Self::Success => Self::Failure,
        }
    }

    /// The branch the driver walks for a node with the given status.
    /// Anything that is not a success predicts a failure.
    #[must_use]
    pub fn predicted_for(status: TaskStatus) -> Self {
        if status == TaskStatus::Success {
            Self::Success
        } else {
            Self::Failure
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Success => "success",
        }
    }
}

/// A tree node: an optional task plus two child slots.
#[derive(Debug)]
pub struct TreeNode {
    task: Option<Arc<Task>>,
    parent: Option<NodeId>,
    /// Which slot of the parent this node occupies.
    branch: Option<Branch>,
    children: [Option<NodeId>; 2],
    depth: usize,
    retired: bool,
}

impl TreeNode {
    #[must_use]
    pub fn task(&self) -> Option<&Arc<Task>> {
        self.task.as_ref()
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn child(&self, branch: Branch) -> Option<NodeId> {
        self.children[branch.index()]
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// A placeholder carries no task.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.task.is_none()
    }
}

/// Where a predicted-path walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// The walk hit an empty placeholder: a prediction turned out wrong and
    /// the opposite branch is now live.
    Placeholder(NodeId),
    /// The walk hit a node with no children yet.
    Leaf(NodeId),
}

impl WalkEnd {
    #[must_use]
    pub fn node(self) -> NodeId {
        match self {
            Self::Placeholder(id) | Self::Leaf(id) => id,
        }
    }
}

/// The finalized prefix of the predicted path.
#[derive(Debug, Clone, Copy)]
pub struct Frontier {
    /// Deepest node on the predicted path whose root path is finalized.
    pub final_any: NodeId,
    /// Deepest success among those nodes (the root qualifies).
    pub final_success: NodeId,
    /// Depth of `final_any`.
    pub depth: usize,
}

/// Result of a compression pass.
#[derive(Debug)]
pub struct CompressOutcome {
    /// Number of nodes moved to the retired list.
    pub retired: usize,
    /// Aggregate predicate time of the retired candidates.
    pub reclaimed: Duration,
    /// Retired tasks, to be handed to the cleanup pool.
    pub victims: Vec<Arc<Task>>,
}

const ROOT: NodeId = NodeId(0);

/// The speculative tree.
pub struct Tree {
    nodes: Vec<TreeNode>,
    retired_roots: Vec<NodeId>,
    max_depth: usize,
    reclaimed: Duration,
}

impl Tree {
    /// Create a tree whose root carries the original input.
    #[must_use]
    pub fn new(root: Arc<Task>) -> Self {
        Self {
            nodes: vec![TreeNode {
                task: Some(root),
                parent: None,
                branch: None,
                children: [None, None],
                depth: 0,
                retired: false,
            }],
            retired_roots: Vec::new(),
            max_depth: 0,
            reclaimed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn root() -> NodeId {
        ROOT
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Total nodes allocated, retired included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Height of the live tree.
    #[must_use]
    pub fn height(&self) -> usize {
        self.max_depth
    }

    /// Aggregate predicate time recovered by compression so far.
    #[must_use]
    pub fn reclaimed(&self) -> Duration {
        self.reclaimed
    }

    /// Walk from the root along predicted outcomes: the success branch for
    /// a success, the failure branch for anything else. Terminates at an
    /// empty placeholder or at a leaf.
    #[must_use]
    pub fn walk_predicted(&self) -> WalkEnd {
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current.0];
            let Some(task) = &node.task else {
                return WalkEnd::Placeholder(current);
            };
            let branch = Branch::predicted_for(task.status());
            match node.children[branch.index()] {
                Some(child) => current = child,
                None => return WalkEnd::Leaf(current),
            }
        }
    }

    /// The finalized prefix of the predicted path.
    #[must_use]
    pub fn frontier(&self) -> Frontier {
        let mut current = ROOT;
        let mut final_success = ROOT;
        loop {
            // Invariant: `current` carries a resolved task (the root always
            // does; descent below only steps onto resolved children).
            let node = &self.nodes[current.0];
            let Some(task) = &node.task else { break };
            let status = task.status();
            if status == TaskStatus::Success {
                final_success = current;
            }
            let branch = Branch::predicted_for(status);
            let Some(child) = node.children[branch.index()] else {
                break;
            };
            match &self.nodes[child.0].task {
                Some(next) if next.status().is_resolved() => current = child,
                _ => break,
            }
        }
        Frontier {
            final_any: current,
            final_success,
            depth: self.nodes[current.0].depth,
        }
    }

    /// Whether the root path of `id` is finalized: every node on it carries
    /// a task with a definitive result.
    #[must_use]
    pub fn is_path_finalized(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            match &node.task {
                Some(task) if task.status().is_resolved() => {}
                _ => return false,
            }
            current = node.parent;
        }
        true
    }

    /// The source for a candidate inserted at or under `id`: the nearest
    /// ancestor, starting at `id` itself, whose task is a success. The root
    /// always qualifies.
    #[must_use]
    pub fn source_for(&self, id: NodeId) -> Option<(NodeId, Arc<Task>)> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            if let Some(task) = &node.task {
                if task.status() == TaskStatus::Success {
                    return Some((node_id, Arc::clone(task)));
                }
            }
            current = node.parent;
        }
        None
    }

    /// Parameter blocks of the success ancestors of a candidate position,
    /// nearest first. The root is excluded: its block spans the whole input
    /// and describes no reduction.
    #[must_use]
    pub fn success_params_for(&self, id: NodeId) -> Vec<ChunkParams> {
        let mut params = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == ROOT {
                break;
            }
            let node = &self.nodes[node_id.0];
            if let Some(task) = &node.task {
                if task.status() == TaskStatus::Success {
                    params.push(task.params());
                }
            }
            current = node.parent;
        }
        params
    }

    /// Fill an empty placeholder with a materialized task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] if the node already carries a task.
    pub fn attach_task(&mut self, id: NodeId, task: Arc<Task>) -> EngineResult<()> {
        let node = &mut self.nodes[id.0];
        if node.task.is_some() {
            return Err(EngineError::Invariant {
                reason: format!("node {} is not a placeholder", id.0),
            });
        }
        node.task = Some(task);
        Ok(())
    }

    /// Insert both children under a leaf: the real task under the predicted
    /// branch, an empty placeholder under the opposite one. Returns the id
    /// of the real child.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] if the node already has children.
    pub fn insert_children(
        &mut self,
        leaf: NodeId,
        task: Arc<Task>,
        predicted: Branch,
    ) -> EngineResult<NodeId> {
        let depth = {
            let node = &self.nodes[leaf.0];
            if node.children.iter().any(Option::is_some) {
                return Err(EngineError::Invariant {
                    reason: format!("node {} is not a leaf", leaf.0),
                });
            }
            node.depth + 1
        };

        let real = self.alloc(Some(task), leaf, predicted, depth);
        let placeholder = self.alloc(None, leaf, predicted.opposite(), depth);
        let node = &mut self.nodes[leaf.0];
        node.children[predicted.index()] = Some(real);
        node.children[predicted.opposite().index()] = Some(placeholder);
        self.max_depth = self.max_depth.max(depth);
        Ok(real)
    }

    fn alloc(
        &mut self,
        task: Option<Arc<Task>>,
        parent: NodeId,
        branch: Branch,
        depth: usize,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            task,
            parent: Some(parent),
            branch: Some(branch),
            children: [None, None],
            depth,
            retired: false,
        });
        id
    }

    /// Collect every task at or under `from`, pre-order, optionally
    /// skipping the task of a single node (the subtree is still traversed).
    #[must_use]
    pub fn collect_tasks(&self, from: NodeId, skip: Option<NodeId>) -> Vec<Arc<Task>> {
        let mut tasks = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if Some(id) != skip {
                if let Some(task) = &node.task {
                    tasks.push(Arc::clone(task));
                }
            }
            for child in node.children.into_iter().flatten() {
                stack.push(child);
            }
        }
        tasks
    }

    /// Compress finalized tails: pull the deepest finalized success directly
    /// under the root, and the deepest finalized node directly under it.
    /// Everything unlinked on the way moves to the retired list and its
    /// tasks are returned for reclamation.
    pub fn compress(&mut self) -> CompressOutcome {
        let Frontier {
            final_any,
            final_success,
            ..
        } = self.frontier();

        let mut outcome = CompressOutcome {
            retired: 0,
            reclaimed: Duration::ZERO,
            victims: Vec::new(),
        };

        // Surgery between the root and the deepest finalized success.
        if final_success != ROOT
            && self.nodes[ROOT.0].children[Branch::Success.index()] != Some(final_success)
        {
            self.detach(final_success);
            if let Some(old) = self.nodes[ROOT.0].children[Branch::Success.index()] {
                self.retire_subtree(old, &mut outcome);
            }
            self.link(ROOT, Branch::Success, final_success);
        }

        // Surgery between that success and the deepest finalized node.
        if final_any != final_success {
            let down = self.nodes[final_success.0].children[Branch::Success.index()];
            if down != Some(final_any) {
                self.detach(final_any);
                if let Some(old) = down {
                    self.retire_subtree(old, &mut outcome);
                }
                self.link(final_success, Branch::Success, final_any);
            }
        }

        if outcome.retired > 0 {
            self.recompute_depths();
            self.reclaimed += outcome.reclaimed;
        }
        outcome
    }

    /// Unlink `id` from its parent's child slot.
    fn detach(&mut self, id: NodeId) {
        let (parent, branch) = {
            let node = &self.nodes[id.0];
            match (node.parent, node.branch) {
                (Some(p), Some(b)) => (p, b),
                _ => return,
            }
        };
        self.nodes[parent.0].children[branch.index()] = None;
        self.nodes[id.0].parent = None;
        self.nodes[id.0].branch = None;
    }

    fn link(&mut self, parent: NodeId, branch: Branch, child: NodeId) {
        self.nodes[parent.0].children[branch.index()] = Some(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[child.0].branch = Some(branch);
    }

    /// Move a subtree into the retired list, collecting its tasks.
    fn retire_subtree(&mut self, root: NodeId, outcome: &mut CompressOutcome) {
        self.detach(root);
        self.retired_roots.push(root);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &mut self.nodes[id.0];
            node.retired = true;
            outcome.retired += 1;
            if let Some(task) = &node.task {
                outcome.reclaimed += task.elapsed();
                outcome.victims.push(Arc::clone(task));
            }
            for child in node.children.into_iter().flatten() {
                stack.push(child);
            }
        }
    }

    fn recompute_depths(&mut self) {
        self.max_depth = 0;
        let mut stack = vec![(ROOT, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            self.nodes[id.0].depth = depth;
            self.max_depth = self.max_depth.max(depth);
            for child in self.nodes[id.0].children.into_iter().flatten() {
                stack.push((child, depth + 1));
            }
        }
    }

    /// A flat rendering of the live tree for external consumers.
    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.retired)
            .map(|(id, node)| NodeSnapshot {
                id,
                parent: node.parent.map(NodeId::index),
                branch: node.branch,
                status: node.task.as_ref().map(|task| task.status()),
                size: node.task.as_ref().map_or(0, |task| task.size()),
                elapsed: node.task.as_ref().map_or(Duration::ZERO, |task| task.elapsed()),
                depth: node.depth,
            })
            .collect();
        TreeSnapshot { nodes }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("retired_roots", &self.retired_roots.len())
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}
