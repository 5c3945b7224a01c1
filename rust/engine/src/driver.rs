//! Tree driver.
//!
//! Owns the speculative tree for one strategy run. Each iteration waits
//! for queue capacity, walks the predicted path, asks the strategy for the
//! next candidate, and either fills the placeholder the walk ended on or
//! inserts a real-child/placeholder pair under the leaf — the real child
//! on the branch the prediction favors. The run is complete when the
//! strategy is exhausted at a position whose root path is finalized.
//!
//! The tree lock is never held across an await or any other blocking
//! work; candidate materialization, all waiting, and event emission happen
//! outside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventEmitter, MinimizeEvent};
use crate::gc::GcPool;
use crate::report::TreeSnapshot;
use crate::strategy::{SpawnContext, Strategy};
use crate::task::{Task, TaskStatus};
use crate::tree::{Branch, Frontier, NodeId, Tree, WalkEnd};
use crate::worker::{self, WorkerContext};

/// How often the driver wakes to publish progress while saturated.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Cap on the strategy-stall backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// State shared between the driver, its workers, and the cleanup pool.
pub(crate) struct TreeShared {
    tree: Mutex<Tree>,
    /// Signalled whenever a worker finishes or a fault is raised.
    pub notify: Notify,
    /// First fatal error raised off the driver's thread.
    fault: Mutex<Option<EngineError>>,
    /// Predicate runs completed in this strategy run.
    pub runs: AtomicU64,
}

impl TreeShared {
    fn new(tree: Tree) -> Self {
        Self {
            tree: Mutex::new(tree),
            notify: Notify::new(),
            fault: Mutex::new(None),
            runs: AtomicU64::new(0),
        }
    }

    /// Take the tree lock, recovering from a poisoned mutex: the tree's
    /// invariants are maintained before any point that could panic.
    pub(crate) fn lock_tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the first fatal error and wake the driver.
    pub(crate) fn raise_fault(&self, error: EngineError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.notify.notify_one();
    }

    fn take_fault(&self) -> Option<EngineError> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Result of driving one strategy to completion.
pub(crate) struct DriveOutcome {
    /// Deepest finalized success; its blob is the strategy's best output.
    pub final_task: Arc<Task>,
    /// Depth of the finalized frontier at completion.
    pub depth: usize,
    /// Predicate runs spent.
    pub runs: u64,
    /// Predicate time recovered by compression.
    pub reclaimed: Duration,
    /// Final rendering of the live tree.
    pub snapshot: TreeSnapshot,
}

/// Drive one strategy over the tree rooted at `root` until the active
/// path is finalized.
pub(crate) async fn drive(
    config: &Arc<EngineConfig>,
    emitter: &Arc<dyn EventEmitter>,
    gc: &GcPool,
    strategy: &Arc<dyn Strategy>,
    root: Arc<Task>,
) -> EngineResult<DriveOutcome> {
    let root_size = root.size();
    let shared = Arc::new(TreeShared::new(Tree::new(root)));
    let queue_capacity = config.num_workers + config.max_unprocessed;
    let queue_slots = Arc::new(Semaphore::new(queue_capacity));
    let worker_ctx = WorkerContext {
        config: Arc::clone(config),
        emitter: Arc::clone(emitter),
        shared: Arc::clone(&shared),
        gc: gc.sender(),
        run_slots: Arc::new(Semaphore::new(config.num_workers)),
    };
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut stalls: u32 = 0;
    let mut last_frontier = (0usize, root_size);

    let mut verdict: EngineResult<()> = 'drive: loop {
        if let Some(error) = shared.take_fault() {
            break Err(error);
        }

        // Bounded speculation: wait for a queue slot, but keep progress
        // flowing while saturated.
        let permit = match tokio::time::timeout(
            PROGRESS_INTERVAL,
            Arc::clone(&queue_slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                break Err(EngineError::Invariant {
                    reason: "queue semaphore closed".into(),
                });
            }
            Err(_) => {
                emit_progress(emitter, &shared, &queue_slots, queue_capacity);
                continue;
            }
        };

        // Housekeeping under the tree lock; the events it produces are
        // emitted only after the guard is dropped, so an emitter can never
        // stall other contenders for the lock.
        let mut housekeeping: Vec<MinimizeEvent> = Vec::new();
        {
            let mut tree = shared.lock_tree();
            if tree.height() > config.max_tree_depth {
                let outcome = tree.compress();
                if outcome.retired > 0 {
                    tracing::debug!(retired = outcome.retired, "compressed finalized tail");
                    housekeeping.push(MinimizeEvent::TreeCompressed {
                        retired: outcome.retired,
                        reclaimed: outcome.reclaimed,
                    });
                    for victim in outcome.victims {
                        gc.enqueue(victim);
                    }
                }
            }
            if let Some(event) = frontier_event(&tree, &mut last_frontier) {
                housekeeping.push(event);
            }
        }
        for event in housekeeping {
            emitter.emit(event);
        }

        // The predicted-path walk, under the tree lock.
        let (walk, ctx) = {
            let tree = shared.lock_tree();

            let walk = tree.walk_predicted();
            let ctx_node = match walk {
                WalkEnd::Placeholder(id) => match tree.node(id).parent() {
                    Some(parent) => parent,
                    None => {
                        break 'drive Err(EngineError::Invariant {
                            reason: "the root cannot be a placeholder".into(),
                        });
                    }
                },
                WalkEnd::Leaf(id) => id,
            };
            let Some(ctx_task) = tree.node(ctx_node).task() else {
                break 'drive Err(EngineError::Invariant {
                    reason: "walk context carries no task".into(),
                });
            };
            let Some((_, source)) = tree.source_for(ctx_node) else {
                break 'drive Err(EngineError::Invariant {
                    reason: "no success ancestor on the active path".into(),
                });
            };
            let ctx = SpawnContext {
                params: ctx_task.params(),
                size: ctx_task.size(),
                succeeded: ctx_task.status() == TaskStatus::Success,
                source,
                success_params: tree.success_params_for(ctx_node),
            };
            (walk, ctx)
        };

        // Materialize the candidate outside the tree lock.
        let produced = match strategy.next(&ctx).await {
            Ok(produced) => produced,
            Err(error) => break Err(error),
        };

        let Some(task) = produced else {
            drop(permit);
            // Either the run is complete, or pending results will reopen
            // this position.
            let complete = {
                let tree = shared.lock_tree();
                let now = tree.walk_predicted();
                now == walk
                    && match now {
                        WalkEnd::Placeholder(id) => tree.node(id).parent(),
                        WalkEnd::Leaf(id) => Some(id),
                    }
                    .is_some_and(|id| tree.is_path_finalized(id))
            };
            if complete {
                break Ok(());
            }
            stalls = stalls.saturating_add(1);
            tokio::select! {
                () = shared.notify.notified() => {}
                () = tokio::time::sleep(stall_backoff(config.poll_delay, stalls)) => {}
            }
            continue;
        };
        stalls = 0;

        // Attach and enqueue: fill the placeholder, or insert the pair
        // under the leaf with the real child on the predicted branch.
        let task = Arc::new(task);
        let queued = {
            let mut tree = shared.lock_tree();
            let inserted = match walk {
                WalkEnd::Placeholder(id) => tree.attach_task(id, Arc::clone(&task)).map(|()| id),
                WalkEnd::Leaf(id) => {
                    let predicted = if ctx.succeeded {
                        Branch::Success
                    } else {
                        Branch::Failure
                    };
                    tree.insert_children(id, Arc::clone(&task), predicted)
                }
            };
            match inserted {
                Ok(node) => node,
                Err(error) => break Err(error),
            }
        };
        emitter.emit(MinimizeEvent::CandidateQueued {
            node: queued.index(),
            size: task.size(),
        });
        workers.spawn(worker::run_candidate(worker_ctx.clone(), queued, task, permit));

        // Keep the join set from accumulating finished handles.
        while workers.try_join_next().is_some() {}
    };

    // On completion the deepest finalized success holds the result.
    let mut final_info: Option<(NodeId, usize, Arc<Task>)> = None;
    if verdict.is_ok() {
        let tree = shared.lock_tree();
        let Frontier {
            final_success,
            depth,
            ..
        } = tree.frontier();
        match tree.node(final_success).task() {
            Some(task) => final_info = Some((final_success, depth, Arc::clone(task))),
            None => {
                verdict = Err(EngineError::Invariant {
                    reason: "finalized success carries no task".into(),
                });
            }
        }
    }

    // Wind down: nothing speculative survives the run. Every remaining
    // task goes to the cleanup pool — the final blob excepted — and every
    // in-flight worker is joined, so no child outlives the driver.
    {
        let tree = shared.lock_tree();
        let skip = final_info.as_ref().map(|(id, _, _)| *id);
        for task in tree.collect_tasks(Tree::root(), skip) {
            gc.enqueue(task);
        }
    }
    while workers.join_next().await.is_some() {}

    let (snapshot, reclaimed) = {
        let tree = shared.lock_tree();
        (tree.snapshot(), tree.reclaimed())
    };
    let runs = shared.runs.load(Ordering::Relaxed);

    match (verdict, final_info) {
        (Err(error), _) => Err(error),
        (Ok(()), Some((_, depth, final_task))) => Ok(DriveOutcome {
            final_task,
            depth,
            runs,
            reclaimed,
            snapshot,
        }),
        (Ok(()), None) => Err(EngineError::Invariant {
            reason: "run completed without a finalized success".into(),
        }),
    }
}

/// The frontier event to publish when the finalized prefix advances.
/// Called under the tree lock; the caller emits after releasing it.
fn frontier_event(tree: &Tree, last: &mut (usize, u64)) -> Option<MinimizeEvent> {
    let frontier = tree.frontier();
    let best_size = tree
        .node(frontier.final_success)
        .task()
        .map_or(0, |task| task.size());
    if (frontier.depth, best_size) == *last {
        return None;
    }
    *last = (frontier.depth, best_size);
    Some(MinimizeEvent::PathFinalized {
        depth: frontier.depth,
        best_size,
    })
}

fn emit_progress(
    emitter: &Arc<dyn EventEmitter>,
    shared: &TreeShared,
    queue_slots: &Semaphore,
    queue_capacity: usize,
) {
    let (depth, best_size) = {
        let tree = shared.lock_tree();
        let frontier = tree.frontier();
        (
            frontier.depth,
            tree.node(frontier.final_success)
                .task()
                .map_or(0, |task| task.size()),
        )
    };
    emitter.emit(MinimizeEvent::Progress {
        pending: queue_capacity.saturating_sub(queue_slots.available_permits()),
        depth,
        best_size,
        runs: shared.runs.load(Ordering::Relaxed),
    });
}

/// Exponential backoff with jitter for strategy stalls. The unit comes
/// from configuration; the delay doubles per consecutive stall up to a
/// fixed cap.
fn stall_backoff(unit: Duration, stalls: u32) -> Duration {
    let doubled = unit.saturating_mul(1u32 << stalls.saturating_sub(1).min(16));
    let capped = doubled.min(MAX_BACKOFF).max(Duration::from_micros(50));
    capped.mul_f64(rand::rng().random_range(0.5..1.5))
}
