//! Worker pool.
//!
//! Each queued candidate becomes one spawned task gated by a worker-slot
//! semaphore: acquire a slot, check for a late discard, run the predicate,
//! record the result under the task mutex, and signal the driver. A
//! success additionally sweeps the failure subtree speculated under it —
//! every prediction there assumed this candidate would fail.
//!
//! Workers never take the tree lock while holding a task mutex; the lock
//! hierarchy is strictly tree first, task second.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::config::EngineConfig;
use crate::driver::TreeShared;
use crate::events::{EventEmitter, MinimizeEvent};
use crate::runner::{self, PredicateRun};
use crate::task::{Task, TaskStatus};
use crate::tree::{Branch, NodeId};

/// Shared handles cloned into every candidate run.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub emitter: Arc<dyn EventEmitter>,
    pub shared: Arc<TreeShared>,
    pub gc: mpsc::UnboundedSender<Arc<Task>>,
    pub run_slots: Arc<Semaphore>,
}

/// Execute one queued candidate. The queue permit is held for the whole
/// run and released on the way out, which is what bounds speculation.
pub(crate) async fn run_candidate(
    ctx: WorkerContext,
    node: NodeId,
    task: Arc<Task>,
    queue_permit: OwnedSemaphorePermit,
) {
    execute(&ctx, node, &task).await;
    drop(queue_permit);
    ctx.shared.notify.notify_one();
}

async fn execute(ctx: &WorkerContext, node: NodeId, task: &Arc<Task>) {
    let Ok(_slot) = Arc::clone(&ctx.run_slots).acquire_owned().await else {
        return;
    };

    // Late-discard check and blob duplication. The dup stays readable even
    // if reclamation closes the original underneath us.
    let blob = {
        let guard = task.lock().await;
        match task.status() {
            TaskStatus::Pending => {}
            TaskStatus::Discarded => return,
            other => {
                ctx.shared.raise_fault(crate::error::EngineError::Invariant {
                    reason: format!("queued candidate already resolved as {other}"),
                });
                return;
            }
        }
        let Some(file) = guard.blob() else { return };
        match file.try_clone() {
            Ok(file) => file,
            Err(error) => {
                ctx.shared.raise_fault(error.into());
                return;
            }
        }
    };

    let mut run = match PredicateRun::spawn(&ctx.config, blob, task.size()).await {
        Ok(run) => run,
        Err(error) => {
            ctx.shared.raise_fault(error);
            return;
        }
    };

    // Publish the pid so aggressive termination can reach the group while
    // the predicate runs.
    {
        let mut guard = task.lock().await;
        if task.status() == TaskStatus::Discarded {
            drop(guard);
            // Discarded between the queue check and the spawn; the sweep
            // saw no pid, so end the run ourselves.
            if ctx.config.terminate {
                runner::signal_group(run.pid(), ctx.config.term_signal);
            }
            let _ = run.wait(ctx.config.timeout).await;
            run.reap();
            return;
        }
        guard.set_child_pid(Some(run.pid()));
    }

    let waited = run.wait(ctx.config.timeout).await;
    let (disposition, elapsed) = match waited {
        Ok(done) => done,
        Err(error) => {
            run.reap();
            ctx.shared.raise_fault(error);
            return;
        }
    };
    let status = if disposition.is_interesting() {
        TaskStatus::Success
    } else {
        TaskStatus::Failure
    };

    {
        let mut guard = task.lock().await;
        if task.status() == TaskStatus::Discarded {
            // The result no longer matters; drop it silently.
            run.reap();
            return;
        }
        guard.set_child_pid(None);
        run.reap();
        task.record_elapsed(elapsed);
        if let Err(error) = task.set_status(&mut guard, status) {
            ctx.shared.raise_fault(error);
            return;
        }
        if status == TaskStatus::Failure {
            // A failure blob is never a source for descendants; release it
            // off the hot path.
            let _ = ctx.gc.send(Arc::clone(task));
        }
    }

    ctx.shared.runs.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(node = node.index(), %disposition, "candidate finished");
    ctx.emitter.emit(MinimizeEvent::CandidateFinished {
        node: node.index(),
        size: task.size(),
        status,
        elapsed,
    });

    if status == TaskStatus::Success {
        sweep_mispredictions(ctx, node);
    }
}

/// A success contradicts every speculative failure queued under this
/// node's failure branch: collect that subtree under the tree lock and
/// hand its tasks to the cleanup pool.
fn sweep_mispredictions(ctx: &WorkerContext, node: NodeId) {
    let victims = {
        let tree = ctx.shared.lock_tree();
        tree.node(node)
            .child(Branch::Failure)
            .map(|failure| tree.collect_tasks(failure, None))
            .unwrap_or_default()
    };
    if !victims.is_empty() {
        tracing::debug!(
            node = node.index(),
            count = victims.len(),
            "success invalidated a speculative failure subtree"
        );
    }
    for victim in victims {
        let _ = ctx.gc.send(victim);
    }
}
