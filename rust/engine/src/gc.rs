//! Cancellation and resource reclamation.
//!
//! A small pool of workers drains a queue of tasks whose resources are no
//! longer needed: speculative candidates invalidated by a misprediction,
//! and failure candidates whose blobs nothing will read again (a
//! descendant's data always comes from its nearest *success* ancestor).
//! Reclamation happens off the hot path so workers and the driver never
//! wait on blob teardown or signalling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::events::{EventEmitter, MinimizeEvent};
use crate::runner;
use crate::task::{Task, TaskStatus};

/// The cleanup pool. Work items are tasks; per task, under its mutex:
/// signal a still-running child's group (when aggressive termination is
/// on), discard a pending status, close the blob, and forget the pid.
pub(crate) struct GcPool {
    queue: mpsc::UnboundedSender<Arc<Task>>,
    workers: Vec<JoinHandle<()>>,
    discards: Arc<AtomicU64>,
}

impl GcPool {
    pub(crate) fn start(config: Arc<EngineConfig>, emitter: Arc<dyn EventEmitter>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<Arc<Task>>();
        let rx = Arc::new(Mutex::new(rx));
        let discards = Arc::new(AtomicU64::new(0));

        let workers = (0..config.cleanup_workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let config = Arc::clone(&config);
                let emitter = Arc::clone(&emitter);
                let discards = Arc::clone(&discards);
                tokio::spawn(async move {
                    loop {
                        // Hold the queue lock only while receiving.
                        let item = { rx.lock().await.recv().await };
                        let Some(task) = item else { break };
                        reclaim(&config, emitter.as_ref(), &discards, &task).await;
                    }
                })
            })
            .collect();

        Self {
            queue,
            workers,
            discards,
        }
    }

    /// A producer handle for workers.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Arc<Task>> {
        self.queue.clone()
    }

    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        let _ = self.queue.send(task);
    }

    /// Total pending candidates discarded so far.
    pub(crate) fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Close the queue and drain the pool.
    pub(crate) async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn reclaim(
    config: &EngineConfig,
    emitter: &dyn EventEmitter,
    discards: &AtomicU64,
    task: &Arc<Task>,
) {
    let mut guard = task.lock().await;
    let status = task.status();
    let running_pid = guard.child_pid();

    let mut terminated = false;
    if let Some(pid) = running_pid {
        if config.terminate && status == TaskStatus::Pending {
            // Cut the mispredicted run short; the owning worker will
            // observe the discard when the child dies.
            runner::signal_group(pid, config.term_signal);
            terminated = true;
        }
    }

    let discarded = if status == TaskStatus::Pending {
        match task.set_status(&mut guard, TaskStatus::Discarded) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(%error, "discard transition refused");
                false
            }
        }
    } else {
        // Already resolved: keep the result, only release resources.
        false
    };

    guard.release_blob();
    // The pid is cleared but never waited on here: the worker that spawned
    // the child performs the one and only reap.
    guard.set_child_pid(None);
    drop(guard);

    if discarded {
        discards.fetch_add(1, Ordering::Relaxed);
        emitter.emit(MinimizeEvent::CandidateDiscarded {
            size: task.size(),
            terminated,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEmitter;
    use crate::task::ChunkParams;

    async fn task(status: TaskStatus) -> Arc<Task> {
        let blob = tempfile::tempfile().expect("tempfile");
        let task = Task::new(
            blob,
            4,
            ChunkParams {
                offset: 0,
                chunksize: 4,
            },
        );
        if status != TaskStatus::Pending {
            let mut guard = task.lock().await;
            task.set_status(&mut guard, status).expect("transition");
        }
        Arc::new(task)
    }

    #[tokio::test]
    async fn pending_tasks_are_discarded_and_released() {
        let config = EngineConfig::new("/bin/true");
        let discards = AtomicU64::new(0);
        let subject = task(TaskStatus::Pending).await;

        reclaim(&config, &NoOpEmitter, &discards, &subject).await;

        assert_eq!(subject.status(), TaskStatus::Discarded);
        assert_eq!(discards.load(Ordering::Relaxed), 1);
        let guard = subject.lock().await;
        assert!(guard.blob().is_none());
        assert!(guard.child_pid().is_none());
    }

    #[tokio::test]
    async fn resolved_tasks_keep_their_status() {
        let config = EngineConfig::new("/bin/true");
        let discards = AtomicU64::new(0);
        let subject = task(TaskStatus::Failure).await;

        reclaim(&config, &NoOpEmitter, &discards, &subject).await;

        assert_eq!(subject.status(), TaskStatus::Failure);
        assert_eq!(discards.load(Ordering::Relaxed), 0);
        assert!(subject.lock().await.blob().is_none());
    }
}
