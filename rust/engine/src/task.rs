//! The materialized candidate.
//!
//! A [`Task`] owns a candidate blob (an unlinked temporary file), the
//! strategy parameter block that produced it, and the execution state a
//! worker fills in. The parameter block and size never change after the
//! task is published into the tree. The blob handle and child pid live
//! behind the task mutex; the status and elapsed timer are atomics that are
//! only *written* while the mutex is held, so the driver can read them
//! lock-free while holding only the tree lock.

use std::fs::File;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, EngineResult};

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Queued or running; no result yet.
    Pending = 0,
    /// The predicate accepted the candidate (exit status 0).
    Success = 1,
    /// The predicate rejected the candidate.
    Failure = 2,
    /// The candidate was invalidated before contributing a result, or its
    /// resources were reclaimed.
    Discarded = 3,
}

impl TaskStatus {
    /// Whether the status carries a definitive predicate result.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// Pending may resolve or be discarded; resolved candidates may only be
    /// discarded. Nothing leaves Discarded.
    #[must_use]
    pub fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Success | Self::Failure | Self::Discarded)
            | (Self::Success | Self::Failure, Self::Discarded) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Discarded => "discarded",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Success,
            2 => Self::Failure,
            3 => Self::Discarded,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy's position in its reduction schedule: the half-open byte
/// range `[offset, offset + chunksize)` the candidate operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub offset: u64,
    pub chunksize: u64,
}

/// State guarded by the task mutex: the blob handle and the pid of the
/// last runner child.
pub struct TaskGuarded {
    blob: Option<File>,
    child_pid: Option<u32>,
}

impl TaskGuarded {
    /// The candidate blob, if not yet reclaimed.
    #[must_use]
    pub fn blob(&self) -> Option<&File> {
        self.blob.as_ref()
    }

    /// Pid of the child currently testing this candidate, if any.
    #[must_use]
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub(crate) fn set_child_pid(&mut self, pid: Option<u32>) {
        self.child_pid = pid;
    }

    /// Close the blob. Only reclamation does this.
    pub(crate) fn release_blob(&mut self) {
        self.blob = None;
    }
}

/// A materialized candidate: blob, size, parameter block, and execution
/// state.
pub struct Task {
    size: u64,
    params: ChunkParams,
    status: AtomicU8,
    elapsed_micros: AtomicU64,
    guarded: Mutex<TaskGuarded>,
}

impl Task {
    /// Create a pending candidate.
    #[must_use]
    pub fn new(blob: File, size: u64, params: ChunkParams) -> Self {
        Self::with_status(blob, size, params, TaskStatus::Pending)
    }

    /// Create the root task for an input blob. The root represents the
    /// original input and starts as a success (verified or assumed), with
    /// its parameter block covering the whole input.
    #[must_use]
    pub fn root(blob: File, size: u64) -> Self {
        Self::with_status(
            blob,
            size,
            ChunkParams {
                offset: 0,
                chunksize: size,
            },
            TaskStatus::Success,
        )
    }

    fn with_status(blob: File, size: u64, params: ChunkParams, status: TaskStatus) -> Self {
        Self {
            size,
            params,
            status: AtomicU8::new(status as u8),
            elapsed_micros: AtomicU64::new(0),
            guarded: Mutex::new(TaskGuarded {
                blob: Some(blob),
                child_pid: None,
            }),
        }
    }

    /// Candidate size in bytes. Equal to the blob's length while the blob
    /// is live.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The parameter block that produced this candidate.
    #[must_use]
    pub fn params(&self) -> ChunkParams {
        self.params
    }

    /// Current status. Lock-free; pairs with writes made under the mutex.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Wall time of the recorded predicate run.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_micros.load(Ordering::Relaxed))
    }

    /// Lock the guarded state.
    pub async fn lock(&self) -> MutexGuard<'_, TaskGuarded> {
        self.guarded.lock().await
    }

    /// Transition the status. The guard parameter proves the caller holds
    /// the task mutex, which is what orders transitions.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] for a transition the lifecycle
    /// does not allow.
    pub fn set_status(
        &self,
        _guard: &mut TaskGuarded,
        next: TaskStatus,
    ) -> EngineResult<()> {
        let current = self.status();
        if !current.can_become(next) {
            return Err(EngineError::Invariant {
                reason: format!("illegal status transition {current} -> {next}"),
            });
        }
        self.status.store(next as u8, Ordering::Release);
        Ok(())
    }

    pub(crate) fn record_elapsed(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_micros.store(micros, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("size", &self.size)
            .field("params", &self.params)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
