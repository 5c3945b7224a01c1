//! The orchestrator.
//!
//! Seeds the root blob from the input file, optionally verifies that the
//! predicate accepts it unmodified, then drives each strategy in sequence
//! — bisection first, then zeroing — feeding each strategy's best output
//! into the next. Under `stable`, the whole sequence repeats until the
//! output size stops shrinking.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::blob;
use crate::config::EngineConfig;
use crate::driver;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventEmitter, MinimizeEvent, NoOpEmitter};
use crate::gc::GcPool;
use crate::report::TreeSnapshot;
use crate::runner::PredicateRun;
use crate::strategies::{Bisect, Zero};
use crate::strategy::Strategy;
use crate::task::Task;

/// The result of a minimization run.
#[derive(Debug)]
pub struct MinimizeOutcome {
    /// The minimized bytes.
    pub data: Vec<u8>,
    /// Size of the original input.
    pub initial_size: u64,
    /// Size of the minimized output.
    pub final_size: u64,
    /// Total predicate runs.
    pub runs: u64,
    /// Speculative candidates discarded as mispredictions.
    pub discards: u64,
    /// Predicate time recovered by tree compression.
    pub reclaimed: Duration,
    /// Wall time of the whole run.
    pub wall: Duration,
    /// Final tree of the last strategy run, for visualizers.
    pub snapshot: TreeSnapshot,
}

/// The minimization engine.
pub struct Minimizer {
    config: Arc<EngineConfig>,
    emitter: Arc<dyn EventEmitter>,
}

impl Minimizer {
    /// Validate the configuration and prepare an engine.
    ///
    /// Also raises the soft `RLIMIT_NOFILE` to its hard limit: every live
    /// success blob retains a descriptor, and exhausting the table is a
    /// real failure mode on large inputs.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        raise_nofile_limit();
        Ok(Self {
            config: Arc::new(config),
            emitter: Arc::new(NoOpEmitter),
        })
    }

    /// Attach an event emitter (progress reporters, tests).
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Minimize the blob at `input`.
    ///
    /// # Errors
    ///
    /// Fails on unreadable input, on a predicate that rejects the original
    /// input (unless verification is disabled), and on any IO error while
    /// materializing candidates.
    pub async fn minimize(&self, input: &Path) -> EngineResult<MinimizeOutcome> {
        let started = Instant::now();
        let (root_blob, initial_size) = seed_blob(input)?;

        if self.config.verify {
            self.verify(&root_blob, initial_size).await?;
        }

        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(Bisect),
            Arc::new(Zero::new(self.config.zero_char)),
        ];

        let gc = GcPool::start(Arc::clone(&self.config), Arc::clone(&self.emitter));
        let run = self
            .run_strategies(&gc, &strategies, root_blob, initial_size)
            .await;
        let discards = gc.discards();
        gc.shutdown().await;

        let (data, runs, reclaimed, snapshot) = run?;
        Ok(MinimizeOutcome {
            initial_size,
            final_size: data.len() as u64,
            data,
            runs,
            discards,
            reclaimed,
            wall: started.elapsed(),
            snapshot,
        })
    }

    async fn run_strategies(
        &self,
        gc: &GcPool,
        strategies: &[Arc<dyn Strategy>],
        root_blob: File,
        initial_size: u64,
    ) -> EngineResult<(Vec<u8>, u64, Duration, TreeSnapshot)> {
        let mut current_blob = root_blob;
        let mut current_size = initial_size;
        let mut total_runs = 0u64;
        let mut total_reclaimed = Duration::ZERO;
        let mut snapshot = TreeSnapshot::default();

        loop {
            let cycle_size = current_size;
            for strategy in strategies {
                self.emitter.emit(MinimizeEvent::StrategyStarted {
                    strategy: strategy.name(),
                    input_size: current_size,
                });
                tracing::info!(
                    strategy = strategy.name(),
                    size = current_size,
                    "strategy started"
                );

                let root = Arc::new(Task::root(current_blob, current_size));
                let outcome =
                    driver::drive(&self.config, &self.emitter, gc, strategy, root).await?;
                total_runs += outcome.runs;
                total_reclaimed += outcome.reclaimed;
                snapshot = outcome.snapshot;

                let (next_blob, next_size) = clone_final_blob(&outcome.final_task).await?;
                self.emitter.emit(MinimizeEvent::StrategyFinished {
                    strategy: strategy.name(),
                    output_size: next_size,
                    runs: outcome.runs,
                });
                tracing::info!(
                    strategy = strategy.name(),
                    size = next_size,
                    runs = outcome.runs,
                    "strategy finished"
                );
                current_blob = next_blob;
                current_size = next_size;
            }
            if !self.config.stable || current_size == cycle_size {
                break;
            }
            tracing::info!(size = current_size, "size still shrinking, running another cycle");
        }

        let data = tokio::task::spawn_blocking(move || {
            blob::read_range(&current_blob, 0, current_size)
        })
        .await
        .map_err(|e| EngineError::Io {
            message: format!("reading the result failed: {e}"),
        })??;

        Ok((data, total_runs, total_reclaimed, snapshot))
    }

    /// The initial sanity run: minimizing an input the predicate already
    /// rejects would be meaningless.
    async fn verify(&self, root_blob: &File, len: u64) -> EngineResult<()> {
        let dup = root_blob.try_clone()?;
        let mut run = PredicateRun::spawn(&self.config, dup, len).await?;
        let (disposition, elapsed) = run.wait(self.config.timeout).await?;
        run.reap();
        if !disposition.is_interesting() {
            return Err(EngineError::VerificationFailed {
                disposition: disposition.to_string(),
            });
        }
        self.emitter.emit(MinimizeEvent::Verified { elapsed });
        tracing::info!(?elapsed, "predicate accepts the original input");
        Ok(())
    }
}

/// Copy the input file into a fresh unlinked blob.
fn seed_blob(input: &Path) -> EngineResult<(File, u64)> {
    let mut source = File::open(input).map_err(|e| EngineError::InputUnreadable {
        path: input.display().to_string(),
        message: e.to_string(),
    })?;
    let mut dest = blob::create()?;
    let size = std::io::copy(&mut source, &mut dest).map_err(|e| EngineError::InputUnreadable {
        path: input.display().to_string(),
        message: e.to_string(),
    })?;
    Ok((dest, size))
}

/// Duplicate the final task's blob to seed the next strategy (or the
/// output) without copying bytes.
async fn clone_final_blob(task: &Task) -> EngineResult<(File, u64)> {
    let guard = task.lock().await;
    let Some(file) = guard.blob() else {
        return Err(EngineError::Invariant {
            reason: "final task's blob was reclaimed".into(),
        });
    };
    let dup = file.try_clone()?;
    Ok((dup, task.size()))
}

/// Raise the soft descriptor limit to the hard limit, best effort.
#[allow(unsafe_code)]
fn raise_nofile_limit() {
    // SAFETY: plain getrlimit/setrlimit on stack-local storage.
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE as _, &raw mut rlim) == 0
            && rlim.rlim_cur < rlim.rlim_max
        {
            rlim.rlim_cur = rlim.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE as _, &raw const rlim) != 0 {
                tracing::warn!("could not raise RLIMIT_NOFILE");
            }
        }
    }
}
