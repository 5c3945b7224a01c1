//! Progress reporting.
//!
//! Implements the engine's [`EventEmitter`]: periodic progress becomes a
//! transient, carriage-return-overwritten line on a TTY, and the counters
//! feed the monitor page when one is active. Discrete events (strategy
//! start/end, new finalized depth) are logged by the engine itself; this
//! reporter only clears its transient line out of their way.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex, PoisonError};

use halfempty_engine::{EventEmitter, MinimizeEvent};

use crate::monitor::Monitor;

/// Counters accumulated from engine events.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    /// Name of the strategy currently driving the tree.
    pub strategy: &'static str,
    /// Predicate runs in the current strategy.
    pub runs: u64,
    /// Mispredicted candidates discarded so far.
    pub discards: u64,
    /// Candidates currently in flight.
    pub pending: usize,
    /// Depth of the finalized frontier.
    pub depth: usize,
    /// Best (smallest interesting) size found so far.
    pub best_size: u64,
}

struct State {
    counters: RunCounters,
    line_live: bool,
}

/// The CLI's event sink.
pub struct ProgressReporter {
    tty: bool,
    monitor: Option<Arc<Monitor>>,
    state: Mutex<State>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(quiet: bool, monitor: Option<Arc<Monitor>>) -> Self {
        Self {
            tty: !quiet && std::io::stderr().is_terminal(),
            monitor,
            state: Mutex::new(State {
                counters: RunCounters::default(),
                line_live: false,
            }),
        }
    }

    /// Clear any transient line, e.g. before final output.
    pub fn finish(&self) {
        let mut state = self.lock();
        self.clear_line(&mut state);
    }

    /// A copy of the current counters.
    #[must_use]
    pub fn counters(&self) -> RunCounters {
        self.lock().counters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::print_stderr)]
    fn render_line(&self, state: &mut State) {
        if self.tty {
            let c = &state.counters;
            eprint!(
                "\r\x1b[2K{}: {} runs, depth {}, best {} bytes, {} in flight, {} discarded",
                c.strategy, c.runs, c.depth, c.best_size, c.pending, c.discards
            );
            let _ = std::io::stderr().flush();
            state.line_live = true;
        }
        if let Some(monitor) = &self.monitor {
            monitor.update(&state.counters);
        }
    }

    #[allow(clippy::print_stderr)]
    fn clear_line(&self, state: &mut State) {
        if self.tty && state.line_live {
            eprint!("\r\x1b[2K");
            let _ = std::io::stderr().flush();
        }
        state.line_live = false;
    }
}

impl EventEmitter for ProgressReporter {
    fn emit(&self, event: MinimizeEvent) {
        let mut state = self.lock();
        match event {
            MinimizeEvent::StrategyStarted {
                strategy,
                input_size,
            } => {
                self.clear_line(&mut state);
                state.counters.strategy = strategy;
                state.counters.runs = 0;
                state.counters.depth = 0;
                state.counters.pending = 0;
                state.counters.best_size = input_size;
            }
            MinimizeEvent::StrategyFinished { output_size, .. } => {
                state.counters.best_size = output_size;
                self.clear_line(&mut state);
            }
            MinimizeEvent::Verified { .. } | MinimizeEvent::TreeCompressed { .. } => {
                self.clear_line(&mut state);
            }
            MinimizeEvent::CandidateQueued { .. } => {}
            MinimizeEvent::CandidateFinished { .. } => {
                state.counters.runs += 1;
            }
            MinimizeEvent::CandidateDiscarded { .. } => {
                state.counters.discards += 1;
            }
            MinimizeEvent::PathFinalized { depth, best_size } => {
                state.counters.depth = depth;
                state.counters.best_size = best_size;
                self.render_line(&mut state);
            }
            MinimizeEvent::Progress {
                pending,
                depth,
                best_size,
                runs,
            } => {
                state.counters.pending = pending;
                state.counters.depth = depth;
                state.counters.best_size = best_size;
                state.counters.runs = runs;
                self.render_line(&mut state);
            }
        }
    }
}
