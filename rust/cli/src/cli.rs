//! Argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use halfempty_engine::config::{
    DEFAULT_CLEANUP_WORKERS, DEFAULT_MAX_UNPROCESSED, default_worker_count,
};
use halfempty_engine::{EngineConfig, ResourceLimit};

/// Fast, parallel test case minimizer.
///
/// Feeds candidate reductions of INPUT to SCRIPT on stdin; SCRIPT exits 0
/// while its input is still interesting. The smallest interesting blob
/// found is written to the output file.
#[derive(Debug, Parser)]
#[command(name = "halfempty", version, max_term_width = 100)]
pub struct Cli {
    /// The predicate: an executable that exits 0 when the data on its
    /// stdin is still interesting.
    pub script: PathBuf,

    /// The file to minimize.
    pub input: PathBuf,

    /// Worker pool size (default: cores + 1).
    #[arg(long = "num-threads", value_name = "N")]
    pub num_threads: Option<usize>,

    /// Cleanup pool size.
    #[arg(long = "cleanup-threads", value_name = "N", default_value_t = DEFAULT_CLEANUP_WORKERS)]
    pub cleanup_threads: usize,

    /// How many speculative candidates may sit queued beyond the running
    /// workers. Higher means more parallelism but a larger recovery cost
    /// on a misprediction.
    #[arg(long = "max-queue", value_name = "N", default_value_t = DEFAULT_MAX_UNPROCESSED)]
    pub max_queue: usize,

    /// Unit of the exponential backoff used when strategies stall, in
    /// microseconds.
    #[arg(long = "poll-delay", value_name = "USEC")]
    pub poll_delay: Option<u64>,

    /// Wall-clock limit per predicate run, in seconds. On expiry the
    /// child's whole process group receives SIGALRM; the script may trap
    /// it to clean up.
    #[arg(long, value_name = "SEC")]
    pub timeout: Option<u64>,

    /// Resource limit applied to each child before exec, e.g.
    /// RLIMIT_CPU=60. May be repeated.
    #[arg(long = "limit", value_name = "RLIMIT_X=N")]
    pub limits: Vec<ResourceLimit>,

    /// Let mispredicted children run to completion instead of signalling
    /// their process group.
    #[arg(long = "no-terminate")]
    pub no_terminate: bool,

    /// Signal number used to terminate mispredicted children.
    #[arg(long = "term-signal", value_name = "N", default_value_t = libc::SIGTERM)]
    pub term_signal: i32,

    /// Leave the predicate's stdout connected instead of discarding it.
    #[arg(long = "inherit-stdout")]
    pub inherit_stdout: bool,

    /// Leave the predicate's stderr connected instead of discarding it.
    #[arg(long = "inherit-stderr")]
    pub inherit_stderr: bool,

    /// Skip the initial sanity run of the predicate on the original input.
    #[arg(long = "noverify")]
    pub noverify: bool,

    /// Re-run all strategies until the output size stops shrinking.
    #[arg(long)]
    pub stable: bool,

    /// Only print errors.
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Where to write the minimized output.
    #[arg(long, short = 'o', value_name = "PATH", default_value = "halfempty.out")]
    pub output: PathBuf,

    /// Byte value the zero strategy overwrites chunks with.
    #[arg(long = "zero-char", value_name = "BYTE", default_value_t = 0)]
    pub zero_char: u8,

    /// Write a DOT rendering of the final tree next to the output file.
    #[arg(long = "generate-dot")]
    pub generate_dot: bool,

    /// Maintain an auto-refreshing HTML status page (with a rendered tree
    /// when graphviz is installed) under the system temp directory.
    #[arg(long)]
    pub monitor: bool,

    /// Debugging aid: sleep this many seconds in each child before exec,
    /// leaving time to attach a debugger.
    #[arg(long = "pre-exec-sleep", value_name = "SEC", hide = true)]
    pub pre_exec_sleep: Option<u64>,
}

impl Cli {
    /// Build the engine configuration these arguments describe.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.script);
        config.num_workers = self.num_threads.unwrap_or_else(default_worker_count);
        config.cleanup_workers = self.cleanup_threads;
        config.max_unprocessed = self.max_queue;
        if let Some(usec) = self.poll_delay {
            config.poll_delay = Duration::from_micros(usec);
        }
        config.timeout = self.timeout.map(Duration::from_secs);
        config.limits = self.limits.clone();
        config.terminate = !self.no_terminate;
        config.term_signal = self.term_signal;
        config.inherit_stdout = self.inherit_stdout;
        config.inherit_stderr = self.inherit_stderr;
        config.verify = !self.noverify;
        config.stable = self.stable;
        config.zero_char = self.zero_char;
        config.pre_exec_sleep = self.pre_exec_sleep.map(Duration::from_secs);
        config
    }
}
