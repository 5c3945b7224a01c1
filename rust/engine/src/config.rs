//! Engine configuration.
//!
//! The configuration is an immutable record constructed once by the caller
//! and shared with every component; nothing in the engine reads process-wide
//! state. [`EngineConfig::validate`] is called before any pool starts.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default bound on speculative work queued beyond the running workers.
pub const DEFAULT_MAX_UNPROCESSED: usize = 2;

/// Default number of cleanup workers.
pub const DEFAULT_CLEANUP_WORKERS: usize = 4;

/// Tree height beyond which finalized failure tails are compressed.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 512;

/// Default unit of the exponential backoff applied when a strategy stalls.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(10_000);

/// Default worker pool size: one slot per core, plus one.
#[must_use]
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(2, std::num::NonZero::get) + 1
}

/// Configuration for a minimization run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The predicate: an executable fed each candidate on stdin.
    pub script: PathBuf,
    /// Worker pool size.
    pub num_workers: usize,
    /// Cleanup pool size.
    pub cleanup_workers: usize,
    /// How many speculative candidates may sit queued beyond the running
    /// workers. Small values limit how far a wrong prediction can run.
    pub max_unprocessed: usize,
    /// Unit of the exponential backoff used while waiting for results to
    /// reopen a stalled path.
    pub poll_delay: Duration,
    /// Wall-clock limit per predicate run, enforced by signalling the
    /// child's process group with SIGALRM.
    pub timeout: Option<Duration>,
    /// Resource limits applied to each child before exec.
    pub limits: Vec<ResourceLimit>,
    /// Whether to signal mispredicted children instead of letting them run
    /// to completion.
    pub terminate: bool,
    /// Signal used for aggressive termination.
    pub term_signal: i32,
    /// Leave the child's stdout connected instead of redirecting to null.
    pub inherit_stdout: bool,
    /// Leave the child's stderr connected instead of redirecting to null.
    pub inherit_stderr: bool,
    /// Run the predicate once on the unmodified input before minimizing.
    pub verify: bool,
    /// Re-run all strategies until the output size reaches a fixed point.
    pub stable: bool,
    /// Byte value written by the zero strategy.
    pub zero_char: u8,
    /// Tree height that triggers path compression.
    pub max_tree_depth: usize,
    /// Debugging aid: sleep this long in the child before exec.
    pub pre_exec_sleep: Option<Duration>,
}

impl EngineConfig {
    /// Create a configuration with defaults for the given predicate script.
    #[must_use]
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            num_workers: default_worker_count(),
            cleanup_workers: DEFAULT_CLEANUP_WORKERS,
            max_unprocessed: DEFAULT_MAX_UNPROCESSED,
            poll_delay: DEFAULT_POLL_DELAY,
            timeout: None,
            limits: Vec::new(),
            terminate: true,
            term_signal: libc::SIGTERM,
            inherit_stdout: false,
            inherit_stderr: false,
            verify: true,
            stable: false,
            zero_char: 0,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            pre_exec_sleep: None,
        }
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for zero-sized pools or a zero
    /// queue bound (which could never admit work), and
    /// [`EngineError::PredicateNotExecutable`] when the script is missing or
    /// lacks an execute bit.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_unprocessed == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max-queue must be at least 1; a zero bound would stall the driver".into(),
            });
        }
        if self.num_workers == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "num-threads must be at least 1".into(),
            });
        }
        if self.cleanup_workers == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "cleanup-threads must be at least 1".into(),
            });
        }
        if self.term_signal <= 0 {
            return Err(EngineError::InvalidConfig {
                reason: format!("term-signal {} is not a valid signal number", self.term_signal),
            });
        }

        let executable = std::fs::metadata(&self.script).is_ok_and(|meta| {
            use std::os::unix::fs::PermissionsExt;
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        });
        if !executable {
            return Err(EngineError::PredicateNotExecutable {
                path: self.script.display().to_string(),
            });
        }

        Ok(())
    }
}

/// A single `RLIMIT_*=N` resource limit applied to each child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub resource: RlimitResource,
    pub value: u64,
}

/// The subset of rlimit resources the runner knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Memlock,
    Nofile,
    Nproc,
    Rss,
    Stack,
}

impl RlimitResource {
    /// The `RLIMIT_*` spelling used on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::As => "RLIMIT_AS",
            Self::Core => "RLIMIT_CORE",
            Self::Cpu => "RLIMIT_CPU",
            Self::Data => "RLIMIT_DATA",
            Self::Fsize => "RLIMIT_FSIZE",
            Self::Memlock => "RLIMIT_MEMLOCK",
            Self::Nofile => "RLIMIT_NOFILE",
            Self::Nproc => "RLIMIT_NPROC",
            Self::Rss => "RLIMIT_RSS",
            Self::Stack => "RLIMIT_STACK",
        }
    }

    /// The raw resource id passed to `setrlimit(2)`.
    ///
    /// The exact libc type of the resource argument differs between libc
    /// flavors, so callers cast the returned value with `as _` at the call
    /// site.
    #[must_use]
    #[allow(clippy::unnecessary_cast)]
    pub(crate) fn raw(self) -> u32 {
        match self {
            Self::As => libc::RLIMIT_AS as u32,
            Self::Core => libc::RLIMIT_CORE as u32,
            Self::Cpu => libc::RLIMIT_CPU as u32,
            Self::Data => libc::RLIMIT_DATA as u32,
            Self::Fsize => libc::RLIMIT_FSIZE as u32,
            Self::Memlock => libc::RLIMIT_MEMLOCK as u32,
            Self::Nofile => libc::RLIMIT_NOFILE as u32,
            Self::Nproc => libc::RLIMIT_NPROC as u32,
            Self::Rss => libc::RLIMIT_RSS as u32,
            Self::Stack => libc::RLIMIT_STACK as u32,
        }
    }
}

impl FromStr for ResourceLimit {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (name, value) = input
            .split_once('=')
            .ok_or_else(|| format!("expected RLIMIT_NAME=N, got `{input}`"))?;

        let resource = match name {
            "RLIMIT_AS" => RlimitResource::As,
            "RLIMIT_CORE" => RlimitResource::Core,
            "RLIMIT_CPU" => RlimitResource::Cpu,
            "RLIMIT_DATA" => RlimitResource::Data,
            "RLIMIT_FSIZE" => RlimitResource::Fsize,
            "RLIMIT_MEMLOCK" => RlimitResource::Memlock,
            "RLIMIT_NOFILE" => RlimitResource::Nofile,
            "RLIMIT_NPROC" => RlimitResource::Nproc,
            "RLIMIT_RSS" => RlimitResource::Rss,
            "RLIMIT_STACK" => RlimitResource::Stack,
            other => return Err(format!("unknown resource `{other}`")),
        };

        let value = value
            .parse::<u64>()
            .map_err(|e| format!("invalid limit value `{value}`: {e}"))?;

        Ok(Self { resource, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_limit_parses() {
        let limit: ResourceLimit = "RLIMIT_CPU=10".parse().expect("parses");
        assert_eq!(limit.resource, RlimitResource::Cpu);
        assert_eq!(limit.value, 10);
        assert_eq!(limit.resource.name(), "RLIMIT_CPU");
    }

    #[test]
    fn resource_limit_rejects_garbage() {
        assert!("RLIMIT_CPU".parse::<ResourceLimit>().is_err());
        assert!("RLIMIT_NOPE=1".parse::<ResourceLimit>().is_err());
        assert!("RLIMIT_CPU=x".parse::<ResourceLimit>().is_err());
    }

    #[test]
    fn zero_queue_bound_is_rejected() {
        let mut config = EngineConfig::new("/bin/true");
        config.max_unprocessed = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn missing_predicate_is_rejected() {
        let config = EngineConfig::new("/nonexistent/predicate");
        assert!(matches!(
            config.validate(),
            Err(EngineError::PredicateNotExecutable { .. })
        ));
    }
}
