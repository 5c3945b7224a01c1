//! Subprocess runner.
//!
//! Spawns the predicate with the candidate piped to stdin, classifies the
//! exit disposition, and enforces the wall-clock timeout. Each child is
//! placed in its own process group so signals reach its whole subtree.
//!
//! Classification uses `waitid` with `WNOWAIT`, which leaves the child as a
//! zombie: its pid stays reserved until the owning worker performs the
//! final reap, so aggressive termination can never signal a recycled pid.

use std::fs::File;
use std::io;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, ResourceLimit};
use crate::error::{EngineError, EngineResult};

const FEED_CHUNK: usize = 64 * 1024;

/// How the predicate terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The child exited normally with this code.
    Exited(i32),
    /// The child was killed by this signal (or dumped core on it).
    Signaled(i32),
}

impl Disposition {
    /// Only a clean exit with status 0 is interesting; every other
    /// disposition is a failure result, not an error.
    #[must_use]
    pub fn is_interesting(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// One predicate invocation: the child, its feeder, and its timer.
pub struct PredicateRun {
    child: Child,
    pid: u32,
    feeder: Option<JoinHandle<()>>,
    started: Instant,
}

impl PredicateRun {
    /// Spawn the predicate and start streaming `len` bytes of `blob` into
    /// its stdin. The blob handle must remain readable for the duration;
    /// callers pass a duplicated descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] when the predicate cannot be
    /// executed.
    pub async fn spawn(config: &EngineConfig, blob: File, len: u64) -> EngineResult<Self> {
        let mut command = Command::new(&config.script);
        command.stdin(Stdio::piped());
        command.stdout(if config.inherit_stdout {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        command.stderr(if config.inherit_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        // A fresh process group, so the watchdog and aggressive
        // termination can signal the predicate together with anything it
        // spawned.
        command.process_group(0);
        install_pre_exec(&mut command, config.limits.clone(), config.pre_exec_sleep);

        let mut child = command.spawn().map_err(|e| EngineError::Spawn {
            message: format!("{}: {e}", config.script.display()),
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| EngineError::Invariant {
            reason: "spawned child has no stdin pipe".into(),
        })?;
        let feeder = tokio::task::spawn_blocking(move || feed_stdin(stdin, &blob, len));

        Ok(Self {
            child,
            pid,
            feeder: Some(feeder),
            started: Instant::now(),
        })
    }

    /// Pid of the child (valid until [`Self::reap`]).
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child and classify its disposition, without reaping.
    ///
    /// When a timeout is given, a watchdog waits alongside and sends
    /// SIGALRM to the child's process group on expiry; whatever
    /// disposition the child then reports is classified normally. The
    /// watchdog is cancelled and joined on the way out.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invariant`] if the wait does not return the
    /// expected child.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> EngineResult<(Disposition, Duration)> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let watchdog = timeout.map(|limit| {
            let pid = self.pid;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel_rx => {}
                    () = tokio::time::sleep(limit) => {
                        tracing::debug!(pid, "predicate timed out, signalling its group");
                        signal_group(pid, libc::SIGALRM);
                    }
                }
            })
        });

        let pid = self.pid;
        let disposition = tokio::task::spawn_blocking(move || wait_nowait(pid))
            .await
            .map_err(|e| EngineError::Invariant {
                reason: format!("wait task failed: {e}"),
            })?;

        let _ = cancel_tx.send(());
        if let Some(handle) = watchdog {
            let _ = handle.await;
        }
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.await;
        }

        Ok((disposition?, self.started.elapsed()))
    }

    /// Final reap. Call after [`Self::wait`]: the child is a zombie by
    /// then, so this never blocks.
    pub fn reap(self) {
        reap_nowait(self.pid);
        // The Child handle is dropped without its own wait; the manual
        // waitpid above already released the pid.
        drop(self.child);
    }
}

/// Stream the blob into the child's stdin and close the pipe.
///
/// A predicate is free to stop reading early; the resulting broken pipe
/// ends feeding without comment. Rust ignores SIGPIPE by default, so the
/// failure surfaces here as a write error.
fn feed_stdin(mut stdin: ChildStdin, blob: &File, len: u64) {
    let mut buf = vec![0u8; FEED_CHUNK];
    let mut offset = 0u64;
    while offset < len {
        let step = usize::try_from((len - offset).min(FEED_CHUNK as u64)).unwrap_or(FEED_CHUNK);
        if let Err(error) = blob.read_exact_at(&mut buf[..step], offset) {
            tracing::warn!(%error, "candidate read failed while feeding the predicate");
            break;
        }
        if stdin.write_all(&buf[..step]).is_err() {
            break;
        }
        offset += step as u64;
    }
}

/// Classify the child's termination without reaping it.
#[allow(unsafe_code)]
fn wait_nowait(pid: u32) -> EngineResult<Disposition> {
    // SAFETY: waitid writes into the zeroed siginfo buffer we own; the pid
    // came from a child we spawned. si_status is valid to read once waitid
    // has succeeded with CLD_* codes.
    unsafe {
        let mut info: libc::siginfo_t = std::mem::zeroed();
        if libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &raw mut info,
            libc::WEXITED | libc::WNOWAIT,
        ) != 0
        {
            return Err(EngineError::Invariant {
                reason: format!(
                    "waitid({pid}) did not return the expected child: {}",
                    io::Error::last_os_error()
                ),
            });
        }
        let status = info.si_status();
        match info.si_code {
            libc::CLD_EXITED => Ok(Disposition::Exited(status)),
            libc::CLD_KILLED | libc::CLD_DUMPED => Ok(Disposition::Signaled(status)),
            code => Err(EngineError::Invariant {
                reason: format!("waitid({pid}) returned unexpected si_code {code}"),
            }),
        }
    }
}

/// Release a zombie child. Non-blocking; the result is deliberately
/// ignored because the child is already classified.
#[allow(unsafe_code)]
fn reap_nowait(pid: u32) {
    // SAFETY: plain waitpid on a child pid we own; WNOHANG never blocks.
    unsafe {
        let mut status = 0;
        libc::waitpid(pid as libc::pid_t, &raw mut status, libc::WNOHANG);
    }
}

/// Send a signal to every process in a child's group.
///
/// These kill calls are the only reason this crate touches raw pids; they
/// are isolated here so the rest of the code stays safe.
#[allow(unsafe_code)]
pub(crate) fn signal_group(pid: u32, signal: i32) {
    // SAFETY: negating a child pid targets its process group per kill(2).
    // The pid stays reserved until the owning worker reaps, so the group
    // can never belong to an unrelated process.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// Configure the child between fork and exec.
#[allow(unsafe_code)]
fn install_pre_exec(
    command: &mut Command,
    limits: Vec<ResourceLimit>,
    pre_exec_sleep: Option<Duration>,
) {
    // SAFETY: the hook only calls async-signal-safe libc functions.
    unsafe {
        command.pre_exec(move || {
            for limit in &limits {
                let rlim = libc::rlimit {
                    rlim_cur: limit.value,
                    rlim_max: limit.value,
                };
                if libc::setrlimit(limit.resource.raw() as _, &raw const rlim) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            #[cfg(target_os = "linux")]
            {
                // Orphaned predicates must not outlive a crashed driver.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                // Stable addresses keep crash-triggered predicates
                // reproducible across runs.
                libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong);
            }
            if let Some(delay) = pre_exec_sleep {
                // A configured zero is honored as-is: sleep(0) is a no-op.
                libc::sleep(delay.as_secs() as libc::c_uint);
            }
            Ok(())
        });
    }
}
