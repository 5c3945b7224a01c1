//! Logging setup.
//!
//! Discrete events are ordinary `tracing` log lines on stderr; in quiet
//! mode only errors get through. `RUST_LOG` overrides the default filter.

use std::io::IsTerminal;

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the default filter directive fails to parse.
pub fn setup(quiet: bool) -> Result<()> {
    let default = if quiet { "error" } else { "info" };
    let filter = EnvFilter::builder()
        .with_default_directive(
            default
                .parse()
                .wrap_err("unable to parse the default logging directive")?,
        )
        .from_env_lossy();

    let format = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    registry().with(filter).with(format).init();
    Ok(())
}
