//! Monitor mode.
//!
//! Maintains an auto-refreshing HTML status page under the system temp
//! directory, fed by the progress reporter. When the run finishes — and a
//! graphviz `dot` binary is on PATH — the final tree is rendered to a PNG
//! the page embeds.

use std::path::PathBuf;

use eyre::{Result, WrapErr};
use halfempty_engine::report::TreeSnapshot;

use crate::dot;
use crate::progress::RunCounters;

/// Paths of the monitor artifacts.
pub struct Monitor {
    html: PathBuf,
    dot: PathBuf,
    png: PathBuf,
}

impl Monitor {
    /// Create the page under the OS temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial page cannot be written.
    pub fn create() -> Result<Self> {
        let base = std::env::temp_dir();
        let monitor = Self {
            html: base.join("halfempty.html"),
            dot: base.join("halfempty.dot"),
            png: base.join("halfempty.png"),
        };
        std::fs::write(&monitor.html, page(&RunCounters::default(), false))
            .wrap_err("unable to create the monitor page")?;
        tracing::info!("monitor page at {}", monitor.html.display());
        Ok(monitor)
    }

    /// Refresh the page with current counters. Failures are not worth
    /// interrupting the run for.
    pub fn update(&self, counters: &RunCounters) {
        if let Err(error) = std::fs::write(&self.html, page(counters, false)) {
            tracing::debug!(%error, "monitor page update failed");
        }
    }

    /// Write the final tree and, when graphviz is available, render the
    /// PNG the page embeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the DOT file or the final page cannot be
    /// written. A missing or failing graphviz is only logged.
    pub async fn finalize(&self, snapshot: &TreeSnapshot, counters: &RunCounters) -> Result<()> {
        dot::write(&self.dot, snapshot)
            .wrap_err_with(|| format!("writing {}", self.dot.display()))?;

        let mut have_png = false;
        match which::which("dot") {
            Ok(graphviz) => {
                let rendered = tokio::process::Command::new(graphviz)
                    .arg("-Tpng")
                    .arg(&self.dot)
                    .arg("-o")
                    .arg(&self.png)
                    .status()
                    .await;
                match rendered {
                    Ok(status) if status.success() => have_png = true,
                    Ok(status) => tracing::warn!(%status, "graphviz failed to render the tree"),
                    Err(error) => tracing::warn!(%error, "could not run graphviz"),
                }
            }
            Err(_) => {
                tracing::warn!("graphviz `dot` not found; the monitor page gets no tree image");
            }
        }

        std::fs::write(&self.html, page(counters, have_png))
            .wrap_err("unable to write the final monitor page")?;
        Ok(())
    }
}

fn page(counters: &RunCounters, have_png: bool) -> String {
    let image = if have_png {
        "<img src=\"halfempty.png\" alt=\"speculative tree\">"
    } else {
        ""
    };
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta http-equiv=\"refresh\" content=\"1\">\n\
         <title>halfempty</title>\n</head>\n<body>\n<h1>halfempty</h1>\n<table>\n\
         <tr><td>strategy</td><td>{}</td></tr>\n\
         <tr><td>runs</td><td>{}</td></tr>\n\
         <tr><td>finalized depth</td><td>{}</td></tr>\n\
         <tr><td>best size</td><td>{} bytes</td></tr>\n\
         <tr><td>in flight</td><td>{}</td></tr>\n\
         <tr><td>discarded</td><td>{}</td></tr>\n\
         </table>\n{image}\n</body>\n</html>\n",
        counters.strategy,
        counters.runs,
        counters.depth,
        counters.best_size,
        counters.pending,
        counters.discards,
    )
}
