use std::sync::Arc;

use clap::Parser;
use eyre::{Result, WrapErr};

use halfempty_cli::monitor::Monitor;
use halfempty_cli::progress::ProgressReporter;
use halfempty_cli::{Cli, dot, logging};
use halfempty_engine::{EventEmitter, Minimizer};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logging::setup(cli.quiet)?;
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let monitor = if cli.monitor {
        Some(Arc::new(Monitor::create()?))
    } else {
        None
    };
    let reporter = Arc::new(ProgressReporter::new(cli.quiet, monitor.clone()));

    let minimizer = Minimizer::new(cli.engine_config())?
        .with_emitter(Arc::clone(&reporter) as Arc<dyn EventEmitter>);
    let outcome = minimizer.minimize(&cli.input).await?;
    reporter.finish();

    std::fs::write(&cli.output, &outcome.data)
        .wrap_err_with(|| format!("writing {}", cli.output.display()))?;

    tracing::info!(
        "minimized {} bytes to {} bytes in {:.2?} ({} runs, {} discarded, {:.2?} of compute reclaimed)",
        outcome.initial_size,
        outcome.final_size,
        outcome.wall,
        outcome.runs,
        outcome.discards,
        outcome.reclaimed,
    );
    tracing::info!("output written to {}", cli.output.display());

    if cli.generate_dot {
        let path = cli.output.with_extension("dot");
        dot::write(&path, &outcome.snapshot)
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        tracing::info!("tree written to {}", path.display());
    }
    if let Some(monitor) = &monitor {
        monitor.finalize(&outcome.snapshot, &reporter.counters()).await?;
    }

    Ok(())
}
