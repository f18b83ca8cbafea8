//! Execution process for labrunner.
//!
//! Spawned by `RunnerProxy`. Reads frames from stdin and writes frames to
//! stdout, so all logging goes to stderr.

use std::time::Duration;

use clap::Parser;
use labrunner_core::ProcessConfig;

#[derive(Parser)]
#[command(name = "labrunner-worker")]
#[command(about = "Execution process for labrunner (spawned by the host, not run by hand)")]
#[command(version)]
struct Args {
    /// Command queue poll interval in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// How often idle workers re-check for cancellation, in milliseconds
    #[arg(long, default_value_t = 50)]
    idle_poll_ms: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if args.poll_ms == 0 {
        anyhow::bail!("--poll-ms must be greater than zero");
    }

    let config = ProcessConfig {
        poll_interval: Duration::from_millis(args.poll_ms),
        idle_poll: Duration::from_millis(args.idle_poll_ms),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(labrunner_core::ipc::serve(
        std::io::stdin(),
        std::io::stdout(),
        config,
    ))?;

    tracing::debug!("Execution process exiting");
    Ok(())
}
