//! labrunner CLI - run scripts under a supervised execution process.

mod check;
mod colors;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "labrunner")]
#[command(about = "Run scripts in a supervised, process-isolated runner")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run script files, each under its own identifier
    Run {
        /// Script files to run
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Stop scripts still running after this many seconds
        #[arg(long, value_name = "SECS", value_parser = run::parse_timeout)]
        timeout: Option<Duration>,

        /// Command loop poll interval of the execution process, in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,

        /// JSON runner configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seed a global, as NAME=JSON (plain text if not valid JSON)
        #[arg(long = "global", value_name = "NAME=JSON")]
        globals: Vec<String>,
    },

    /// Parse script files and report syntax errors without running them
    Check {
        /// Script files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
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

    // Format labrunner-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<labrunner_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let ok = match cli.command {
        Commands::Run {
            files,
            timeout,
            poll_ms,
            config,
            globals,
        } => {
            let options = run::RunOptions {
                timeout,
                poll_ms,
                config,
                globals,
            };
            run::execute(&files, &options).map_err(format_error)?
        }

        Commands::Check { files } => check::execute(&files).map_err(format_error)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
