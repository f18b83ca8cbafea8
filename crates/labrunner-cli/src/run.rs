//! Run command implementation for the labrunner CLI.
//!
//! Starts one execution process, submits every file under its own
//! identifier and relays script output until all of them finish.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use labrunner_core::{Identifier, RunnerConfig, RunnerProxy, Snapshot, Status};
use rustc_hash::FxHashSet;
use serde_json::Value as JsonValue;

use crate::colors;

/// How long each output drain waits for a first chunk.
const RELAY_WAIT: Duration = Duration::from_millis(50);

pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub poll_ms: Option<u64>,
    pub config: Option<PathBuf>,
    pub globals: Vec<String>,
}

/// Run every file. Returns `false` if any script failed or timed out.
pub fn execute(files: &[PathBuf], options: &RunOptions) -> anyhow::Result<bool> {
    let start = Instant::now();
    let config = load_config(options)?;
    let globals = parse_globals(&options.globals)?;

    let mut proxy = RunnerProxy::with_config(globals, config)?;
    tracing::debug!("Execution process pid {:?}", proxy.pid());

    let mut identifiers = Vec::with_capacity(files.len());
    for path in unique_files(files) {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let identifier = identifier_for(path);
        let filename = path.display().to_string();

        if proxy.execute(&code, identifier.clone(), &filename)?.is_none() {
            anyhow::bail!("Execution process did not accept {}", filename);
        }
        identifiers.push(identifier);
    }

    // A deadline past what Instant can represent never expires.
    let deadline = options.timeout.and_then(|limit| start.checked_add(limit));
    let mut timed_out = Vec::new();

    let status = loop {
        relay_output(&mut proxy);

        let status = proxy.status()?;
        if proxy.restart_count() > 0 {
            anyhow::bail!("Execution process died while scripts were running");
        }
        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        let Some(status) = status else {
            if expired {
                anyhow::bail!("Execution process stopped answering");
            }
            tracing::warn!("No status from execution process, retrying");
            continue;
        };
        if all_finished(&status, &identifiers) {
            break status;
        }

        if expired {
            for identifier in running(&status, &identifiers) {
                proxy.stop_execution(identifier.clone())?;
                timed_out.push(identifier);
            }
            wait_stopped(&mut proxy, &timed_out)?;
            break proxy.status()?.unwrap_or(status);
        }
    };
    relay_output(&mut proxy);

    let mut failures = 0;
    for identifier in &identifiers {
        if timed_out.contains(identifier) {
            failures += 1;
            eprintln!(
                "{}{} timed out and was stopped{}",
                colors::YELLOW,
                identifier,
                colors::RESET
            );
            continue;
        }
        if status.get(identifier).is_some_and(|s| s.failed) {
            failures += 1;
            let traceback = proxy
                .get_traceback(identifier.clone())?
                .unwrap_or_else(|| format!("{} failed\n", identifier));
            eprint!("{}{}{}", colors::RED, traceback, colors::RESET);
        }
    }

    proxy.close()?;
    print_summary(identifiers.len(), failures, start.elapsed());
    Ok(failures == 0)
}

/// Parse a `--timeout` value in seconds.
pub fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", raw))?;
    if secs.is_nan() || secs < 0.0 {
        return Err(format!("timeout must be zero or more seconds, got {}", raw));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("timeout {} is too large", raw))
}

/// Files in first-seen order with repeats dropped, since each file runs
/// under an identifier derived from its path.
fn unique_files(files: &[PathBuf]) -> Vec<&PathBuf> {
    let mut seen = FxHashSet::default();
    let mut unique = Vec::with_capacity(files.len());
    for path in files {
        if seen.insert(identifier_for(path)) {
            unique.push(path);
        } else {
            tracing::warn!("Skipping repeated file {}", path.display());
        }
    }
    unique
}

fn load_config(options: &RunOptions) -> anyhow::Result<RunnerConfig> {
    let mut config = match &options.config {
        Some(path) => RunnerConfig::load(path)?.apply_env()?,
        None => RunnerConfig::from_env()?,
    };
    if let Some(poll_ms) = options.poll_ms {
        config = config.with_poll_interval(Duration::from_millis(poll_ms));
    }
    Ok(config)
}

/// Parse `NAME=JSON` pairs. Values that are not valid JSON are taken as
/// strings.
fn parse_globals(pairs: &[String]) -> anyhow::Result<Snapshot> {
    let mut globals = Snapshot::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --global '{}', expected NAME=JSON", pair))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Invalid --global '{}': empty name", pair);
        }
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()));
        globals.insert(name.to_string(), value);
    }
    Ok(globals)
}

fn identifier_for(path: &Path) -> Identifier {
    Identifier::from(path.display().to_string())
}

fn all_finished(status: &Status, identifiers: &[Identifier]) -> bool {
    running(status, identifiers).is_empty()
}

fn running(status: &Status, identifiers: &[Identifier]) -> Vec<Identifier> {
    identifiers
        .iter()
        .filter(|id| status.get(*id).is_some_and(|s| s.is_running))
        .cloned()
        .collect()
}

fn wait_stopped(proxy: &mut RunnerProxy, identifiers: &[Identifier]) -> anyhow::Result<()> {
    let deadline = Instant::now() + proxy.config().response_timeout();
    while Instant::now() < deadline {
        relay_output(proxy);
        if let Some(status) = proxy.status()? {
            if all_finished(&status, identifiers) {
                return Ok(());
            }
        }
        thread::sleep(RELAY_WAIT);
    }
    tracing::warn!("Some scripts did not stop before the deadline");
    Ok(())
}

fn relay_output(proxy: &mut RunnerProxy) {
    let out = proxy.stdout(RELAY_WAIT);
    if !out.is_empty() {
        print!("{}", out);
        let _ = std::io::stdout().flush();
    }
    let err = proxy.stderr(Duration::ZERO);
    if !err.is_empty() {
        eprint!("{}", err);
    }
}

fn print_summary(total: usize, failures: usize, elapsed: Duration) {
    let (color, label) = if failures == 0 {
        (colors::GREEN, "Completed")
    } else {
        (colors::RED, "Failed")
    };
    eprintln!(
        "{}{}{} {} of {} scripts ok {}in {:.2}s{}",
        color,
        label,
        colors::RESET,
        total - failures,
        total,
        colors::DIM,
        elapsed.as_secs_f64(),
        colors::RESET
    );
}
