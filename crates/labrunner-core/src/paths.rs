//! Locating the `labrunner-worker` executable.

use std::path::{Path, PathBuf};

use crate::config::WORKER_PATH_ENV;
use crate::error::{Error, Result};

pub const WORKER_BINARY: &str = if cfg!(windows) {
    "labrunner-worker.exe"
} else {
    "labrunner-worker"
};

/// Find the worker binary.
///
/// Looks in the following order:
/// 1. the explicitly configured path
/// 2. `LABRUNNER_WORKER_PATH` environment variable
/// 3. same directory as the current executable (and its parent, for test
///    binaries under `target/<profile>/deps`)
/// 4. system PATH
/// 5. `target/{debug,release}` relative to the crate, for development
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Config(format!(
            "configured worker binary {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let candidate = dir.join(WORKER_BINARY);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Spawn {
        what: WORKER_BINARY.to_string(),
        message: format!(
            "binary not found. Set {} or ensure it's in PATH.",
            WORKER_PATH_ENV
        ),
    })
}
