//! Check command implementation for the labrunner CLI.
//!
//! Parses each file and reports syntax errors without starting a runner.

use std::path::PathBuf;

use anyhow::Context;
use labrunner_core::script;

use crate::colors;

/// Check every file. Returns `false` if any file has a syntax error.
pub fn execute(files: &[PathBuf]) -> anyhow::Result<bool> {
    let mut failed = 0;

    for path in files {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path.display().to_string();

        match script::parse(&code, &filename) {
            Ok(_) => println!("{}ok{}    {}", colors::GREEN, colors::RESET, filename),
            Err(e) => {
                failed += 1;
                println!(
                    "{}error{} {}:{}: {}",
                    colors::RED,
                    colors::RESET,
                    filename,
                    e.line,
                    e.message
                );
            }
        }
    }

    if failed > 0 {
        println!(
            "\n{}{} of {} files failed to parse{}",
            colors::YELLOW,
            failed,
            files.len(),
            colors::RESET
        );
    }
    Ok(failed == 0)
}
