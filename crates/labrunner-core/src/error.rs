//! Error types for labrunner-core.

use thiserror::Error;

use crate::execute::Identifier;
use crate::script::ExceptionInfo;

/// Result type for labrunner-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in labrunner-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Code was submitted to an identifier whose worker is still running.
    #[error("worker for {0} is busy")]
    Busy(Identifier),

    /// IPC communication error with the execution process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to start the execution process or a worker thread.
    #[error("failed to spawn {what}: {message}")]
    Spawn { what: String, message: String },

    /// A command carried arguments that could not be decoded.
    #[error("invalid arguments for '{command}': {message}")]
    InvalidArguments { command: String, message: String },

    /// The command name is not part of the protocol.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The execution process answered with an error.
    #[error("remote error: {exception}")]
    Remote {
        exception: ExceptionInfo,
        traceback: String,
    },

    /// The proxy has been closed.
    #[error("runner proxy is closed")]
    Closed,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Ipc(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

impl Error {
    /// Whether this error is the synchronous "busy" rejection.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Render the error with a recovery hint, where one is known.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Spawn { .. } => Some(
                "build `labrunner-worker` with cargo or set LABRUNNER_WORKER_PATH",
            ),
            Error::Busy(_) => Some("wait for the running code to finish or call stop_execution"),
            Error::Closed => Some("create a new RunnerProxy"),
            Error::Config(_) => Some("check the LABRUNNER_* environment variables"),
            _ => None,
        };
        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_only_when_known() {
        let spawn = Error::Spawn {
            what: "worker".to_string(),
            message: "not found".to_string(),
        };
        assert!(spawn.with_hint().contains("LABRUNNER_WORKER_PATH"));
        assert_eq!(Error::Ipc("x".into()).with_hint(), "IPC error: x");
    }
}
