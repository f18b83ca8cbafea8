//! Cancellation, completion callbacks and script I/O.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::types::Identifier;
use crate::script::ExceptionInfo;

/// Handle for cooperatively cancelling a running code unit.
///
/// Clones share state: any clone can trigger the abort and every clone sees
/// it. The interpreter polls [`is_aborted`](Self::is_aborted) between
/// statements, and blocking builtins wait on [`sleep`](Self::sleep).
///
/// # Example
///
/// ```
/// use labrunner_core::execute::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_aborted());
/// handle_clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Request abort and wake any sleeper.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.wake.notify_all();
    }

    /// Sleep for `duration` unless aborted first.
    ///
    /// Returns `true` if the sleep was cut short by an abort. A duration too
    /// long to represent as a deadline waits for the abort only.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_aborted() {
                return true;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .wake
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .wake
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// What a worker reports after a code unit ends, successfully or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub identifier: Identifier,
    pub worker_id: u64,
    pub failed: bool,
    pub exception: Option<ExceptionInfo>,
    pub traceback: Option<String>,
}

/// Callback trait for execution progress reporting.
pub trait ExecutionCallback: Send + Sync {
    /// Called when a code unit completes or fails. Not called on cancellation.
    fn on_finished(&self, report: &CompletionReport);
}

/// Output and input streams seen by scripts.
pub trait ScriptIo: Send + Sync {
    fn write_stdout(&self, text: &str);

    fn write_stderr(&self, text: &str);

    /// Read one line for `input()`. Returns `None` at end of input or when
    /// `abort` trips while waiting.
    fn read_line(&self, abort: &AbortHandle) -> Option<String>;
}

/// In-memory [`ScriptIo`], for embedding a runner in-process.
#[derive(Debug, Default)]
pub struct BufferedIo {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    stdin: Mutex<VecDeque<String>>,
}

impl BufferedIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything written to stdout so far.
    pub fn take_stdout(&self) -> String {
        std::mem::take(&mut *self.stdout.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Take everything written to stderr so far.
    pub fn take_stderr(&self) -> String {
        std::mem::take(&mut *self.stderr.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Queue a line for `input()`.
    pub fn push_stdin(&self, line: impl Into<String>) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(line.into());
    }
}

impl ScriptIo for BufferedIo {
    fn write_stdout(&self, text: &str) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    fn write_stderr(&self, text: &str) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    fn read_line(&self, _abort: &AbortHandle) -> Option<String> {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
