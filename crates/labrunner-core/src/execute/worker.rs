//! A cancellable thread of execution bound to one identifier.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::context::{AbortHandle, CompletionReport, ExecutionCallback, ScriptIo};
use super::types::{CodeUnit, Identifier, WorkerStatus};
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::script::{self, Exception, ExceptionInfo, ScriptError, TraceFrame};

/// Stack size for worker threads, sized for the interpreter's recursion limit.
pub const WORKER_STACK_SIZE: usize = 32 * 1024 * 1024;

/// Everything a worker thread needs besides its own state.
#[derive(Clone)]
pub struct WorkerContext {
    pub globals: Namespace,
    pub io: Arc<dyn ScriptIo>,
    pub callback: Arc<dyn ExecutionCallback>,
    /// How long an idle worker waits before re-checking for cancellation.
    pub idle_poll: Duration,
}

#[derive(Debug, Default)]
struct WorkerState {
    pending: Option<CodeUnit>,
    filename: String,
    running: bool,
    failed: bool,
    /// Set by the thread, in the same critical section that clears
    /// `running`, once it will not pick up another unit.
    exiting: bool,
    exception: Option<ExceptionInfo>,
    traceback: Option<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One execution slot.
///
/// The worker thread is started on the first [`submit`](Self::submit) and
/// ends on cancellation or failure. The next submit after that starts a fresh
/// thread with the same id and local namespace.
pub struct Worker {
    id: u64,
    identifier: Identifier,
    locals: Namespace,
    shared: Arc<Shared>,
    abort: AbortHandle,
    thread: Option<JoinHandle<()>>,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: u64, identifier: Identifier, locals: Namespace, ctx: WorkerContext) -> Self {
        Self {
            id,
            identifier,
            locals,
            shared: Arc::new(Shared::default()),
            abort: AbortHandle::new(),
            thread: None,
            ctx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn locals(&self) -> &Namespace {
        &self.locals
    }

    /// Whether the worker thread exists and has not ended.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Running flag AND a live thread.
    pub fn is_running(&self) -> bool {
        let running = self.shared.lock().running;
        running && self.is_alive()
    }

    /// Hand a code unit to the worker.
    ///
    /// Fails with [`Error::Busy`] while a previous unit is still running.
    /// Returns once the code is queued, not when it finishes.
    pub fn submit(&mut self, code: impl Into<String>, filename: impl Into<String>) -> Result<()> {
        if self.is_running() {
            return Err(Error::Busy(self.identifier.clone()));
        }
        self.ensure_thread()?;

        let unit = CodeUnit::new(code, filename);
        let mut state = self.shared.lock();
        state.filename = unit.filename.clone();
        state.pending = Some(unit);
        state.running = true;
        state.failed = false;
        drop(state);

        self.shared.wake.notify_all();
        Ok(())
    }

    /// Trip the cancellation handle of the live thread.
    pub fn cancel(&self) {
        if self.is_alive() {
            tracing::debug!("Cancelling worker {} ({})", self.id, self.identifier);
            self.abort.abort();
            self.shared.wake.notify_all();
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let alive = self.is_alive();
        let state = self.shared.lock();
        WorkerStatus {
            is_running: state.running && alive,
            filename: state.filename.clone(),
            failed: state.failed,
        }
    }

    /// Exception and traceback of the last failure, if any.
    pub fn failure(&self) -> Option<(ExceptionInfo, String)> {
        let state = self.shared.lock();
        match (&state.exception, &state.traceback) {
            (Some(exception), Some(traceback)) => Some((exception.clone(), traceback.clone())),
            _ => None,
        }
    }

    /// Start a thread if there is none, or if the previous one ended or is
    /// on its way out after a cancellation or failure.
    fn ensure_thread(&mut self) -> Result<()> {
        let exiting = self.shared.lock().exiting;
        if self.is_alive() && !exiting && !self.abort.is_aborted() {
            return Ok(());
        }
        if let Some(old) = self.thread.take() {
            // An exiting thread only has its completion report left, and an
            // aborted one exits within one idle poll.
            let _ = old.join();
        }

        self.abort = AbortHandle::new();
        {
            let mut state = self.shared.lock();
            state.running = false;
            state.exiting = false;
        }

        let run = RunLoop {
            id: self.id,
            identifier: self.identifier.clone(),
            locals: self.locals.clone(),
            shared: Arc::clone(&self.shared),
            abort: self.abort.clone(),
            ctx: self.ctx.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("worker-{}", self.identifier))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || run.run())
            .map_err(|e| Error::Spawn {
                what: format!("worker thread for {}", self.identifier),
                message: e.to_string(),
            })?;
        self.thread = Some(handle);
        Ok(())
    }
}

/// State moved into the worker thread.
struct RunLoop {
    id: u64,
    identifier: Identifier,
    locals: Namespace,
    shared: Arc<Shared>,
    abort: AbortHandle,
    ctx: WorkerContext,
}

impl RunLoop {
    fn run(self) {
        tracing::debug!("Worker {} ({}) started", self.id, self.identifier);
        while let Some(unit) = self.next_unit() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                script::run(
                    &unit.code,
                    &unit.filename,
                    &self.ctx.globals,
                    &self.locals,
                    self.ctx.io.as_ref(),
                    &self.abort,
                )
            }))
            .unwrap_or_else(|payload| Err(internal_error(&unit.filename, payload)));

            match result {
                Ok(()) => {
                    self.shared.lock().running = false;
                    self.ctx.callback.on_finished(&CompletionReport {
                        identifier: self.identifier.clone(),
                        worker_id: self.id,
                        failed: false,
                        exception: None,
                        traceback: None,
                    });
                }
                Err(ScriptError::Interrupt) => {
                    let mut state = self.shared.lock();
                    state.running = false;
                    state.exiting = true;
                    drop(state);
                    tracing::debug!("Worker {} ({}) cancelled", self.id, self.identifier);
                    return;
                }
                Err(ScriptError::Raised(exception)) => {
                    let traceback = exception.format_traceback();
                    {
                        let mut state = self.shared.lock();
                        state.running = false;
                        state.exiting = true;
                        state.failed = true;
                        state.exception = Some(exception.info.clone());
                        state.traceback = Some(traceback.clone());
                    }
                    self.ctx.io.write_stderr(&traceback);
                    tracing::debug!(
                        "Worker {} ({}) failed: {}",
                        self.id,
                        self.identifier,
                        exception.info
                    );
                    self.ctx.callback.on_finished(&CompletionReport {
                        identifier: self.identifier.clone(),
                        worker_id: self.id,
                        failed: true,
                        exception: Some(exception.info),
                        traceback: Some(traceback),
                    });
                    return;
                }
            }
        }
        tracing::debug!("Worker {} ({}) exiting", self.id, self.identifier);
    }

    /// Wait for the next code unit. `None` when the thread should end:
    /// cancelled, or the owning [`Worker`] was dropped.
    fn next_unit(&self) -> Option<CodeUnit> {
        let mut state = self.shared.lock();
        loop {
            if self.abort.is_aborted() {
                state.running = false;
                state.exiting = true;
                return None;
            }
            if let Some(unit) = state.pending.take() {
                state.running = true;
                state.failed = false;
                return Some(unit);
            }
            if Arc::strong_count(&self.shared) == 1 {
                state.exiting = true;
                return None;
            }
            state = self
                .shared
                .wake
                .wait_timeout(state, self.ctx.idle_poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// A panic inside the interpreter, recorded like any other failure.
fn internal_error(filename: &str, payload: Box<dyn Any + Send>) -> ScriptError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let frame = TraceFrame {
        filename: filename.to_string(),
        line: 0,
        function: "<script>".to_string(),
    };
    ScriptError::Raised(Exception::new(
        ExceptionInfo::new("RuntimeError", format!("internal error: {}", detail)),
        vec![frame],
    ))
}
