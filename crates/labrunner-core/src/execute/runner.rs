//! In-process runner owning every worker of one execution process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;

use super::context::{CompletionReport, ExecutionCallback, ScriptIo};
use super::types::{Identifier, Status};
use super::worker::{Worker, WorkerContext};
use crate::error::{Error, Result};
use crate::namespace::{Namespace, Snapshot};
use crate::script::{ExceptionInfo, Value};

/// Default wait of an idle worker between cancellation checks.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Failures {
    exceptions: FxHashMap<Identifier, ExceptionInfo>,
    tracebacks: FxHashMap<Identifier, String>,
}

/// Per-identifier failure tables, filled by worker completion callbacks.
#[derive(Default)]
struct FailureTable {
    inner: Mutex<Failures>,
}

impl FailureTable {
    fn lock(&self) -> MutexGuard<'_, Failures> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecutionCallback for FailureTable {
    fn on_finished(&self, report: &CompletionReport) {
        if !report.failed {
            return;
        }
        let mut failures = self.lock();
        if let Some(exception) = &report.exception {
            failures
                .exceptions
                .insert(report.identifier.clone(), exception.clone());
        }
        if let Some(traceback) = &report.traceback {
            failures
                .tracebacks
                .insert(report.identifier.clone(), traceback.clone());
        }
    }
}

/// Owns the workers, the global namespace and captured failures.
pub struct LocalRunner {
    globals: Namespace,
    workers: FxHashMap<Identifier, Worker>,
    failures: Arc<FailureTable>,
    io: Arc<dyn ScriptIo>,
    idle_poll: Duration,
    next_worker_id: u64,
}

impl LocalRunner {
    pub fn new(globals: Namespace, io: Arc<dyn ScriptIo>) -> Self {
        Self {
            globals,
            workers: FxHashMap::default(),
            failures: Arc::new(FailureTable::default()),
            io,
            idle_poll: DEFAULT_IDLE_POLL,
            next_worker_id: 0,
        }
    }

    /// Set how long idle workers wait between cancellation checks.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Handle to the shared global namespace.
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    /// Discard every worker and captured failure and install `globals`.
    ///
    /// Live workers are cancelled first.
    pub fn reset(&mut self, globals: Namespace) {
        for worker in self.workers.values() {
            worker.cancel();
        }
        tracing::info!("Resetting runner ({} workers)", self.workers.len());
        self.workers.clear();
        self.failures = Arc::new(FailureTable::default());
        self.globals = globals;
    }

    /// Start `code` under `identifier`. Returns the worker's numeric id as
    /// soon as the worker has the code.
    pub fn execute(
        &mut self,
        code: &str,
        identifier: Identifier,
        filename: &str,
    ) -> Result<u64> {
        if let Some(worker) = self.workers.get_mut(&identifier) {
            if worker.is_running() {
                return Err(Error::Busy(identifier));
            }
            worker.locals().set("__file__", Value::str(filename));
            worker.submit(code, filename)?;
            tracing::debug!("Reusing worker {} for {}", worker.id(), identifier);
            return Ok(worker.id());
        }

        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let locals = Namespace::new();
        locals.set("globals", Value::Namespace(self.globals.clone()));
        locals.set("__file__", Value::str(filename));

        let ctx = WorkerContext {
            globals: self.globals.clone(),
            io: Arc::clone(&self.io),
            callback: self.failures.clone(),
            idle_poll: self.idle_poll,
        };
        let mut worker = Worker::new(id, identifier.clone(), locals, ctx);
        worker.submit(code, filename)?;
        tracing::debug!("Created worker {} for {}", id, identifier);
        self.workers.insert(identifier, worker);
        Ok(id)
    }

    pub fn status(&self) -> Status {
        self.workers
            .iter()
            .map(|(identifier, worker)| (identifier.clone(), worker.status()))
            .collect()
    }

    /// Cancel the worker for `identifier` if it is running. Best-effort and
    /// asynchronous.
    pub fn stop_execution(&self, identifier: &Identifier) {
        match self.workers.get(identifier) {
            Some(worker) if worker.is_running() => worker.cancel(),
            _ => tracing::debug!("stop_execution: {} is not running", identifier),
        }
    }

    /// Forget `identifier`. A running worker is not stopped.
    pub fn delete_thread(&mut self, identifier: &Identifier) {
        if self.workers.remove(identifier).is_some() {
            tracing::debug!("Deleted worker for {}", identifier);
        }
    }

    pub fn get_exception(&self, identifier: &Identifier) -> Option<ExceptionInfo> {
        self.failures.lock().exceptions.get(identifier).cloned()
    }

    pub fn get_traceback(&self, identifier: &Identifier) -> Option<String> {
        self.failures.lock().tracebacks.get(identifier).cloned()
    }

    pub fn clear_exceptions(&self) {
        let mut failures = self.failures.lock();
        failures.exceptions.clear();
        failures.tracebacks.clear();
    }

    /// JSON value of a global, `None` if unbound or not plain data.
    pub fn get_global(&self, name: &str) -> Option<JsonValue> {
        self.globals.get(name).and_then(|value| value.to_json())
    }

    pub fn set_global(&self, name: &str, value: &JsonValue) {
        self.globals.set(name, Value::from_json(value));
    }

    pub fn globals_snapshot(&self) -> Snapshot {
        self.globals.snapshot()
    }
}

impl Drop for LocalRunner {
    fn drop(&mut self) {
        for worker in self.workers.values() {
            worker.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::BufferedIo;
    use std::thread;
    use std::time::Instant;

    fn runner() -> LocalRunner {
        LocalRunner::new(Namespace::new(), Arc::new(BufferedIo::new()))
            .with_idle_poll(Duration::from_millis(10))
    }

    fn wait_idle(runner: &LocalRunner, identifier: &Identifier) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if runner
                .status()
                .get(identifier)
                .is_some_and(|status| !status.is_running)
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("{} did not finish", identifier);
    }

    #[test]
    fn test_reuse_keeps_worker_id_and_locals() {
        let mut runner = runner();
        let id = Identifier::from(1);

        let first = runner.execute("counter = 1", id.clone(), "a.txt").unwrap();
        wait_idle(&runner, &id);
        let second = runner
            .execute("counter += 1\nglobals.seen = counter", id.clone(), "b.txt")
            .unwrap();
        wait_idle(&runner, &id);

        assert_eq!(first, second);
        assert_eq!(runner.get_global("seen"), Some(serde_json::json!(2)));
        assert_eq!(runner.status()[&id].filename, "b.txt");
    }

    #[test]
    fn test_worker_ids_are_monotonic() {
        let mut runner = runner();
        let a = runner.execute("pass", "a".into(), "a.txt").unwrap();
        let b = runner.execute("pass", "b".into(), "b.txt").unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_failure_tables_survive_until_cleared() {
        let mut runner = runner();
        let id = Identifier::from("bad");

        runner.execute("1 / 0", id.clone(), "bad.txt").unwrap();
        wait_idle(&runner, &id);

        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.get_exception(&id).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runner.get_exception(&id).unwrap().kind, "ZeroDivisionError");
        assert!(runner.get_traceback(&id).unwrap().contains("bad.txt:1"));

        runner.delete_thread(&id);
        assert!(runner.get_exception(&id).is_some());

        runner.clear_exceptions();
        assert!(runner.get_exception(&id).is_none());
        assert!(runner.get_traceback(&id).is_none());
    }

    #[test]
    fn test_reset_drops_everything() {
        let mut runner = runner();
        runner.set_global("limit", &serde_json::json!(5));
        runner
            .execute("while True:\n    sleep(0.01)\n", "loop".into(), "loop.txt")
            .unwrap();

        let fresh = Namespace::new();
        fresh.set("mode", Value::str("dry"));
        runner.reset(fresh);

        assert!(runner.status().is_empty());
        assert_eq!(runner.get_global("limit"), None);
        assert_eq!(runner.get_global("mode"), Some(serde_json::json!("dry")));
    }

    #[test]
    fn test_set_global_visible_to_scripts() {
        let mut runner = runner();
        runner.set_global("gain", &serde_json::json!(2.5));
        let id = Identifier::from(7);
        runner
            .execute("globals.out = gain * 2", id.clone(), "g.txt")
            .unwrap();
        wait_idle(&runner, &id);
        assert_eq!(runner.get_global("out"), Some(serde_json::json!(5.0)));
        assert_eq!(runner.globals_snapshot().len(), 2);
    }
}
