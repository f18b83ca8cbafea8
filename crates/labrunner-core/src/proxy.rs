//! Host-side proxy for a process-isolated runner.
//!
//! ```text
//! host ── RunnerProxy::call ──▶ command frame ──▶ ExecutionProcess
//!                                                     │
//!      ◀── bounded wait ◀── response frame (same seq) ◀┘
//! ```
//!
//! A call that finds the process dead restarts it first, seeded with the
//! globals captured at construction. A call that gets no answer within the
//! response timeout returns `Ok(None)`.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::{Identifier, Status};
use crate::ipc::protocol::status_from_json;
use crate::ipc::{BUSY_KIND, Command, Message, Outcome, ProcessHandle, ProcessKillHandle};
use crate::namespace::Snapshot;
use crate::paths::find_worker_binary;
use crate::script::ExceptionInfo;

pub struct RunnerProxy {
    globals: Snapshot,
    config: RunnerConfig,
    worker_path: PathBuf,
    process: Option<ProcessHandle>,
    seq: u64,
    restarts: u64,
    closed: bool,
    /// Output read from a process that has since been replaced.
    stdout_backlog: String,
    stderr_backlog: String,
}

impl RunnerProxy {
    /// Start an execution process seeded with `globals`, using the default
    /// configuration with environment overrides.
    pub fn new(globals: Snapshot) -> Result<Self> {
        Self::with_config(globals, RunnerConfig::from_env()?)
    }

    pub fn with_config(globals: Snapshot, config: RunnerConfig) -> Result<Self> {
        config.validate()?;
        let worker_path = find_worker_binary(config.worker_path.as_deref())?;
        let process = ProcessHandle::spawn(&worker_path, &globals, &config)?;
        tracing::info!(
            "Started execution process (pid {}) from {}",
            process.pid(),
            worker_path.display()
        );
        Ok(Self {
            globals,
            config,
            worker_path,
            process: Some(process),
            seq: 0,
            restarts: 0,
            closed: false,
            stdout_backlog: String::new(),
            stderr_backlog: String::new(),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.config.response_timeout_ms = timeout.as_millis() as u64;
    }

    /// Send a named command and wait for its result.
    ///
    /// Returns `Ok(None)` if no response arrived within the response timeout,
    /// which is also what unknown command names produce.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Result<Option<JsonValue>> {
        self.seq += 1;
        let message = Message::new(self.seq, name)
            .with_args(args)
            .with_kwargs(kwargs);
        self.round_trip(message)
    }

    fn command(&mut self, command: Command) -> Result<Option<JsonValue>> {
        self.seq += 1;
        let message = command.into_message(self.seq);
        self.round_trip(message)
    }

    fn round_trip(&mut self, message: Message) -> Result<Option<JsonValue>> {
        let timeout = self.config.response_timeout();
        let process = self.live_process()?;
        while process.responses().try_recv().is_ok() {}

        if let Err(e) = process.send(&message) {
            tracing::warn!("Sending '{}' failed ({}), restarting", message.name, e);
            self.restart()?;
            self.current()?.send(&message)?;
        }

        let responses = self.current()?.responses();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.recv_timeout(remaining) {
                Ok(response) if response.seq == message.seq => {
                    return match response.outcome {
                        Outcome::Ok { value } => Ok(Some(value)),
                        Outcome::Error {
                            exception,
                            traceback,
                        } => Err(Error::Remote {
                            exception,
                            traceback,
                        }),
                    };
                }
                Ok(response) => {
                    tracing::debug!("Discarding stale response {}", response.seq);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!("No response to '{}' within {:?}", message.name, timeout);
                    return Ok(None);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Execution process went away during '{}'", message.name);
                    return Ok(None);
                }
            }
        }
    }

    fn current(&mut self) -> Result<&mut ProcessHandle> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.process
            .as_mut()
            .ok_or_else(|| Error::Ipc("No execution process".to_string()))
    }

    /// The current process, restarted first if it died.
    fn live_process(&mut self) -> Result<&mut ProcessHandle> {
        if self.closed {
            return Err(Error::Closed);
        }
        let alive = self.process.as_mut().is_some_and(|p| p.is_alive());
        if !alive {
            tracing::warn!("Execution process is not running, restarting");
            self.restart()?;
        }
        self.current()
    }

    /// Replace the current process with a fresh one seeded from the
    /// construction-time globals.
    pub fn restart(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if let Some(mut old) = self.process.take() {
            if let Err(e) = old.kill() {
                tracing::warn!("Failed to stop execution process: {}", e);
            }
            self.keep_output(&old);
        }
        let process = ProcessHandle::spawn(&self.worker_path, &self.globals, &self.config)?;
        self.restarts += 1;
        tracing::info!(
            "Restarted execution process (pid {}, restart #{})",
            process.pid(),
            self.restarts
        );
        self.process = Some(process);
        Ok(())
    }

    fn keep_output(&mut self, process: &ProcessHandle) {
        while let Ok(chunk) = process.stdout().try_recv() {
            self.stdout_backlog.push_str(&chunk);
        }
        while let Ok(chunk) = process.stderr().try_recv() {
            self.stderr_backlog.push_str(&chunk);
        }
    }

    /// Ask the process loop to exit. Does not wait.
    pub fn stop(&mut self) -> Result<()> {
        self.seq += 1;
        let message = Command::Stop.into_message(self.seq);
        match self.process.as_mut() {
            Some(process) => process.send(&message),
            None => Ok(()),
        }
    }

    /// Script stdout: waits up to `timeout` for a first chunk, then takes
    /// whatever else is already queued.
    pub fn stdout(&mut self, timeout: Duration) -> String {
        let backlog = std::mem::take(&mut self.stdout_backlog);
        match &self.process {
            Some(process) => collect_output(process.stdout(), backlog, timeout),
            None => backlog,
        }
    }

    /// Script stderr, with the same waiting rule as [`stdout`](Self::stdout).
    pub fn stderr(&mut self, timeout: Duration) -> String {
        let backlog = std::mem::take(&mut self.stderr_backlog);
        match &self.process {
            Some(process) => collect_output(process.stderr(), backlog, timeout),
            None => backlog,
        }
    }

    /// Feed a line to scripts blocked in `input()`.
    pub fn write_stdin(&mut self, line: &str) -> Result<()> {
        self.live_process()?.send_input(line)
    }

    pub fn execute(
        &mut self,
        code: &str,
        identifier: impl Into<Identifier>,
        filename: &str,
    ) -> Result<Option<u64>> {
        let identifier = identifier.into();
        let command = Command::Execute {
            code: code.to_string(),
            identifier: identifier.clone(),
            filename: filename.to_string(),
        };
        match self.command(command) {
            Ok(value) => Ok(value.and_then(|v| v.as_u64())),
            Err(Error::Remote { exception, .. }) if exception.kind == BUSY_KIND => {
                Err(Error::Busy(identifier))
            }
            Err(e) => Err(e),
        }
    }

    pub fn status(&mut self) -> Result<Option<Status>> {
        match self.command(Command::Status)? {
            Some(value) => status_from_json(value).map(Some),
            None => Ok(None),
        }
    }

    /// Returns whether the process acknowledged the request.
    pub fn stop_execution(&mut self, identifier: impl Into<Identifier>) -> Result<bool> {
        let identifier = identifier.into();
        Ok(self.command(Command::StopExecution { identifier })?.is_some())
    }

    pub fn delete_thread(&mut self, identifier: impl Into<Identifier>) -> Result<bool> {
        let identifier = identifier.into();
        Ok(self.command(Command::DeleteThread { identifier })?.is_some())
    }

    /// Last captured failure for `identifier`. `None` if there is none or the
    /// process did not answer.
    pub fn get_exception(
        &mut self,
        identifier: impl Into<Identifier>,
    ) -> Result<Option<ExceptionInfo>> {
        let identifier = identifier.into();
        match self.command(Command::GetException { identifier })? {
            Some(JsonValue::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    pub fn get_traceback(&mut self, identifier: impl Into<Identifier>) -> Result<Option<String>> {
        let identifier = identifier.into();
        Ok(self
            .command(Command::GetTraceback { identifier })?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    pub fn clear_exceptions(&mut self) -> Result<bool> {
        Ok(self.command(Command::ClearExceptions)?.is_some())
    }

    /// Reset the runner inside the process to `globals` (empty if `None`).
    pub fn reset(&mut self, globals: Option<Snapshot>) -> Result<bool> {
        Ok(self.command(Command::Reset { globals })?.is_some())
    }

    pub fn get_global(&mut self, name: &str) -> Result<Option<JsonValue>> {
        let value = self.command(Command::GetGlobal {
            name: name.to_string(),
        })?;
        Ok(value.filter(|v| !v.is_null()))
    }

    pub fn set_global(&mut self, name: &str, value: JsonValue) -> Result<bool> {
        Ok(self
            .command(Command::SetGlobal {
                name: name.to_string(),
                value,
            })?
            .is_some())
    }

    pub fn globals_snapshot(&mut self) -> Result<Option<Snapshot>> {
        match self.command(Command::GlobalsSnapshot)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        !self.closed && self.process.as_mut().is_some_and(|p| p.is_alive())
    }

    pub fn process_id(&self) -> Option<Uuid> {
        self.process.as_ref().map(ProcessHandle::process_id)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Number of times the process was replaced.
    pub fn restart_count(&self) -> u64 {
        self.restarts
    }

    /// Out-of-band kill switch for the current process.
    pub fn kill_handle(&self) -> Option<ProcessKillHandle> {
        self.process.as_ref().map(ProcessHandle::kill_handle)
    }

    /// Stop the process and reap it. Later calls fail with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Err(e) = self.stop() {
            tracing::debug!("Stop request failed during close: {}", e);
        }
        self.closed = true;
        if let Some(mut process) = self.process.take() {
            if !process.wait_timeout(self.config.response_timeout()) {
                tracing::warn!("Execution process did not exit in time, killing it");
            }
            process.kill()?;
            self.keep_output(&process);
        }
        Ok(())
    }
}

impl Drop for RunnerProxy {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
        }
    }
}

fn collect_output(chunks: &Receiver<String>, mut out: String, timeout: Duration) -> String {
    if out.is_empty() {
        match chunks.recv_timeout(timeout) {
            Ok(chunk) => out.push_str(&chunk),
            Err(_) => return out,
        }
    }
    while let Ok(chunk) = chunks.try_recv() {
        out.push_str(&chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_collect_output_waits_for_first_chunk_only() {
        let (tx, rx) = mpsc::channel();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx.send("a".to_string()).unwrap();
            tx.send("b".to_string()).unwrap();
        });

        let out = collect_output(&rx, String::new(), Duration::from_secs(5));
        sender.join().unwrap();
        let rest = collect_output(&rx, String::new(), Duration::from_millis(1));
        assert_eq!(format!("{}{}", out, rest), "ab");
    }

    #[test]
    fn test_collect_output_respects_budget() {
        let (_tx, rx) = mpsc::channel::<String>();
        let start = Instant::now();
        assert_eq!(collect_output(&rx, String::new(), Duration::from_millis(20)), "");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backlog_returned_without_waiting() {
        let (_tx, rx) = mpsc::channel::<String>();
        let start = Instant::now();
        let out = collect_output(&rx, "old".to_string(), Duration::from_secs(10));
        assert_eq!(out, "old");
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
