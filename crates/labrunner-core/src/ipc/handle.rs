//! Host-side handle to a spawned execution process.

use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::protocol::{HostFrame, Message, ProcessFrame, Response, read_message, write_message};
use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::namespace::Snapshot;

/// Handle to an execution process.
///
/// A reader thread demultiplexes the child's stdout into response, stdout
/// and stderr channels. The child's own stderr is inherited.
pub struct ProcessHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    responses: Receiver<Response>,
    stdout: Receiver<String>,
    stderr: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    process_id: Uuid,
    killed: bool,
}

impl ProcessHandle {
    /// Spawn `worker_path` and seed it with `globals`.
    pub fn spawn(worker_path: &Path, globals: &Snapshot, config: &RunnerConfig) -> Result<Self> {
        let mut child = ProcessCommand::new(worker_path)
            .arg("--poll-ms")
            .arg(config.poll_interval_ms.to_string())
            .arg("--idle-poll-ms")
            .arg(config.idle_poll_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Spawn {
                what: format!("execution process '{}'", worker_path.display()),
                message: e.to_string(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get execution process stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get execution process stdout".to_string()))?;

        let (response_tx, responses) = mpsc::channel();
        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();

        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            responses,
            stdout: stdout_rx,
            stderr: stderr_rx,
            reader: None,
            process_id: Uuid::new_v4(),
            killed: false,
        };

        let pid = handle.pid();
        let reader = thread::Builder::new()
            .name(format!("process-reader-{}", pid))
            .spawn(move || read_process_frames(stdout, response_tx, stdout_tx, stderr_tx))?;
        handle.reader = Some(reader);

        handle.write(&HostFrame::Init {
            globals: globals.clone(),
        })?;
        tracing::debug!(
            "Spawned execution process {} (pid {})",
            handle.process_id,
            pid
        );
        Ok(handle)
    }

    fn write(&mut self, frame: &HostFrame) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Execution process has been killed".to_string()));
        }
        write_message(&mut self.stdin, frame)
    }

    /// Push a command onto the command queue.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.write(&HostFrame::Command(message.clone()))
    }

    /// Feed one line to the `input()` builtin.
    pub fn send_input(&mut self, line: &str) -> Result<()> {
        self.write(&HostFrame::Input {
            line: line.to_string(),
        })
    }

    pub fn responses(&self) -> &Receiver<Response> {
        &self.responses
    }

    pub fn stdout(&self) -> &Receiver<String> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Receiver<String> {
        &self.stderr
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Identity of this process incarnation.
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => return false,
                Err(e) => {
                    tracing::warn!("Failed to poll execution process: {}", e);
                    return false;
                }
            }
        }
    }

    /// Kill the process, reap it and wait for the reader thread.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        if let Err(e) = self.child.kill() {
            // InvalidInput means it already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill execution process: {}", e);
            }
        }
        self.child
            .wait()
            .map_err(|e| Error::Ipc(format!("Failed to reap execution process: {}", e)))?;

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }

    pub fn kill_handle(&self) -> ProcessKillHandle {
        ProcessKillHandle::new(self)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

fn read_process_frames(
    stdout: ChildStdout,
    responses: Sender<Response>,
    out: Sender<String>,
    err: Sender<String>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_message::<_, ProcessFrame>(&mut reader) {
            Ok(Some(ProcessFrame::Response(response))) => {
                let _ = responses.send(response);
            }
            Ok(Some(ProcessFrame::Stdout { text })) => {
                let _ = out.send(text);
            }
            Ok(Some(ProcessFrame::Stderr { text })) => {
                let _ = err.send(text);
            }
            Ok(None) => break,
            Err(Error::Serialization(e)) => {
                tracing::warn!("Skipping undecodable frame from execution process: {}", e);
            }
            Err(e) => {
                tracing::debug!("Execution process output closed: {}", e);
                break;
            }
        }
    }
}

/// Thread-safe handle for killing or interrupting an execution process from
/// another thread.
#[derive(Debug, Clone)]
pub struct ProcessKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl ProcessKillHandle {
    pub fn new(process: &ProcessHandle) -> Self {
        Self {
            pid: process.pid(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SIGKILL the process.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal(Signal::Kill);
    }

    /// SIGINT the process, which makes its loop exit cleanly.
    pub fn interrupt(&self) {
        self.signal(Signal::Interrupt);
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        let signum = match signal {
            Signal::Kill => libc::SIGKILL,
            Signal::Interrupt => libc::SIGINT,
        };
        // SAFETY: kill(2) has no memory safety requirements.
        unsafe {
            libc::kill(self.pid as libc::pid_t, signum);
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) {
        tracing::warn!("Signalling execution processes is only supported on unix");
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Kill,
    Interrupt,
}
