//! The execution process: one [`LocalRunner`] behind a polling command loop.
//!
//! ```text
//! host stdin ──▶ reader thread ──┬─▶ commands ──▶ poll loop ──▶ LocalRunner
//!                                └─▶ stdin lines ──▶ input()
//!
//! LocalRunner / workers ──▶ FrameSink (mutex) ──▶ host stdout
//!                           response, stdout, stderr frames
//! ```

use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::MissedTickBehavior;

use super::protocol::{
    Command, HostFrame, Message, Outcome, ProcessFrame, Response, read_message, status_to_json,
    write_message,
};
use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::{AbortHandle, LocalRunner, ScriptIo};
use crate::namespace::{Namespace, Snapshot};
use crate::script::ExceptionInfo;

/// Exception kind used for the busy rejection on the wire.
pub const BUSY_KIND: &str = "Busy";

/// How often a blocked `input()` re-checks for cancellation.
const INPUT_POLL: Duration = Duration::from_millis(50);

/// Serialized writer shared by the loop and every worker.
pub type FrameSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn frame_sink(writer: impl Write + Send + 'static) -> FrameSink {
    let writer: Box<dyn Write + Send> = Box::new(writer);
    Arc::new(Mutex::new(writer))
}

fn send_frame(sink: &FrameSink, frame: &ProcessFrame) -> Result<()> {
    let mut writer = sink.lock().unwrap_or_else(PoisonError::into_inner);
    write_message(&mut *writer, frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessConfig {
    pub poll_interval: Duration,
    pub idle_poll: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for ProcessConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            idle_poll: config.idle_poll(),
        }
    }
}

/// [`ScriptIo`] that turns output into frames and reads `input()` lines
/// from the host.
pub struct QueueIo {
    sink: FrameSink,
    stdin: Mutex<Receiver<String>>,
}

impl QueueIo {
    pub fn new(sink: FrameSink, stdin: Receiver<String>) -> Self {
        Self {
            sink,
            stdin: Mutex::new(stdin),
        }
    }
}

impl ScriptIo for QueueIo {
    fn write_stdout(&self, text: &str) {
        let frame = ProcessFrame::Stdout {
            text: text.to_string(),
        };
        if let Err(e) = send_frame(&self.sink, &frame) {
            tracing::debug!("Dropping script stdout: {}", e);
        }
    }

    fn write_stderr(&self, text: &str) {
        let frame = ProcessFrame::Stderr {
            text: text.to_string(),
        };
        if let Err(e) = send_frame(&self.sink, &frame) {
            tracing::debug!("Dropping script stderr: {}", e);
        }
    }

    fn read_line(&self, abort: &AbortHandle) -> Option<String> {
        let stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if abort.is_aborted() {
                return None;
            }
            match stdin.recv_timeout(INPUT_POLL) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// What the loop should do after one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Push this response.
    Reply(Response),
    /// Nothing to push.
    Silent,
    /// Leave the loop.
    Stop,
}

pub struct ExecutionProcess {
    runner: LocalRunner,
    commands: Receiver<Message>,
    sink: FrameSink,
    config: ProcessConfig,
}

impl ExecutionProcess {
    pub fn new(
        globals: &Snapshot,
        commands: Receiver<Message>,
        sink: FrameSink,
        stdin: Receiver<String>,
        config: ProcessConfig,
    ) -> Self {
        let io = Arc::new(QueueIo::new(Arc::clone(&sink), stdin));
        let runner = LocalRunner::new(Namespace::from_snapshot(globals), io)
            .with_idle_poll(config.idle_poll);
        Self {
            runner,
            commands,
            sink,
            config,
        }
    }

    pub fn runner(&self) -> &LocalRunner {
        &self.runner
    }

    /// Handle one command message.
    ///
    /// Never fails: undecodable arguments and panics inside the runner are
    /// logged and produce no response.
    pub fn dispatch(&mut self, message: &Message) -> Dispatch {
        let command = match Command::from_message(message) {
            Ok(Command::Stop) => return Dispatch::Stop,
            Ok(command) => command,
            Err(Error::UnknownCommand(name)) => {
                tracing::debug!("Ignoring unknown command '{}'", name);
                return Dispatch::Silent;
            }
            Err(e) => {
                tracing::warn!("Dropping command '{}': {}", message.name, e);
                return Dispatch::Silent;
            }
        };

        let name = command.name();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.apply(command)));
        let outcome = match result {
            Ok(Ok(value)) => Outcome::Ok { value },
            Ok(Err(Error::Busy(identifier))) => Outcome::Error {
                exception: ExceptionInfo::new(BUSY_KIND, identifier.to_string()),
                traceback: String::new(),
            },
            Ok(Err(e)) => {
                tracing::warn!("Command '{}' failed: {}", name, e);
                return Dispatch::Silent;
            }
            Err(_) => {
                tracing::warn!("Command '{}' panicked", name);
                return Dispatch::Silent;
            }
        };
        Dispatch::Reply(Response {
            seq: message.seq,
            outcome,
        })
    }

    fn apply(&mut self, command: Command) -> Result<JsonValue> {
        let runner = &mut self.runner;
        let value = match command {
            Command::Execute {
                code,
                identifier,
                filename,
            } => JsonValue::from(runner.execute(&code, identifier, &filename)?),
            Command::Status => status_to_json(&runner.status()),
            Command::StopExecution { identifier } => {
                runner.stop_execution(&identifier);
                JsonValue::Null
            }
            Command::DeleteThread { identifier } => {
                runner.delete_thread(&identifier);
                JsonValue::Null
            }
            Command::GetException { identifier } => {
                serde_json::to_value(runner.get_exception(&identifier))?
            }
            Command::GetTraceback { identifier } => runner
                .get_traceback(&identifier)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
            Command::ClearExceptions => {
                runner.clear_exceptions();
                JsonValue::Null
            }
            Command::Reset { globals } => {
                runner.reset(Namespace::from_snapshot(&globals.unwrap_or_default()));
                JsonValue::Null
            }
            Command::GetGlobal { name } => runner.get_global(&name).unwrap_or(JsonValue::Null),
            Command::SetGlobal { name, value } => {
                runner.set_global(&name, &value);
                JsonValue::Null
            }
            Command::GlobalsSnapshot => {
                JsonValue::Object(runner.globals_snapshot().into_iter().collect())
            }
            Command::Stop => JsonValue::Null,
        };
        Ok(value)
    }

    /// Process every queued command in order.
    pub fn drain(&mut self) -> ControlFlow<()> {
        loop {
            let message = match self.commands.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
            };
            match self.dispatch(&message) {
                Dispatch::Reply(response) => {
                    if let Err(e) = send_frame(&self.sink, &ProcessFrame::Response(response)) {
                        tracing::warn!("Failed to send response: {}", e);
                    }
                }
                Dispatch::Silent => {}
                Dispatch::Stop => return ControlFlow::Break(()),
            }
        }
    }

    /// Poll the command queue until `stop`, end of input, or Ctrl-C.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        tracing::info!(
            "Execution process ready (poll {:?})",
            self.config.poll_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.drain().is_break() {
                        tracing::info!("Stop requested, shutting down");
                        break;
                    }
                }
                _ = &mut ctrl_c => {
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
            }
        }
    }
}

/// Run an execution process over a pair of byte streams.
///
/// The first frame on `reader` must be `init`. Returns when the loop ends.
pub async fn serve<R, W>(mut reader: R, writer: W, config: ProcessConfig) -> Result<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let globals = match read_message::<_, HostFrame>(&mut reader)? {
        Some(HostFrame::Init { globals }) => globals,
        Some(other) => {
            return Err(Error::Ipc(format!("Expected init frame, got {:?}", other)));
        }
        None => {
            tracing::debug!("Host closed the pipe before init");
            return Ok(());
        }
    };

    let (command_tx, command_rx) = mpsc::channel();
    let (stdin_tx, stdin_rx) = mpsc::channel();
    thread::Builder::new()
        .name("host-reader".to_string())
        .spawn(move || read_host_frames(reader, command_tx, stdin_tx))?;

    let process = ExecutionProcess::new(&globals, command_rx, frame_sink(writer), stdin_rx, config);
    process.run().await;
    Ok(())
}

/// Split host frames into commands and `input()` lines. At end of input a
/// synthetic `stop` is queued.
fn read_host_frames(mut reader: impl Read, commands: Sender<Message>, stdin: Sender<String>) {
    loop {
        match read_message::<_, HostFrame>(&mut reader) {
            Ok(Some(HostFrame::Command(message))) => {
                if commands.send(message).is_err() {
                    return;
                }
            }
            Ok(Some(HostFrame::Input { line })) => {
                let _ = stdin.send(line);
            }
            Ok(Some(HostFrame::Init { .. })) => {
                tracing::warn!("Ignoring repeated init frame");
            }
            Ok(None) => {
                tracing::debug!("Host closed the command pipe");
                break;
            }
            Err(Error::Serialization(e)) => {
                tracing::warn!("Skipping undecodable frame: {}", e);
            }
            Err(e) => {
                tracing::warn!("Command pipe failed: {}", e);
                break;
            }
        }
    }
    let _ = commands.send(Command::Stop.into_message(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::Identifier;
    use serde_json::json;
    use std::io::Cursor;
    use std::time::Instant;

    /// Writer whose bytes can be inspected after the fact.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn frames(&self) -> Vec<ProcessFrame> {
            let bytes = self.0.lock().unwrap().clone();
            let mut cursor = Cursor::new(bytes);
            let mut frames = Vec::new();
            while let Some(frame) = read_message(&mut cursor).unwrap() {
                frames.push(frame);
            }
            frames
        }
    }

    fn process() -> (ExecutionProcess, Sender<Message>, SharedBuf) {
        let (command_tx, command_rx) = mpsc::channel();
        let (_stdin_tx, stdin_rx) = mpsc::channel();
        let buf = SharedBuf::default();
        let config = ProcessConfig {
            poll_interval: Duration::from_millis(10),
            idle_poll: Duration::from_millis(10),
        };
        let process = ExecutionProcess::new(
            &Snapshot::new(),
            command_rx,
            frame_sink(buf.clone()),
            stdin_rx,
            config,
        );
        (process, command_tx, buf)
    }

    fn ok_value(dispatch: Dispatch) -> JsonValue {
        match dispatch {
            Dispatch::Reply(Response {
                outcome: Outcome::Ok { value },
                ..
            }) => value,
            other => panic!("expected an ok reply, got {:?}", other),
        }
    }

    fn execute(seq: u64, code: &str, identifier: i64) -> Message {
        Command::Execute {
            code: code.to_string(),
            identifier: Identifier::from(identifier),
            filename: "t.txt".to_string(),
        }
        .into_message(seq)
    }

    #[test]
    fn test_execute_replies_with_worker_id() {
        let (mut process, _tx, _buf) = process();
        assert_eq!(ok_value(process.dispatch(&execute(1, "x = 1", 1))), json!(0));
        assert_eq!(ok_value(process.dispatch(&execute(2, "x = 1", 2))), json!(1));
    }

    #[test]
    fn test_busy_is_an_error_reply() {
        let (mut process, _tx, _buf) = process();
        process.dispatch(&execute(1, "while True:\n    pass\n", 5));

        match process.dispatch(&execute(2, "pass", 5)) {
            Dispatch::Reply(Response {
                seq: 2,
                outcome: Outcome::Error { exception, .. },
            }) => {
                assert_eq!(exception.kind, BUSY_KIND);
                assert_eq!(exception.message, "5");
            }
            other => panic!("expected busy, got {:?}", other),
        }
        process.runner().stop_execution(&Identifier::from(5));
    }

    #[test]
    fn test_unknown_and_malformed_commands_are_silent() {
        let (mut process, _tx, _buf) = process();
        assert_eq!(process.dispatch(&Message::new(1, "launch_rocket")), Dispatch::Silent);
        assert_eq!(process.dispatch(&Message::new(2, "execute")), Dispatch::Silent);
        assert_eq!(process.dispatch(&Message::new(3, "stop")), Dispatch::Stop);
    }

    #[test]
    fn test_drain_pushes_responses_and_stops() {
        let (mut process, tx, buf) = process();
        let set = Command::SetGlobal {
            name: "g".into(),
            value: json!(3),
        };
        tx.send(set.into_message(1)).unwrap();
        tx.send(Command::GetGlobal { name: "g".into() }.into_message(2)).unwrap();
        tx.send(Message::new(3, "nonsense")).unwrap();
        tx.send(Command::Stop.into_message(4)).unwrap();
        tx.send(Command::Status.into_message(5)).unwrap();

        assert!(process.drain().is_break());

        let frames = buf.frames();
        let responses: Vec<_> = frames
            .iter()
            .filter_map(|frame| match frame {
                ProcessFrame::Response(response) => Some(response.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].seq, 2);
        assert_eq!(responses[1].outcome, Outcome::Ok { value: json!(3) });

        // The status command behind stop stays queued.
        assert!(process.drain().is_continue());
    }

    #[test]
    fn test_script_output_becomes_frames() {
        let (mut process, _tx, buf) = process();
        process.dispatch(&execute(1, "print('hello')\nraise ValueError('boom')\n", 1));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frames = Vec::new();
        while Instant::now() < deadline {
            frames = buf.frames();
            if frames.iter().any(|f| matches!(f, ProcessFrame::Stderr { .. })) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert!(frames.contains(&ProcessFrame::Stdout { text: "hello\n".into() }));
        assert!(frames.iter().any(
            |f| matches!(f, ProcessFrame::Stderr { text } if text.contains("ValueError: boom"))
        ));
    }

    #[tokio::test]
    async fn test_serve_until_end_of_input() {
        let mut input = Vec::new();
        let mut globals = Snapshot::new();
        globals.insert("x".into(), json!(41));
        write_message(&mut input, &HostFrame::Init { globals }).unwrap();
        let message = Command::GetGlobal { name: "x".into() }.into_message(7);
        write_message(&mut input, &HostFrame::Command(message)).unwrap();

        let buf = SharedBuf::default();
        let config = ProcessConfig {
            poll_interval: Duration::from_millis(10),
            idle_poll: Duration::from_millis(10),
        };
        serve(Cursor::new(input), buf.clone(), config).await.unwrap();

        assert_eq!(
            buf.frames(),
            vec![ProcessFrame::Response(Response {
                seq: 7,
                outcome: Outcome::Ok { value: json!(41) },
            })]
        );
    }

    #[tokio::test]
    async fn test_serve_rejects_missing_init() {
        let mut input = Vec::new();
        write_message(&mut input, &HostFrame::Input { line: "hi".into() }).unwrap();
        let result = serve(
            Cursor::new(input),
            SharedBuf::default(),
            ProcessConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
