//! IPC protocol between a runner proxy and its execution process.
//!
//! Uses length-prefixed JSON frames over the child's stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded frame.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::execute::{Identifier, Status, WorkerStatus};
use crate::namespace::Snapshot;
use crate::script::ExceptionInfo;

/// Frames larger than this are rejected.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Filename used when `execute` is called without one.
pub const DEFAULT_FILENAME: &str = "<string>";

/// Named command as it travels on the command queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Per-proxy sequence number, echoed by the response.
    pub seq: u64,
    pub name: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: Map<String, JsonValue>,
}

impl Message {
    pub fn new(seq: u64, name: impl Into<String>) -> Self {
        Self {
            seq,
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<JsonValue>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, JsonValue>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Argument by keyword, falling back to position.
    fn arg(&self, name: &str, index: usize) -> Option<&JsonValue> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }

    fn required<T: DeserializeOwned>(&self, name: &str, index: usize) -> Result<T> {
        let value = self.arg(name, index).ok_or_else(|| Error::InvalidArguments {
            command: self.name.clone(),
            message: format!("missing argument '{}'", name),
        })?;
        self.decode(name, value)
    }

    fn optional<T: DeserializeOwned>(&self, name: &str, index: usize) -> Result<Option<T>> {
        match self.arg(name, index) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => self.decode(name, value).map(Some),
        }
    }

    fn decode<T: DeserializeOwned>(&self, name: &str, value: &JsonValue) -> Result<T> {
        T::deserialize(value).map_err(|e| Error::InvalidArguments {
            command: self.name.clone(),
            message: format!("argument '{}': {}", name, e),
        })
    }
}

/// Every command the execution process understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Execute {
        code: String,
        identifier: Identifier,
        filename: String,
    },
    Status,
    StopExecution {
        identifier: Identifier,
    },
    DeleteThread {
        identifier: Identifier,
    },
    GetException {
        identifier: Identifier,
    },
    GetTraceback {
        identifier: Identifier,
    },
    ClearExceptions,
    Reset {
        globals: Option<Snapshot>,
    },
    GetGlobal {
        name: String,
    },
    SetGlobal {
        name: String,
        value: JsonValue,
    },
    GlobalsSnapshot,
    /// Reserved: ends the process loop.
    Stop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Execute { .. } => "execute",
            Command::Status => "status",
            Command::StopExecution { .. } => "stop_execution",
            Command::DeleteThread { .. } => "delete_thread",
            Command::GetException { .. } => "get_exception",
            Command::GetTraceback { .. } => "get_traceback",
            Command::ClearExceptions => "clear_exceptions",
            Command::Reset { .. } => "reset",
            Command::GetGlobal { .. } => "get_global",
            Command::SetGlobal { .. } => "set_global",
            Command::GlobalsSnapshot => "globals_snapshot",
            Command::Stop => "stop",
        }
    }

    /// Decode a wire message. Unknown names fail with
    /// [`Error::UnknownCommand`], bad arguments with
    /// [`Error::InvalidArguments`].
    pub fn from_message(message: &Message) -> Result<Command> {
        let command = match message.name.as_str() {
            "execute" | "executeCode" => Command::Execute {
                code: message.required("code", 0)?,
                identifier: message.required("identifier", 1)?,
                filename: message
                    .optional("filename", 2)?
                    .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
            },
            "status" => Command::Status,
            "stop_execution" | "stopExecution" => Command::StopExecution {
                identifier: message.required("identifier", 0)?,
            },
            "delete_thread" | "deleteThread" => Command::DeleteThread {
                identifier: message.required("identifier", 0)?,
            },
            "get_exception" | "getException" => Command::GetException {
                identifier: message.required("identifier", 0)?,
            },
            "get_traceback" | "getTraceback" => Command::GetTraceback {
                identifier: message.required("identifier", 0)?,
            },
            "clear_exceptions" | "clearExceptions" => Command::ClearExceptions,
            "reset" => Command::Reset {
                globals: message.optional("globals", 0)?,
            },
            "get_global" => Command::GetGlobal {
                name: message.required("name", 0)?,
            },
            "set_global" => Command::SetGlobal {
                name: message.required("name", 0)?,
                value: message.optional("value", 1)?.unwrap_or(JsonValue::Null),
            },
            "globals_snapshot" => Command::GlobalsSnapshot,
            "stop" => Command::Stop,
            other => return Err(Error::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    /// Encode as a wire message with positional arguments.
    pub fn into_message(self, seq: u64) -> Message {
        let name = self.name();
        let args = match self {
            Command::Execute {
                code,
                identifier,
                filename,
            } => vec![
                JsonValue::String(code),
                identifier_json(identifier),
                JsonValue::String(filename),
            ],
            Command::StopExecution { identifier }
            | Command::DeleteThread { identifier }
            | Command::GetException { identifier }
            | Command::GetTraceback { identifier } => vec![identifier_json(identifier)],
            Command::Reset { globals } => match globals {
                Some(globals) => vec![JsonValue::Object(globals.into_iter().collect())],
                None => Vec::new(),
            },
            Command::GetGlobal { name } => vec![JsonValue::String(name)],
            Command::SetGlobal { name, value } => vec![JsonValue::String(name), value],
            Command::Status
            | Command::ClearExceptions
            | Command::GlobalsSnapshot
            | Command::Stop => Vec::new(),
        };
        Message::new(seq, name).with_args(args)
    }
}

fn identifier_json(identifier: Identifier) -> JsonValue {
    match identifier {
        Identifier::Number(n) => JsonValue::from(n),
        Identifier::Name(name) => JsonValue::String(name),
    }
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        value: JsonValue,
    },
    Error {
        exception: ExceptionInfo,
        traceback: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub outcome: Outcome,
}

/// One row of a `status` reply. Identifiers are not valid JSON object keys,
/// so the status map travels as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub identifier: Identifier,
    #[serde(flatten)]
    pub status: WorkerStatus,
}

pub fn status_to_json(status: &Status) -> JsonValue {
    let entries: Vec<StatusEntry> = status
        .iter()
        .map(|(identifier, status)| StatusEntry {
            identifier: identifier.clone(),
            status: status.clone(),
        })
        .collect();
    serde_json::to_value(entries).unwrap_or(JsonValue::Array(Vec::new()))
}

pub fn status_from_json(value: JsonValue) -> Result<Status> {
    let entries: Vec<StatusEntry> = serde_json::from_value(value)?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.identifier, entry.status))
        .collect())
}

/// Frame sent from the host to the execution process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// First frame: the initial global namespace.
    Init { globals: Snapshot },
    Command(Message),
    /// A line for the `input()` builtin.
    Input { line: String },
}

/// Frame sent from the execution process to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessFrame {
    Response(Response),
    Stdout { text: String },
    Stderr { text: String },
}

/// Write a frame using length-prefixed JSON encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read a frame using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!(
                "Failed to read IPC message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    let message = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;
    Ok(Some(message))
}
