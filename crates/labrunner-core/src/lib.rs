//! Core engine for labrunner, a supervised script runner.
//!
//! This crate provides:
//! - An embedded scripting language for code units
//! - Cancellable workers and the in-process `LocalRunner`
//! - The `ExecutionProcess` command loop and its frame protocol
//! - `RunnerProxy`, the host-side handle with crash recovery

pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod namespace;
pub mod paths;
pub mod proxy;
pub mod script;

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use execute::{
    AbortHandle, BufferedIo, CompletionReport, ExecutionCallback, Identifier, LocalRunner,
    ScriptIo, Status, Worker, WorkerStatus,
};
pub use ipc::{Command, ExecutionProcess, Message, ProcessConfig, ProcessKillHandle};
pub use namespace::{Namespace, Snapshot};
pub use proxy::RunnerProxy;
pub use script::{Exception, ExceptionInfo, ScriptError, Value};
