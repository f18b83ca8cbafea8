//! Inter-process communication with execution processes.
//!
//! This module provides the frame protocol, the process-side command loop
//! and the host-side process handle.

mod handle;
pub mod process;
pub mod protocol;

pub use handle::{ProcessHandle, ProcessKillHandle};
pub use process::{BUSY_KIND, Dispatch, ExecutionProcess, ProcessConfig, QueueIo, serve};
pub use protocol::{
    Command, HostFrame, Message, Outcome, ProcessFrame, Response, StatusEntry, read_message,
    write_message,
};
