//! Execution engine: workers and the in-process runner.
//!
//! # Architecture
//!
//! ```text
//! LocalRunner
//!     │
//!     ├── global Namespace (shared by every worker)
//!     │
//!     ├── Worker "scan"  ── thread worker-scan ── local Namespace
//!     ├── Worker 2       ── thread worker-2    ── local Namespace
//!     │       │
//!     │       └── on failure: CompletionReport ──▶ failure tables
//!     │
//!     └── ScriptIo (print / eprint / input)
//! ```
//!
//! Cancellation is cooperative: [`Worker::cancel`] trips the worker's
//! [`AbortHandle`] and the interpreter unwinds at its next checkpoint.
//!
//! # Module Structure
//!
//! - `context` - Abort handles, completion callbacks, script I/O
//! - `runner` - LocalRunner owning workers and failure tables
//! - `types` - Identifiers and status records
//! - `worker` - One cancellable thread per identifier

mod context;
mod runner;
mod types;
mod worker;

pub use context::{AbortHandle, BufferedIo, CompletionReport, ExecutionCallback, ScriptIo};
pub use runner::{DEFAULT_IDLE_POLL, LocalRunner};
pub use types::{CodeUnit, Identifier, Status, WorkerStatus};
pub use worker::{WORKER_STACK_SIZE, Worker, WorkerContext};
