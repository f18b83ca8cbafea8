//! Identifiers, code units and status records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen name of one execution slot.
///
/// Serializes untagged, so `3` and `"acquire"` are both valid on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Number(i64),
    Name(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Number(n) => write!(f, "{}", n),
            Identifier::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for Identifier {
    fn from(n: i64) -> Self {
        Identifier::Number(n)
    }
}

impl From<i32> for Identifier {
    fn from(n: i32) -> Self {
        Identifier::Number(n.into())
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::Name(name.to_string())
    }
}

impl From<String> for Identifier {
    fn from(name: String) -> Self {
        Identifier::Name(name)
    }
}

/// Source text plus the filename shown in tracebacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub code: String,
    pub filename: String,
}

impl CodeUnit {
    pub fn new(code: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            filename: filename.into(),
        }
    }
}

/// Externally visible state of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub filename: String,
    pub failed: bool,
}

/// Status of every known identifier.
pub type Status = BTreeMap<Identifier, WorkerStatus>;
