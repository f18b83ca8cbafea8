//! Exception descriptors and tracebacks raised by scripts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind and message of a raised exception.
///
/// This is the part of a failure that crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Exception kind, e.g. `ValueError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// One entry of a traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub filename: String,
    pub line: usize,
    pub function: String,
}

/// A raised exception with the call stack captured at the raise point.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub info: ExceptionInfo,
    /// Outermost frame first.
    pub traceback: Vec<TraceFrame>,
}

impl Exception {
    pub fn new(info: ExceptionInfo, traceback: Vec<TraceFrame>) -> Self {
        Self { info, traceback }
    }

    /// Render the traceback the way it is shown to users.
    pub fn format_traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.traceback {
            out.push_str(&format!(
                "  {}:{} in {}\n",
                frame.filename, frame.line, frame.function
            ));
        }
        out.push_str(&self.info.to_string());
        out.push('\n');
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.info.fmt(f)
    }
}

/// Outcome of a script that did not complete normally.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// The script raised an exception.
    Raised(Exception),
    /// The script was cancelled from outside. Scripts cannot catch this.
    Interrupt,
}

impl From<Exception> for ScriptError {
    fn from(e: Exception) -> Self {
        ScriptError::Raised(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceback_format() {
        let exc = Exception::new(
            ExceptionInfo::new("ValueError", "boom"),
            vec![
                TraceFrame {
                    filename: "s3.txt".to_string(),
                    line: 4,
                    function: "<script>".to_string(),
                },
                TraceFrame {
                    filename: "s3.txt".to_string(),
                    line: 2,
                    function: "explode".to_string(),
                },
            ],
        );

        let text = exc.format_traceback();
        assert!(text.starts_with("Traceback (most recent call last):\n"));
        assert!(text.contains("  s3.txt:4 in <script>\n  s3.txt:2 in explode\n"));
        assert!(text.ends_with("ValueError: boom\n"));
    }

    #[test]
    fn test_info_display_without_message() {
        assert_eq!(ExceptionInfo::new("KeyError", "").to_string(), "KeyError");
        assert_eq!(
            ExceptionInfo::new("KeyError", "'x'").to_string(),
            "KeyError: 'x'"
        );
    }
}
