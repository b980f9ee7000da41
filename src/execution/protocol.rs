//! Worker Wire Protocol
//!
//! One [`CallRequest`] travels parent -> worker on the worker's stdin.
//! One [`CallReply`] travels back on the worker's stdout as a single
//! line prefixed with [`REPLY_MARKER`], so anything else the callable
//! prints cannot be mistaken for the reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Prefix of the reply line on the worker's stdout.
pub const REPLY_MARKER: &str = "@@bear-reply@@ ";

/// Description of the call a worker should make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Result/error pair sent back by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CallReply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }

    /// True if the reply carries a non-empty error.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Frames a reply as one marker-prefixed line.
pub fn encode_reply(reply: &CallReply) -> Result<String> {
    Ok(format!("\n{}{}\n", REPLY_MARKER, serde_json::to_string(reply)?))
}

/// Splits worker stdout into the reply (last framed line) and
/// everything else the worker printed.
pub fn decode_output(stdout: &[u8]) -> (Option<CallReply>, String) {
    let text = String::from_utf8_lossy(stdout);
    let mut reply = None;
    let mut other = Vec::new();

    for line in text.lines() {
        match line.strip_prefix(REPLY_MARKER) {
            Some(json) => reply = serde_json::from_str(json).ok(),
            None if !line.trim().is_empty() => other.push(line),
            None => {}
        }
    }

    (reply, other.join("\n"))
}
