//! Wire model for messages emitted by an interpreter on its output stream.
//!
//! The shape follows the Jupyter messaging layout (`header`, `parent_header`,
//! `content`) so the correlator can be driven by any engine that speaks it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExecutionFailure;

pub const MSG_STATUS: &str = "status";
pub const MSG_STREAM: &str = "stream";
pub const MSG_EXECUTE_RESULT: &str = "execute_result";
pub const MSG_DISPLAY_DATA: &str = "display_data";
pub const MSG_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub msg_id: String,
    pub msg_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Unknown,
}

/// A message after classification by type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Stream { name: String, text: String },
    ExecuteResult { data: Map<String, Value> },
    DisplayData { data: Map<String, Value> },
    Error(ExecutionFailure),
    Status(ExecutionState),
    Other(String),
}

impl KernelMessage {
    pub fn new(msg_type: &str, parent: Option<&str>, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                msg_type: msg_type.to_string(),
            },
            parent_header: ParentHeader {
                msg_id: parent.map(str::to_string),
            },
            content,
        }
    }

    pub fn status(parent: Option<&str>, state: &str) -> Self {
        Self::new(
            MSG_STATUS,
            parent,
            serde_json::json!({ "execution_state": state }),
        )
    }

    pub fn stream(parent: Option<&str>, text: &str) -> Self {
        Self::new(
            MSG_STREAM,
            parent,
            serde_json::json!({ "name": "stdout", "text": text }),
        )
    }

    pub fn parent_token(&self) -> Option<&str> {
        self.parent_header.msg_id.as_deref()
    }

    /// True when this message carries a parent token and it is not `token`.
    pub fn belongs_elsewhere(&self, token: &str) -> bool {
        self.parent_token().is_some_and(|parent| parent != token)
    }

    pub fn is_idle_for(&self, token: &str) -> bool {
        self.parent_token() == Some(token)
            && matches!(self.kind(), MessageKind::Status(ExecutionState::Idle))
    }

    pub fn kind(&self) -> MessageKind {
        let content = &self.content;
        match self.header.msg_type.as_str() {
            MSG_STREAM => MessageKind::Stream {
                name: str_field(content, "name").unwrap_or("stdout").to_string(),
                text: str_field(content, "text").unwrap_or_default().to_string(),
            },
            MSG_EXECUTE_RESULT => MessageKind::ExecuteResult {
                data: data_field(content),
            },
            MSG_DISPLAY_DATA => MessageKind::DisplayData {
                data: data_field(content),
            },
            MSG_ERROR => MessageKind::Error(ExecutionFailure {
                ename: str_field(content, "ename")
                    .unwrap_or("UnknownError")
                    .to_string(),
                evalue: str_field(content, "evalue")
                    .unwrap_or("Unknown error value")
                    .to_string(),
                traceback: content
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(|l| l.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            MSG_STATUS => MessageKind::Status(match str_field(content, "execution_state") {
                Some("starting") => ExecutionState::Starting,
                Some("busy") => ExecutionState::Busy,
                Some("idle") => ExecutionState::Idle,
                _ => ExecutionState::Unknown,
            }),
            other => MessageKind::Other(other.to_string()),
        }
    }
}

fn str_field<'a>(content: &'a Value, key: &str) -> Option<&'a str> {
    content.get(key).and_then(Value::as_str)
}

fn data_field(content: &Value) -> Map<String, Value> {
    content
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Plain-text rendering of an `execute_result` mime bundle.
pub fn render_result(data: &Map<String, Value>) -> String {
    data.get("text/plain")
        .map(value_text)
        .unwrap_or_default()
}

/// Bounded rendering of a `display_data` mime bundle. Binary and markup
/// payloads are replaced by placeholders.
pub fn render_display(data: &Map<String, Value>) -> Option<String> {
    if data.contains_key("image/png") {
        return Some("[Image data: base64 PNG omitted]".to_string());
    }
    if let Some(mime) = data.keys().find(|k| k.starts_with("image/")) {
        return Some(format!("[Image data: {mime} omitted]"));
    }
    if data.contains_key("text/html") {
        return Some("[HTML data omitted]".to_string());
    }
    let text = data.get("text/plain").map(value_text)?;
    if text.is_empty() { None } else { Some(text) }
}

// Jupyter allows multiline mime values to be split into a list of strings.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
