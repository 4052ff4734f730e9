//! Message content, keyed by the header's `msg_type`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// MIME type → representation, e.g. `text/plain` → `"1"`.
pub type MimeBundle = BTreeMap<String, Value>;

/// Output category of a message.
///
/// Everything that is not kernel output (replies, status, comms, messages
/// this crate has never heard of) is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Stream,
    ExecuteResult,
    DisplayData,
    Error,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResultContent {
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataContent {
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// `Some(Value::Null)` when the field is present but null.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub transient: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorContent {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    #[serde(default)]
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Shell reply to an `execute_request`.
///
/// Fields beyond `status` and `execution_count` (`ename`, `payload`,
/// `user_expressions`, ...) are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecuteReply {
    /// Error details carried by an `error` reply.
    pub fn error(&self) -> Option<ErrorContent> {
        if self.status != ReplyStatus::Error {
            return None;
        }
        serde_json::from_value(Value::Object(self.extra.clone())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: String,
}

impl StatusContent {
    pub fn is_idle(&self) -> bool {
        self.execution_state == "idle"
    }
}

/// Message content as a union keyed by `msg_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Stream(StreamContent),
    ExecuteResult(ExecuteResultContent),
    DisplayData(DisplayDataContent),
    Error(ErrorContent),
    ExecuteRequest(ExecuteRequest),
    ExecuteReply(ExecuteReply),
    Status(StatusContent),
    /// Any other message, payload untouched.
    Other { msg_type: String, payload: Value },
}

impl Content {
    /// Parse a raw payload according to its `msg_type`.
    ///
    /// Only output types can fail. Protocol messages whose payload does not
    /// fit their typed form, and message types this crate does not know,
    /// become [`Content::Other`].
    pub fn from_type_and_payload(msg_type: &str, payload: Value) -> serde_json::Result<Self> {
        let content = match msg_type {
            "stream" => Content::Stream(serde_json::from_value(payload)?),
            "execute_result" => Content::ExecuteResult(serde_json::from_value(payload)?),
            "display_data" => Content::DisplayData(serde_json::from_value(payload)?),
            "error" => Content::Error(serde_json::from_value(payload)?),
            "execute_request" => typed_or_other(msg_type, payload, Content::ExecuteRequest),
            "execute_reply" => typed_or_other(msg_type, payload, Content::ExecuteReply),
            "status" => typed_or_other(msg_type, payload, Content::Status),
            other => Content::Other {
                msg_type: other.to_string(),
                payload,
            },
        };
        Ok(content)
    }

    pub fn msg_type(&self) -> &str {
        match self {
            Content::Stream(_) => "stream",
            Content::ExecuteResult(_) => "execute_result",
            Content::DisplayData(_) => "display_data",
            Content::Error(_) => "error",
            Content::ExecuteRequest(_) => "execute_request",
            Content::ExecuteReply(_) => "execute_reply",
            Content::Status(_) => "status",
            Content::Other { msg_type, .. } => msg_type,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Content::Stream(_) => MessageKind::Stream,
            Content::ExecuteResult(_) => MessageKind::ExecuteResult,
            Content::DisplayData(_) => MessageKind::DisplayData,
            Content::Error(_) => MessageKind::Error,
            Content::ExecuteRequest(_)
            | Content::ExecuteReply(_)
            | Content::Status(_)
            | Content::Other { .. } => MessageKind::Other,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Value> {
        match self {
            Content::Stream(c) => serde_json::to_value(c),
            Content::ExecuteResult(c) => serde_json::to_value(c),
            Content::DisplayData(c) => serde_json::to_value(c),
            Content::Error(c) => serde_json::to_value(c),
            Content::ExecuteRequest(c) => serde_json::to_value(c),
            Content::ExecuteReply(c) => serde_json::to_value(c),
            Content::Status(c) => serde_json::to_value(c),
            Content::Other { payload, .. } => Ok(payload.clone()),
        }
    }
}

fn typed_or_other<T: DeserializeOwned>(
    msg_type: &str,
    payload: Value,
    wrap: fn(T) -> Content,
) -> Content {
    match T::deserialize(&payload) {
        Ok(typed) => wrap(typed),
        Err(_) => Content::Other {
            msg_type: msg_type.to_string(),
            payload,
        },
    }
}
