//! Envelope framing and the JSON codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::content::{Content, ExecuteRequest, MessageKind};

/// Jupyter messaging protocol version stamped on outbound headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Inbound message that cannot be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum MalformedEnvelope {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing header field: {0}")]
    MissingField(&'static str),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid {msg_type} content: {source}")]
    Content {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    #[default]
    Iopub,
    Stdin,
    Control,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(Channel::Shell),
            "iopub" => Some(Channel::Iopub),
            "stdin" => Some(Channel::Stdin),
            "control" => Some(Channel::Control),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header fields other than `msg_type`, which is owned by [`Content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: Option<String>,
    pub version: String,
}

impl Header {
    /// Fresh header with a unique `msg_id`, stamped now.
    pub fn new(session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: "user".to_string(),
            date: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One message exchanged with the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    /// `msg_id` of the request this message answers.
    pub parent_id: Option<String>,
    pub channel: Channel,
    pub content: Content,
    pub metadata: Value,
    pub buffers: Vec<Bytes>,
}

impl Envelope {
    pub fn new(content: Content, channel: Channel, session: &str) -> Self {
        Self {
            header: Header::new(session),
            parent_id: None,
            channel,
            content,
            metadata: Value::Object(Map::new()),
            buffers: Vec::new(),
        }
    }

    /// `execute_request` on the shell channel.
    pub fn execute_request(code: &str, session: &str) -> Self {
        Self::new(
            Content::ExecuteRequest(ExecuteRequest::new(code)),
            Channel::Shell,
            session,
        )
    }

    /// A message answering `parent`, in the parent's session.
    pub fn reply_to(parent: &Envelope, content: Content, channel: Channel) -> Self {
        let mut reply = Self::new(content, channel, &parent.header.session);
        reply.parent_id = Some(parent.header.msg_id.clone());
        reply
    }

    pub fn id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        self.content.msg_type()
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }
}

#[derive(Deserialize)]
struct RawHeader {
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    session: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    version: String,
}

/// Wire form as read. Everything is optional here; required fields are
/// checked in [`decode`] so the error names what is missing.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    header: Option<RawHeader>,
    #[serde(default)]
    parent_header: Option<Value>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    content: Value,
    #[serde(default, with = "crate::buffers")]
    buffers: Vec<Bytes>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    msg_type: Option<String>,
}

#[derive(Serialize)]
struct WireHeader<'a> {
    msg_id: &'a str,
    msg_type: &'a str,
    session: &'a str,
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<&'a str>,
    version: &'a str,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    header: WireHeader<'a>,
    parent_header: Value,
    metadata: &'a Value,
    content: Value,
    #[serde(with = "crate::buffers")]
    buffers: &'a [Bytes],
    channel: Channel,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    let header = &envelope.header;
    let wire = WireEnvelope {
        header: WireHeader {
            msg_id: &header.msg_id,
            msg_type: envelope.msg_type(),
            session: &header.session,
            username: &header.username,
            date: header.date.as_deref(),
            version: &header.version,
        },
        parent_header: match &envelope.parent_id {
            Some(id) => json!({ "msg_id": id }),
            None => json!({}),
        },
        metadata: &envelope.metadata,
        content: envelope.content.to_payload()?,
        buffers: &envelope.buffers,
        channel: envelope.channel,
    };
    serde_json::to_vec(&wire)
}

/// Parse one wire frame.
///
/// Fails when the frame is not JSON, lacks `msg_id`/`msg_type`, names an
/// unknown channel, or carries content that does not fit a known output
/// type. Unknown `msg_type`s decode to [`Content::Other`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, MalformedEnvelope> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)?;

    let (header_id, header_type, session, username, date, version) = match raw.header {
        Some(h) => (h.msg_id, h.msg_type, h.session, h.username, h.date, h.version),
        None => (None, None, String::new(), String::new(), None, String::new()),
    };

    let msg_id = non_empty(header_id)
        .or_else(|| non_empty(raw.msg_id))
        .ok_or(MalformedEnvelope::MissingField("msg_id"))?;
    let msg_type = non_empty(header_type)
        .or_else(|| non_empty(raw.msg_type))
        .ok_or(MalformedEnvelope::MissingField("msg_type"))?;

    let channel = match raw.channel {
        Some(name) => Channel::parse(&name).ok_or(MalformedEnvelope::UnknownChannel(name))?,
        None => Channel::default(),
    };

    let parent_id = raw
        .parent_header
        .as_ref()
        .and_then(|h| h.get("msg_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let content = Content::from_type_and_payload(&msg_type, raw.content).map_err(|source| {
        MalformedEnvelope::Content {
            msg_type: msg_type.clone(),
            source,
        }
    })?;

    Ok(Envelope {
        header: Header {
            msg_id,
            session,
            username,
            date,
            version,
        },
        parent_id,
        channel,
        content,
        metadata: raw.metadata,
        buffers: raw.buffers,
    })
}
