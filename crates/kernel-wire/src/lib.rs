//! Message envelopes for the Jupyter kernel websocket.
//!
//! A Jupyter server multiplexes the kernel's `shell`, `iopub`, `stdin` and
//! `control` channels onto one websocket, each frame carrying a single JSON
//! message. This crate turns those frames into [`Envelope`]s and back.
//!
//! # Features
//!
//! - Typed content union keyed by `msg_type`, with an [`Content::Other`]
//!   fallback so unrecognised messages still flow through for correlation
//! - Tolerant header parsing (`{}`/`null` parent headers, top-level
//!   `msg_id`/`msg_type` as emitted by some servers)
//! - Base64 encoding for binary buffers

mod buffers;
mod content;
mod envelope;

pub use content::{
    Content, DisplayDataContent, ErrorContent, ExecuteReply, ExecuteRequest,
    ExecuteResultContent, MessageKind, MimeBundle, ReplyStatus, StatusContent, StreamContent,
    StreamName,
};
pub use envelope::{decode, encode, Channel, Envelope, Header, MalformedEnvelope, PROTOCOL_VERSION};
