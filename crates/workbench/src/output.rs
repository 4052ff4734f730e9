//! Typed kernel output, independent of the wire format.

use kernel_wire::{Content, ErrorContent, MimeBundle, StreamName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single output produced by executing a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputRecord {
    Stream {
        #[serde(rename = "name")]
        source_stream: StreamName,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
    },
    DisplayData {
        data: MimeBundle,
    },
    Error {
        message: String,
        traceback: Vec<String>,
    },
}

impl OutputRecord {
    /// Build the record for an output message; `None` for anything that is
    /// not kernel output.
    pub fn from_content(content: &Content) -> Option<Self> {
        match content {
            Content::Stream(stream) => Some(OutputRecord::Stream {
                source_stream: stream.name,
                text: stream.text.clone(),
            }),
            Content::ExecuteResult(result) => Some(OutputRecord::ExecuteResult {
                data: result.data.clone(),
            }),
            Content::DisplayData(display) => Some(OutputRecord::DisplayData {
                data: display.data.clone(),
            }),
            Content::Error(error) => Some(Self::from_error(error)),
            _ => None,
        }
    }

    pub fn from_error(error: &ErrorContent) -> Self {
        let message = if error.ename.is_empty() {
            error.evalue.clone()
        } else {
            format!("{}: {}", error.ename, error.evalue)
        };
        OutputRecord::Error {
            message,
            traceback: error.traceback.clone(),
        }
    }

    /// An error record raised by the client itself rather than the kernel.
    pub fn error(message: impl Into<String>) -> Self {
        OutputRecord::Error {
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputRecord::Error { .. })
    }

    /// Best plain-text rendering, for terminals and logs.
    pub fn to_text(&self) -> String {
        match self {
            OutputRecord::Stream { text, .. } => text.clone(),
            OutputRecord::ExecuteResult { data } | OutputRecord::DisplayData { data } => {
                match data.get("text/plain") {
                    Some(serde_json::Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => format!(
                        "<{}>",
                        data.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                }
            }
            OutputRecord::Error { message, traceback } => {
                if traceback.is_empty() {
                    message.clone()
                } else {
                    traceback.join("\n")
                }
            }
        }
    }
}

fn stream_text(outputs: &[Arc<OutputRecord>], wanted: StreamName) -> String {
    outputs
        .iter()
        .filter_map(|o| match &**o {
            OutputRecord::Stream {
                source_stream,
                text,
            } if *source_stream == wanted => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Combined stdout text.
pub fn stdout(outputs: &[Arc<OutputRecord>]) -> String {
    stream_text(outputs, StreamName::Stdout)
}

/// Combined stderr text.
pub fn stderr(outputs: &[Arc<OutputRecord>]) -> String {
    stream_text(outputs, StreamName::Stderr)
}
