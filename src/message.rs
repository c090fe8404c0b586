use crate::error::{MuxError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application payload carried by a `data` message.
///
/// Text travels as a JSON string, binary as a JSON array of bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(data))
    }
}

/// The discriminant of a [`WireMessage`], as written in its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    Open,
    Data,
    Close,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Open => "open",
            MessageKind::Data => "data",
            MessageKind::Close => "close",
        }
    }

    /// Handshake and teardown messages; only `data` carries application bytes.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageKind::Data)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of the multiplexing protocol.
///
/// Every variant except `Connect` names the channel it belongs to; `Open`
/// also echoes the temporary reference the client chose in `Connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Connect {
        #[serde(rename = "ref")]
        reference: String,
        name: String,
    },
    Open {
        id: String,
        #[serde(rename = "ref")]
        reference: String,
    },
    Data {
        id: String,
        data: Payload,
    },
    Close {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl WireMessage {
    pub fn connect(reference: impl Into<String>, name: impl Into<String>) -> Self {
        WireMessage::Connect {
            reference: reference.into(),
            name: name.into(),
        }
    }

    pub fn open(id: impl Into<String>, reference: impl Into<String>) -> Self {
        WireMessage::Open {
            id: id.into(),
            reference: reference.into(),
        }
    }

    pub fn data(id: impl Into<String>, data: impl Into<Payload>) -> Self {
        WireMessage::Data {
            id: id.into(),
            data: data.into(),
        }
    }

    pub fn close(id: impl Into<String>, code: Option<u16>, reason: Option<String>) -> Self {
        WireMessage::Close {
            id: id.into(),
            code,
            reason,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Connect { .. } => MessageKind::Connect,
            WireMessage::Open { .. } => MessageKind::Open,
            WireMessage::Data { .. } => MessageKind::Data,
            WireMessage::Close { .. } => MessageKind::Close,
        }
    }

    /// The channel id this message is routed by, `None` for `connect`.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            WireMessage::Connect { .. } => None,
            WireMessage::Open { id, .. }
            | WireMessage::Data { id, .. }
            | WireMessage::Close { id, .. } => Some(id),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            WireMessage::Connect { reference, name } => {
                if reference.is_empty() {
                    return Err(MuxError::InvalidMessage(
                        "connect without a reference".to_string(),
                    ));
                }
                if name.trim_matches('/').is_empty() {
                    return Err(MuxError::InvalidMessage(
                        "connect without a backend name".to_string(),
                    ));
                }
            }
            WireMessage::Open { id, reference } => {
                if id.is_empty() || reference.is_empty() {
                    return Err(MuxError::InvalidMessage(
                        "open requires both id and ref".to_string(),
                    ));
                }
            }
            WireMessage::Data { id, .. } | WireMessage::Close { id, .. } => {
                if id.is_empty() {
                    return Err(MuxError::InvalidMessage(format!(
                        "{} without a channel id",
                        self.kind()
                    )));
                }
            }
        }
        Ok(())
    }
}
