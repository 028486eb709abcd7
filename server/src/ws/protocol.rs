//! Envelope schema and JSON codec.
//!
//! Outbound envelopes are always built server-side. Inbound client frames go
//! through [`InboundFrame`], which keeps only the `content` payload; every
//! other field is re-stamped from the sending session's identity.

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Envelope discriminant, carried on the wire as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Join,
    Leave,
    Chat,
    Error,
    Welcome,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 5] = [
        EnvelopeKind::Join,
        EnvelopeKind::Leave,
        EnvelopeKind::Chat,
        EnvelopeKind::Error,
        EnvelopeKind::Welcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Chat => "chat",
            Self::Error => "error",
            Self::Welcome => "welcome",
        }
    }
}

/// A message exchanged between the Hub and connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub username: String,
    /// Absent only for errors raised before an identity was assigned.
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    fn server(kind: EnvelopeKind, member_id: &str, username: &str, content: String) -> Self {
        Self {
            kind,
            username: username.to_string(),
            member_id: Some(member_id.to_string()),
            content: Some(content),
            timestamp: Utc::now(),
        }
    }

    /// Unicast to a freshly registered session.
    pub fn welcome(member_id: &str, username: &str) -> Self {
        Self::server(
            EnvelopeKind::Welcome,
            member_id,
            username,
            "Welcome to the chat!".to_string(),
        )
    }

    pub fn join(member_id: &str, username: &str) -> Self {
        Self::server(
            EnvelopeKind::Join,
            member_id,
            username,
            format!("{} ({}) joined the chat", username, member_id),
        )
    }

    pub fn leave(member_id: &str, username: &str) -> Self {
        Self::server(
            EnvelopeKind::Leave,
            member_id,
            username,
            format!("{} ({}) left the chat", username, member_id),
        )
    }

    /// Chat message attributed to a verified sender.
    pub fn chat(member_id: &str, username: &str, content: Option<String>) -> Self {
        Self {
            kind: EnvelopeKind::Chat,
            username: username.to_string(),
            member_id: Some(member_id.to_string()),
            content,
            timestamp: Utc::now(),
        }
    }

    /// Server-side error notice. `member_id` is `None` before registration.
    pub fn error(member_id: Option<&str>, username: &str, message: &str) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            username: username.to_string(),
            member_id: member_id.map(str::to_string),
            content: Some(message.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Strict decode: `type`, `username` and `timestamp` must be present and
    /// `type` must be a known discriminant.
    pub fn decode(data: &str) -> Result<Self, CodecError> {
        serde_json::from_str(data).map_err(CodecError::Decode)
    }
}

/// A frame as sent by a client. Only `content` is ever trusted.
///
/// The remaining fields are parsed so that a malformed `type` still counts as
/// a protocol error, then discarded by [`InboundFrame::into_chat`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<EnvelopeKind>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "userId", default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<IgnoredAny>,
}

impl InboundFrame {
    /// Only JSON objects are accepted; arrays and scalars are protocol errors.
    pub fn decode(data: &str) -> Result<Self, CodecError> {
        let value: serde_json::Value = serde_json::from_str(data).map_err(CodecError::Decode)?;
        if !value.is_object() {
            return Err(CodecError::Decode(serde::de::Error::custom(
                "expected a JSON object",
            )));
        }
        serde_json::from_value(value).map_err(CodecError::Decode)
    }

    pub fn decode_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(data).map_err(|_| CodecError::Binary)?;
        Self::decode(text)
    }

    /// Stamp the frame with the sender's verified identity and server time.
    pub fn into_chat(self, member_id: &str, username: &str) -> Envelope {
        Envelope::chat(member_id, username, self.content)
    }
}
