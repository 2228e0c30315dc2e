//! Message model for the conductor wire protocol.
//!
//! A [`Message`] is the unit of exchange between conductor and player:
//! a protocol version, one of six closed message types, and a JSON
//! object payload. Messages are immutable once constructed and exist
//! only for the duration of one frame transmission.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// The single supported protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

/// Closed set of message types on the wire.
///
/// New message types are a compile-time-checked addition: every
/// dispatch site matches exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Conductor identity announcement.
    Config,
    /// Phase download (step list + results endpoint).
    Phase,
    /// Trigger execution of all pending phases.
    Run,
    /// One result envelope (a `RetVal`).
    Result,
    /// Terminal sentinel message type.
    Done,
    /// Error report.
    Error,
}

impl MessageType {
    /// Returns the lowercase wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Phase => "phase",
            Self::Run => "run",
            Self::Result => "result",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "phase" => Ok(Self::Phase),
            "run" => Ok(Self::Run),
            "result" => Ok(Self::Result),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// One framed protocol message: `{version, type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Protocol version, always [`PROTOCOL_VERSION`] for outgoing frames.
    pub version: u64,
    /// Message type tag.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Type-specific payload, always a JSON object.
    pub data: Value,
}

impl Message {
    /// Creates a message stamped with the current protocol version.
    #[must_use]
    pub const fn new(msg_type: MessageType, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            data,
        }
    }

    /// Parses a message from a decoded frame body.
    ///
    /// Validation order matches the checks a receiver must make before
    /// trusting any field: the body must be a JSON object, carry a
    /// `version` equal to the single supported version, a known `type`
    /// string, and an object `data` payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if any of those checks fail.
    pub fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::InvalidMessage(format!("body is not valid JSON: {e}")))?;

        let Value::Object(map) = value else {
            return Err(ProtocolError::InvalidMessage(
                "body is not a JSON object".to_string(),
            ));
        };

        let version = map
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::InvalidMessage("missing version field".to_string()))?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let msg_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidMessage("missing type field".to_string()))?
            .parse::<MessageType>()?;

        let data = map
            .get("data")
            .cloned()
            .ok_or_else(|| ProtocolError::InvalidMessage("missing data field".to_string()))?;
        if !data.is_object() {
            return Err(ProtocolError::InvalidMessage(
                "data is not a JSON object".to_string(),
            ));
        }

        Ok(Self {
            version,
            msg_type,
            data,
        })
    }
}
