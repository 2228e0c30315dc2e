//! Result envelope shared by conductor and player.
//!
//! Every step execution and every protocol-level acknowledgment is a
//! [`RetVal`]: a closed result code plus a message string. The `Done`
//! code is a synthetic sentinel that terminates a phase's result
//! stream; it is never produced by a real command.

use std::fmt;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::ProtocolError;
use crate::protocol::framing::MessageCodec;
use crate::protocol::message::{Message, MessageType};

/// Closed set of result codes with fixed wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    /// Command succeeded (wire code 0).
    Ok,
    /// Command or protocol operation failed (wire code 1).
    Error,
    /// Request was not a recognized command (wire code 2).
    BadCmd,
    /// Terminal sentinel for a result stream (wire code 65535).
    Done,
}

impl RetCode {
    /// Returns the numeric wire code for this value.
    #[must_use]
    pub const fn wire_code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::BadCmd => 2,
            Self::Done => 65535,
        }
    }

    /// Maps a numeric wire code back to a `RetCode`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMessage`] for any code outside the
    /// closed set; result codes are never free-form.
    pub fn from_wire(code: u64) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            2 => Ok(Self::BadCmd),
            65535 => Ok(Self::Done),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown result code: {other}"
            ))),
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::BadCmd => "bad_cmd",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

impl Serialize for RetCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.wire_code())
    }
}

impl<'de> Deserialize<'de> for RetCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Self::from_wire(code).map_err(de::Error::custom)
    }
}

/// The result envelope: `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetVal {
    /// Result code, always one of the four closed values.
    pub code: RetCode,
    /// Human-readable payload (command output, error reason, …).
    pub message: String,
}

impl RetVal {
    /// Creates a success result.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: RetCode::Ok,
            message: message.into(),
        }
    }

    /// Creates an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: RetCode::Error,
            message: message.into(),
        }
    }

    /// Creates a bad-command result.
    pub fn bad_cmd(message: impl Into<String>) -> Self {
        Self {
            code: RetCode::BadCmd,
            message: message.into(),
        }
    }

    /// Creates the terminal sentinel.
    #[must_use]
    pub fn done() -> Self {
        Self {
            code: RetCode::Done,
            message: "phase complete".to_string(),
        }
    }

    /// Returns `true` if this is the stream-terminating sentinel.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.code, RetCode::Done)
    }

    /// Serializes this envelope into RESULT message data.
    ///
    /// Infallible by construction: the envelope is a numeric code and a
    /// `String`, both always representable as JSON.
    #[must_use]
    pub fn to_data(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.wire_code(),
            "message": self.message,
        })
    }

    /// Parses an envelope out of RESULT message data.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMessage`] if the data is missing
    /// either field or carries an unknown code.
    pub fn from_data(data: &serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(data.clone())
            .map_err(|e| ProtocolError::InvalidMessage(format!("malformed result: {e}")))
    }
}

impl fmt::Display for RetVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Destination for a phase's result stream.
///
/// The production sink is a framed TCP connection back to the
/// conductor; tests substitute an in-memory sink.
#[async_trait]
pub trait ResultSink: Send {
    /// Sends one result envelope as a RESULT message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the underlying transport fails.
    async fn send(&mut self, retval: &RetVal) -> Result<(), ProtocolError>;
}

#[async_trait]
impl<T> ResultSink for Framed<T, MessageCodec>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, retval: &RetVal) -> Result<(), ProtocolError> {
        SinkExt::send(self, Message::new(MessageType::Result, retval.to_data())).await
    }
}
