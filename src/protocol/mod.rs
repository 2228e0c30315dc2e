//! Wire protocol for conductor↔player communication.
//!
//! Every exchange on the wire is one [`Message`]: a typed, versioned
//! JSON object carried in a length-prefixed frame. [`MessageCodec`]
//! handles the framing, [`RetVal`] is the result envelope both sides
//! share, and [`ResultSink`] is the seam through which phase results
//! are streamed back to the conductor.

pub mod framing;
pub mod message;
pub mod retval;

pub use framing::{DEFAULT_MAX_MESSAGE_SIZE, MessageCodec};
pub use message::{Message, MessageType, PROTOCOL_VERSION};
pub use retval::{ResultSink, RetCode, RetVal};

use crate::error::ProtocolError;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
