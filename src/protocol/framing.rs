//! Length-prefixed message framing.
//!
//! Frames are `[4-byte big-endian length][UTF-8 JSON body]`. The codec
//! verifies the declared length against the configured limit before any
//! body bytes are buffered, so an attacker-controlled header can never
//! force unbounded allocation.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::protocol::message::Message;

/// Default maximum message size in bytes (10 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Length header size in bytes.
const HEADER_LEN: usize = 4;

/// Codec for length-prefixed protocol messages.
///
/// One `decode` call consumes exactly one frame; bytes belonging to the
/// next frame are left in the buffer.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Creates a codec with an explicit message size limit.
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Returns the configured message size limit.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let body_len = u32::from_be_bytes(header) as usize;

        // Checked before the body is read or buffered.
        if body_len > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                limit: self.max_message_size,
            });
        }

        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len);
        Message::from_body(&body).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed(format!(
                "stream ended mid-frame ({} bytes of partial frame)",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(&msg)?;
        if body.len() > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                limit: self.max_message_size,
            });
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: body.len(),
            limit: u32::MAX as usize,
        })?);
        dst.put_slice(&body);
        Ok(())
    }
}
