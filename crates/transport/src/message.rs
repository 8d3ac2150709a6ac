// SPDX-License-Identifier: Apache-2.0

//! Framed binary messages.
//!
//! Every message starts with a 16-byte little-endian header
//! `{message_length, request_id, response_to, op_code}` followed by
//! `message_length - 16` body bytes. The transport does not parse bodies;
//! it only enforces the framing bounds.

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::{Read, Write};

/// Size of the fixed message header.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Maximum accepted frame length, header included.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

/// Known operation codes. Bodies of other operations pass through the
/// transport opaquely, but these two shape its behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum OpCode {
    /// A compressed frame wrapping another message.
    Compressed = 2012,
    /// A regular message.
    Msg = 2013,
}

/// The fixed 16-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame length in bytes, header included.
    pub message_length: i32,
    /// Client-assigned request identifier.
    pub request_id: i32,
    /// The `request_id` this message responds to, or 0.
    pub response_to: i32,
    /// Operation code.
    pub op_code: i32,
}

impl MessageHeader {
    /// Parses a header from the first 16 bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::InvalidMessage {
                reason: format!("header requires 16 bytes, got {}", data.len()),
            });
        }
        let mut buf = data;
        Ok(Self {
            message_length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: buf.get_i32_le(),
        })
    }

    /// Validates the advertised frame length.
    pub fn validate_length(&self) -> Result<usize, Error> {
        let Ok(length) = usize::try_from(self.message_length) else {
            return Err(Error::InvalidMessage {
                reason: format!("negative message length {}", self.message_length),
            });
        };
        if length < MESSAGE_HEADER_SIZE {
            return Err(Error::InvalidMessage {
                reason: format!("message length {length} below header size"),
            });
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(length)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }
}

/// A complete framed message (header plus body) backed by shared bytes,
/// so clones are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    data: Bytes,
}

impl Message {
    /// Builds a message from header fields and a body.
    pub fn new(request_id: i32, response_to: i32, op_code: i32, body: &[u8]) -> Result<Self, Error> {
        let length = MESSAGE_HEADER_SIZE + body.len();
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let Ok(message_length) = i32::try_from(length) else {
            return Err(Error::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        };
        let mut buf = BytesMut::with_capacity(length);
        MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code,
        }
        .put(&mut buf);
        buf.put_slice(body);
        Ok(Self { data: buf.freeze() })
    }

    /// Wraps an already-framed byte buffer, validating the header.
    pub fn from_bytes(data: Bytes) -> Result<Self, Error> {
        let header = MessageHeader::parse(&data)?;
        let length = header.validate_length()?;
        if length != data.len() {
            return Err(Error::InvalidMessage {
                reason: format!(
                    "header advertises {length} bytes but frame carries {}",
                    data.len()
                ),
            });
        }
        Ok(Self { data })
    }

    /// The parsed header.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        // The constructor validated the frame; 16 bytes are present.
        MessageHeader::parse(&self.data).unwrap_or(MessageHeader {
            message_length: 0,
            request_id: 0,
            response_to: 0,
            op_code: 0,
        })
    }

    /// The body bytes (everything after the header).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data[MESSAGE_HEADER_SIZE..]
    }

    /// The full frame.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reads one framed message.
    ///
    /// A clean EOF before any header byte maps to
    /// [`Error::SessionClosed`]; a torn frame is a socket error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::SessionClosed
            } else {
                Error::socket("failed to read message header", e)
            }
        })?;

        let header = MessageHeader::parse(&header_bytes)?;
        let length = header.validate_length()?;

        let mut buf = BytesMut::with_capacity(length);
        buf.put_slice(&header_bytes);
        buf.resize(length, 0);
        reader
            .read_exact(&mut buf[MESSAGE_HEADER_SIZE..])
            .map_err(|e| Error::socket("failed to read message body", e))?;
        Ok(Self { data: buf.freeze() })
    }

    /// Writes the full frame.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writer
            .write_all(&self.data)
            .map_err(|e| Error::socket("failed to write message", e))?;
        writer
            .flush()
            .map_err(|e| Error::socket("failed to flush message", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_byte_stream() {
        let message =
            Message::new(7, 0, OpCode::Msg as i32, b"hello world").expect("message builds");
        assert_eq!(message.header().message_length, 16 + 11);
        assert_eq!(message.header().request_id, 7);
        assert_eq!(message.body(), b"hello world");

        let mut wire = Vec::new();
        message.write_to(&mut wire).expect("write succeeds");
        let parsed = Message::read_from(&mut wire.as_slice()).expect("read succeeds");
        assert_eq!(parsed, message);
    }

    #[test]
    fn empty_body_is_a_valid_frame() {
        let message = Message::new(1, 0, OpCode::Msg as i32, b"").expect("message builds");
        assert_eq!(message.header().message_length, 16);
        assert!(message.body().is_empty());
    }

    #[test]
    fn eof_at_frame_boundary_is_session_closed() {
        let result = Message::read_from(&mut [].as_slice());
        assert!(matches!(result, Err(Error::SessionClosed)));
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_i32_le(8); // below header size
        frame.put_i32_le(0);
        frame.put_i32_le(0);
        frame.put_i32_le(OpCode::Msg as i32);
        let result = Message::read_from(&mut frame.freeze().as_ref());
        assert!(matches!(result, Err(Error::InvalidMessage { .. })));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_i32_le(i32::try_from(MAX_MESSAGE_SIZE + 1).expect("fits in i32"));
        frame.put_i32_le(0);
        frame.put_i32_le(0);
        frame.put_i32_le(OpCode::Msg as i32);
        let result = Message::read_from(&mut frame.freeze().as_ref());
        assert!(matches!(result, Err(Error::MessageTooLarge { .. })));
    }

    #[test]
    fn from_bytes_rejects_length_mismatch() {
        let message = Message::new(1, 0, OpCode::Msg as i32, b"abc").expect("message builds");
        let mut truncated = BytesMut::from(message.as_bytes());
        let _ = truncated.split_off(truncated.len() - 1);
        let result = Message::from_bytes(truncated.freeze());
        assert!(matches!(result, Err(Error::InvalidMessage { .. })));
    }

    #[test]
    fn op_codes_map_to_wire_values() {
        assert_eq!(OpCode::try_from(2012), Ok(OpCode::Compressed));
        assert_eq!(OpCode::try_from(2013), Ok(OpCode::Msg));
        assert!(OpCode::try_from(0).is_err());
    }
}
