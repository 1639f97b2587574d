//! Wire protocol for relog replication traffic.
//!
//! Every message is a fixed 8-byte header followed by `payload_size` bytes of
//! UTF-8 payload. Both header words are little-endian:
//!
//! ```text
//! word 0: bit 31      = kind (0 = request, 1 = response)
//!         bits 0..=30 = sequence number
//! word 1: payload size in bytes
//! ```
//!
//! Sequence number 0 is reserved for health checks. A response with an empty
//! payload is an acknowledgement; a non-empty response payload is the
//! human-readable reason the peer failed the request.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Header size in bytes (kind+sequence:4 + payload_size:4).
pub const HEADER_SIZE: usize = 8;

/// Bit of the first header word that carries the message kind.
pub const KIND_BIT: u32 = 1 << 31;

/// Largest sequence number representable in the header.
pub const MAX_SEQUENCE: u32 = KIND_BIT - 1;

/// Sequence number carried by health-check traffic.
pub const HEALTHCHECK_SEQUENCE: u32 = 0;

/// Upper bound on payload sizes accepted from the wire.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Sent by the master: a record to store, or a health probe.
    Request,
    /// Sent by a follower in answer to a request.
    Response,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Response => write!(f, "RESPONSE"),
        }
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message direction.
    pub kind: MessageKind,
    /// Write sequence number, or [`HEALTHCHECK_SEQUENCE`].
    pub sequence: u32,
    /// Number of payload bytes following the header.
    pub payload_size: u32,
}

impl MessageHeader {
    /// Create a new header.
    pub fn new(kind: MessageKind, sequence: u32, payload_size: u32) -> Self {
        Self {
            kind,
            sequence,
            payload_size,
        }
    }

    /// True for health-check traffic.
    pub fn is_health_check(&self) -> bool {
        self.sequence == HEALTHCHECK_SEQUENCE
    }

    /// Encode into the 8-byte wire form.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        if self.sequence > MAX_SEQUENCE {
            return Err(TransportError::SequenceOutOfRange {
                sequence: self.sequence,
            });
        }

        let mut word = self.sequence;
        if self.kind == MessageKind::Response {
            word |= KIND_BIT;
        }

        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&word.to_le_bytes());
        buf[4..].copy_from_slice(&self.payload_size.to_le_bytes());
        Ok(buf)
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(TransportError::InvalidHeader {
                reason: format!("expected {} bytes, got {}", HEADER_SIZE, buf.len()),
            });
        }

        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let payload_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let kind = if word & KIND_BIT == 0 {
            MessageKind::Request
        } else {
            MessageKind::Response
        };

        Ok(Self {
            kind,
            sequence: word & MAX_SEQUENCE,
            payload_size,
        })
    }
}

/// A header together with its payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    payload: String,
}

impl Message {
    fn build(kind: MessageKind, sequence: u32, payload: String) -> Result<Self> {
        if sequence > MAX_SEQUENCE {
            return Err(TransportError::SequenceOutOfRange { sequence });
        }
        let size = payload.len() as u64;
        if size > MAX_PAYLOAD_SIZE as u64 {
            return Err(TransportError::PayloadTooLarge {
                size,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            header: MessageHeader::new(kind, sequence, size as u32),
            payload,
        })
    }

    /// A data request carrying one record.
    pub fn request(sequence: u32, record: impl Into<String>) -> Result<Self> {
        Self::build(MessageKind::Request, sequence, record.into())
    }

    /// A successful acknowledgement of `sequence`.
    pub fn response(sequence: u32) -> Result<Self> {
        Self::build(MessageKind::Response, sequence, String::new())
    }

    /// A failed acknowledgement of `sequence` carrying the reason.
    pub fn error_response(sequence: u32, reason: impl Into<String>) -> Result<Self> {
        Self::build(MessageKind::Response, sequence, reason.into())
    }

    /// Health probe sent by the master.
    pub fn health_check_request() -> Self {
        Self {
            header: MessageHeader::new(MessageKind::Request, HEALTHCHECK_SEQUENCE, 0),
            payload: String::new(),
        }
    }

    /// Answer to a health probe.
    pub fn health_check_response() -> Self {
        Self {
            header: MessageHeader::new(MessageKind::Response, HEALTHCHECK_SEQUENCE, 0),
            payload: String::new(),
        }
    }

    /// Reassemble a message from a decoded header and its payload.
    pub fn from_parts(header: MessageHeader, payload: String) -> Result<Self> {
        if payload.len() as u64 != header.payload_size as u64 {
            return Err(TransportError::InvalidHeader {
                reason: format!(
                    "header announces {} payload bytes, got {}",
                    header.payload_size,
                    payload.len()
                ),
            });
        }
        Ok(Self { header, payload })
    }

    /// The decoded header.
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Request or response.
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// Sequence number; 0 for health checks.
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Record text, or the error reason of a failed response.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.header.encode()?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(self.payload.as_bytes());
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let header = MessageHeader::new(MessageKind::Request, 5, 3);
        let buf = header.encode().unwrap();
        assert_eq!(buf, [5, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_response_sets_kind_bit() {
        let header = MessageHeader::new(MessageKind::Response, 1, 0);
        let buf = header.encode().unwrap();
        assert_eq!(buf, [1, 0, 0, 0x80, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_max_sequence_response() {
        let header = MessageHeader::new(MessageKind::Response, MAX_SEQUENCE, u32::MAX);
        let decoded = MessageHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_encode_rejects_sequence_over_31_bits() {
        let header = MessageHeader::new(MessageKind::Request, KIND_BIT, 0);
        assert!(matches!(
            header.encode(),
            Err(TransportError::SequenceOutOfRange { .. })
        ));
        assert!(Message::request(KIND_BIT, "x").is_err());
    }

    #[test]
    fn test_decode_short_buffer_is_invalid_header() {
        let result = MessageHeader::decode(&[0u8; 7]);
        assert!(matches!(result, Err(TransportError::InvalidHeader { .. })));
    }

    #[test]
    fn test_health_check_messages() {
        let request = Message::health_check_request();
        assert!(request.header().is_health_check());
        assert_eq!(request.kind(), MessageKind::Request);
        assert_eq!(request.header().payload_size, 0);

        let response = Message::health_check_response();
        assert!(response.header().is_health_check());
        assert_eq!(response.kind(), MessageKind::Response);
    }

    #[test]
    fn test_encode_message_appends_utf8_payload() {
        let msg = Message::request(7, "héllo").unwrap();
        assert_eq!(msg.header().payload_size, 6);

        let buf = msg.encode().unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 6);
        assert_eq!(&buf[HEADER_SIZE..], "héllo".as_bytes());
    }

    #[test]
    fn test_empty_payload_encodes_header_only() {
        let buf = Message::response(9).unwrap().encode().unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_from_parts_checks_size() {
        let header = MessageHeader::new(MessageKind::Response, 2, 4);
        assert!(Message::from_parts(header, "oops".to_string()).is_ok());
        assert!(Message::from_parts(header, "no".to_string()).is_err());
    }
}
