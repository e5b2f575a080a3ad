//! Message framing.
//!
//! A frame on the wire is a 4-byte big-endian header length, the XML header
//! (`MsgHeader_PI`), then the message, error and binary segments in that
//! fixed order. Segment lengths come from the header.

use crate::error::{ProtoError, Result};
use crate::pack::{Element, PackWriter};

/// Size of the big-endian header length prefix.
pub const HEADER_LEN_PREFIX_SIZE: usize = 4;

/// Upper bound accepted for an incoming header.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Message type tokens carried in the header `type` field.
pub mod msg_type {
    pub const CONNECT: &str = "RODS_CONNECT";
    pub const VERSION: &str = "RODS_VERSION";
    pub const CS_NEG: &str = "RODS_CS_NEG_T";
    pub const API_REQ: &str = "RODS_API_REQ";
    pub const API_REPLY: &str = "RODS_API_REPLY";
    pub const DISCONNECT: &str = "RODS_DISCONNECT";
    pub const SHARED_SECRET: &str = "SHARED_SECRET";
}

/// The `MsgHeader_PI` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: String,
    pub message_len: u32,
    pub error_len: u32,
    pub bs_len: u32,
    pub int_info: i32,
}

impl MessageHeader {
    pub fn new(msg_type: impl Into<String>, int_info: i32) -> Self {
        Self {
            msg_type: msg_type.into(),
            int_info,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        PackWriter::new("MsgHeader_PI")
            .text("type", &self.msg_type)
            .num("msgLen", self.message_len)
            .num("errorLen", self.error_len)
            .num("bsLen", self.bs_len)
            .num("intInfo", self.int_info)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let root = Element::parse_root(bytes, "MsgHeader_PI").map_err(|e| {
            ProtoError::InvalidHeader {
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            msg_type: root.text_of("type")?.trim().to_string(),
            message_len: root.num_of("msgLen")?,
            error_len: root.num_of("errorLen")?,
            bs_len: root.num_of("bsLen")?,
            int_info: root.num_of("intInfo")?,
        })
    }

    /// Total number of body bytes following the header.
    pub fn body_len(&self) -> u64 {
        self.message_len as u64 + self.error_len as u64 + self.bs_len as u64
    }

    pub fn expect_type(&self, expected: &str) -> Result<()> {
        if self.msg_type != expected {
            return Err(ProtoError::UnexpectedType {
                expected: expected.to_string(),
                got: self.msg_type.clone(),
            });
        }
        Ok(())
    }
}

/// One framed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Vec<u8>,
    pub error: Vec<u8>,
    pub bs: Vec<u8>,
}

impl Message {
    /// Builds a message whose header lengths match its segments.
    pub fn new(msg_type: &str, body: Vec<u8>, int_info: i32) -> Self {
        let mut msg = Self {
            header: MessageHeader::new(msg_type, int_info),
            body,
            error: Vec::new(),
            bs: Vec::new(),
        };
        msg.sync_lengths();
        msg
    }

    /// A message made of its header alone. Its declared lengths are kept
    /// verbatim even though no segments follow.
    pub fn header_only(header: MessageHeader) -> Self {
        Self {
            header,
            ..Default::default()
        }
    }

    pub fn with_bs(mut self, bs: Vec<u8>) -> Self {
        self.bs = bs;
        self.sync_lengths();
        self
    }

    pub fn sync_lengths(&mut self) {
        self.header.message_len = self.body.len() as u32;
        self.header.error_len = self.error.len() as u32;
        self.header.bs_len = self.bs.len() as u32;
    }

    /// Encodes the length prefix, header, message and error segments. The
    /// binary segment is left to the caller so it can be streamed.
    pub fn encode_head(&self) -> Vec<u8> {
        let header = self.header.encode();
        let mut out =
            Vec::with_capacity(HEADER_LEN_PREFIX_SIZE + header.len() + self.body.len() + self.error.len());
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&self.error);
        out
    }

    /// Encodes the whole frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_head();
        out.extend_from_slice(&self.bs);
        out
    }

    /// Splits a received body into segments according to `header`.
    pub fn from_parts(header: MessageHeader, mut payload: Vec<u8>) -> Result<Self> {
        if payload.len() as u64 != header.message_len as u64 + header.error_len as u64 {
            return Err(ProtoError::InvalidHeader {
                reason: format!(
                    "payload of {} bytes does not match declared lengths {}+{}",
                    payload.len(),
                    header.message_len,
                    header.error_len
                ),
            });
        }
        let error = payload.split_off(header.message_len as usize);
        Ok(Self {
            header,
            body: payload,
            error,
            bs: Vec::new(),
        })
    }
}

/// Validates a received header length prefix.
pub fn parse_header_len(prefix: [u8; HEADER_LEN_PREFIX_SIZE]) -> Result<u32> {
    let len = u32::from_be_bytes(prefix);
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(ProtoError::InvalidHeaderLength { len });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = MessageHeader {
            msg_type: msg_type::API_REQ.to_string(),
            message_len: 10,
            error_len: 2,
            bs_len: 300,
            int_info: 110000,
        };
        let encoded = header.encode();
        assert_eq!(
            String::from_utf8(encoded.clone()).unwrap(),
            "<MsgHeader_PI><type>RODS_API_REQ</type><msgLen>10</msgLen><errorLen>2</errorLen><bsLen>300</bsLen><intInfo>110000</intInfo></MsgHeader_PI>"
        );
        assert_eq!(MessageHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_negative_int_info() {
        let mut header = MessageHeader::new(msg_type::API_REPLY, -826000);
        header.message_len = 0;
        let decoded = MessageHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.int_info, -826000);
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::new(msg_type::API_REQ, b"<a/>".to_vec(), 7).with_bs(vec![1, 2, 3]);
        let bytes = msg.encode();
        let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header = MessageHeader::decode(&bytes[4..4 + header_len]).unwrap();
        assert_eq!(header.message_len, 4);
        assert_eq!(header.bs_len, 3);
        assert_eq!(&bytes[4 + header_len..4 + header_len + 4], b"<a/>");
        assert_eq!(&bytes[bytes.len() - 3..], &[1, 2, 3]);
    }

    #[test]
    fn test_header_only_keeps_declared_lengths() {
        let header = MessageHeader {
            msg_type: "AES-256-CBC".to_string(),
            message_len: 32,
            error_len: 8,
            bs_len: 16,
            int_info: 0,
        };
        let msg = Message::header_only(header);
        let head = msg.encode_head();
        let header_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        assert_eq!(head.len(), 4 + header_len);
        let decoded = MessageHeader::decode(&head[4..]).unwrap();
        assert_eq!(decoded.message_len, 32);
        assert_eq!(decoded.error_len, 8);
        assert_eq!(decoded.bs_len, 16);
    }

    #[test]
    fn test_from_parts_splits_segments() {
        let mut header = MessageHeader::new(msg_type::API_REPLY, 0);
        header.message_len = 3;
        header.error_len = 2;
        let msg = Message::from_parts(header.clone(), b"abcde".to_vec()).unwrap();
        assert_eq!(msg.body, b"abc");
        assert_eq!(msg.error, b"de");
        assert!(Message::from_parts(header, b"abc".to_vec()).is_err());
    }

    #[test]
    fn test_parse_header_len() {
        assert!(matches!(
            parse_header_len([0, 0, 0, 0]),
            Err(ProtoError::InvalidHeaderLength { len: 0 })
        ));
        assert_eq!(parse_header_len([0, 0, 0, 150]).unwrap(), 150);
        assert!(parse_header_len([0xff, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_garbage_header() {
        assert!(matches!(
            MessageHeader::decode(b"<Other/>"),
            Err(ProtoError::InvalidHeader { .. })
        ));
    }
}
