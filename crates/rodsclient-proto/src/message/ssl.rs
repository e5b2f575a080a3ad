use crate::error::Result;
use crate::frame::{msg_type, Message, MessageHeader};
use crate::message::Request;
use crate::xml::Correction;

/// Encryption parameters announced after the TLS handshake.
///
/// The message is a bare header: the algorithm name travels as the message
/// type and the three numbers reuse the segment-length fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslSettings {
    pub algorithm: String,
    pub key_size: u32,
    pub salt_size: u32,
    pub hash_rounds: u32,
}

impl Request for SslSettings {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::header_only(MessageHeader {
            msg_type: self.algorithm.clone(),
            message_len: self.key_size,
            error_len: self.salt_size,
            bs_len: self.hash_rounds,
            int_info: 0,
        }))
    }

    fn correction(&self) -> Correction {
        Correction::Raw
    }
}

/// The raw shared secret, sent as the message body.
#[derive(Clone, PartialEq, Eq)]
pub struct SslSharedSecret {
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for SslSharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslSharedSecret")
            .field("len", &self.secret.len())
            .finish()
    }
}

impl Request for SslSharedSecret {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::new(msg_type::SHARED_SECRET, self.secret.clone(), 0))
    }

    fn correction(&self) -> Correction {
        Correction::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_are_header_only() {
        let settings = SslSettings {
            algorithm: "AES-256-CBC".into(),
            key_size: 32,
            salt_size: 8,
            hash_rounds: 16,
        };
        let msg = settings.to_message().unwrap();
        assert_eq!(msg.header.msg_type, "AES-256-CBC");
        assert_eq!(msg.header.message_len, 32);
        assert_eq!(msg.header.error_len, 8);
        assert_eq!(msg.header.bs_len, 16);
        assert!(msg.body.is_empty());
        assert_eq!(settings.correction(), Correction::Raw);
    }

    #[test]
    fn test_shared_secret_debug_hides_key() {
        let secret = SslSharedSecret {
            secret: vec![7; 32],
        };
        let msg = secret.to_message().unwrap();
        assert_eq!(msg.header.msg_type, "SHARED_SECRET");
        assert_eq!(msg.header.message_len, 32);
        assert_eq!(format!("{:?}", secret), "SslSharedSecret { len: 32 }");
    }
}
