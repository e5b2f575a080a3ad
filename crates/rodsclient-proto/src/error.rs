use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid header length: {len} bytes")]
    InvalidHeaderLength { len: u32 },

    #[error("invalid message header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: String, got: String },

    #[error("xml error: {0}")]
    Xml(String),

    #[error("unexpected root element: expected <{expected}>, got <{got}>")]
    UnexpectedRoot { expected: String, got: String },

    #[error("missing element <{name}> in <{parent}>")]
    MissingElement { parent: String, name: String },

    #[error("invalid value {value:?} for <{name}>")]
    InvalidValue { name: String, value: String },

    #[error("invalid utf-8 character in xml payload ({} bytes)", .original.len())]
    InvalidUtf8 { original: Vec<u8> },

    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty message body")]
    EmptyBody,

    #[error("service error {code} ({name}){}", format_message(.message))]
    Service {
        code: i32,
        name: &'static str,
        message: Option<String>,
    },
}

fn format_message(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(": {}", m),
        _ => String::new(),
    }
}

impl ProtoError {
    /// Builds a service error for a negative result code.
    pub fn service(code: i32) -> Self {
        ProtoError::Service {
            code,
            name: crate::codes::error_name(code),
            message: None,
        }
    }

    pub fn service_with_message(code: i32, message: impl Into<String>) -> Self {
        ProtoError::Service {
            code,
            name: crate::codes::error_name(code),
            message: Some(message.into()),
        }
    }

    pub fn missing(parent: &str, name: &str) -> Self {
        ProtoError::MissingElement {
            parent: parent.to_string(),
            name: name.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
