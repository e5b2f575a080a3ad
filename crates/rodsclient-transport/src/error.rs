use std::fmt;

use rodsclient_proto::ProtoError;
use thiserror::Error;

/// Stage of [`Connection::connect`](crate::Connection::connect) that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Dial,
    Negotiation,
    TlsBootstrap,
    Authentication,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectPhase::Dial => "dial",
            ConnectPhase::Negotiation => "negotiation",
            ConnectPhase::TlsBootstrap => "tls bootstrap",
            ConnectPhase::Authentication => "authentication",
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {reason}")]
    Connection { reason: String },

    #[error("invalid connection configuration for {account}: {reason}")]
    ConnectionConfig { account: String, reason: String },

    /// The server refused the credentials or a login step. When the refusal
    /// came back as a service error it is kept as the source.
    #[error("authentication failed for {account}: {reason}")]
    Auth {
        account: String,
        reason: String,
        #[source]
        source: Option<Box<TransportError>>,
    },

    #[error("authentication flow error: {reason}")]
    AuthFlow { reason: String },

    #[error("authentication operation not found: {operation}")]
    AuthOperationNotFound { operation: String },

    #[error("invalid utf-8 character in xml payload ({} bytes)", .original.len())]
    InvalidUtf8 { original: Vec<u8> },

    #[error("service error {code} ({name}){}", format_message(.message))]
    Service {
        code: i32,
        name: &'static str,
        message: Option<String>,
    },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("TLS error: {reason}")]
    Tls { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("encryption error: {reason}")]
    Encryption { reason: String },

    #[error("protocol error: {0}")]
    Protocol(ProtoError),

    #[error("connect failed during {phase}: {source}")]
    Connect {
        phase: ConnectPhase,
        #[source]
        source: Box<TransportError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_message(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(": {}", m),
        _ => String::new(),
    }
}

impl From<ProtoError> for TransportError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::InvalidUtf8 { original } => TransportError::InvalidUtf8 { original },
            ProtoError::Service {
                code,
                name,
                message,
            } => TransportError::Service {
                code,
                name,
                message,
            },
            ProtoError::InvalidHeaderLength { len } => TransportError::InvalidFrame {
                reason: format!("header length {}", len),
            },
            ProtoError::InvalidHeader { reason } => TransportError::InvalidFrame { reason },
            other => TransportError::Protocol(other),
        }
    }
}

impl TransportError {
    pub fn connection(reason: impl Into<String>) -> Self {
        TransportError::Connection {
            reason: reason.into(),
        }
    }

    pub fn auth_flow(reason: impl Into<String>) -> Self {
        TransportError::AuthFlow {
            reason: reason.into(),
        }
    }

    pub(crate) fn in_phase(self, phase: ConnectPhase) -> Self {
        match self {
            already @ TransportError::Connect { .. } => already,
            other => TransportError::Connect {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The service result code, looking through connect-phase and
    /// authentication wrapping.
    pub fn service_code(&self) -> Option<i32> {
        match self {
            TransportError::Service { code, .. } => Some(*code),
            TransportError::Connect { source, .. } => source.service_code(),
            TransportError::Auth {
                source: Some(source), ..
            } => source.service_code(),
            _ => None,
        }
    }

    /// Whether the error came from the socket rather than from the service.
    /// Such errors leave the connection unusable.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            TransportError::Connection { .. }
            | TransportError::ShortRead { .. }
            | TransportError::InvalidFrame { .. }
            | TransportError::Timeout { .. }
            | TransportError::Tls { .. }
            | TransportError::NotConnected
            | TransportError::Io(_) => true,
            TransportError::Connect { source, .. } => source.is_transport_failure(),
            _ => false,
        }
    }

    pub fn phase(&self) -> Option<ConnectPhase> {
        match self {
            TransportError::Connect { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_errors_map_to_dedicated_variants() {
        let err: TransportError = ProtoError::InvalidUtf8 {
            original: vec![0xc3, 0x28],
        }
        .into();
        assert!(matches!(err, TransportError::InvalidUtf8 { ref original } if original == &[0xc3, 0x28]));

        let err: TransportError = ProtoError::service(-826000).into();
        assert_eq!(err.service_code(), Some(-826000));
        assert_eq!(
            err.to_string(),
            "service error -826000 (CAT_INVALID_AUTHENTICATION)"
        );

        let err: TransportError = ProtoError::InvalidHeaderLength { len: 0 }.into();
        assert!(err.is_transport_failure());

        let err: TransportError = ProtoError::EmptyBody.into();
        assert!(matches!(err, TransportError::Protocol(ProtoError::EmptyBody)));
    }

    #[test]
    fn test_connect_phase_wrapping() {
        let err = TransportError::ShortRead {
            expected: 10,
            actual: 3,
        }
        .in_phase(ConnectPhase::Negotiation);
        assert_eq!(err.phase(), Some(ConnectPhase::Negotiation));
        assert!(err.is_transport_failure());
        assert_eq!(
            err.to_string(),
            "connect failed during negotiation: short read: expected 10 bytes, got 3"
        );

        let rewrapped = err.in_phase(ConnectPhase::Authentication);
        assert_eq!(rewrapped.phase(), Some(ConnectPhase::Negotiation));
    }

    #[test]
    fn test_service_errors_are_not_transport_failures() {
        let err = TransportError::Service {
            code: -808000,
            name: "CAT_NO_ROWS_FOUND",
            message: None,
        };
        assert!(!err.is_transport_failure());
        assert!(!TransportError::auth_flow("missing next_operation").is_transport_failure());
    }

    #[test]
    fn test_service_code_through_auth_refusal() {
        let refusal = TransportError::Auth {
            account: "rods#tempZone@localhost:1247".to_string(),
            reason: "native login refused".to_string(),
            source: Some(Box::new(ProtoError::service(-826000).into())),
        }
        .in_phase(ConnectPhase::Authentication);
        assert_eq!(refusal.service_code(), Some(-826000));
        assert!(!refusal.is_transport_failure());

        let source = std::error::Error::source(&refusal).unwrap();
        let source = source.downcast_ref::<TransportError>().unwrap();
        assert!(matches!(source, TransportError::Auth { .. }));
        assert!(std::error::Error::source(source).is_some());
    }
}
