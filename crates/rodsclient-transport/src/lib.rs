//! rodsclient-transport: the iRODS connection.
//!
//! Dialing, client/server negotiation, the in-place TLS upgrade with its
//! shared-secret bootstrap, framed request/response exchange (synchronous,
//! fire-and-forget and pipelined) and authentication with the native, PAM
//! password and interactive PAM schemes.

pub mod auth;
mod channel;
pub mod config;
pub mod connection;
pub mod dial;
pub mod encryption;
pub mod error;
pub mod framer;
pub mod metrics;
pub mod pipeline;
pub mod tls;

pub use auth::input::{InteractiveInput, ScriptedInput, TerminalInput};
pub use auth::{authenticate_client, AuthContext, AuthPlugin};
pub use config::{Account, AuthScheme, ConnectionConfig, ServerVerification, SslConfig};
pub use connection::{CallOptions, Connection};
pub use dial::{Dialer, TcpDialer};
pub use encryption::{EncryptionAlgorithm, SharedSecret};
pub use error::{ConnectPhase, Result, TransportError};
pub use framer::{BoxedStream, IoStream, ProgressCallback};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use pipeline::{RequestResponsePair, PIPELINE_DEPTH};
pub use tls::TlsUpgrader;

/// Installs a test-friendly `tracing` subscriber filtered by `RUST_LOG`.
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
