//! Test Harness - accounts, stream plumbing and TLS identities for
//! end-to-end runs.

use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use rodsclient_proto::NegotiationPolicy;
use rodsclient_transport::{Account, BoxedStream, ConnectionConfig, Dialer, ServerVerification, SslConfig, TransportError};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;

pub const TEST_USER: &str = "rods";
pub const TEST_ZONE: &str = "tempZone";
pub const TEST_PASSWORD: &str = "demo";

/// A native account for the fake server.
pub fn native_account(host: &str, port: u16) -> Account {
    Account::new(host, port, TEST_USER, TEST_ZONE, TEST_PASSWORD)
}

/// A native account that asks to negotiate with `policy`. The SSL section
/// accepts any certificate.
pub fn negotiating_account(host: &str, port: u16, policy: NegotiationPolicy) -> Account {
    let mut account = native_account(host, port);
    account.cs_negotiation = true;
    account.negotiation_policy = policy;
    account.ssl = Some(SslConfig {
        verify_server: ServerVerification::None,
        ..Default::default()
    });
    account
}

/// Short timeouts so a stuck scenario fails instead of hanging.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_secs: 5,
        operation_timeout_secs: 5,
        long_operation_timeout_secs: 10,
        ..Default::default()
    }
}

/// A throwaway CA and a `localhost` server certificate it signed.
pub struct TlsIdentity {
    ca_pem: String,
    acceptor: TlsAcceptor,
}

impl TlsIdentity {
    pub fn generate() -> anyhow::Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca_key = rcgen::KeyPair::generate()?;
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let server_key = rcgen::KeyPair::generate()?;
        let server_cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])?
            .signed_by(&server_key, &ca_cert, &ca_key)?;

        let private = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![server_cert.der().clone()], private)?;
        Ok(Self {
            ca_pem: ca_cert.pem(),
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Writes the CA certificate to a temporary file.
    pub fn ca_file(&self) -> anyhow::Result<NamedTempFile> {
        let mut file = NamedTempFile::with_suffix(".pem")?;
        file.write_all(self.ca_pem.as_bytes())?;
        Ok(file)
    }
}

/// Hands out prepared streams, one per dial.
pub struct StreamDialer {
    streams: Mutex<Vec<BoxedStream>>,
}

impl StreamDialer {
    pub fn new(streams: Vec<BoxedStream>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams),
        })
    }
}

#[async_trait]
impl Dialer for StreamDialer {
    async fn dial(&self, _account: &Account, _config: &ConnectionConfig) -> rodsclient_transport::Result<BoxedStream> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| TransportError::connection("dialer poisoned"))?;
        if streams.is_empty() {
            return Err(TransportError::connection("no stream left to dial"));
        }
        Ok(streams.remove(0))
    }
}

/// Counts the reads issued on the wrapped stream and fails writes once a
/// number of frames has been flushed.
pub struct InstrumentedStream<S> {
    inner: S,
    reads: Arc<AtomicUsize>,
    flushes: usize,
    fail_after_flushes: Option<usize>,
}

impl<S> InstrumentedStream<S> {
    pub fn new(inner: S, reads: Arc<AtomicUsize>) -> Self {
        Self {
            inner,
            reads,
            flushes: 0,
            fail_after_flushes: None,
        }
    }

    /// Writes fail once `frames` flushes have completed.
    pub fn fail_writes_after(mut self, frames: usize) -> Self {
        self.fail_after_flushes = Some(frames);
        self
    }

    fn writes_broken(&self) -> bool {
        matches!(self.fail_after_flushes, Some(n) if self.flushes >= n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if self.writes_broken() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let flushed = Pin::new(&mut self.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = flushed {
            self.flushes += 1;
        }
        flushed
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
