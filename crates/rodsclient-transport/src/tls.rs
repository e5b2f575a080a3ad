//! In-place TLS upgrade of an established connection.
//!
//! The handshake runs over the socket the startup exchange already used; the
//! connection is never reopened. Only `hostname` verification checks the
//! server certificate. The other modes accept any certificate but still
//! verify handshake signatures.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::SslConfig;
use crate::error::{Result, TransportError};
use crate::framer::BoxedStream;

/// Client side of the TLS upgrade.
pub struct TlsUpgrader {
    inner: TlsConnector,
}

impl fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsUpgrader").finish()
    }
}

impl TlsUpgrader {
    pub fn new(ssl: &SslConfig) -> Result<Self> {
        let config = client_config(ssl)?;
        Ok(Self {
            inner: TlsConnector::from(config),
        })
    }

    /// Performs the client handshake over `stream` and returns the encrypted
    /// stream in its place.
    pub async fn upgrade(&self, server_name: &str, stream: BoxedStream) -> Result<BoxedStream> {
        let name = parse_server_name(server_name)?;
        let tls = self
            .inner
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::Tls {
                reason: format!("TLS handshake failed: {}", e),
            })?;
        tracing::debug!(server_name, "TLS handshake complete");
        Ok(Box::new(tls))
    }
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(name.to_string()).map_err(|e| TransportError::Tls {
        reason: format!("invalid server name {:?}: {}", name, e),
    })
}

/// Builds the rustls client configuration for `ssl`.
pub fn client_config(ssl: &SslConfig) -> Result<Arc<ClientConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = if ssl.verify_server.is_verification_required() {
        let mut roots = RootCertStore::empty();
        for cert in load_ca_file(ssl.ca_certificate_file.as_deref())? {
            roots.add(cert).map_err(|e| TransportError::Tls {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Reads the CA file. A missing file is ignored; an unreadable or empty one
/// is an error.
fn load_ca_file(path: Option<&Path>) -> Result<Vec<CertificateDer<'static>>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    if !path.exists() {
        tracing::debug!(path = %path.display(), "CA certificate file does not exist, ignoring");
        return Ok(Vec::new());
    }
    let pem = std::fs::read(path).map_err(|e| TransportError::Tls {
        reason: format!("failed to read CA certificate file {}: {}", path.display(), e),
    })?;
    load_certs_from_pem(&pem)
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        if let rustls_pemfile::Item::X509Certificate(cert) = item {
            certs.push(cert);
        }
    }

    if certs.is_empty() {
        return Err(TransportError::Tls {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerVerification;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap()
    }

    fn acceptor(key: &rcgen::CertifiedKey) -> TlsAcceptor {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let private = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![key.cert.der().clone()], private)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    async fn handshake(ssl: SslConfig, key: &rcgen::CertifiedKey, name: &str) -> Result<()> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let acceptor = acceptor(key);
        let server_task = tokio::spawn(async move {
            if let Ok(mut tls) = acceptor.accept(server).await {
                let mut buf = [0u8; 4];
                if tls.read_exact(&mut buf).await.is_ok() {
                    let _ = tls.write_all(&buf).await;
                    let _ = tls.flush().await;
                }
            }
        });

        let upgrader = TlsUpgrader::new(&ssl)?;
        let mut stream = upgrader.upgrade(name, Box::new(client)).await?;
        stream.write_all(b"ping").await?;
        stream.flush().await?;
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await?;
        assert_eq!(&echo, b"ping");
        drop(stream);
        let _ = server_task.await;
        Ok(())
    }

    #[tokio::test]
    async fn test_upgrade_without_verification() {
        let key = self_signed();
        let ssl = SslConfig {
            verify_server: ServerVerification::None,
            ..Default::default()
        };
        handshake(ssl, &key, "irods.example.org").await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_with_hostname_verification() {
        let key = self_signed();
        let mut ca = tempfile::NamedTempFile::with_suffix(".pem").unwrap();
        ca.write_all(key.cert.pem().as_bytes()).unwrap();

        let ssl = SslConfig {
            verify_server: ServerVerification::Hostname,
            ca_certificate_file: Some(ca.path().to_path_buf()),
            ..Default::default()
        };
        handshake(ssl, &key, "localhost").await.unwrap();
    }

    #[tokio::test]
    async fn test_hostname_verification_rejects_unknown_ca() {
        let key = self_signed();
        let ssl = SslConfig {
            verify_server: ServerVerification::Hostname,
            ..Default::default()
        };
        let err = handshake(ssl, &key, "localhost").await.unwrap_err();
        assert!(matches!(err, TransportError::Tls { .. }));
    }

    #[test]
    fn test_missing_ca_file_is_ignored() {
        let ssl = SslConfig {
            verify_server: ServerVerification::Hostname,
            ca_certificate_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(client_config(&ssl).is_ok());
    }

    #[test]
    fn test_load_certs_from_pem() {
        let key = self_signed();
        let certs = load_certs_from_pem(key.cert.pem().as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(load_certs_from_pem(b"not a pem").is_err());
    }

    #[test]
    fn test_server_name_parsing() {
        assert!(matches!(
            parse_server_name("10.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            parse_server_name("irods.example.org").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(parse_server_name("bad name!").is_err());
    }
}
