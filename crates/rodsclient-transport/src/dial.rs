//! Opening the raw socket a connection starts on.

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::config::{Account, ConnectionConfig};
use crate::error::{Result, TransportError};
use crate::framer::BoxedStream;

/// Opens a fresh byte stream to the account's server. A connection dials
/// again when a login flow needs a second session.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, account: &Account, config: &ConnectionConfig) -> Result<BoxedStream>;
}

/// Plain TCP with `TCP_NODELAY` and optional socket buffer sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    async fn connect(&self, account: &Account, config: &ConnectionConfig) -> Result<TcpStream> {
        let addr = format!("{}:{}", account.host, account.port);
        let mut last_err = None;
        for resolved in lookup_host(addr.as_str()).await? {
            let socket = if resolved.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if config.tcp_buffer_size > 0 {
                let size = config.tcp_buffer_size as u32;
                if let Err(e) = socket.set_recv_buffer_size(size) {
                    tracing::error!(size, error = %e, "failed to set tcp read buffer size");
                }
                if let Err(e) = socket.set_send_buffer_size(size) {
                    tracing::error!(size, error = %e, "failed to set tcp write buffer size");
                }
            }
            match socket.connect(resolved).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransportError::connection(match last_err {
            Some(e) => format!("failed to connect to {}: {}", addr, e),
            None => format!("no address found for {}", addr),
        }))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, account: &Account, config: &ConnectionConfig) -> Result<BoxedStream> {
        let timeout = config.connect_timeout();
        let stream = tokio::time::timeout(timeout, self.connect(account, config))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                timeout_ms: timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(host = %account.host, port = account.port, "TCP connected");
        Ok(Box::new(stream))
    }
}
