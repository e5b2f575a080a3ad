//! A scripted iRODS server for end-to-end tests.
//!
//! Each [`ServerConn`] owns the server side of one client stream and offers
//! the steps of the connection protocol as separate calls so a test can stop
//! after any of them, or misbehave in between.

use anyhow::{bail, ensure, Context};
use rodsclient_proto::frame::{msg_type, parse_header_len, HEADER_LEN_PREFIX_SIZE};
use rodsclient_proto::message::{decode_auth_plugin_request, AuthPluginResponse, VersionReply, REQUEST_SERVER_NEGOTIATION};
use rodsclient_proto::pack::PackWriter;
use rodsclient_proto::{Message, MessageHeader, NegotiationPolicy, NegotiationResult};
use rodsclient_transport::auth::native::generate_auth_response;
use rodsclient_transport::framer::{read_full, read_message, write_message};
use rodsclient_transport::BoxedStream;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;

/// Result code the server answers a wrong password with.
pub const CAT_INVALID_AUTHENTICATION: i32 = -826000;

/// Challenge handed out by [`ServerConn::serve_native_login`].
pub fn native_challenge() -> Vec<u8> {
    (0u8..64).map(|i| b'A' + (i % 26)).collect()
}

/// Encryption parameters the client announced after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapParams {
    pub algorithm: String,
    pub key_size: u32,
    pub salt_size: u32,
    pub hash_rounds: u32,
    pub secret: Vec<u8>,
}

fn field<'a>(context: &'a Map<String, Value>, key: &str) -> &'a str {
    context.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn expect_operation(context: &Map<String, Value>, operation: &str) -> anyhow::Result<()> {
    let found = field(context, "next_operation");
    ensure!(found == operation, "expected {}, got {:?}", operation, found);
    Ok(())
}

pub struct ServerConn {
    stream: BoxedStream,
    release: String,
}

impl ServerConn {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            release: String::from("rods4.3.2"),
        }
    }

    /// Release reported in the version reply.
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = release.into();
        self
    }

    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        let (msg, _) = read_message(&mut self.stream, None, None).await?;
        Ok(msg)
    }

    /// Reads a frame that is a header only, whatever lengths it declares.
    pub async fn recv_header(&mut self) -> anyhow::Result<MessageHeader> {
        let mut prefix = [0u8; HEADER_LEN_PREFIX_SIZE];
        read_full(&mut self.stream, &mut prefix).await?;
        let len = parse_header_len(prefix)?;
        let mut header = vec![0u8; len as usize];
        read_full(&mut self.stream, &mut header).await?;
        Ok(MessageHeader::decode(&header)?)
    }

    pub async fn send(&mut self, msg: &Message) -> anyhow::Result<()> {
        write_message(&mut self.stream, msg, None).await?;
        Ok(())
    }

    /// Writes bytes without framing them.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Runs the server side of the TLS handshake on the current stream.
    pub async fn accept_tls(&mut self, acceptor: &TlsAcceptor) -> anyhow::Result<()> {
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
        let tls = acceptor.accept(plain).await.context("server TLS handshake")?;
        self.stream = Box::new(tls);
        Ok(())
    }

    /// Reads the startup pack and reports whether it asks for negotiation.
    pub async fn expect_startup(&mut self) -> anyhow::Result<bool> {
        let startup = self.recv().await?;
        ensure!(
            startup.header.msg_type == msg_type::CONNECT,
            "expected a startup pack, got {}",
            startup.header.msg_type
        );
        Ok(String::from_utf8_lossy(&startup.body).contains(REQUEST_SERVER_NEGOTIATION))
    }

    pub async fn send_version(&mut self) -> anyhow::Result<()> {
        let reply = VersionReply {
            release: self.release.clone(),
            api: "d".to_string(),
            ..Default::default()
        };
        self.send(&reply.to_message()).await
    }

    /// Offers `policy` and returns the client's answer.
    pub async fn offer_negotiation(&mut self, policy: NegotiationPolicy) -> anyhow::Result<NegotiationResult> {
        let offer = PackWriter::new("CS_NEG_PI")
            .num("status", 1)
            .text("result", policy.as_token())
            .finish();
        self.send(&Message::new(msg_type::CS_NEG, offer, 0)).await?;

        let reply = self.recv().await?;
        ensure!(
            reply.header.msg_type == msg_type::CS_NEG,
            "expected a negotiation reply, got {}",
            reply.header.msg_type
        );
        let body = String::from_utf8_lossy(&reply.body);
        [NegotiationResult::UseSsl, NegotiationResult::UseTcp, NegotiationResult::Failure]
            .into_iter()
            .find(|r| body.contains(&format!("={};", r.as_token())))
            .with_context(|| format!("unrecognised negotiation reply {}", body))
    }

    /// Accepts the handshake and reads the encryption parameters and the
    /// shared secret that follow it.
    pub async fn expect_ssl_bootstrap(&mut self, acceptor: &TlsAcceptor) -> anyhow::Result<BootstrapParams> {
        self.accept_tls(acceptor).await?;
        let settings = self.recv_header().await?;
        let secret = self.recv().await?;
        ensure!(
            secret.header.msg_type == msg_type::SHARED_SECRET,
            "expected the shared secret, got {}",
            secret.header.msg_type
        );
        ensure!(
            secret.body.len() == settings.message_len as usize,
            "secret of {} bytes for a {} byte key",
            secret.body.len(),
            settings.message_len
        );
        Ok(BootstrapParams {
            algorithm: settings.msg_type,
            key_size: settings.message_len,
            salt_size: settings.error_len,
            hash_rounds: settings.bs_len,
            secret: secret.body,
        })
    }

    async fn send_agent_reply(&mut self, context: Map<String, Value>, result: i32) -> anyhow::Result<()> {
        let msg = AuthPluginResponse { context, result }.to_message()?;
        self.send(&msg).await
    }

    /// Serves the two-step native agent flow. A digest that does not match
    /// `password` is refused with [`CAT_INVALID_AUTHENTICATION`]. Returns
    /// whether the login succeeded.
    pub async fn serve_native_login(&mut self, password: &str) -> anyhow::Result<bool> {
        let request = decode_auth_plugin_request(&self.recv().await?)?;
        ensure!(field(&request, "scheme") == "native", "unexpected scheme {:?}", request.get("scheme"));
        expect_operation(&request, "auth_agent_auth_request")?;
        ensure!(request.get("password").is_none(), "password sent in the clear");

        let mut reply = request.clone();
        reply.insert(
            "request_result".into(),
            json!(String::from_utf8(native_challenge())?),
        );
        self.send_agent_reply(reply, 0).await?;

        let request = decode_auth_plugin_request(&self.recv().await?)?;
        expect_operation(&request, "auth_agent_auth_response")?;
        let digest = field(&request, "digest");
        if digest.is_empty() {
            bail!("no digest in the auth response");
        }
        if digest != generate_auth_response(&native_challenge(), password) {
            self.send_agent_reply(Map::new(), CAT_INVALID_AUTHENTICATION).await?;
            return Ok(false);
        }
        self.send_agent_reply(Map::new(), 0).await?;
        Ok(true)
    }

    pub async fn expect_disconnect(&mut self) -> anyhow::Result<()> {
        let bye = self.recv().await?;
        ensure!(
            bye.header.msg_type == msg_type::DISCONNECT,
            "expected a disconnect, got {}",
            bye.header.msg_type
        );
        Ok(())
    }
}
