//! A single iRODS connection: dial, startup and negotiation, the optional TLS
//! bootstrap, login, and the request/response engine built on top.
//!
//! A [`Connection`] is used by one task at a time. The pipelined mode in
//! [`crate::pipeline`] is the only place where sends and receives overlap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rodsclient_proto::frame::msg_type;
use rodsclient_proto::message::{
    Disconnect, EmptyResponse, RError, SslSettings, SslSharedSecret, StartupPack, TicketAdminRequest, VersionReply,
};
use rodsclient_proto::negotiation::{resolve, CsNegotiationOffer, CsNegotiationReply};
use rodsclient_proto::{Message, NegotiationPolicy, NegotiationResult, ProtoError, Request, Response, ServerVersion, XmlDialect};

use crate::auth;
use crate::auth::input::{InteractiveInput, TerminalInput};
use crate::channel::Channel;
use crate::config::{Account, ConnectionConfig};
use crate::dial::{Dialer, TcpDialer};
use crate::encryption::{self, EncryptionAlgorithm, SharedSecret};
use crate::error::{ConnectPhase, Result, TransportError};
use crate::framer::{BoxedStream, ProgressCallback};
use crate::metrics::ConnectionMetrics;
use crate::tls::TlsUpgrader;

/// Per-call knobs for [`Connection::request_sync_with`] and friends.
#[derive(Default)]
pub struct CallOptions<'a> {
    /// Deadline for the send and, separately, the receive. Defaults to the
    /// configured operation timeout.
    pub timeout: Option<Duration>,
    /// Receives the reply's binary segment instead of `Message::bs`.
    pub bs_buffer: Option<&'a mut [u8]>,
    pub request_progress: Option<ProgressCallback>,
    pub response_progress: Option<ProgressCallback>,
}

impl<'a> CallOptions<'a> {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

pub struct Connection {
    account: Account,
    config: ConnectionConfig,
    channel: Channel,
    dialer: Arc<dyn Dialer>,
    input: Arc<dyn InteractiveInput>,
    dialect: XmlDialect,
    server_version: Option<ServerVersion>,
    socket_open: bool,
    connected: bool,
    logged_in: bool,
    tls: bool,
    client_signature: String,
    shared_secret: Option<SharedSecret>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("account", &self.account.to_string())
            .field("server_version", &self.server_version)
            .field("connected", &self.connected)
            .field("logged_in", &self.logged_in)
            .field("tls", &self.tls)
            .field("failed", &self.channel.is_failed())
            .finish()
    }
}

impl Connection {
    /// Creates an unconnected connection dialing over TCP.
    pub fn new(account: Account, config: ConnectionConfig) -> Self {
        Self {
            account,
            config,
            channel: Channel::new(Arc::new(ConnectionMetrics::new())),
            dialer: Arc::new(TcpDialer),
            input: Arc::new(TerminalInput),
            dialect: XmlDialect::default(),
            server_version: None,
            socket_open: false,
            connected: false,
            logged_in: false,
            tls: false,
            client_signature: String::new(),
            shared_secret: None,
        }
    }

    /// Shares a metrics registry, e.g. across the connections of a pool.
    pub fn with_metrics(mut self, metrics: Arc<ConnectionMetrics>) -> Self {
        self.channel = Channel::new(metrics);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Source of answers for interactive PAM prompts.
    pub fn with_input(mut self, input: Arc<dyn InteractiveInput>) -> Self {
        self.input = input;
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub(crate) fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.channel.metrics
    }

    pub(crate) fn input(&self) -> Arc<dyn InteractiveInput> {
        Arc::clone(&self.input)
    }

    pub(crate) fn dialect(&self) -> XmlDialect {
        self.dialect
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Connected, logged in as far as the flow requires, and no socket
    /// failure seen since.
    pub fn is_connected(&self) -> bool {
        self.connected && !self.channel.is_failed()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub(crate) fn set_logged_in(&mut self, logged_in: bool) {
        self.logged_in = logged_in;
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// A socket error or timeout has made this connection unusable.
    pub fn is_failed(&self) -> bool {
        self.channel.is_failed()
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.server_version.as_ref()
    }

    /// Hex of the first 16 challenge bytes of the last native login.
    pub fn client_signature(&self) -> &str {
        &self.client_signature
    }

    pub(crate) fn set_client_signature(&mut self, signature: String) {
        self.client_signature = signature;
    }

    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        self.shared_secret.as_ref()
    }

    /// Token issued by the last PAM login, if any.
    pub fn pam_token(&self) -> &str {
        &self.account.pam_token
    }

    /// Dials, negotiates, upgrades to TLS when agreed, and logs in.
    ///
    /// On failure the connection is torn down and the error names the phase
    /// that failed. Configuration errors are returned before dialing.
    pub async fn connect(&mut self) -> Result<()> {
        self.account.validate()?;
        self.config.validate().map_err(|e| match e {
            TransportError::ConnectionConfig { reason, .. } => self.account.config_error(reason),
            other => other,
        })?;

        self.connected = false;
        self.logged_in = false;
        tracing::debug!(account = %self.account, "connecting");

        match self.establish().await {
            Ok(()) => {
                self.connected = true;
                tracing::info!(
                    account = %self.account,
                    tls = self.tls,
                    release = self.server_version.as_ref().map(|v| v.release.as_str()).unwrap_or(""),
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(account = %self.account, error = %e, "connect failed");
                self.channel.metrics.inc_connection_failures();
                let _ = self.logout().await;
                let _ = self.disconnect_now().await;
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        self.open().await?;
        auth::login(self)
            .await
            .map_err(|e| e.in_phase(ConnectPhase::Authentication))?;
        if self.account.use_ticket() {
            self.start_ticket_session()
                .await
                .map_err(|e| e.in_phase(ConnectPhase::Authentication))?;
        }
        Ok(())
    }

    /// Adopts a stream that already went through startup elsewhere.
    pub async fn bind(&mut self, stream: BoxedStream, version: ServerVersion) {
        self.channel.attach(stream).await;
        self.channel.metrics.inc_connections_opened();
        self.socket_open = true;
        self.dialect = XmlDialect::for_version(Some(&version));
        self.server_version = Some(version);
        self.connected = true;
    }

    /// Dials and runs the startup exchange; the session is not logged in
    /// afterwards.
    pub(crate) async fn open(&mut self) -> Result<()> {
        let stream = self
            .dialer
            .dial(&self.account, &self.config)
            .await
            .map_err(|e| e.in_phase(ConnectPhase::Dial))?;
        self.channel.attach(stream).await;
        self.channel.metrics.inc_connections_opened();
        self.socket_open = true;
        self.tls = false;
        self.shared_secret = None;
        self.dialect = XmlDialect::default();

        let reply = self.startup().await?;
        reply
            .check_error()
            .map_err(|e| TransportError::from(e).in_phase(ConnectPhase::Negotiation))?;

        let version = reply.to_server_version();
        tracing::debug!(release = %version.release, api = %version.api, "server version");
        self.dialect = XmlDialect::for_version(Some(&version));
        self.server_version = Some(version);
        Ok(())
    }

    async fn startup(&mut self) -> Result<VersionReply> {
        let negotiation = |e: TransportError| e.in_phase(ConnectPhase::Negotiation);
        let timeout = self.config.operation_timeout();
        let pack = StartupPack {
            proxy_user: self.account.proxy_user.clone(),
            proxy_zone: self.account.proxy_zone.clone(),
            client_user: self.account.client_user.clone(),
            client_zone: self.account.client_zone.clone(),
            application: self.config.application_name.clone(),
            request_negotiation: self.account.cs_negotiation,
        };

        if !self.account.cs_negotiation {
            let mut version = VersionReply::default();
            self.request_sync(&pack, &mut version, timeout)
                .await
                .map_err(negotiation)?;
            return Ok(version);
        }

        self.request_fire_and_forget(&pack, timeout)
            .await
            .map_err(negotiation)?;
        let msg = self.receive_message(None, timeout, None).await.map_err(negotiation)?;

        match msg.header.msg_type.as_str() {
            msg_type::VERSION => {
                let mut version = VersionReply::default();
                self.decode(msg, &mut version, false).map_err(negotiation)?;
                Ok(version)
            }
            msg_type::CS_NEG => {
                let mut offer = CsNegotiationOffer::default();
                self.decode(msg, &mut offer, false).map_err(negotiation)?;
                let result = self.negotiate(&offer).await.map_err(negotiation)?;

                if result == NegotiationResult::UseSsl {
                    self.ssl_startup()
                        .await
                        .map_err(|e| e.in_phase(ConnectPhase::TlsBootstrap))?;
                }

                let mut version = VersionReply::default();
                self.receive_response(&mut version, timeout)
                    .await
                    .map_err(negotiation)?;
                Ok(version)
            }
            other => Err(negotiation(TransportError::connection(format!(
                "unknown response message {:?}",
                other
            )))),
        }
    }

    /// Resolves the server's offer and answers it. A failed negotiation is
    /// still reported to the server before the error is returned.
    async fn negotiate(&mut self, offer: &CsNegotiationOffer) -> Result<NegotiationResult> {
        // unreadable server tokens are treated as a refusal of TLS
        let server_policy = offer.policy().unwrap_or_else(|e| {
            tracing::warn!(offer = %offer.result, error = %e, "unknown server negotiation policy");
            NegotiationPolicy::RequireTcp
        });
        let client_policy = if self.account.cs_negotiation {
            self.account.negotiation_policy
        } else {
            NegotiationPolicy::RequireTcp
        };
        let result = resolve(client_policy, server_policy);
        tracing::debug!(
            client = %client_policy,
            server = %server_policy,
            result = %result,
            "client-server negotiation"
        );

        let timeout = self.config.operation_timeout();
        let reply = CsNegotiationReply { result };
        if result == NegotiationResult::Failure {
            if let Err(e) = self.request_fire_and_forget(&reply, timeout).await {
                tracing::debug!(error = %e, "failed to report negotiation failure");
            }
            return Err(TransportError::connection(format!(
                "client-server negotiation failed (client {}, server {})",
                client_policy, server_policy
            )));
        }
        self.request_fire_and_forget(&reply, timeout).await?;
        Ok(result)
    }

    /// Upgrades the socket in place and sends the encryption parameters and
    /// a fresh shared secret.
    async fn ssl_startup(&mut self) -> Result<()> {
        let ssl = self
            .account
            .ssl
            .clone()
            .ok_or_else(|| self.account.config_error("SSL configuration is not set"))?;
        let upgrader = TlsUpgrader::new(&ssl)?;
        let timeout = self.config.operation_timeout();

        let stream = self.channel.detach().await?;
        let server_name = ssl.tls_server_name(&self.account.host).to_string();
        let upgraded = crate::framer::with_deadline(timeout, "tls handshake", upgrader.upgrade(&server_name, stream)).await;
        let stream = match upgraded {
            Ok(stream) => stream,
            Err(e) => {
                self.channel.mark_failed(&e);
                return Err(e);
            }
        };
        self.channel.attach(stream).await;
        self.tls = true;
        self.channel.metrics.inc_tls_upgrades();

        let secret = SharedSecret::generate(ssl.encryption_key_size as usize);
        let settings = SslSettings {
            algorithm: ssl.encryption_algorithm.clone(),
            key_size: ssl.encryption_key_size,
            salt_size: ssl.encryption_salt_size,
            hash_rounds: ssl.encryption_hash_rounds,
        };
        self.request_fire_and_forget(&settings, timeout).await?;
        self.request_fire_and_forget(
            &SslSharedSecret {
                secret: secret.as_bytes().to_vec(),
            },
            timeout,
        )
        .await?;
        self.shared_secret = Some(secret);
        tracing::debug!(algorithm = %ssl.encryption_algorithm, key_size = ssl.encryption_key_size, "TLS bootstrap complete");
        Ok(())
    }

    async fn start_ticket_session(&mut self) -> Result<()> {
        let request = TicketAdminRequest {
            ticket: self.account.ticket.clone(),
        };
        let mut response = EmptyResponse::default();
        self.request_and_check(&request, &mut response)
            .await
            .map_err(|e| self.account.auth_refusal("failed to set session ticket", e))
    }

    /// Tears the socket down and dials again; used by logins that obtain a
    /// credential on one session and use it on the next.
    pub(crate) async fn reopen(&mut self) -> Result<()> {
        let _ = self.logout().await;
        let _ = self.disconnect_now().await;
        self.open().await
    }

    /// Sends the polite goodbye. The server does not answer.
    pub(crate) async fn logout(&mut self) -> Result<()> {
        self.logged_in = false;
        if !self.socket_open || self.channel.is_failed() {
            return Ok(());
        }
        self.request_fire_and_forget(&Disconnect, self.config.operation_timeout())
            .await
    }

    /// Closes the socket without a goodbye.
    pub(crate) async fn disconnect_now(&mut self) -> Result<()> {
        self.connected = false;
        self.logged_in = false;
        self.tls = false;
        if !self.socket_open {
            return Ok(());
        }
        self.socket_open = false;
        self.channel.metrics.inc_connections_closed();
        self.channel.close().await
    }

    /// Logs out and closes the socket.
    pub async fn disconnect(&mut self) -> Result<()> {
        tracing::debug!(account = %self.account, "disconnecting");
        let logout = self.logout().await;
        let close = self.disconnect_now().await;
        logout.and(close)
    }

    /// Writes one frame as is.
    pub async fn send_message(&self, msg: &Message, timeout: Duration, progress: Option<&ProgressCallback>) -> Result<()> {
        self.channel.send(msg, timeout, progress).await
    }

    /// Reads one frame without interpreting it.
    pub async fn receive_message(
        &self,
        bs_buffer: Option<&mut [u8]>,
        timeout: Duration,
        progress: Option<&ProgressCallback>,
    ) -> Result<Message> {
        self.channel.receive(bs_buffer, timeout, progress).await
    }

    /// Renders a request in the server's dialect.
    pub(crate) fn prepare(&self, request: &dyn Request) -> Result<Message> {
        prepare(&self.dialect, request)
    }

    fn decode(&self, msg: Message, response: &mut dyn Response, check: bool) -> Result<()> {
        decode(&self.dialect, msg, response, check)
    }

    async fn send_request(&self, request: &dyn Request, timeout: Duration, progress: Option<&ProgressCallback>) -> Result<()> {
        let msg = self.prepare(request).map_err(|e| {
            self.channel.metrics.inc_request_failures();
            e
        })?;
        self.send_message(&msg, timeout, progress).await.map_err(|e| {
            self.channel.metrics.inc_request_failures();
            e
        })
    }

    async fn receive_response(&self, response: &mut dyn Response, timeout: Duration) -> Result<()> {
        self.receive_with(response, None, timeout, None, false).await
    }

    async fn receive_with(
        &self,
        response: &mut dyn Response,
        bs_buffer: Option<&mut [u8]>,
        timeout: Duration,
        progress: Option<&ProgressCallback>,
        check: bool,
    ) -> Result<()> {
        let msg = self
            .receive_message(bs_buffer, timeout, progress)
            .await
            .map_err(|e| {
                self.channel.metrics.inc_response_failures();
                e
            })?;
        self.decode(msg, response, check).map_err(|e| {
            if !matches!(e, TransportError::Service { .. }) {
                self.channel.metrics.inc_response_failures();
            }
            e
        })
    }

    async fn call(&self, request: &dyn Request, response: &mut dyn Response, opts: CallOptions<'_>, check: bool) -> Result<()> {
        let timeout = opts.timeout.unwrap_or_else(|| self.config.operation_timeout());
        self.send_request(request, timeout, opts.request_progress.as_ref())
            .await?;
        self.receive_with(
            response,
            opts.bs_buffer,
            timeout,
            opts.response_progress.as_ref(),
            check,
        )
        .await
    }

    /// Sends `request` and reads `response`. A negative result in the reply
    /// is left for the caller to inspect.
    pub async fn request_sync(&self, request: &dyn Request, response: &mut dyn Response, timeout: Duration) -> Result<()> {
        self.call(request, response, CallOptions::with_timeout(timeout), false)
            .await
    }

    pub async fn request_sync_with(&self, request: &dyn Request, response: &mut dyn Response, opts: CallOptions<'_>) -> Result<()> {
        self.call(request, response, opts, false).await
    }

    /// Like [`request_sync`](Self::request_sync) with the operation timeout,
    /// then turns a negative result into [`TransportError::Service`].
    pub async fn request_and_check(&self, request: &dyn Request, response: &mut dyn Response) -> Result<()> {
        self.call(request, response, CallOptions::default(), true).await
    }

    pub async fn request_and_check_with(
        &self,
        request: &dyn Request,
        response: &mut dyn Response,
        opts: CallOptions<'_>,
    ) -> Result<()> {
        self.call(request, response, opts, true).await
    }

    /// Sends `request` and returns without reading anything.
    pub async fn request_fire_and_forget(&self, request: &dyn Request, timeout: Duration) -> Result<()> {
        self.send_request(request, timeout, None).await
    }

    fn cipher(&self) -> Result<(EncryptionAlgorithm, &[u8])> {
        let secret = self.shared_secret.as_ref().ok_or_else(|| TransportError::Encryption {
            reason: "no shared secret, the connection is not using TLS".to_string(),
        })?;
        let algorithm = match &self.account.ssl {
            Some(ssl) => ssl.encryption_algorithm.parse()?,
            None => EncryptionAlgorithm::Aes256Cbc,
        };
        Ok((algorithm, secret.as_bytes()))
    }

    /// A random IV for [`encrypt`](Self::encrypt).
    pub fn new_iv(&self) -> Result<Vec<u8>> {
        let (algorithm, _) = self.cipher()?;
        Ok(encryption::new_iv(algorithm))
    }

    /// Encrypts with the shared secret; returns the bytes written to `dst`.
    pub fn encrypt(&self, iv: &[u8], src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let (algorithm, key) = self.cipher()?;
        encryption::encrypt(algorithm, key, iv, src, dst)
    }

    pub fn decrypt(&self, iv: &[u8], src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let (algorithm, key) = self.cipher()?;
        encryption::decrypt(algorithm, key, iv, src, dst)
    }
}

pub(crate) fn prepare(dialect: &XmlDialect, request: &dyn Request) -> Result<Message> {
    let mut msg = request.to_message()?;
    dialect.correct_request(&mut msg, request.correction())?;
    Ok(msg)
}

/// Applies the dialect correction and unmarshals. With `check`, a negative
/// result becomes a service error carrying the server's error stack.
pub(crate) fn decode(dialect: &XmlDialect, mut msg: Message, response: &mut dyn Response, check: bool) -> Result<()> {
    dialect.correct_response(&mut msg, response.correction())?;
    response.from_message(&msg)?;
    if check {
        if let Err(e) = response.check_error() {
            return Err(with_error_stack(e, &msg.error));
        }
    }
    Ok(())
}

fn with_error_stack(err: ProtoError, segment: &[u8]) -> TransportError {
    if let ProtoError::Service { code, message: None, .. } = &err {
        if !segment.is_empty() {
            if let Some(summary) = RError::parse(segment).ok().and_then(|r| r.summary()) {
                return ProtoError::service_with_message(*code, summary).into();
            }
        }
    }
    err.into()
}
