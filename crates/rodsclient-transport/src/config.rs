//! Account and connection configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use rodsclient_proto::NegotiationPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Default service port.
pub const DEFAULT_PORT: u16 = 1247;
/// User names must be shorter than this many bytes.
pub const MAX_NAME_LENGTH: usize = 64;
const USERNAME_PATTERN: &str = r"^((\w|[-.@])+)$";
const REDACTED: &str = "<Redacted>";

/// Credential scheme used to log in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    Native,
    PamPassword,
    PamInteractive,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Native => "native",
            AuthScheme::PamPassword => "pam_password",
            AuthScheme::PamInteractive => "pam_interactive",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthScheme {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" | "" => Ok(AuthScheme::Native),
            "pam" | "pam_password" => Ok(AuthScheme::PamPassword),
            "pam_interactive" => Ok(AuthScheme::PamInteractive),
            other => Err(TransportError::ConnectionConfig {
                account: String::new(),
                reason: format!("unknown authentication scheme {:?}", other),
            }),
        }
    }
}

/// How the server certificate is checked during the TLS upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerVerification {
    /// Accept the certificate without checking the chain.
    Cert,
    /// Verify the chain against the CA file and match the host name.
    Hostname,
    #[default]
    None,
}

impl ServerVerification {
    pub fn is_verification_required(&self) -> bool {
        *self == ServerVerification::Hostname
    }
}

/// TLS and shared-secret parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub ca_certificate_file: Option<PathBuf>,
    pub encryption_key_size: u32,
    pub encryption_algorithm: String,
    pub encryption_salt_size: u32,
    pub encryption_hash_rounds: u32,
    pub verify_server: ServerVerification,
    /// Overrides the host name used for SNI and verification.
    pub server_name: Option<String>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            ca_certificate_file: None,
            encryption_key_size: 32,
            encryption_algorithm: String::from("AES-256-CBC"),
            encryption_salt_size: 8,
            encryption_hash_rounds: 16,
            verify_server: ServerVerification::default(),
            server_name: None,
        }
    }
}

impl SslConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.encryption_key_size == 0 {
            return Err("invalid encryption key size".into());
        }
        if self.encryption_algorithm.is_empty() {
            return Err("empty encryption algorithm".into());
        }
        if self.encryption_salt_size == 0 {
            return Err("invalid encryption salt size".into());
        }
        if self.encryption_hash_rounds == 0 {
            return Err("invalid encryption number of hash rounds".into());
        }
        Ok(())
    }

    /// Name presented to the server: the override when set, else `host`.
    pub fn tls_server_name<'a>(&'a self, host: &'a str) -> &'a str {
        self.server_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(host)
    }
}

/// Who connects where, and how they prove it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub client_user: String,
    pub client_zone: String,
    pub proxy_user: String,
    pub proxy_zone: String,
    pub password: String,
    pub ticket: String,
    pub auth_scheme: AuthScheme,
    /// Whether the startup message asks the server to negotiate.
    pub cs_negotiation: bool,
    pub negotiation_policy: NegotiationPolicy,
    /// PAM token lifetime in hours; zero or less lets the server decide.
    pub pam_ttl: i32,
    /// Token issued by an earlier PAM login.
    pub pam_token: String,
    pub ssl: Option<SslConfig>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            client_user: String::new(),
            client_zone: String::new(),
            proxy_user: String::new(),
            proxy_zone: String::new(),
            password: String::new(),
            ticket: String::new(),
            auth_scheme: AuthScheme::Native,
            cs_negotiation: false,
            negotiation_policy: NegotiationPolicy::DontCare,
            pam_ttl: 0,
            pam_token: String::new(),
            ssl: None,
        }
    }
}

impl Account {
    /// A native account where the client and proxy identities are the same.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        zone: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let user = user.into();
        let zone = zone.into();
        Self {
            host: host.into(),
            port,
            client_user: user.clone(),
            client_zone: zone.clone(),
            proxy_user: user,
            proxy_zone: zone,
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn use_ticket(&self) -> bool {
        !self.ticket.is_empty()
    }

    pub fn use_proxy_access(&self) -> bool {
        !self.proxy_user.is_empty() && self.client_user != self.proxy_user
    }

    /// Makes the negotiation settings consistent with the scheme and fills
    /// the missing half of each user/zone pair from the other.
    pub fn fix_auth_configuration(&mut self) {
        if self.auth_scheme != AuthScheme::Native {
            self.negotiation_policy = NegotiationPolicy::RequireSsl;
        }
        if self.negotiation_policy == NegotiationPolicy::RequireSsl {
            self.cs_negotiation = true;
        }
        if self.proxy_user.is_empty() {
            self.proxy_user = self.client_user.clone();
        }
        if self.client_user.is_empty() {
            self.client_user = self.proxy_user.clone();
        }
        if self.proxy_zone.is_empty() {
            self.proxy_zone = self.client_zone.clone();
        }
        if self.client_zone.is_empty() {
            self.client_zone = self.proxy_zone.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(self.config_error("empty host"));
        }
        if self.port == 0 {
            return Err(self.config_error("empty port"));
        }
        if self.proxy_user.is_empty() {
            return Err(self.config_error("empty user"));
        }
        self.validate_username(&self.proxy_user)?;
        if !self.client_user.is_empty() {
            self.validate_username(&self.client_user)?;
        }
        if self.proxy_zone.is_empty() {
            return Err(self.config_error("empty zone"));
        }
        if self.auth_scheme != AuthScheme::Native
            && self.negotiation_policy != NegotiationPolicy::RequireSsl
        {
            return Err(self.config_error("SSL is required for non-native authentication scheme"));
        }
        if self.negotiation_policy == NegotiationPolicy::RequireSsl {
            if !self.cs_negotiation {
                return Err(self.config_error("client-server negotiation is required for SSL"));
            }
            if self.ssl.is_none() {
                return Err(self.config_error("SSL configuration is empty"));
            }
        }
        if let Some(ssl) = &self.ssl {
            ssl.validate()
                .map_err(|reason| self.config_error(format!("invalid SSL configuration: {}", reason)))?;
        }
        Ok(())
    }

    fn validate_username(&self, name: &str) -> Result<()> {
        if name.len() >= MAX_NAME_LENGTH {
            return Err(self.config_error(format!("username {:?} too long", name)));
        }
        if name == "." || name == ".." {
            return Err(self.config_error(format!("invalid username {:?}", name)));
        }
        let pattern = Regex::new(USERNAME_PATTERN)
            .map_err(|e| self.config_error(format!("failed to compile username pattern: {}", e)))?;
        if !pattern.is_match(name) {
            return Err(self.config_error(format!(
                "invalid username {:?}, containing invalid chars",
                name
            )));
        }
        Ok(())
    }

    /// A copy with the password, PAM token and ticket masked.
    pub fn redacted(&self) -> Account {
        let mask = |s: &str| {
            if s.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            }
        };
        Account {
            password: mask(&self.password),
            pam_token: mask(&self.pam_token),
            ticket: mask(&self.ticket),
            ..self.clone()
        }
    }

    pub(crate) fn config_error(&self, reason: impl Into<String>) -> TransportError {
        TransportError::ConnectionConfig {
            account: self.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn auth_error(&self, reason: impl Into<String>) -> TransportError {
        TransportError::Auth {
            account: self.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Wraps a failed login request. Service refusals become
    /// [`TransportError::Auth`] with the refusal as source; socket failures
    /// pass through unchanged.
    pub(crate) fn auth_refusal(&self, step: &str, err: TransportError) -> TransportError {
        if err.is_transport_failure() {
            return err;
        }
        TransportError::Auth {
            account: self.to_string(),
            reason: format!("{}: {}", step, err),
            source: Some(Box::new(err)),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        load_file(path)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.redacted();
        f.debug_struct("Account")
            .field("host", &r.host)
            .field("port", &r.port)
            .field("client_user", &r.client_user)
            .field("client_zone", &r.client_zone)
            .field("proxy_user", &r.proxy_user)
            .field("proxy_zone", &r.proxy_zone)
            .field("password", &r.password)
            .field("ticket", &r.ticket)
            .field("auth_scheme", &r.auth_scheme)
            .field("cs_negotiation", &r.cs_negotiation)
            .field("negotiation_policy", &r.negotiation_policy)
            .field("pam_ttl", &r.pam_ttl)
            .field("pam_token", &r.pam_token)
            .field("ssl", &r.ssl)
            .finish()
    }
}

/// Identity only; never includes secrets.
impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}:{} ({})",
            self.proxy_user, self.proxy_zone, self.host, self.port, self.auth_scheme
        )
    }
}

/// Connection-level tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub long_operation_timeout_secs: u64,
    pub application_name: String,
    /// Socket buffer size in bytes; zero keeps the OS default.
    pub tcp_buffer_size: usize,
    /// PAM logins over plain TCP fail when set, and only warn otherwise.
    pub require_secure_auth: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            operation_timeout_secs: 60,
            long_operation_timeout_secs: 300,
            application_name: String::from("rodsclient"),
            tcp_buffer_size: 0,
            require_secure_auth: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn long_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.long_operation_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TransportError::ConnectionConfig {
            account: String::new(),
            reason: reason.to_string(),
        };
        if self.application_name.is_empty() {
            return Err(invalid("application name is empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect timeout is invalid"));
        }
        if self.operation_timeout_secs == 0 {
            return Err(invalid("operation timeout is invalid"));
        }
        if self.long_operation_timeout_secs == 0 {
            return Err(invalid("long operation timeout is invalid"));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        load_file(path)
    }
}

fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => Ok(toml::from_str(&contents)?),
        "json" => Ok(serde_json::from_str(&contents)?),
        _ => anyhow::bail!("Unsupported config file extension: {}", ext),
    }
}
