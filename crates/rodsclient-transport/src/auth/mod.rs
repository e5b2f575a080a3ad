//! Authentication.
//!
//! Servers from 4.3.0 run a plugin flow: the client and the agent pass a
//! JSON context back and forth, and `next_operation` in each reply names the
//! step the client runs next. [`authenticate_client`] drives that loop for
//! any [`AuthPlugin`]. Older servers use the fixed exchanges in [`legacy`].

pub mod input;
pub mod legacy;
pub mod native;
pub mod pam_interactive;
pub mod pam_password;

use std::fmt;

use async_trait::async_trait;
use rodsclient_proto::message::{AuthPluginRequest, AuthPluginResponse};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AuthScheme;
use crate::connection::Connection;
use crate::error::{Result, TransportError};

use native::NativePlugin;
use pam_interactive::PamInteractivePlugin;
use pam_password::PamPasswordPlugin;

pub const AUTH_CLIENT_START: &str = "auth_client_start";
pub const AUTH_ESTABLISH_CONTEXT: &str = "auth_establish_context";
pub const AUTH_CLIENT_AUTH_REQUEST: &str = "auth_client_auth_request";
pub const AUTH_AGENT_AUTH_REQUEST: &str = "auth_agent_auth_request";
pub const AUTH_CLIENT_AUTH_RESPONSE: &str = "auth_client_auth_response";
pub const AUTH_AGENT_AUTH_RESPONSE: &str = "auth_agent_auth_response";
pub const AUTH_FLOW_COMPLETE: &str = "authentication_flow_complete";
pub const PERFORM_NATIVE_AUTH: &str = "perform_native_auth";

/// First release that speaks the plugin flow.
const PLUGIN_API_VERSION: (u32, u32, u32) = (4, 3, 0);

/// The JSON object exchanged with the agent.
///
/// Keys this client does not interpret survive a round trip in `extra`.
/// `password` never leaves the process.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Password handed to the PAM stack on the server.
    #[serde(rename = "a_pw", skip_serializing_if = "Option::is_none")]
    pub pam_password: Option<String>,
    /// Interactive PAM state, edited with JSON patches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pstate: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdirty: Option<bool>,
    /// Interactive PAM message from the server: prompt, patch, retrieve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<Map<String, Value>>,
    /// Interactive PAM answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("AuthContext")
            .field("scheme", &self.scheme)
            .field("next_operation", &self.next_operation)
            .field("user_name", &self.user_name)
            .field("zone_name", &self.zone_name)
            .field("request_result", &redact(&self.request_result))
            .field("digest", &redact(&self.digest))
            .field("pam_password", &redact(&self.pam_password))
            .field("pstate", &self.pstate)
            .field("pdirty", &self.pdirty)
            .field("msg", &self.msg)
            .field("resp", &redact(&self.resp))
            .field("password", &redact(&self.password))
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AuthContext {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn next_operation(&self) -> Option<&str> {
        self.next_operation.as_deref()
    }

    pub fn set_next_operation(&mut self, operation: &str) {
        self.next_operation = Some(operation.to_string());
    }

    pub fn to_wire(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(TransportError::auth_flow("authentication context is not an object")),
            Err(e) => Err(TransportError::auth_flow(format!(
                "failed to encode authentication context: {}",
                e
            ))),
        }
    }

    /// Decodes an agent reply. The local password of `sent` carries over.
    pub fn from_wire(context: Map<String, Value>, sent: &AuthContext) -> Result<AuthContext> {
        let mut ctx: AuthContext = serde_json::from_value(Value::Object(context)).map_err(|e| {
            TransportError::auth_flow(format!("failed to decode authentication context: {}", e))
        })?;
        ctx.password = sent.password.clone();
        Ok(ctx)
    }
}

/// One authentication scheme of the plugin flow.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// Scheme name sent as `scheme`.
    fn name(&self) -> &'static str;

    /// Runs the client-side step `operation` and returns the context for
    /// the next one. Unknown operations are
    /// [`TransportError::AuthOperationNotFound`].
    async fn execute(&self, conn: &mut Connection, operation: &str, ctx: &AuthContext) -> Result<AuthContext>;
}

pub(crate) fn operation_not_found(operation: &str) -> TransportError {
    TransportError::AuthOperationNotFound {
        operation: operation.to_string(),
    }
}

/// Runs `plugin` from `auth_client_start` until a step logs the connection
/// in.
///
/// Reaching `authentication_flow_complete`, or a reply without a next
/// operation, while still logged out fails the flow.
pub async fn authenticate_client(conn: &mut Connection, plugin: &dyn AuthPlugin, mut ctx: AuthContext) -> Result<()> {
    let scheme = plugin.name();
    ctx.scheme = Some(scheme.to_string());
    ctx.set_next_operation(AUTH_CLIENT_START);
    let mut operation = AUTH_CLIENT_START.to_string();
    tracing::debug!(scheme, "authentication started");

    loop {
        tracing::debug!(scheme, operation = %operation, "authentication step");
        let response = plugin.execute(conn, &operation, &ctx).await?;
        if conn.is_logged_in() {
            break;
        }

        let next = match response.next_operation() {
            Some(next) if !next.is_empty() && next != AUTH_FLOW_COMPLETE => next.to_string(),
            Some(_) => {
                return Err(TransportError::auth_flow(format!(
                    "authentication flow of {} completed without logging in",
                    scheme
                )))
            }
            None => {
                return Err(TransportError::auth_flow(format!(
                    "authentication response of {} did not name a next operation",
                    scheme
                )))
            }
        };
        operation = next;
        ctx = response;
    }

    tracing::debug!(scheme, "authentication complete");
    Ok(())
}

/// Sends `ctx` to the agent and decodes the reply context.
pub(crate) async fn request(conn: &Connection, ctx: &AuthContext) -> Result<AuthContext> {
    let request = AuthPluginRequest::from(ctx.to_wire()?);
    let mut response = AuthPluginResponse::default();
    conn.request_and_check(&request, &mut response).await.map_err(|e| {
        tracing::debug!(operation = ?ctx.next_operation, error = %e, "agent request failed");
        conn.account().auth_refusal("agent request refused", e)
    })?;
    AuthContext::from_wire(response.context, ctx)
}

/// PAM secrets travel in the clear without TLS. That fails with
/// `required` and only warns otherwise.
pub(crate) fn check_secure_channel(conn: &Connection, required: bool) -> Result<()> {
    if conn.is_tls() {
        return Ok(());
    }
    if required {
        return Err(conn
            .account()
            .auth_error("PAM authentication requires a TLS connection"));
    }
    tracing::warn!(account = %conn.account(), "using an insecure channel for PAM authentication, the password is visible on the network");
    Ok(())
}

fn speaks_plugin_api(conn: &Connection) -> Result<bool> {
    let (major, minor, patch) = PLUGIN_API_VERSION;
    conn.server_version()
        .map(|v| v.has_higher_version_than(major, minor, patch))
        .ok_or(TransportError::NotConnected)
}

/// Logs an opened connection in with the account's scheme.
pub(crate) async fn login(conn: &mut Connection) -> Result<()> {
    let plugin_api = speaks_plugin_api(conn)?;
    let scheme = conn.account().auth_scheme;
    tracing::debug!(scheme = %scheme, plugin_api, "login");

    match scheme {
        AuthScheme::Native => {
            let password = conn.account().password.clone();
            login_native(conn, password, plugin_api).await
        }
        AuthScheme::PamPassword if !conn.account().pam_token.is_empty() => login_with_pam_token(conn).await,
        AuthScheme::PamPassword if plugin_api => {
            let plugin = PamPasswordPlugin::new(conn.config().require_secure_auth);
            let ctx = AuthContext::with_password(conn.account().password.clone());
            authenticate_client(conn, &plugin, ctx).await
        }
        AuthScheme::PamPassword => {
            legacy::obtain_pam_token(conn).await?;
            conn.reopen().await?;
            login_with_pam_token(conn).await
        }
        AuthScheme::PamInteractive if plugin_api => {
            let plugin = PamInteractivePlugin::new(conn.config().require_secure_auth, conn.input());
            let ctx = AuthContext::with_password(conn.account().password.clone());
            authenticate_client(conn, &plugin, ctx).await
        }
        AuthScheme::PamInteractive => Err(conn
            .account()
            .auth_error("interactive PAM requires server 4.3.0 or newer")),
    }
}

async fn login_native(conn: &mut Connection, password: String, plugin_api: bool) -> Result<()> {
    if plugin_api {
        authenticate_client(conn, &NativePlugin, AuthContext::with_password(password)).await
    } else {
        legacy::login_native(conn, &password).await
    }
}

/// A PAM token is a native password that only works over TLS.
async fn login_with_pam_token(conn: &mut Connection) -> Result<()> {
    if !conn.is_tls() {
        return Err(TransportError::connection("connection should be using SSL"));
    }
    let token = conn.account().pam_token.clone();
    let plugin_api = speaks_plugin_api(conn)?;
    login_native(conn, token, plugin_api).await
}
