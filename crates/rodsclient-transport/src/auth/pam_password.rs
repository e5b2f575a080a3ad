//! PAM password authentication over the agent flow. The server checks the
//! password with PAM and issues a token, which then logs in natively.

use async_trait::async_trait;

use super::native::NativePlugin;
use super::{
    authenticate_client, check_secure_channel, operation_not_found, request, AuthContext, AuthPlugin,
    AUTH_AGENT_AUTH_REQUEST, AUTH_CLIENT_AUTH_REQUEST, AUTH_CLIENT_START, AUTH_FLOW_COMPLETE, PERFORM_NATIVE_AUTH,
};
use crate::connection::Connection;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ClientStart,
    ClientAuthRequest,
    PerformNativeAuth,
}

impl Operation {
    fn parse(name: &str) -> Option<Self> {
        match name {
            AUTH_CLIENT_START => Some(Operation::ClientStart),
            AUTH_CLIENT_AUTH_REQUEST => Some(Operation::ClientAuthRequest),
            PERFORM_NATIVE_AUTH => Some(Operation::PerformNativeAuth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PamPasswordPlugin {
    require_secure: bool,
}

impl PamPasswordPlugin {
    /// With `require_secure`, sending the password over plain TCP fails.
    pub fn new(require_secure: bool) -> Self {
        Self { require_secure }
    }
}

#[async_trait]
impl AuthPlugin for PamPasswordPlugin {
    fn name(&self) -> &'static str {
        "pam_password"
    }

    async fn execute(&self, conn: &mut Connection, operation: &str, ctx: &AuthContext) -> Result<AuthContext> {
        match Operation::parse(operation).ok_or_else(|| operation_not_found(operation))? {
            Operation::ClientStart => Ok(client_start(conn, ctx)),
            Operation::ClientAuthRequest => self.client_request(conn, ctx).await,
            Operation::PerformNativeAuth => perform_native_auth(conn, ctx).await,
        }
    }
}

fn client_start(conn: &Connection, ctx: &AuthContext) -> AuthContext {
    let mut resp = ctx.clone();
    resp.user_name = Some(conn.account().proxy_user.clone());
    resp.zone_name = Some(conn.account().proxy_zone.clone());
    resp.pam_password = resp.password.take();
    resp.set_next_operation(AUTH_CLIENT_AUTH_REQUEST);
    resp
}

impl PamPasswordPlugin {
    async fn client_request(&self, conn: &Connection, ctx: &AuthContext) -> Result<AuthContext> {
        check_secure_channel(conn, self.require_secure)?;

        let mut req = ctx.clone();
        req.set_next_operation(AUTH_AGENT_AUTH_REQUEST);
        let mut resp = request(conn, &req).await?;
        if resp.request_result.is_none() {
            return Err(conn
                .account()
                .auth_error("PAM password response did not carry a token"));
        }
        resp.set_next_operation(PERFORM_NATIVE_AUTH);
        Ok(resp)
    }
}

/// Logs in natively with the token the server issued. Shared with the
/// interactive PAM plugin.
pub(crate) async fn perform_native_auth(conn: &mut Connection, ctx: &AuthContext) -> Result<AuthContext> {
    let mut resp = ctx.clone();
    resp.pam_password = None;
    let token = resp
        .request_result
        .clone()
        .ok_or_else(|| conn.account().auth_error("no PAM token to log in with"))?;
    conn.account_mut().pam_token = token.clone();

    authenticate_client(conn, &NativePlugin, AuthContext::with_password(token)).await?;

    conn.set_logged_in(true);
    resp.set_next_operation(AUTH_FLOW_COMPLETE);
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Account, ConnectionConfig};
    use crate::error::TransportError;

    fn conn() -> Connection {
        Connection::new(
            Account::new("localhost", 1247, "alice", "tempZone", "pam-secret"),
            ConnectionConfig::default(),
        )
    }

    #[test]
    fn test_client_start_moves_password_to_wire_key() {
        let resp = client_start(&conn(), &AuthContext::with_password("pam-secret"));
        assert!(resp.password.is_none());
        assert_eq!(resp.pam_password.as_deref(), Some("pam-secret"));
        let wire = resp.to_wire().unwrap();
        assert_eq!(wire["a_pw"], "pam-secret");
        assert_eq!(wire["user_name"], "alice");
    }

    #[tokio::test]
    async fn test_plain_tcp_rejected_when_secure_auth_required() {
        let mut conn = conn();
        let ctx = client_start(&conn, &AuthContext::with_password("pam-secret"));
        let err = PamPasswordPlugin::new(true)
            .execute(&mut conn, AUTH_CLIENT_AUTH_REQUEST, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_native_auth_needs_token() {
        let err = perform_native_auth(&mut conn(), &AuthContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Auth { .. }));
    }
}
