//! Native password authentication: an MD5 challenge/response over the
//! agent flow.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

use super::{
    operation_not_found, request, AuthContext, AuthPlugin, AUTH_AGENT_AUTH_REQUEST, AUTH_AGENT_AUTH_RESPONSE,
    AUTH_CLIENT_AUTH_REQUEST, AUTH_CLIENT_AUTH_RESPONSE, AUTH_CLIENT_START, AUTH_ESTABLISH_CONTEXT, AUTH_FLOW_COMPLETE,
};
use crate::connection::Connection;
use crate::error::{Result, TransportError};

/// Bytes of the challenge that enter the digest.
pub const CHALLENGE_LEN: usize = 64;
/// Bytes of the MD5 digest that are sent.
pub const RESPONSE_LEN: usize = 16;
/// The password is zero-padded (or cut) to this length.
pub const MAX_PASSWORD_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ClientStart,
    ClientAuthRequest,
    EstablishContext,
    ClientAuthResponse,
}

impl Operation {
    fn parse(name: &str) -> Option<Self> {
        match name {
            AUTH_CLIENT_START => Some(Operation::ClientStart),
            AUTH_CLIENT_AUTH_REQUEST => Some(Operation::ClientAuthRequest),
            AUTH_ESTABLISH_CONTEXT => Some(Operation::EstablishContext),
            AUTH_CLIENT_AUTH_RESPONSE => Some(Operation::ClientAuthResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlugin;

#[async_trait]
impl AuthPlugin for NativePlugin {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn execute(&self, conn: &mut Connection, operation: &str, ctx: &AuthContext) -> Result<AuthContext> {
        match Operation::parse(operation).ok_or_else(|| operation_not_found(operation))? {
            Operation::ClientStart => Ok(client_start(conn, ctx)),
            Operation::ClientAuthRequest => client_request(conn, ctx).await,
            Operation::EstablishContext => establish_context(conn, ctx),
            Operation::ClientAuthResponse => client_response(conn, ctx).await,
        }
    }
}

fn client_start(conn: &Connection, ctx: &AuthContext) -> AuthContext {
    let mut resp = ctx.clone();
    resp.user_name = Some(conn.account().proxy_user.clone());
    resp.zone_name = Some(conn.account().proxy_zone.clone());
    resp.set_next_operation(AUTH_CLIENT_AUTH_REQUEST);
    resp
}

async fn client_request(conn: &Connection, ctx: &AuthContext) -> Result<AuthContext> {
    let mut req = ctx.clone();
    req.set_next_operation(AUTH_AGENT_AUTH_REQUEST);
    let mut resp = request(conn, &req).await?;
    resp.set_next_operation(AUTH_ESTABLISH_CONTEXT);
    Ok(resp)
}

fn establish_context(conn: &mut Connection, ctx: &AuthContext) -> Result<AuthContext> {
    let challenge = ctx.request_result.as_deref().unwrap_or_default().as_bytes();
    if challenge.len() < CHALLENGE_LEN {
        return Err(TransportError::auth_flow(format!(
            "challenge of {} bytes is shorter than {} bytes",
            challenge.len(),
            CHALLENGE_LEN
        )));
    }
    conn.set_client_signature(client_signature(challenge));

    let password = ctx.password.as_deref().unwrap_or_default();
    let mut resp = ctx.clone();
    resp.digest = Some(generate_auth_response(challenge, password));
    resp.password = None;
    resp.set_next_operation(AUTH_CLIENT_AUTH_RESPONSE);
    Ok(resp)
}

async fn client_response(conn: &mut Connection, ctx: &AuthContext) -> Result<AuthContext> {
    for (key, present) in [
        ("digest", ctx.digest.is_some()),
        ("user_name", ctx.user_name.is_some()),
        ("zone_name", ctx.zone_name.is_some()),
    ] {
        if !present {
            return Err(TransportError::auth_flow(format!(
                "native authentication context is missing {}",
                key
            )));
        }
    }

    let mut req = ctx.clone();
    req.set_next_operation(AUTH_AGENT_AUTH_RESPONSE);
    let mut resp = request(conn, &req).await?;
    conn.set_logged_in(true);
    resp.set_next_operation(AUTH_FLOW_COMPLETE);
    Ok(resp)
}

/// Hex of the first 16 challenge bytes; identifies the session to later
/// requests that need it.
pub fn client_signature(challenge: &[u8]) -> String {
    hex::encode(&challenge[..challenge.len().min(16)])
}

/// Digest of the first 64 challenge bytes and the password padded to 50
/// bytes, base64 encoded. An empty password contributes nothing.
///
/// Zero bytes of the digest are replaced by 1 since the server treats the
/// response as a C string.
pub fn generate_auth_response(challenge: &[u8], password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(&challenge[..challenge.len().min(CHALLENGE_LEN)]);
    if !password.is_empty() {
        let mut padded = [0u8; MAX_PASSWORD_LEN];
        let bytes = password.as_bytes();
        let n = bytes.len().min(MAX_PASSWORD_LEN);
        padded[..n].copy_from_slice(&bytes[..n]);
        hasher.update(padded);
    }
    let mut digest = hasher.finalize();
    for b in digest.iter_mut() {
        if *b == 0 {
            *b = 1;
        }
    }
    BASE64.encode(&digest[..RESPONSE_LEN])
}
