//! Logins for servers older than 4.3.0, which predate the agent flow.

use rodsclient_proto::message::{
    AuthChallenge, AuthRequest, AuthResponse, AuthResult, LegacyAuthPluginRequest, LegacyAuthPluginResponse,
    PamAuthRequest, PamAuthResponse,
};
use rodsclient_proto::ServerVersion;

use super::native::{client_signature, generate_auth_response, CHALLENGE_LEN};
use crate::connection::Connection;
use crate::error::{Result, TransportError};

/// PAM contexts at least this long go to the dedicated API.
const MAX_PAM_CONTEXT_LEN: usize = 1024 + 64;

/// Challenge and response through the dedicated API numbers.
pub(crate) async fn login_native(conn: &mut Connection, password: &str) -> Result<()> {
    let mut challenge = AuthChallenge::default();
    conn.request_and_check(&AuthRequest, &mut challenge)
        .await
        .map_err(|e| conn.account().auth_refusal("challenge request refused", e))?;

    let challenge = challenge.challenge_bytes()?;
    if challenge.len() < CHALLENGE_LEN {
        return Err(conn.account().auth_error(format!(
            "challenge of {} bytes is shorter than {} bytes",
            challenge.len(),
            CHALLENGE_LEN
        )));
    }
    conn.set_client_signature(client_signature(&challenge));

    let account = conn.account();
    let response = AuthResponse {
        response: generate_auth_response(&challenge, password),
        username: format!("{}#{}", account.proxy_user, account.proxy_zone),
    };
    let mut result = AuthResult::default();
    conn.request_and_check(&response, &mut result)
        .await
        .map_err(|e| conn.account().auth_refusal("challenge response refused", e))?;

    conn.set_logged_in(true);
    tracing::debug!(account = %conn.account(), "native login complete");
    Ok(())
}

/// Backslash-escapes the characters that delimit a key/value context.
pub fn escape_pam_password(password: &str) -> String {
    let mut out = String::with_capacity(password.len());
    for c in password.chars() {
        if matches!(c, '@' | '=' | '&' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Whether the token is requested through the dedicated PAM API rather
/// than the generic plugin API. Servers before 4.3.0 always use the
/// dedicated one. Newer ones use it only when the context cannot be parsed
/// reliably: the escaped password still contains `;` or `=`, or the
/// context is too long.
pub fn use_dedicated_pam_api(version: &ServerVersion, escaped_password: &str, context: &str) -> bool {
    if version.has_higher_version_than(4, 3, 0) {
        escaped_password.contains([';', '=']) || context.len() >= MAX_PAM_CONTEXT_LEN
    } else {
        true
    }
}

/// Exchanges the account password for a PAM token and stores it in the
/// account. Requires TLS.
pub(crate) async fn obtain_pam_token(conn: &mut Connection) -> Result<String> {
    if !conn.is_tls() {
        return Err(TransportError::connection("connection should be using SSL"));
    }
    let version = conn.server_version().cloned().ok_or(TransportError::NotConnected)?;

    let account = conn.account();
    let ttl = account.pam_ttl.max(0);
    let escaped = escape_pam_password(&account.password);
    let context = format!("a_user={};a_pw={};a_ttl={}", account.proxy_user, escaped, ttl);

    let token = if use_dedicated_pam_api(&version, &escaped, &context) {
        tracing::debug!(account = %account, "requesting PAM token through the dedicated API");
        let request = PamAuthRequest {
            user: account.proxy_user.clone(),
            password: account.password.clone(),
            ttl,
        };
        let mut response = PamAuthResponse::default();
        conn.request_and_check(&request, &mut response)
            .await
            .map_err(|e| conn.account().auth_refusal("PAM token request refused", e))?;
        response.token
    } else {
        tracing::debug!(account = %account, "requesting PAM token through the plugin API");
        let request = LegacyAuthPluginRequest {
            scheme: "pam".to_string(),
            context,
        };
        let mut response = LegacyAuthPluginResponse::default();
        conn.request_and_check(&request, &mut response)
            .await
            .map_err(|e| conn.account().auth_refusal("PAM token request refused", e))?;
        response.token
    };

    conn.account_mut().pam_token = token.clone();
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_pam_password() {
        assert_eq!(escape_pam_password("plain"), "plain");
        assert_eq!(escape_pam_password("a@b=c&d;e"), "a\\@b\\=c\\&d\\;e");
    }

    #[test]
    fn test_dedicated_api_choice() {
        let old = ServerVersion::new("rods4.2.11", "d");
        let new = ServerVersion::new("rods4.3.1", "d");
        assert!(use_dedicated_pam_api(&old, "plain", "a_user=u;a_pw=plain;a_ttl=0"));
        assert!(!use_dedicated_pam_api(&new, "plain", "a_user=u;a_pw=plain;a_ttl=0"));
        assert!(use_dedicated_pam_api(&new, "x\\;y", "a_user=u;a_pw=x\\;y;a_ttl=0"));
        assert!(use_dedicated_pam_api(&new, "x\\=y", "a_user=u;a_pw=x\\=y;a_ttl=0"));
        assert!(use_dedicated_pam_api(&new, "p", &"c".repeat(MAX_PAM_CONTEXT_LEN)));
        assert!(!use_dedicated_pam_api(&new, "p", &"c".repeat(MAX_PAM_CONTEXT_LEN - 1)));
    }
}
