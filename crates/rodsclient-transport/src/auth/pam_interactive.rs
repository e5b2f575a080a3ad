//! Interactive PAM: the server drives a conversation of prompts and the
//! client answers them, keeping the conversation state in `pstate`.
//!
//! Each server step may carry `msg.patch`, a JSON patch applied to
//! `pstate` where `add` and `replace` operations without a value take the
//! user's last answer. Waiting steps may name a `msg.retrieve` pointer
//! into `pstate`; a value found there answers the prompt without asking.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::input::InteractiveInput;
use super::pam_password::perform_native_auth;
use super::{
    check_secure_channel, operation_not_found, request, AuthContext, AuthPlugin, AUTH_AGENT_AUTH_REQUEST,
    AUTH_AGENT_AUTH_RESPONSE, AUTH_CLIENT_AUTH_REQUEST, AUTH_CLIENT_AUTH_RESPONSE, AUTH_CLIENT_START,
    AUTH_FLOW_COMPLETE, PERFORM_NATIVE_AUTH,
};
use crate::connection::Connection;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ClientStart,
    ClientAuthRequest,
    ClientAuthResponse,
    Running,
    Ready,
    Next,
    Response,
    Waiting,
    WaitingPw,
    Error,
    Timeout,
    Authenticated,
    NotAuthenticated,
    PerformNativeAuth,
}

impl Operation {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            AUTH_CLIENT_START => Operation::ClientStart,
            AUTH_CLIENT_AUTH_REQUEST => Operation::ClientAuthRequest,
            AUTH_CLIENT_AUTH_RESPONSE => Operation::ClientAuthResponse,
            "running" => Operation::Running,
            "ready" => Operation::Ready,
            "next" => Operation::Next,
            "response" => Operation::Response,
            "waiting" => Operation::Waiting,
            "waiting_pw" => Operation::WaitingPw,
            "error" => Operation::Error,
            "timeout" => Operation::Timeout,
            "authenticated" => Operation::Authenticated,
            "not_authenticated" => Operation::NotAuthenticated,
            PERFORM_NATIVE_AUTH => Operation::PerformNativeAuth,
            _ => return None,
        })
    }
}

pub struct PamInteractivePlugin {
    require_secure: bool,
    input: Arc<dyn InteractiveInput>,
}

impl std::fmt::Debug for PamInteractivePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PamInteractivePlugin")
            .field("require_secure", &self.require_secure)
            .finish()
    }
}

impl PamInteractivePlugin {
    pub fn new(require_secure: bool, input: Arc<dyn InteractiveInput>) -> Self {
        Self { require_secure, input }
    }
}

#[async_trait]
impl AuthPlugin for PamInteractivePlugin {
    fn name(&self) -> &'static str {
        "pam_interactive"
    }

    async fn execute(&self, conn: &mut Connection, operation: &str, ctx: &AuthContext) -> Result<AuthContext> {
        match Operation::parse(operation).ok_or_else(|| operation_not_found(operation))? {
            Operation::ClientStart => Ok(client_start(conn, ctx)),
            Operation::ClientAuthRequest => self.client_request(conn, ctx).await,
            Operation::ClientAuthResponse => client_response(conn, ctx).await,
            Operation::Running | Operation::Ready | Operation::Response => step(conn, ctx.clone()).await,
            Operation::Next => {
                let mut req = ctx.clone();
                if let Some(prompt) = prompt_of(&req) {
                    self.input.show_prompt(&prompt);
                }
                patch_state(&mut req)?;
                step(conn, req).await
            }
            Operation::Waiting => self.waiting(conn, ctx, false).await,
            Operation::WaitingPw => self.waiting(conn, ctx, true).await,
            Operation::Error | Operation::Timeout | Operation::NotAuthenticated => {
                tracing::warn!(state = operation, account = %conn.account(), "interactive PAM conversation ended without authentication");
                conn.set_logged_in(false);
                let mut resp = ctx.clone();
                resp.set_next_operation(AUTH_FLOW_COMPLETE);
                Ok(resp)
            }
            Operation::Authenticated => {
                let mut resp = ctx.clone();
                resp.set_next_operation(PERFORM_NATIVE_AUTH);
                Ok(resp)
            }
            Operation::PerformNativeAuth => perform_native_auth(conn, ctx).await,
        }
    }
}

fn client_start(conn: &Connection, ctx: &AuthContext) -> AuthContext {
    let mut resp = ctx.clone();
    resp.user_name = Some(conn.account().proxy_user.clone());
    resp.zone_name = Some(conn.account().proxy_zone.clone());
    resp.pdirty = Some(false);
    resp.pstate = Some(Map::new());
    resp.password = None;
    resp.set_next_operation(AUTH_CLIENT_AUTH_REQUEST);
    resp
}

async fn client_response(conn: &Connection, ctx: &AuthContext) -> Result<AuthContext> {
    if ctx.user_name.is_none() || ctx.zone_name.is_none() {
        return Err(conn
            .account()
            .auth_error("interactive PAM context is missing user_name or zone_name"));
    }
    let mut req = ctx.clone();
    req.set_next_operation(AUTH_AGENT_AUTH_RESPONSE);
    request(conn, &req).await
}

/// Patches the state and hands the context back; the server picks the next
/// operation.
async fn step(conn: &Connection, mut req: AuthContext) -> Result<AuthContext> {
    patch_state(&mut req)?;
    req.set_next_operation(AUTH_AGENT_AUTH_RESPONSE);
    request(conn, &req).await
}

impl PamInteractivePlugin {
    async fn client_request(&self, conn: &Connection, ctx: &AuthContext) -> Result<AuthContext> {
        check_secure_channel(conn, self.require_secure)?;
        let mut req = ctx.clone();
        req.set_next_operation(AUTH_AGENT_AUTH_REQUEST);
        let mut resp = request(conn, &req).await?;
        resp.set_next_operation(AUTH_CLIENT_AUTH_RESPONSE);
        Ok(resp)
    }

    async fn waiting(&self, conn: &Connection, ctx: &AuthContext, masked: bool) -> Result<AuthContext> {
        let mut req = ctx.clone();
        if let Some(value) = retrieve_entry(&req) {
            req.resp = Some(value);
            return step(conn, req).await;
        }

        let default = default_value(&req);
        if let Some(prompt) = prompt_of(&req) {
            self.input.show_prompt(&prompt);
        }
        let answer = if masked {
            self.input.read_masked()?
        } else {
            self.input.read_visible()?
        };
        req.resp = Some(if answer.is_empty() { default } else { answer });
        step(conn, req).await
    }
}

fn msg_text(ctx: &AuthContext, key: &str) -> Option<String> {
    ctx.msg
        .as_ref()
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn prompt_of(ctx: &AuthContext) -> Option<String> {
    msg_text(ctx, "prompt").filter(|p| !p.is_empty())
}

/// Value at `pointer` in the conversation state. Non-string values are
/// rendered as JSON.
fn lookup_state(ctx: &AuthContext, pointer: &str) -> Option<String> {
    let state = Value::Object(ctx.pstate.clone().unwrap_or_default());
    match state.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Answer stored earlier under `msg.retrieve`, if any.
fn retrieve_entry(ctx: &AuthContext) -> Option<String> {
    let pointer = msg_text(ctx, "retrieve")?;
    lookup_state(ctx, &pointer)
}

/// Answer used when the user enters nothing.
fn default_value(ctx: &AuthContext) -> String {
    msg_text(ctx, "default_path")
        .and_then(|pointer| lookup_state(ctx, &pointer))
        .unwrap_or_default()
}

/// Applies the step's patch to `pstate` and marks the state dirty.
fn patch_state(ctx: &mut AuthContext) -> Result<()> {
    let patch = ctx
        .msg
        .as_mut()
        .and_then(|m| m.remove("patch"))
        .or_else(|| ctx.extra.remove("patch"));
    let ops = match patch {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(ops)) => ops,
        Some(other) => {
            return Err(TransportError::auth_flow(format!(
                "interactive PAM patch is not a list: {}",
                other
            )))
        }
    };

    let answer = ctx.resp.clone().unwrap_or_default();
    let ops: Vec<Value> = ops
        .into_iter()
        .map(|mut op| {
            if let Value::Object(fields) = &mut op {
                let fills = matches!(fields.get("op").and_then(Value::as_str), Some("add" | "replace"));
                if fills && !fields.contains_key("value") {
                    fields.insert("value".to_string(), Value::String(answer.clone()));
                }
            }
            op
        })
        .collect();

    let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops))
        .map_err(|e| TransportError::auth_flow(format!("invalid interactive PAM patch: {}", e)))?;
    let mut state = Value::Object(ctx.pstate.take().unwrap_or_default());
    json_patch::patch(&mut state, &patch.0)
        .map_err(|e| TransportError::auth_flow(format!("failed to apply interactive PAM patch: {}", e)))?;

    ctx.pstate = match state {
        Value::Object(map) => Some(map),
        _ => return Err(TransportError::auth_flow("interactive PAM state is not an object")),
    };
    ctx.pdirty = Some(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::input::ScriptedInput;
    use crate::config::{Account, ConnectionConfig};
    use serde_json::json;

    fn ctx_with(msg: Value, pstate: Value) -> AuthContext {
        AuthContext {
            msg: serde_json::from_value(msg).unwrap(),
            pstate: serde_json::from_value(pstate).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_fills_missing_values_with_answer() {
        let mut ctx = ctx_with(
            json!({"patch": [{"op": "add", "path": "/otp"}, {"op": "add", "path": "/fixed", "value": "x"}]}),
            json!({"user": "alice"}),
        );
        ctx.resp = Some("123456".into());
        patch_state(&mut ctx).unwrap();

        let state = ctx.pstate.as_ref().unwrap();
        assert_eq!(state["otp"], "123456");
        assert_eq!(state["fixed"], "x");
        assert_eq!(state["user"], "alice");
        assert_eq!(ctx.pdirty, Some(true));
        assert!(!ctx.msg.as_ref().unwrap().contains_key("patch"));
    }

    #[test]
    fn test_top_level_patch_is_accepted() {
        let mut ctx = ctx_with(json!({}), json!({}));
        ctx.extra.insert("patch".into(), json!([{"op": "replace", "path": "/a", "value": 1}, {"op": "remove", "path": "/a"}]));
        ctx.pstate = Some(serde_json::from_value(json!({"a": 0})).unwrap());
        patch_state(&mut ctx).unwrap();
        assert!(ctx.pstate.as_ref().unwrap().is_empty());
        assert!(!ctx.extra.contains_key("patch"));
    }

    #[test]
    fn test_no_patch_leaves_state_clean() {
        let mut ctx = ctx_with(json!({"prompt": "Password: "}), json!({}));
        ctx.pdirty = Some(false);
        patch_state(&mut ctx).unwrap();
        assert_eq!(ctx.pdirty, Some(false));
    }

    #[test]
    fn test_bad_patch_is_an_error() {
        let mut ctx = ctx_with(json!({"patch": [{"op": "remove", "path": "/missing"}]}), json!({}));
        assert!(matches!(patch_state(&mut ctx), Err(TransportError::AuthFlow { .. })));
    }

    #[test]
    fn test_retrieve_and_default_lookup() {
        let ctx = ctx_with(
            json!({"retrieve": "/saved/otp", "default_path": "/user"}),
            json!({"saved": {"otp": "42"}, "user": "alice"}),
        );
        assert_eq!(retrieve_entry(&ctx).as_deref(), Some("42"));
        assert_eq!(default_value(&ctx), "alice");

        let missing = ctx_with(json!({"retrieve": "/nope"}), json!({}));
        assert_eq!(retrieve_entry(&missing), None);
        assert_eq!(default_value(&missing), "");
    }

    #[test]
    fn test_client_start_resets_state() {
        let conn = Connection::new(
            Account::new("localhost", 1247, "alice", "tempZone", "pw"),
            ConnectionConfig::default(),
        );
        let resp = client_start(&conn, &AuthContext::with_password("pw"));
        assert_eq!(resp.pdirty, Some(false));
        assert_eq!(resp.pstate, Some(Map::new()));
        assert!(resp.password.is_none());
        assert_eq!(resp.next_operation(), Some(AUTH_CLIENT_AUTH_REQUEST));
    }

    #[tokio::test]
    async fn test_terminal_states_end_the_flow() {
        let mut conn = Connection::new(
            Account::new("localhost", 1247, "alice", "tempZone", "pw"),
            ConnectionConfig::default(),
        );
        let plugin = PamInteractivePlugin::new(true, Arc::new(ScriptedInput::new(Vec::<String>::new())));
        for state in ["error", "timeout", "not_authenticated"] {
            let resp = plugin.execute(&mut conn, state, &AuthContext::default()).await.unwrap();
            assert_eq!(resp.next_operation(), Some(AUTH_FLOW_COMPLETE));
            assert!(!conn.is_logged_in());
        }
        let resp = plugin
            .execute(&mut conn, "authenticated", &AuthContext::default())
            .await
            .unwrap();
        assert_eq!(resp.next_operation(), Some(PERFORM_NATIVE_AUTH));
    }
}
