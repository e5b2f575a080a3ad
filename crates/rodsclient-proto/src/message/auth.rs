//! Authentication messages: the generic agent endpoint of 4.3+ servers, the
//! older challenge/response exchange and the PAM token APIs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::codes::api;
use crate::error::{ProtoError, Result};
use crate::frame::{msg_type, Message, MessageHeader};
use crate::message::{check_result, require_body, Request, Response};
use crate::pack::{Element, PackWriter};
use crate::xml::Correction;

/// Authentication context sent to the agent endpoint as base64 JSON inside
/// `BinBytesBuf_PI`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthPluginRequest {
    pub context: Map<String, Value>,
}

impl Request for AuthPluginRequest {
    fn to_message(&self) -> Result<Message> {
        let json = serde_json::to_vec(&self.context)?;
        let body = PackWriter::new("BinBytesBuf_PI")
            .num("buflen", json.len())
            .text("buf", &BASE64.encode(&json))
            .finish();
        Ok(Message::new(msg_type::API_REQ, body, api::AUTHENTICATION_APN))
    }
}

/// Agent reply; the result code is the header `intInfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthPluginResponse {
    pub context: Map<String, Value>,
    pub result: i32,
}

impl AuthPluginResponse {
    /// Renders the reply the way an agent would; used by test servers.
    pub fn to_message(&self) -> Result<Message> {
        let json = serde_json::to_vec(&self.context)?;
        let body = PackWriter::new("BinBytesBuf_PI")
            .num("buflen", json.len())
            .text("buf", &BASE64.encode(&json))
            .finish();
        Ok(Message::new(msg_type::API_REPLY, body, self.result))
    }
}

impl Response for AuthPluginResponse {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        if msg.body.is_empty() {
            return Ok(());
        }
        let root = Element::parse_root(&msg.body, "BinBytesBuf_PI")?;
        let mut json = BASE64.decode(root.text_or_empty("buf").trim())?;
        if let Some(nul) = json.iter().position(|b| *b == 0) {
            json.truncate(nul);
        }
        self.context = serde_json::from_slice(&json)?;
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}

/// Asks the server for a native challenge (pre-4.3 servers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest;

impl Request for AuthRequest {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::header_only(MessageHeader::new(
            msg_type::API_REQ,
            api::AUTH_REQUEST_AN,
        )))
    }
}

/// `authRequestOut_PI` carrying the base64 challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: String,
    pub result: i32,
}

impl AuthChallenge {
    pub fn challenge_bytes(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(self.challenge.trim())?)
    }
}

impl Response for AuthChallenge {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        if self.result < 0 && msg.body.is_empty() {
            return Ok(());
        }
        require_body(msg)?;
        let root = Element::parse_root(&msg.body, "authRequestOut_PI")?;
        self.challenge = root.text_of("challenge")?.to_string();
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}

/// `authResponseInp_PI`, the digest answer to a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub response: String,
    pub username: String,
}

impl Request for AuthResponse {
    fn to_message(&self) -> Result<Message> {
        let body = PackWriter::new("authResponseInp_PI")
            .text("response", &self.response)
            .text("username", &self.username)
            .finish();
        Ok(Message::new(msg_type::API_REQ, body, api::AUTH_RESPONSE_AN))
    }
}

/// Result of an [`AuthResponse`]; only the header matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResult {
    pub result: i32,
}

impl Response for AuthResult {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}

/// Dedicated PAM API: exchanges a password for a server-issued token.
#[derive(Clone, PartialEq, Eq)]
pub struct PamAuthRequest {
    pub user: String,
    pub password: String,
    pub ttl: i32,
}

impl std::fmt::Debug for PamAuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PamAuthRequest")
            .field("user", &self.user)
            .field("password", &"<Redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Request for PamAuthRequest {
    fn to_message(&self) -> Result<Message> {
        let body = PackWriter::new("pamAuthRequestInp_PI")
            .text("pamUser", &self.user)
            .text("pamPassword", &self.password)
            .num("timeToLive", self.ttl)
            .finish();
        Ok(Message::new(msg_type::API_REQ, body, api::PAM_AUTH_REQUEST_AN))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PamAuthResponse {
    pub token: String,
    pub result: i32,
}

impl Response for PamAuthResponse {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        if self.result < 0 && msg.body.is_empty() {
            return Ok(());
        }
        require_body(msg)?;
        let root = Element::parse_root(&msg.body, "pamAuthRequestOut_PI")?;
        self.token = root.text_or_empty("irodsPamPassword").to_string();
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}

/// `authPlugReqInp_PI`, the pre-4.3 plugin API used for PAM tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct LegacyAuthPluginRequest {
    pub scheme: String,
    pub context: String,
}

impl std::fmt::Debug for LegacyAuthPluginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyAuthPluginRequest")
            .field("scheme", &self.scheme)
            .field("context_len", &self.context.len())
            .finish()
    }
}

impl Request for LegacyAuthPluginRequest {
    fn to_message(&self) -> Result<Message> {
        let body = PackWriter::new("authPlugReqInp_PI")
            .text("auth_scheme_", &self.scheme)
            .text("context_", &self.context)
            .finish();
        Ok(Message::new(msg_type::API_REQ, body, api::AUTH_PLUG_REQ_AN))
    }
}

/// `authPlugReqOut_PI`; the token comes back in `result_`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyAuthPluginResponse {
    pub token: String,
    pub result: i32,
}

impl Response for LegacyAuthPluginResponse {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        if self.result < 0 && msg.body.is_empty() {
            return Ok(());
        }
        require_body(msg)?;
        let root = Element::parse_root(&msg.body, "authPlugReqOut_PI")?;
        let raw = unescape_hex_tokens(root.text_or_empty("result_"));
        self.token = String::from_utf8_lossy(&raw).into_owned();
        Ok(())
    }

    fn correction(&self) -> Correction {
        Correction::Password
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}

/// Reverses the `0x..` rendering the password corrector applies to bytes
/// outside printable ASCII.
fn unescape_hex_tokens(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"0x") && i + 4 <= bytes.len() {
            let pair = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = pair {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

impl From<Map<String, Value>> for AuthPluginRequest {
    fn from(context: Map<String, Value>) -> Self {
        Self { context }
    }
}

/// Decodes the agent request carried by a message; used by test servers.
pub fn decode_auth_plugin_request(msg: &Message) -> Result<Map<String, Value>> {
    if msg.header.int_info != api::AUTHENTICATION_APN {
        return Err(ProtoError::InvalidValue {
            name: "intInfo".to_string(),
            value: msg.header.int_info.to_string(),
        });
    }
    let root = Element::parse_root(&msg.body, "BinBytesBuf_PI")?;
    let json = BASE64.decode(root.text_or_empty("buf").trim())?;
    Ok(serde_json::from_slice(&json)?)
}
