//! Client/server transport-security negotiation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::frame::{msg_type, Message};
use crate::message::{Request, Response};
use crate::pack::{Element, PackWriter};

/// Key prefixing the result token in the client's reply.
pub const CS_NEG_RESULT_KW: &str = "cs_neg_result_kw";

/// Transport-security policy held by each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NegotiationPolicy {
    #[serde(rename = "CS_NEG_REQUIRE", alias = "SSL")]
    RequireSsl,
    #[serde(rename = "CS_NEG_REFUSE", alias = "TCP")]
    RequireTcp,
    #[default]
    #[serde(rename = "CS_NEG_DONT_CARE", alias = "DONT_CARE")]
    DontCare,
}

impl NegotiationPolicy {
    pub const ALL: [NegotiationPolicy; 3] = [
        NegotiationPolicy::RequireSsl,
        NegotiationPolicy::RequireTcp,
        NegotiationPolicy::DontCare,
    ];

    pub fn as_token(&self) -> &'static str {
        match self {
            NegotiationPolicy::RequireSsl => "CS_NEG_REQUIRE",
            NegotiationPolicy::RequireTcp => "CS_NEG_REFUSE",
            NegotiationPolicy::DontCare => "CS_NEG_DONT_CARE",
        }
    }
}

impl fmt::Display for NegotiationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for NegotiationPolicy {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CS_NEG_REQUIRE" | "SSL" => Ok(NegotiationPolicy::RequireSsl),
            "CS_NEG_REFUSE" | "TCP" => Ok(NegotiationPolicy::RequireTcp),
            "CS_NEG_DONT_CARE" | "DONT_CARE" | "" => Ok(NegotiationPolicy::DontCare),
            _ => Err(ProtoError::InvalidValue {
                name: "negotiation policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Outcome of combining two policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NegotiationResult {
    UseSsl,
    UseTcp,
    Failure,
}

impl NegotiationResult {
    pub fn as_token(&self) -> &'static str {
        match self {
            NegotiationResult::UseSsl => "CS_NEG_USE_SSL",
            NegotiationResult::UseTcp => "CS_NEG_USE_TCP",
            NegotiationResult::Failure => "CS_NEG_FAILURE",
        }
    }
}

impl fmt::Display for NegotiationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Combines the client and server policies.
pub fn resolve(client: NegotiationPolicy, server: NegotiationPolicy) -> NegotiationResult {
    use NegotiationPolicy::*;
    match (client, server) {
        (RequireSsl, RequireTcp) | (RequireTcp, RequireSsl) => NegotiationResult::Failure,
        (RequireSsl, _) | (_, RequireSsl) => NegotiationResult::UseSsl,
        _ => NegotiationResult::UseTcp,
    }
}

/// `CS_NEG_PI` from the server, carrying its policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsNegotiationOffer {
    pub status: i32,
    pub result: String,
}

impl CsNegotiationOffer {
    pub fn policy(&self) -> Result<NegotiationPolicy> {
        self.result.parse()
    }
}

impl Response for CsNegotiationOffer {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        msg.header.expect_type(msg_type::CS_NEG)?;
        let root = Element::parse_root(&msg.body, "CS_NEG_PI")?;
        self.status = root.num_of("status")?;
        self.result = root.text_or_empty("result").to_string();
        Ok(())
    }
}

/// `CS_NEG_PI` sent back by the client with the resolved result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsNegotiationReply {
    pub result: NegotiationResult,
}

impl Request for CsNegotiationReply {
    fn to_message(&self) -> Result<Message> {
        let status = if self.result == NegotiationResult::Failure { 0 } else { 1 };
        let body = PackWriter::new("CS_NEG_PI")
            .num("status", status)
            .text(
                "result",
                &format!("{}={};", CS_NEG_RESULT_KW, self.result.as_token()),
            )
            .finish();
        Ok(Message::new(msg_type::CS_NEG, body, 0))
    }
}
