//! Typed request and response messages.
//!
//! A [`Request`] renders itself into a [`Message`] with standard XML escaping;
//! the connection applies the dialect correction before framing. A
//! [`Response`] is filled in from a received, already-corrected message.

mod auth;
mod rerror;
mod session;
mod ssl;
mod startup;

pub use auth::{
    decode_auth_plugin_request, AuthChallenge, AuthPluginRequest, AuthPluginResponse, AuthRequest, AuthResponse, AuthResult,
    LegacyAuthPluginRequest, LegacyAuthPluginResponse, PamAuthRequest, PamAuthResponse,
};
pub use rerror::{RError, RErrorEntry};
pub use session::{Disconnect, EmptyResponse, TicketAdminRequest};
pub use ssl::{SslSettings, SslSharedSecret};
pub use startup::{
    StartupPack, VersionReply, CLIENT_API_VERSION, CLIENT_RELEASE_VERSION, REQUEST_SERVER_NEGOTIATION,
};

use crate::error::{ProtoError, Result};
use crate::frame::Message;
use crate::xml::Correction;

/// A message the client sends.
pub trait Request: Send + Sync {
    fn to_message(&self) -> Result<Message>;

    fn correction(&self) -> Correction {
        Correction::Standard
    }
}

/// A message the client receives.
pub trait Response: Send {
    fn from_message(&mut self, msg: &Message) -> Result<()>;

    fn correction(&self) -> Correction {
        Correction::Standard
    }

    /// Turns a negative service result into an error.
    fn check_error(&self) -> Result<()> {
        Ok(())
    }
}

/// Negative results are service errors.
pub fn check_result(result: i32) -> Result<()> {
    if result < 0 {
        return Err(ProtoError::service(result));
    }
    Ok(())
}

pub(crate) fn require_body(msg: &Message) -> Result<()> {
    if msg.body.is_empty() {
        return Err(ProtoError::EmptyBody);
    }
    Ok(())
}
