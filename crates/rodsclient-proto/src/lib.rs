#![warn(missing_docs)]

//! rodsclient-proto: the iRODS wire format.
//!
//! Framing of `MsgHeader_PI` messages, packing-instruction XML, the per-release
//! XML dialect corrector, client/server security negotiation and the typed
//! messages used while connecting and authenticating. Nothing here performs
//! I/O; see `rodsclient-transport` for the connection.

pub mod codes;
pub mod error;
pub mod frame;
pub mod message;
pub mod negotiation;
pub mod pack;
pub mod version;
pub mod xml;

pub use error::{ProtoError, Result};
pub use frame::{Message, MessageHeader};
pub use message::{Request, Response};
pub use negotiation::{NegotiationPolicy, NegotiationResult};
pub use version::ServerVersion;
pub use xml::{Correction, XmlDialect};
