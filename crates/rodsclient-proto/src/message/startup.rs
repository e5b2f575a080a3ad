use crate::error::Result;
use crate::frame::{msg_type, Message};
use crate::message::{check_result, require_body, Request, Response};
use crate::pack::{Element, PackWriter};
use crate::version::ServerVersion;

/// Release string announced by the client.
pub const CLIENT_RELEASE_VERSION: &str = "rods4.3.0";
/// API version announced by the client.
pub const CLIENT_API_VERSION: &str = "d";
/// Option suffix asking the server to start a negotiation.
pub const REQUEST_SERVER_NEGOTIATION: &str = "request_server_negotiation";

/// `StartupPack_PI`, the first message on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPack {
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub application: String,
    pub request_negotiation: bool,
}

impl StartupPack {
    pub fn option(&self) -> String {
        if self.request_negotiation {
            format!("{};{}", self.application, REQUEST_SERVER_NEGOTIATION)
        } else {
            self.application.clone()
        }
    }
}

impl Request for StartupPack {
    fn to_message(&self) -> Result<Message> {
        let body = PackWriter::new("StartupPack_PI")
            .num("irodsProt", 1)
            .num("reconnFlag", 0)
            .num("connectCnt", 0)
            .text("proxyUser", &self.proxy_user)
            .text("proxyRcatZone", &self.proxy_zone)
            .text("clientUser", &self.client_user)
            .text("clientRcatZone", &self.client_zone)
            .text("relVersion", CLIENT_RELEASE_VERSION)
            .text("apiVersion", CLIENT_API_VERSION)
            .text("option", &self.option())
            .finish();
        Ok(Message::new(msg_type::CONNECT, body, 0))
    }
}

/// `Version_PI`, the server's answer to a startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionReply {
    pub status: i32,
    pub release: String,
    pub api: String,
    pub reconn_port: i32,
    pub reconn_addr: String,
    pub cookie: i32,
}

impl VersionReply {
    pub fn to_server_version(&self) -> ServerVersion {
        let mut version = ServerVersion::new(self.release.clone(), self.api.clone());
        version.reconn_port = self.reconn_port;
        version.reconn_addr = self.reconn_addr.clone();
        version.cookie = self.cookie;
        version
    }

    /// Renders the reply the way a server would; used by test servers.
    pub fn to_message(&self) -> Message {
        let body = PackWriter::new("Version_PI")
            .num("status", self.status)
            .text("relVersion", &self.release)
            .text("apiVersion", &self.api)
            .num("reconnPort", self.reconn_port)
            .text("reconnAddr", &self.reconn_addr)
            .num("cookie", self.cookie)
            .finish();
        Message::new(msg_type::VERSION, body, 0)
    }
}

impl Response for VersionReply {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        msg.header.expect_type(msg_type::VERSION)?;
        require_body(msg)?;
        let root = Element::parse_root(&msg.body, "Version_PI")?;
        self.status = root.num_of("status")?;
        self.release = root.text_or_empty("relVersion").to_string();
        self.api = root.text_or_empty("apiVersion").to_string();
        self.reconn_port = root.num_of("reconnPort")?;
        self.reconn_addr = root.text_or_empty("reconnAddr").to_string();
        self.cookie = root.num_of("cookie")?;
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtoError;

    #[test]
    fn test_startup_pack_option() {
        let mut pack = StartupPack {
            proxy_user: "rods".into(),
            proxy_zone: "tempZone".into(),
            client_user: "alice".into(),
            client_zone: "tempZone".into(),
            application: "rodsclient".into(),
            request_negotiation: true,
        };
        assert_eq!(pack.option(), "rodsclient;request_server_negotiation");
        let body = String::from_utf8(pack.to_message().unwrap().body).unwrap();
        assert!(body.starts_with("<StartupPack_PI><irodsProt>1</irodsProt><reconnFlag>0</reconnFlag><connectCnt>0</connectCnt><proxyUser>rods</proxyUser>"));
        assert!(body.contains("<relVersion>rods4.3.0</relVersion><apiVersion>d</apiVersion>"));

        pack.request_negotiation = false;
        assert_eq!(pack.option(), "rodsclient");
    }

    #[test]
    fn test_version_reply_roundtrip() {
        let reply = VersionReply {
            status: 0,
            release: "rods4.3.1".into(),
            api: "d".into(),
            reconn_port: 0,
            reconn_addr: String::new(),
            cookie: 400,
        };
        let mut decoded = VersionReply::default();
        decoded.from_message(&reply.to_message()).unwrap();
        assert_eq!(decoded, reply);
        let version = decoded.to_server_version();
        assert_eq!((version.major, version.minor, version.patch), (4, 3, 1));
    }

    #[test]
    fn test_version_reply_negative_status() {
        let reply = VersionReply {
            status: -9000,
            ..Default::default()
        };
        assert!(matches!(
            reply.check_error(),
            Err(ProtoError::Service { code: -9000, .. })
        ));
    }

    #[test]
    fn test_version_reply_wrong_type() {
        let msg = Message::new(msg_type::CS_NEG, b"<CS_NEG_PI/>".to_vec(), 0);
        assert!(matches!(
            VersionReply::default().from_message(&msg),
            Err(ProtoError::UnexpectedType { .. })
        ));
    }
}
