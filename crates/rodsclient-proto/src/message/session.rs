use crate::codes::api;
use crate::error::Result;
use crate::frame::{msg_type, Message, MessageHeader};
use crate::message::{check_result, Request, Response};
use crate::pack::PackWriter;

/// Polite goodbye; the server does not answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Disconnect;

impl Request for Disconnect {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::header_only(MessageHeader::new(msg_type::DISCONNECT, 0)))
    }
}

/// Attaches a ticket to the current session (`ticketAdminInp_PI` with
/// `arg1 = session`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketAdminRequest {
    pub ticket: String,
}

impl Request for TicketAdminRequest {
    fn to_message(&self) -> Result<Message> {
        let body = PackWriter::new("ticketAdminInp_PI")
            .text("arg1", "session")
            .text("arg2", &self.ticket)
            .text("arg3", "")
            .text("arg4", "")
            .text("arg5", "")
            .text("arg6", "")
            .nested(PackWriter::new("KeyValPair_PI").num("ssLen", 0))
            .finish();
        Ok(Message::new(msg_type::API_REQ, body, api::TICKET_ADMIN_AN))
    }
}

/// A reply carrying only a result code in `intInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyResponse {
    pub result: i32,
}

impl Response for EmptyResponse {
    fn from_message(&mut self, msg: &Message) -> Result<()> {
        self.result = msg.header.int_info;
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        check_result(self.result)
    }
}
