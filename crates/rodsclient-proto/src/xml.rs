//! XML dialect correction.
//!
//! Servers do not decode every standard XML escape. Outgoing payloads are
//! rewritten from standard escaping into the server's own, and incoming
//! payloads are cleaned up before parsing. Releases up to 4.2.8 use an older
//! dialect that swaps quotes and backticks.

use crate::error::{ProtoError, Result};
use crate::frame::Message;
use crate::pack::is_xml_char;
use crate::version::ServerVersion;

const ESC_QUOT: &str = "&#34;";
const ESC_APOS: &str = "&#39;";
const ESC_TAB: &str = "&#x9;";
const ESC_NL: &str = "&#xA;";
const ESC_CR: &str = "&#xD;";
const SERVER_ESC_QUOT: &str = "&quot;";
const SERVER_ESC_APOS: &str = "&apos;";

/// Which rewrite a message body needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    #[default]
    Standard,
    /// For bodies carrying literal credential bytes.
    Password,
    /// Binary bodies that are not XML at all.
    Raw,
}

/// Dialect spoken by the connected server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlDialect {
    correct_xml: bool,
}

impl Default for XmlDialect {
    fn default() -> Self {
        Self { correct_xml: true }
    }
}

impl XmlDialect {
    pub fn new(correct_xml: bool) -> Self {
        Self { correct_xml }
    }

    /// Dialect for a negotiated server; unknown servers speak correct XML.
    pub fn for_version(version: Option<&ServerVersion>) -> Self {
        Self::new(version.map(ServerVersion::talks_correct_xml).unwrap_or(true))
    }

    pub fn talks_correct_xml(&self) -> bool {
        self.correct_xml
    }

    /// Rewrites standard escaping into the server's escaping.
    pub fn to_wire(&self, input: &[u8]) -> Result<Vec<u8>> {
        let text = as_utf8(input)?;
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if let Some(r) = rest.strip_prefix(ESC_QUOT) {
                out.push_str(SERVER_ESC_QUOT);
                rest = r;
            } else if let Some(r) = rest.strip_prefix(ESC_APOS) {
                if self.correct_xml {
                    out.push_str(SERVER_ESC_APOS);
                } else {
                    out.push('\'');
                }
                rest = r;
            } else if let Some(r) = strip_control_escape(rest, &mut out) {
                rest = r;
            } else if c == '`' && !self.correct_xml {
                out.push_str(SERVER_ESC_APOS);
                rest = &rest[1..];
            } else {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
        Ok(out.into_bytes())
    }

    /// Like [`to_wire`](Self::to_wire) but quotes become literal characters.
    pub fn to_wire_for_password(&self, input: &[u8]) -> Result<Vec<u8>> {
        let text = as_utf8(input)?;
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if let Some(r) = rest.strip_prefix(ESC_QUOT) {
                out.push('"');
                rest = r;
            } else if let Some(r) = rest.strip_prefix(ESC_APOS) {
                out.push('\'');
                rest = r;
            } else if let Some(r) = strip_control_escape(rest, &mut out) {
                rest = r;
            } else {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
        Ok(out.into_bytes())
    }

    /// Cleans up a payload received from the server.
    pub fn from_wire(&self, input: &[u8]) -> Result<Vec<u8>> {
        let text = as_utf8(input)?;
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if !self.correct_xml {
                if let Some(r) = rest.strip_prefix(SERVER_ESC_QUOT) {
                    out.push('`');
                    rest = r;
                    continue;
                }
                if c == '\'' {
                    out.push_str(ESC_APOS);
                    rest = &rest[1..];
                    continue;
                }
            }
            out.push(if is_xml_char(c) { c } else { '\u{FFFD}' });
            rest = &rest[c.len_utf8()..];
        }
        Ok(out.into_bytes())
    }

    /// Incoming credential payloads: anything but printable ASCII, tab, CR
    /// and LF is rendered as a `0x..` hex token, byte by byte.
    pub fn from_wire_for_password(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            let rest = &input[i..];
            if !self.correct_xml {
                if rest.starts_with(SERVER_ESC_QUOT.as_bytes()) {
                    out.push(b'`');
                    i += SERVER_ESC_QUOT.len();
                    continue;
                }
                if rest[0] == b'\'' {
                    out.extend_from_slice(ESC_APOS.as_bytes());
                    i += 1;
                    continue;
                }
            }
            let b = rest[0];
            if matches!(b, 0x09 | 0x0A | 0x0D | 0x20..=0x7E) {
                out.push(b);
            } else {
                out.extend_from_slice(format!("0x{:02x}", b).as_bytes());
            }
            i += 1;
        }
        out
    }

    /// Applies the outgoing rewrite to a message body and fixes its length.
    /// On error the message is left untouched.
    pub fn correct_request(&self, msg: &mut Message, correction: Correction) -> Result<()> {
        if msg.body.is_empty() || correction == Correction::Raw {
            return Ok(());
        }
        msg.body = match correction {
            Correction::Password => self.to_wire_for_password(&msg.body)?,
            _ => self.to_wire(&msg.body)?,
        };
        msg.header.message_len = msg.body.len() as u32;
        Ok(())
    }

    /// Applies the incoming rewrite to a message body and fixes its length.
    pub fn correct_response(&self, msg: &mut Message, correction: Correction) -> Result<()> {
        if msg.body.is_empty() || correction == Correction::Raw {
            return Ok(());
        }
        msg.body = match correction {
            Correction::Password => self.from_wire_for_password(&msg.body),
            _ => self.from_wire(&msg.body)?,
        };
        msg.header.message_len = msg.body.len() as u32;
        Ok(())
    }
}

fn as_utf8(input: &[u8]) -> Result<&str> {
    std::str::from_utf8(input).map_err(|e| {
        tracing::debug!(len = input.len(), valid_up_to = e.valid_up_to(), "payload is not utf-8");
        ProtoError::InvalidUtf8 {
            original: input.to_vec(),
        }
    })
}

/// Numeric tab, CR and LF escapes go out as literal bytes.
fn strip_control_escape<'a>(rest: &'a str, out: &mut String) -> Option<&'a str> {
    for (esc, literal) in [(ESC_TAB, '\t'), (ESC_CR, '\r'), (ESC_NL, '\n')] {
        if let Some(r) = rest.strip_prefix(esc) {
            out.push(literal);
            return Some(r);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{Element, PackWriter};
    use proptest::prelude::*;

    const NEW: XmlDialect = XmlDialect { correct_xml: true };
    const OLD: XmlDialect = XmlDialect { correct_xml: false };

    fn wire(dialect: XmlDialect, input: &str) -> String {
        String::from_utf8(dialect.to_wire(input.as_bytes()).unwrap()).unwrap()
    }

    fn roundtrip(dialect: XmlDialect, value: &str) -> String {
        let xml = PackWriter::new("T").text("v", value).finish();
        let sent = dialect.to_wire(&xml).unwrap();
        let received = dialect.from_wire(&sent).unwrap();
        Element::parse(&received).unwrap().text_of("v").unwrap().to_string()
    }

    #[test]
    fn test_to_wire_new_server() {
        assert_eq!(wire(NEW, "a&#34;b&#39;c"), "a&quot;b&apos;c");
        assert_eq!(wire(NEW, "&#x9;&#xD;&#xA;"), "\t\r\n");
        assert_eq!(wire(NEW, "x`y"), "x`y");
    }

    #[test]
    fn test_to_wire_old_server() {
        assert_eq!(wire(OLD, "a&#34;b&#39;c"), "a&quot;b'c");
        assert_eq!(wire(OLD, "x`y"), "x&apos;y");
        assert_eq!(wire(OLD, "&#x9;"), "\t");
    }

    #[test]
    fn test_to_wire_for_password() {
        let out = OLD.to_wire_for_password(b"p&#34;w&#39;d`&#xA;").unwrap();
        assert_eq!(out, b"p\"w'd`\n");
        let out = NEW.to_wire_for_password(b"&#34;&#39;").unwrap();
        assert_eq!(out, b"\"'");
    }

    #[test]
    fn test_from_wire_old_server() {
        let out = OLD.from_wire(b"a&quot;b'c").unwrap();
        assert_eq!(out, b"a`b&#39;c");
    }

    #[test]
    fn test_from_wire_new_server_keeps_entities() {
        let out = NEW.from_wire(b"a&quot;b'c").unwrap();
        assert_eq!(out, b"a&quot;b'c");
    }

    #[test]
    fn test_from_wire_replaces_out_of_range_chars() {
        let out = NEW.from_wire("a\u{1}b\u{FFFF}c\td".as_bytes()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a\u{FFFD}b\u{FFFD}c\td");
    }

    #[test]
    fn test_invalid_utf8_returns_original() {
        let input = vec![b'<', b'a', b'>', 0xC3, 0x28, b'<', b'/', b'a', b'>'];
        for dialect in [NEW, OLD] {
            for result in [
                dialect.to_wire(&input),
                dialect.to_wire_for_password(&input),
                dialect.from_wire(&input),
            ] {
                match result {
                    Err(ProtoError::InvalidUtf8 { original }) => assert_eq!(original, input),
                    other => panic!("expected InvalidUtf8, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_from_wire_for_password_hex_renders_bytes() {
        let out = NEW.from_wire_for_password(&[b'a', 0x01, b'b', 0xff]);
        assert_eq!(out, b"a0x01b0xff");
    }

    #[test]
    fn test_roundtrip_new_server() {
        let value = "say \"hi\", it's\tfine\r\nok";
        assert_eq!(roundtrip(NEW, value), value);
    }

    #[test]
    fn test_roundtrip_old_server() {
        let value = "it's\tfine\r\nok";
        assert_eq!(roundtrip(OLD, value), value);
    }

    #[test]
    fn test_correct_request_updates_length() {
        let mut msg = Message::new("RODS_API_REQ", b"<a>&#34;</a>".to_vec(), 0);
        NEW.correct_request(&mut msg, Correction::Standard).unwrap();
        assert_eq!(msg.body, b"<a>&quot;</a>");
        assert_eq!(msg.header.message_len, msg.body.len() as u32);
    }

    #[test]
    fn test_correct_request_leaves_message_on_error() {
        let mut msg = Message::new("RODS_API_REQ", vec![0xff], 0);
        assert!(NEW.correct_request(&mut msg, Correction::Standard).is_err());
        assert_eq!(msg.body, vec![0xff]);
        assert_eq!(msg.header.message_len, 1);
    }

    #[test]
    fn test_raw_bodies_are_untouched() {
        let mut msg = Message::new("SHARED_SECRET", vec![0xff, 0x00, b'&'], 0);
        NEW.correct_request(&mut msg, Correction::Raw).unwrap();
        assert_eq!(msg.body, vec![0xff, 0x00, b'&']);
    }

    #[test]
    fn test_for_version() {
        assert!(XmlDialect::for_version(None).talks_correct_xml());
        let old = ServerVersion::new("rods4.2.8", "d");
        assert!(!XmlDialect::for_version(Some(&old)).talks_correct_xml());
    }

    proptest! {
        #[test]
        fn prop_ascii_roundtrip_new(value in "[ -~\t\r\n]{0,64}") {
            prop_assert_eq!(roundtrip(NEW, &value), value);
        }

        #[test]
        fn prop_ascii_roundtrip_old_without_double_quote(value in "[ !#-~\t\r\n]{0,64}") {
            // the old dialect maps `"` and backtick onto the same server escape
            let value = value.replace('`', "");
            prop_assert_eq!(roundtrip(OLD, &value), value);
        }

        #[test]
        fn prop_to_wire_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = NEW.to_wire(&bytes);
            let _ = OLD.from_wire(&bytes);
        }
    }
}
