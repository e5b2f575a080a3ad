//! Packing-instruction XML.
//!
//! The service speaks a flat XML dialect: one root element named after the
//! packing instruction (`StartupPack_PI`, `MsgHeader_PI`, ...) whose children
//! are leaf values or nested instructions. There are no attributes.
//!
//! [`PackWriter`] produces standard XML escaping (numeric entities for quotes
//! and control characters); the dialect corrector in [`crate::xml`] rewrites
//! that into what a given server release expects. [`Element`] parses a corrected
//! payload back into a small tree.

use std::fmt::Display;
use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{ProtoError, Result};

/// Builder for a packing-instruction document.
#[derive(Debug, Clone)]
pub struct PackWriter {
    root: &'static str,
    buf: String,
}

impl PackWriter {
    pub fn new(root: &'static str) -> Self {
        let mut buf = String::with_capacity(128);
        buf.push('<');
        buf.push_str(root);
        buf.push('>');
        Self { root, buf }
    }

    /// Appends a text leaf.
    pub fn text(mut self, tag: &str, value: &str) -> Self {
        self.open(tag);
        escape_text(value, &mut self.buf);
        self.close(tag);
        self
    }

    /// Appends a numeric leaf.
    pub fn num<T: Display>(mut self, tag: &str, value: T) -> Self {
        self.open(tag);
        self.buf.push_str(&value.to_string());
        self.close(tag);
        self
    }

    /// Appends a nested instruction.
    pub fn nested(mut self, child: PackWriter) -> Self {
        self.buf.push_str(&child.into_string());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.into_string().into_bytes()
    }

    fn into_string(mut self) -> String {
        let root = self.root;
        self.close(root);
        self.buf
    }

    fn open(&mut self, tag: &str) {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
    }

    fn close(&mut self, tag: &str) {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
    }
}

/// Standard text escaping: quotes and control characters become numeric
/// entities, characters outside the XML character range become U+FFFD.
pub fn escape_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c if is_xml_char(c) => out.push(c),
            _ => out.push('\u{FFFD}'),
        }
    }
}

/// Whether `c` is inside the XML 1.0 character range.
pub fn is_xml_char(c: char) -> bool {
    matches!(c as u32,
        0x09 | 0x0A | 0x0D
        | 0x20..=0xD7FF
        | 0xE000..=0xFFFD
        | 0x10000..=0x10FFFF)
}

/// A parsed packing-instruction element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Parses a document and returns its root element.
    pub fn parse(xml: &[u8]) -> Result<Element> {
        let mut reader = Reader::from_reader(xml);
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| ProtoError::Xml(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    stack.push(Element {
                        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                        ..Default::default()
                    });
                }
                Event::Empty(empty) => {
                    let element = Element {
                        name: String::from_utf8_lossy(empty.name().as_ref()).into_owned(),
                        ..Default::default()
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ProtoError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let unescaped = text
                            .unescape()
                            .map_err(|e| ProtoError::Xml(e.to_string()))?;
                        top.text.push_str(&unescaped);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => {
                    return Err(ProtoError::Xml(if stack.is_empty() {
                        "empty document".to_string()
                    } else {
                        "unexpected end of document".to_string()
                    }));
                }
                _ => {}
            }
        }
    }

    /// Parses a document and checks the root element name.
    pub fn parse_root(xml: &[u8], root: &str) -> Result<Element> {
        let element = Self::parse(xml)?;
        if element.name != root {
            return Err(ProtoError::UnexpectedRoot {
                expected: root.to_string(),
                got: element.name,
            });
        }
        Ok(element)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a required child.
    pub fn text_of(&self, name: &str) -> Result<&str> {
        self.child(name)
            .map(|c| c.text.as_str())
            .ok_or_else(|| ProtoError::missing(&self.name, name))
    }

    /// Text of an optional child, empty when absent.
    pub fn text_or_empty(&self, name: &str) -> &str {
        self.child(name).map(|c| c.text.as_str()).unwrap_or("")
    }

    /// Numeric child; absent or blank children read as zero.
    pub fn num_of<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr + Default,
    {
        let raw = self.text_or_empty(name).trim();
        if raw.is_empty() {
            return Ok(T::default());
        }
        raw.parse::<T>().map_err(|_| ProtoError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_escapes_like_standard_xml() {
        let xml = PackWriter::new("Test_PI")
            .text("a", "say \"hi\" it's <ok> & \t\n\r")
            .num("n", -5)
            .finish();
        assert_eq!(
            String::from_utf8(xml).unwrap(),
            "<Test_PI><a>say &#34;hi&#34; it&#39;s &lt;ok&gt; &amp; &#x9;&#xA;&#xD;</a><n>-5</n></Test_PI>"
        );
    }

    #[test]
    fn test_writer_replaces_out_of_range_chars() {
        let xml = PackWriter::new("T").text("a", "x\u{1}y\u{FFFE}").finish();
        assert_eq!(String::from_utf8(xml).unwrap(), "<T><a>x\u{FFFD}y\u{FFFD}</a></T>");
    }

    #[test]
    fn test_nested_writer() {
        let inner = PackWriter::new("KeyValPair_PI").num("ssLen", 0);
        let xml = PackWriter::new("Outer_PI").text("arg1", "session").nested(inner).finish();
        assert_eq!(
            String::from_utf8(xml).unwrap(),
            "<Outer_PI><arg1>session</arg1><KeyValPair_PI><ssLen>0</ssLen></KeyValPair_PI></Outer_PI>"
        );
    }

    #[test]
    fn test_parse_roundtrip_with_whitespace() {
        let doc = b"<MsgHeader_PI>\n<type>RODS_VERSION</type>\n<msgLen>182</msgLen>\n<errorLen>0</errorLen>\n<bsLen>0</bsLen>\n<intInfo>0</intInfo>\n</MsgHeader_PI>\n";
        let root = Element::parse_root(doc, "MsgHeader_PI").unwrap();
        assert_eq!(root.text_of("type").unwrap(), "RODS_VERSION");
        assert_eq!(root.num_of::<u32>("msgLen").unwrap(), 182);
        assert_eq!(root.num_of::<i32>("intInfo").unwrap(), 0);
    }

    #[test]
    fn test_parse_entities_and_preserves_spaces() {
        let doc = b"<A><v> a &quot;b&quot; &apos;c&apos; &#34;d&#39; </v><e/></A>";
        let root = Element::parse(doc).unwrap();
        assert_eq!(root.text_of("v").unwrap(), " a \"b\" 'c' \"d' ");
        assert_eq!(root.text_of("e").unwrap(), "");
    }

    #[test]
    fn test_parse_repeated_children() {
        let doc = b"<RError_PI><count>2</count><RErrMsg_PI><status>-1</status><msg>a</msg></RErrMsg_PI><RErrMsg_PI><status>-2</status><msg>b</msg></RErrMsg_PI></RError_PI>";
        let root = Element::parse(doc).unwrap();
        let msgs: Vec<_> = root.children_named("RErrMsg_PI").collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].text_of("msg").unwrap(), "b");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Element::parse(b"").is_err());
        assert!(Element::parse(b"<A><b>1</b>").is_err());
        assert!(matches!(
            Element::parse_root(b"<A/>", "B"),
            Err(ProtoError::UnexpectedRoot { .. })
        ));
        let root = Element::parse(b"<A><n>x</n></A>").unwrap();
        assert!(matches!(
            root.num_of::<i32>("n"),
            Err(ProtoError::InvalidValue { .. })
        ));
        assert!(matches!(
            root.text_of("missing"),
            Err(ProtoError::MissingElement { .. })
        ));
    }
}
