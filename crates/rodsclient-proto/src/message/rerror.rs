use crate::error::Result;
use crate::pack::Element;

/// One entry of an `RError_PI` stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RErrorEntry {
    pub status: i32,
    pub message: String,
}

/// Error stack a server may attach in the error segment of a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RError {
    pub entries: Vec<RErrorEntry>,
}

impl RError {
    pub fn parse(segment: &[u8]) -> Result<Self> {
        let root = Element::parse_root(segment, "RError_PI")?;
        let entries = root
            .children_named("RErrMsg_PI")
            .map(|e| {
                Ok(RErrorEntry {
                    status: e.num_of("status")?,
                    message: e.text_or_empty("msg").trim().to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Messages joined into one line, or `None` when the stack is empty.
    pub fn summary(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .entries
            .iter()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack() {
        let doc = b"<RError_PI><count>2</count><RErrMsg_PI><status>-826000</status><msg>bad password\n</msg></RErrMsg_PI><RErrMsg_PI><status>-1</status><msg>again</msg></RErrMsg_PI></RError_PI>";
        let err = RError::parse(doc).unwrap();
        assert_eq!(err.entries.len(), 2);
        assert_eq!(err.entries[0].status, -826000);
        assert_eq!(err.summary().as_deref(), Some("bad password; again"));
    }

    #[test]
    fn test_empty_stack() {
        let err = RError::parse(b"<RError_PI><count>0</count></RError_PI>").unwrap();
        assert_eq!(err.summary(), None);
    }
}
