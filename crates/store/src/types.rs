//! Common types shared by backends and repositories.

use std::fmt;

use bytes::Bytes;

/// A named group of documents.
///
/// Ids only need to be unique within their collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Drug records keyed by their external drug id.
    Drugs,
    /// Audit entries keyed by their generated id.
    AuditLog,
}

impl Collection {
    /// Returns the stable storage name of the collection.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drugs => "drugs",
            Self::AuditLog => "audit_log",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document returned from collection scans.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use pharmatrace_store::Document;
///
/// let doc = Document::new("1001", Bytes::from_static(br#"{"id":"1001"}"#));
/// assert_eq!(doc.id, "1001");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// The id the document is stored under.
    pub id: String,

    /// The raw JSON bytes.
    pub value: Bytes,
}

impl Document {
    /// Creates a new document.
    pub fn new(id: impl Into<String>, value: Bytes) -> Self {
        Self { id: id.into(), value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_are_stable() {
        assert_eq!(Collection::Drugs.to_string(), "drugs");
        assert_eq!(Collection::AuditLog.to_string(), "audit_log");
    }
}
