use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Caller-facing identifier grouping one or more passages.
///
/// Serialized untagged, so a JSON string stays a string and a JSON integer
/// stays an integer when the mapping files are read back.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(untagged)]
pub enum DocumentId {
    Integer(i64),
    String(String),
}

/// The two shapes a [`DocumentId`] can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Integer,
    String,
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdKind::Integer => f.write_str("integer"),
            IdKind::String => f.write_str("string"),
        }
    }
}

impl DocumentId {
    /// Generate a fresh random string id for a document supplied without one.
    pub fn generate() -> Self {
        DocumentId::String(uuid::Uuid::new_v4().to_string())
    }

    pub fn kind(&self) -> IdKind {
        match self {
            DocumentId::Integer(_) => IdKind::Integer,
            DocumentId::String(_) => IdKind::String,
        }
    }

    /// The form used as a JSON object key.
    pub fn as_key(&self) -> String {
        self.to_string()
    }

    fn is_blank(&self) -> bool {
        matches!(self, DocumentId::String(s) if s.trim().is_empty())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentId::Integer(n) => write!(f, "{n}"),
            DocumentId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DocumentId {
    fn from(value: i64) -> Self {
        DocumentId::Integer(value)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        DocumentId::String(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        DocumentId::String(value)
    }
}

/// Check that every id in a passage-level batch has the same kind and that
/// no string id is blank. Repeats are allowed: chunks of one document share
/// its id.
pub fn validate_kinds(ids: &[DocumentId]) -> Result<()> {
    let Some(first) = ids.first() else {
        return Ok(());
    };

    if let Some(blank) = ids.iter().position(DocumentId::is_blank) {
        return Err(Error::Validation(format!(
            "document ids must not contain empty strings (position {blank})"
        )));
    }

    let kind = first.kind();
    if let Some(other) = ids.iter().find(|id| id.kind() != kind) {
        return Err(Error::Validation(format!(
            "all document ids must be of the same type: expected {kind}, found {} ({other})",
            other.kind()
        )));
    }

    Ok(())
}

/// Validate a document-level batch: same kind, no blanks, and no repeats.
pub fn validate_unique(ids: &[DocumentId]) -> Result<()> {
    validate_kinds(ids)?;

    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id) {
            return Err(Error::Validation(format!(
                "document ids must be unique: '{id}' appears more than once"
            )));
        }
    }
    Ok(())
}
