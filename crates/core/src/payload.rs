//! File entries and the payload produced by decoding a listing blob.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the LLM asked us to do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    EditedFull,
    Created,
    Deleted,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::EditedFull,
        OperationKind::Created,
        OperationKind::Deleted,
    ];

    /// Marker suffix used on the wire, e.g. `DELETED` in `FILE WAS DELETED`.
    pub fn as_marker(&self) -> &'static str {
        match self {
            OperationKind::EditedFull => "EDITED_FULL",
            OperationKind::Created => "CREATED",
            OperationKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_marker())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|op| op.as_marker() == s)
            .ok_or_else(|| format!("unknown file operation '{}'", s))
    }
}

/// Byte span of a section's content inside the decoded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: usize,
    pub end: usize,
}

/// A single file, either read from the workspace or parsed out of pasted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    /// Set when the file could not be read; encoded as an annotation line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_range: Option<SourceRange>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            content: content.into(),
            operation: None,
            read_error: None,
            source_range: None,
        }
    }

    /// Entry for a file that could not be read.
    pub fn unreadable(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            read_error: Some(error.into()),
            ..Self::new(path, String::new())
        }
    }

    pub fn with_operation(mut self, operation: OperationKind) -> Self {
        if operation == OperationKind::Deleted {
            self.content.clear();
        }
        self.operation = Some(operation);
        self
    }

    /// Operation to perform, defaulting to a full-file edit when no marker was given.
    pub fn effective_operation(&self) -> OperationKind {
        self.operation.unwrap_or(OperationKind::EditedFull)
    }
}

/// Convert a workspace-relative path to forward-slash form.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").map(str::to_string).unwrap_or(path)
}

/// Files decoded from one pasted blob, plus non-fatal diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesPayload {
    pub files: Vec<FileEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl FilesPayload {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_marker_names() {
        assert_eq!(OperationKind::EditedFull.as_marker(), "EDITED_FULL");
        assert_eq!("CREATED".parse::<OperationKind>().unwrap(), OperationKind::Created);
        assert!("MOVED".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_deleted_entry_drops_content() {
        let entry = FileEntry::new("src/a.rs", "fn main() {}").with_operation(OperationKind::Deleted);
        assert_eq!(entry.content, "");
        assert_eq!(entry.effective_operation(), OperationKind::Deleted);
    }

    #[test]
    fn test_missing_operation_defaults_to_full_edit() {
        let entry = FileEntry::new(".\\src\\a.rs", "x");
        assert_eq!(entry.path, "src/a.rs");
        assert_eq!(entry.effective_operation(), OperationKind::EditedFull);
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let payload = FilesPayload {
            files: vec![FileEntry::unreadable("a.txt", "denied")],
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["files"][0]["readError"], "denied");
        assert!(json["files"][0].get("operation").is_none());
    }
}
