//! Follow-up prompt asking the LLM to resend a reply that could not be used.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::codec::ParseError;

/// Where the last rejected reply is kept, next to the config file.
pub const LAST_FAILURE_FILE_NAME: &str = ".llm-copypaster-last-failure.json";

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Step at which an inbound reply was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStage {
    Validation,
    Sanitization,
    Apply,
}

impl RetryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::Validation => "validation",
            RetryStage::Sanitization => "sanitization",
            RetryStage::Apply => "apply",
        }
    }
}

impl fmt::Display for RetryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validation" => Ok(RetryStage::Validation),
            "sanitization" => Ok(RetryStage::Sanitization),
            "apply" => Ok(RetryStage::Apply),
            other => Err(format!(
                "unknown retry stage '{other}' (expected validation, sanitization or apply)"
            )),
        }
    }
}

/// The last rejected reply, kept so a retry prompt can be built later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFailure {
    pub stage: RetryStage,
    pub message: String,
    pub raw_clipboard_text: String,
}

impl LastFailure {
    pub fn new(stage: RetryStage, message: impl Into<String>, raw_clipboard_text: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            raw_clipboard_text: raw_clipboard_text.into(),
        }
    }

    pub fn from_parse_error(error: &ParseError, raw_clipboard_text: impl Into<String>) -> Self {
        Self::new(RetryStage::Validation, error.to_string(), raw_clipboard_text)
    }
}

/// Overwrite `path` with `failure` as JSON.
pub fn save_last_failure(path: &Path, failure: &LastFailure) -> Result<(), RetryError> {
    let json = serde_json::to_string_pretty(failure).map_err(|source| RetryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| RetryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(?path, stage = %failure.stage, "saved last failure");
    Ok(())
}

/// The failure saved at `path`, or `None` when nothing was saved.
pub fn load_last_failure(path: &Path) -> Result<Option<LastFailure>, RetryError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RetryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map(Some).map_err(|source| RetryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Prompt text: stage, error, format reminder, then the reply as received.
pub fn build_guided_retry_prompt(failure: &LastFailure, header_prefix: &str) -> String {
    [
        format!("Stage: {}", failure.stage),
        format!("Error: {}", failure.message),
        format!(
            "Return format: concatenated file listings, each file starts with \"{header_prefix}relative/path.ext\" then full raw content"
        ),
        String::new(),
        "Clipboard input (as received):".to_string(),
        failure.raw_clipboard_text.clone(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_layout() {
        let failure = LastFailure::new(RetryStage::Apply, "disk full", "# a.txt\nhi\n");
        assert_eq!(
            build_guided_retry_prompt(&failure, "# "),
            "Stage: apply\n\
             Error: disk full\n\
             Return format: concatenated file listings, each file starts with \"# relative/path.ext\" then full raw content\n\
             \n\
             Clipboard input (as received):\n\
             # a.txt\nhi\n"
        );
    }

    #[test]
    fn test_from_parse_error() {
        let failure = LastFailure::from_parse_error(&ParseError::NoHeadersFound, "garbage");
        assert_eq!(failure.stage, RetryStage::Validation);
        assert!(failure.message.starts_with("No file headers found"));
        let prompt = build_guided_retry_prompt(&failure, "## LLM-CPP-FILE: ");
        assert!(prompt.contains("starts with \"## LLM-CPP-FILE: relative/path.ext\""));
        assert!(prompt.ends_with("\ngarbage"));
    }

    #[test]
    fn test_last_failure_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LAST_FAILURE_FILE_NAME);
        assert!(load_last_failure(&path).unwrap().is_none());

        let failure = LastFailure::new(RetryStage::Sanitization, "bad rule", "# a.txt\nhi\n");
        save_last_failure(&path, &failure).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"rawClipboardText\""));
        assert!(text.contains("\"sanitization\""));
        assert_eq!(load_last_failure(&path).unwrap(), Some(failure));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_last_failure(&path), Err(RetryError::Json { .. })));
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!("Sanitization".parse::<RetryStage>(), Ok(RetryStage::Sanitization));
        assert!("later".parse::<RetryStage>().is_err());
        assert_eq!(serde_json::to_string(&RetryStage::Validation).unwrap(), "\"validation\"");
    }
}
