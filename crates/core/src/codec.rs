//! Listing codec: files <-> one delimited text blob.
//!
//! Each file section starts with a header line (`<prefix><path>`), optionally
//! followed by an operation marker line, then the raw content and a blank
//! separator line. Decoding scans header matches with a regex and slices the
//! text between consecutive matches, so file bodies never need escaping as long
//! as none of their lines looks like a header.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::debug;

use crate::helpers::{split_first_line, strip_leading_line_break, strip_separator_line_break};
use crate::payload::{normalize_path, FileEntry, FilesPayload, OperationKind, SourceRange};

/// Default header prefix.
pub const DEFAULT_HEADER_PREFIX: &str = "# ";

/// Default header regex; group 1 captures the path.
pub const DEFAULT_HEADER_REGEX: &str = r"^#[ \t]+(.+)$";

/// Default prefix of operation marker lines (`FILE WAS DELETED`).
pub const DEFAULT_FILE_STATUS_PREFIX: &str = "FILE WAS ";

/// Annotation written in place of content when a file could not be read.
pub const READ_ERROR_PREFIX: &str = "// READ ERROR: ";

/// Structural failure while decoding a pasted blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("No file headers found (expected \"<header prefix>relative/path.ext\")")]
    NoHeadersFound,
    #[error("Empty file path in header #{header_index}")]
    EmptyPathInHeader { header_index: usize },
    #[error("No files found in pasted text")]
    NoFilesFound,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid header regex '{pattern}': {source}")]
    InvalidHeaderRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("header regex '{0}' has no capture group for the path")]
    MissingPathGroup(String),
}

/// Configuration of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecOptions {
    pub header_prefix: String,
    pub header_regex: String,
    pub file_status_prefix: String,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            header_regex: DEFAULT_HEADER_REGEX.to_string(),
            file_status_prefix: DEFAULT_FILE_STATUS_PREFIX.to_string(),
        }
    }
}

impl CodecOptions {
    /// Options whose header regex is derived from `header_prefix`.
    ///
    /// Trailing whitespace of the prefix becomes "one or more blanks" so that
    /// `"# "` also accepts `"#\tpath"` and `"#   path"`.
    pub fn for_prefix(header_prefix: impl Into<String>) -> Self {
        let header_prefix = header_prefix.into();
        Self {
            header_regex: header_regex_for_prefix(&header_prefix),
            header_prefix,
            ..Self::default()
        }
    }
}

/// Build a header regex for a prefix such as `"# "` or `"## LLM-CPP-FILE: "`.
pub fn header_regex_for_prefix(header_prefix: &str) -> String {
    let trimmed = header_prefix.trim_end();
    if trimmed.len() == header_prefix.len() {
        format!(r"^{}[ \t]*(.+)$", regex::escape(trimmed))
    } else {
        format!(r"^{}[ \t]+(.+)$", regex::escape(trimmed))
    }
}

/// Compile a header regex with `^`/`$` matching at line boundaries.
pub fn compile_header_regex(pattern: &str) -> Result<Regex, CodecError> {
    let regex = RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| CodecError::InvalidHeaderRegex {
            pattern: pattern.to_string(),
            source,
        })?;
    if regex.captures_len() < 2 {
        return Err(CodecError::MissingPathGroup(pattern.to_string()));
    }
    Ok(regex)
}

/// Encoder/decoder for listing blobs.
#[derive(Debug, Clone)]
pub struct ListingCodec {
    options: CodecOptions,
    header_regex: Regex,
}

impl ListingCodec {
    pub fn new(options: CodecOptions) -> Result<Self, CodecError> {
        let header_regex = compile_header_regex(&options.header_regex)?;
        Ok(Self {
            options,
            header_regex,
        })
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Serialize files into a listing blob, in input order.
    pub fn encode(&self, files: &[FileEntry]) -> String {
        encode_with(&self.options, files)
    }

    /// Parse a pasted blob into file entries.
    pub fn decode(&self, raw_text: &str) -> Result<FilesPayload, ParseError> {
        decode_with(raw_text, &self.header_regex, &self.options.file_status_prefix)
    }
}

/// Encode with a bare header prefix and no custom marker prefix.
pub fn encode_listing(files: &[FileEntry], header_prefix: &str) -> String {
    let options = CodecOptions {
        header_prefix: header_prefix.to_string(),
        ..CodecOptions::default()
    };
    encode_with(&options, files)
}

fn encode_with(options: &CodecOptions, files: &[FileEntry]) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str(&options.header_prefix);
        out.push_str(&file.path);
        out.push('\n');

        if let Some(operation) = file.operation {
            out.push_str(&options.file_status_prefix);
            out.push_str(operation.as_marker());
            out.push('\n');
        }

        if let Some(err) = file.read_error.as_deref().filter(|e| !e.trim().is_empty()) {
            out.push_str(READ_ERROR_PREFIX);
            out.push_str(err);
            out.push('\n');
        }

        if file.operation != Some(OperationKind::Deleted) && !file.content.is_empty() {
            out.push_str(&file.content);
            if !file.content.ends_with('\n') {
                out.push('\n');
            }
        }

        out.push('\n');
    }
    out
}

/// Decode with an already compiled header regex and the default marker prefix.
pub fn decode_listing(raw_text: &str, header_regex: &Regex) -> Result<FilesPayload, ParseError> {
    decode_with(raw_text, header_regex, DEFAULT_FILE_STATUS_PREFIX)
}

fn decode_with(
    raw_text: &str,
    header_regex: &Regex,
    file_status_prefix: &str,
) -> Result<FilesPayload, ParseError> {
    // (match start, match end, captured path)
    let headers: Vec<(usize, usize, &str)> = header_regex
        .captures_iter(raw_text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let path = caps.get(1).map_or("", |m| m.as_str());
            Some((whole.start(), whole.end(), path))
        })
        .collect();

    if headers.is_empty() {
        return Err(ParseError::NoHeadersFound);
    }

    let mut payload = FilesPayload::default();
    let mut index_by_path: HashMap<String, usize> = HashMap::new();

    let preamble = &raw_text[..headers[0].0];
    if !preamble.trim().is_empty() {
        payload.warnings.push(format!(
            "Ignored {} character(s) before the first file header",
            preamble.chars().count()
        ));
    }

    for (header_index, &(_, match_end, captured)) in headers.iter().enumerate() {
        let path = normalize_path(captured.trim());
        if path.is_empty() {
            return Err(ParseError::EmptyPathInHeader { header_index });
        }

        let span_end = headers
            .get(header_index + 1)
            .map_or(raw_text.len(), |next| next.0);
        let span = strip_leading_line_break(&raw_text[match_end..span_end]);
        let span_start = span_end - span.len();

        let (operation, body) = read_operation_marker(span, file_status_prefix);
        let content = match operation {
            Some(OperationKind::Deleted) => String::new(),
            _ => strip_separator_line_break(body).to_string(),
        };

        let entry = FileEntry {
            path: path.clone(),
            content,
            operation,
            read_error: None,
            source_range: Some(SourceRange {
                start: span_start,
                end: span_end,
            }),
        };

        match index_by_path.get(&path) {
            Some(&existing) => {
                payload.warnings.push(format!(
                    "Duplicate header for '{}'; the later section replaces the earlier one",
                    path
                ));
                payload.files[existing] = entry;
            }
            None => {
                index_by_path.insert(path, payload.files.len());
                payload.files.push(entry);
            }
        }
    }

    if payload.files.is_empty() {
        return Err(ParseError::NoFilesFound);
    }

    debug!(
        files = payload.files.len(),
        warnings = payload.warnings.len(),
        "decoded listing"
    );
    Ok(payload)
}

/// Consume the operation marker on the first line of a section, if present.
fn read_operation_marker<'a>(span: &'a str, file_status_prefix: &str) -> (Option<OperationKind>, &'a str) {
    let (first_line, rest) = split_first_line(span);
    let operation = first_line
        .trim()
        .strip_prefix(file_status_prefix.trim_start())
        .and_then(|marker| marker.trim().parse::<OperationKind>().ok());
    match operation {
        Some(op) => (Some(op), rest),
        None => (None, span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ListingCodec {
        ListingCodec::new(CodecOptions::default()).unwrap()
    }

    #[test]
    fn test_decode_two_files() {
        let payload = codec()
            .decode("# src/a.ts\nconst a=1;\n\n# src/b.ts\nconst b=2;\n")
            .unwrap();
        assert_eq!(payload.paths(), vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(payload.files[0].content, "const a=1;\n");
        assert_eq!(payload.files[1].content, "const b=2;\n");
        assert!(payload.warnings.is_empty());
        assert!(payload.errors.is_empty());
    }

    #[test]
    fn test_decode_no_headers() {
        assert_eq!(codec().decode("just some text\n"), Err(ParseError::NoHeadersFound));
        assert_eq!(codec().decode(""), Err(ParseError::NoHeadersFound));
    }

    #[test]
    fn test_decode_whitespace_path() {
        let err = codec().decode("# src/a.ts\nx\n#    \ny\n").unwrap_err();
        assert_eq!(err, ParseError::EmptyPathInHeader { header_index: 1 });
    }

    #[test]
    fn test_decode_deleted_marker_discards_body() {
        let payload = codec()
            .decode("# src/old.ts\nFILE WAS DELETED\nleftover text\n\n# src/new.ts\nFILE WAS CREATED\nexport {};\n")
            .unwrap();
        let old = payload.get("src/old.ts").unwrap();
        assert_eq!(old.operation, Some(OperationKind::Deleted));
        assert_eq!(old.content, "");
        let new = payload.get("src/new.ts").unwrap();
        assert_eq!(new.operation, Some(OperationKind::Created));
        assert_eq!(new.content, "export {};\n");
    }

    #[test]
    fn test_decode_marker_only_on_first_line() {
        let payload = codec().decode("# a.txt\nhello\nFILE WAS DELETED\n").unwrap();
        assert_eq!(payload.files[0].operation, None);
        assert_eq!(payload.files[0].content, "hello\nFILE WAS DELETED\n");
    }

    #[test]
    fn test_decode_duplicate_path_last_write_wins() {
        let payload = codec()
            .decode("# a.txt\nfirst\n\n# b.txt\nb\n\n# a.txt\nsecond\n")
            .unwrap();
        assert_eq!(payload.paths(), vec!["a.txt", "b.txt"]);
        assert_eq!(payload.files[0].content, "second\n");
        assert_eq!(payload.warnings.len(), 1);
        assert!(payload.warnings[0].contains("a.txt"));
    }

    #[test]
    fn test_decode_normalizes_header_paths() {
        let payload = codec()
            .decode("# ./a.txt\nfirst\n\n# src\\b.ts\nb\n\n# a.txt\nsecond\n")
            .unwrap();
        assert_eq!(payload.paths(), vec!["a.txt", "src/b.ts"]);
        assert_eq!(payload.files[0].content, "second\n");
        assert_eq!(payload.warnings.len(), 1);

        let err = codec().decode("# ./\nbody\n").unwrap_err();
        assert_eq!(err, ParseError::EmptyPathInHeader { header_index: 0 });
    }

    #[test]
    fn test_decode_preamble_is_warned_and_ignored() {
        let payload = codec().decode("Sure! Here are the files:\n# a.txt\nA\n").unwrap();
        assert_eq!(payload.files.len(), 1);
        assert_eq!(payload.files[0].content, "A\n");
        assert_eq!(payload.warnings.len(), 1);
    }

    #[test]
    fn test_decode_crlf() {
        let payload = codec().decode("# a.txt\r\nline\r\n\r\n# b.txt\r\nb\r\n").unwrap();
        assert_eq!(payload.paths(), vec!["a.txt", "b.txt"]);
        assert_eq!(payload.files[0].content, "line\r\n");
        assert_eq!(payload.files[1].content, "b\r\n");
    }

    #[test]
    fn test_decode_source_range_points_at_content() {
        let raw = "# a.txt\nA\n";
        let payload = codec().decode(raw).unwrap();
        let range = payload.files[0].source_range.unwrap();
        assert_eq!(&raw[range.start..range.end], "A\n");
    }

    #[test]
    fn test_round_trip() {
        let files = vec![
            FileEntry::new("src/a.ts", "const a = 1;\n"),
            FileEntry::new("src/empty.ts", ""),
            FileEntry::new("src/blank_tail.ts", "x\n\n"),
            FileEntry::new("src/gone.ts", "").with_operation(OperationKind::Deleted),
            FileEntry::new("src/made.ts", "export {};\n").with_operation(OperationKind::Created),
        ];
        let codec = codec();
        let decoded = codec.decode(&codec.encode(&files)).unwrap();
        assert_eq!(decoded.files.len(), files.len());
        for (original, parsed) in files.iter().zip(&decoded.files) {
            assert_eq!(parsed.path, original.path);
            assert_eq!(parsed.content, original.content);
            assert_eq!(parsed.operation, original.operation);
        }
    }

    #[test]
    fn test_round_trip_adds_missing_final_newline() {
        let codec = codec();
        let decoded = codec.decode(&codec.encode(&[FileEntry::new("a.txt", "no newline")])).unwrap();
        assert_eq!(decoded.files[0].content, "no newline\n");
    }

    #[test]
    fn test_encode_annotations() {
        let files = vec![
            FileEntry::unreadable("bin/blob", "stream did not contain valid UTF-8"),
            FileEntry::new("a.txt", "A"),
        ];
        assert_eq!(
            encode_listing(&files, "# "),
            "# bin/blob\n// READ ERROR: stream did not contain valid UTF-8\n\n# a.txt\nA\n\n"
        );
    }

    #[test]
    fn test_custom_prefix_and_marker() {
        let options = CodecOptions {
            file_status_prefix: "#### FILE WAS ".to_string(),
            ..CodecOptions::for_prefix("## LLM-CPP-FILE: ")
        };
        let codec = ListingCodec::new(options).unwrap();
        let text = codec.encode(&[
            FileEntry::new("src/a.md", "# Title\n").with_operation(OperationKind::EditedFull),
        ]);
        assert!(text.starts_with("## LLM-CPP-FILE: src/a.md\n#### FILE WAS EDITED_FULL\n"));

        // A markdown heading inside the body is not a header for this prefix.
        let decoded = codec.decode(&text).unwrap();
        assert_eq!(decoded.files.len(), 1);
        assert_eq!(decoded.files[0].content, "# Title\n");
        assert_eq!(decoded.files[0].operation, Some(OperationKind::EditedFull));
    }

    #[test]
    fn test_encode_listing_matches_codec_with_same_prefix() {
        let files = vec![
            FileEntry::new("a.txt", "A\n").with_operation(OperationKind::Created),
            FileEntry::new("gone.txt", "").with_operation(OperationKind::Deleted),
        ];
        let codec = ListingCodec::new(CodecOptions::for_prefix("## LLM-CPP-FILE: ")).unwrap();
        assert_eq!(encode_listing(&files, "## LLM-CPP-FILE: "), codec.encode(&files));
    }

    #[test]
    fn test_decode_listing_free_function() {
        let re = compile_header_regex(DEFAULT_HEADER_REGEX).unwrap();
        let payload = decode_listing("# x.txt\nFILE WAS DELETED\nstuff\n", &re).unwrap();
        assert_eq!(payload.files[0].operation, Some(OperationKind::Deleted));
        assert_eq!(payload.files[0].content, "");
    }

    #[test]
    fn test_header_regex_validation() {
        assert!(matches!(
            ListingCodec::new(CodecOptions {
                header_regex: "^# .+$".to_string(),
                ..CodecOptions::default()
            }),
            Err(CodecError::MissingPathGroup(_))
        ));
        assert!(matches!(
            compile_header_regex("^# (.+"),
            Err(CodecError::InvalidHeaderRegex { .. })
        ));
    }
}
