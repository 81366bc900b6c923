//! Line-break handling shared by the codec and the size estimator.

use regex::Regex;
use std::sync::LazyLock;

static LINE_BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r\n|\r|\n").unwrap());

/// Strip exactly one leading `\n` or `\r\n`.
pub fn strip_leading_line_break(text: &str) -> &str {
    text.strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text)
}

/// Length in bytes of the line break ending `text`, if any.
fn trailing_line_break_len(text: &str) -> Option<usize> {
    if text.ends_with("\r\n") {
        Some(2)
    } else if text.ends_with('\n') {
        Some(1)
    } else {
        None
    }
}

/// Drop the blank separator line that follows every encoded section.
///
/// The separator is only removed when it is really a blank line: the text is
/// a lone line break, or its last line break is preceded by another one.
pub fn strip_separator_line_break(text: &str) -> &str {
    let Some(last) = trailing_line_break_len(text) else {
        return text;
    };
    let without_last = &text[..text.len() - last];
    if without_last.is_empty() || trailing_line_break_len(without_last).is_some() {
        without_last
    } else {
        text
    }
}

/// Split off the first line, returning `(line, rest)` where `rest` starts after the line break.
pub fn split_first_line(text: &str) -> (&str, &str) {
    match text.find('\n') {
        Some(idx) => (text[..idx].trim_end_matches('\r'), &text[idx + 1..]),
        None => (text.trim_end_matches('\r'), ""),
    }
}

/// Split on any line break convention.
pub fn split_lines(text: &str) -> Vec<&str> {
    LINE_BREAK_RE.split(text).collect()
}

/// Best-effort editor language id derived from a file extension.
///
/// Mirrors the identifiers editors report so language-scoped sanitization
/// rules work for files that were not opened in an editor.
pub fn language_id_for_path(path: &str) -> Option<&'static str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if file_name.eq_ignore_ascii_case("dockerfile") {
        return Some("dockerfile");
    }
    let (_, ext) = file_name.rsplit_once('.')?;
    let id = match ext.to_ascii_lowercase().as_str() {
        "md" | "markdown" | "mdx" => "markdown",
        "rs" => "rust",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "json" => "json",
        "jsonc" => "jsonc",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "sh" | "bash" | "zsh" => "shellscript",
        "sql" => "sql",
        "xml" => "xml",
        "txt" => "plaintext",
        _ => return None,
    };
    Some(id)
}
