//! Regex rewrite rules applied to file contents returned by the LLM.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::helpers::language_id_for_path;
use crate::payload::{FilesPayload, OperationKind};

/// One ordered rewrite rule. Later rules see the output of earlier ones.
///
/// `replace_with` uses JavaScript `String.replace` syntax, the same as the
/// editor extension sharing the config: `$1`..`$99`, `$<name>`, `$&`, `` $` ``,
/// `$'` and `$$`. Anything else after `$` is literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationRule {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub replace_with: String,
    #[serde(default)]
    pub disabled_for_languages: Vec<String>,
    /// Path prefixes the rule never touches, e.g. `docs/`.
    #[serde(default)]
    pub disabled_for_paths: Vec<String>,
}

impl SanitizationRule {
    pub fn new(id: impl Into<String>, pattern: impl Into<String>, replace_with: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            replace_with: replace_with.into(),
            disabled_for_languages: Vec::new(),
            disabled_for_paths: Vec::new(),
        }
    }

    fn is_disabled_for(&self, meta: &FileMeta<'_>) -> bool {
        if let Some(language_id) = meta.language_id {
            if self.disabled_for_languages.iter().any(|l| l == language_id) {
                return true;
            }
        }
        self.disabled_for_paths
            .iter()
            .any(|prefix| meta.path.starts_with(prefix.as_str()))
    }
}

/// Rule that strips markdown code fences an LLM wraps around file bodies.
pub fn strip_codefence_rule() -> SanitizationRule {
    SanitizationRule {
        disabled_for_languages: vec!["markdown".to_string()],
        disabled_for_paths: vec!["docs/".to_string()],
        ..SanitizationRule::new("strip-codefence", r"`{3}[^\r\n]*", "")
    }
}

/// What the engine knows about the file being sanitized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta<'a> {
    pub path: &'a str,
    pub language_id: Option<&'a str>,
}

impl<'a> FileMeta<'a> {
    pub fn new(path: &'a str) -> Self {
        Self {
            path,
            language_id: None,
        }
    }

    /// Meta with the language id guessed from the file extension.
    pub fn from_path(path: &'a str) -> Self {
        Self {
            path,
            language_id: language_id_for_path(path),
        }
    }

    pub fn with_language(mut self, language_id: &'a str) -> Self {
        self.language_id = Some(language_id);
        self
    }
}

/// A rule that could not be applied to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFailure {
    pub rule_id: String,
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sanitization rule failed ({}) for {}: {}",
            self.rule_id, self.path, self.message
        )
    }
}

/// Output of sanitizing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedContent {
    pub content: String,
    pub failures: Vec<RuleFailure>,
}

struct CompiledRule {
    rule: SanitizationRule,
    regex: Result<Regex, String>,
}

/// Rules compiled once, applied to many files.
pub struct SanitizationEngine {
    rules: Vec<CompiledRule>,
}

impl SanitizationEngine {
    /// Compile the rules. Patterns that fail to compile are kept and reported
    /// on every file they would have applied to.
    pub fn new(rules: impl IntoIterator<Item = SanitizationRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let regex = Regex::new(&rule.pattern).map_err(|e| e.to_string());
                CompiledRule { rule, regex }
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> impl Iterator<Item = &SanitizationRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn apply(&self, content: &str, meta: &FileMeta<'_>) -> SanitizedContent {
        let mut output = content.to_string();
        let mut failures = Vec::new();

        for compiled in &self.rules {
            if compiled.rule.is_disabled_for(meta) {
                continue;
            }
            match &compiled.regex {
                Ok(regex) => {
                    let input = std::mem::take(&mut output);
                    output = regex
                        .replace_all(&input, |caps: &Captures<'_>| {
                            expand_replacement(regex, caps, &input, &compiled.rule.replace_with)
                        })
                        .into_owned();
                }
                Err(message) => {
                    let failure = RuleFailure {
                        rule_id: compiled.rule.id.clone(),
                        path: meta.path.to_string(),
                        message: message.clone(),
                    };
                    warn!("{}", failure);
                    failures.push(failure);
                }
            }
        }

        SanitizedContent {
            content: output,
            failures,
        }
    }
}

/// Expand a JavaScript-style replacement template for one match of `haystack`.
fn expand_replacement(regex: &Regex, caps: &Captures<'_>, haystack: &str, template: &str) -> String {
    let has_named_groups = regex.capture_names().any(|name| name.is_some());
    let group = |index: usize| caps.get(index).map_or("", |m| m.as_str());
    let whole = caps.get(0).map_or(0..0, |m| m.range());
    let group_count = caps.len() - 1;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];
        let mut chars = after.chars();
        let consumed = match chars.next() {
            Some('$') => {
                out.push('$');
                1
            }
            Some('&') => {
                out.push_str(&haystack[whole.clone()]);
                1
            }
            Some('`') => {
                out.push_str(&haystack[..whole.start]);
                1
            }
            Some('\'') => {
                out.push_str(&haystack[whole.end..]);
                1
            }
            // `$<name>` only expands when the pattern has named groups.
            Some('<') => match after[1..].find('>').filter(|_| has_named_groups) {
                Some(close) => {
                    out.push_str(caps.name(&after[1..1 + close]).map_or("", |m| m.as_str()));
                    close + 2
                }
                None => {
                    out.push('$');
                    0
                }
            },
            Some(first) if first.is_ascii_digit() => {
                let one = first.to_digit(10).map_or(0, |d| d as usize);
                let two = chars
                    .next()
                    .and_then(|c| c.to_digit(10))
                    .map(|d| one * 10 + d as usize)
                    .filter(|&n| (1..=group_count).contains(&n));
                match two {
                    Some(n) => {
                        out.push_str(group(n));
                        2
                    }
                    None if (1..=group_count).contains(&one) => {
                        out.push_str(group(one));
                        1
                    }
                    None => {
                        out.push('$');
                        0
                    }
                }
            }
            _ => {
                out.push('$');
                0
            }
        };
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

/// One-shot helper: compile `rules` and apply them to a single file.
pub fn apply_sanitization_rules(
    content: &str,
    meta: &FileMeta<'_>,
    rules: &[SanitizationRule],
) -> SanitizedContent {
    SanitizationEngine::new(rules.iter().cloned()).apply(content, meta)
}

/// Sanitize every non-deleted entry; rule failures are appended as warnings.
pub fn sanitize_payload(payload: FilesPayload, engine: &SanitizationEngine) -> FilesPayload {
    let FilesPayload {
        files,
        mut warnings,
        errors,
    } = payload;

    let files = files
        .into_iter()
        .map(|mut file| {
            if file.effective_operation() == OperationKind::Deleted {
                return file;
            }
            let sanitized = engine.apply(&file.content, &FileMeta::from_path(&file.path));
            warnings.extend(sanitized.failures.iter().map(ToString::to_string));
            file.content = sanitized.content;
            file
        })
        .collect();

    FilesPayload {
        files,
        warnings,
        errors,
    }
}
