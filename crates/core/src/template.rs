//! Mustache-like rendering for instruction prompts.
//!
//! Supported syntax (delimiters are configurable, `{{`/`}}` by default):
//!
//! - `{{someKey}}` placeholders, replaced one key at a time;
//! - `{{#if flag}} ... {{/if}}`;
//! - `{{#if flag}} ... {{else if other}} ... {{else}} ... {{/if}}`.
//!
//! Expressions are never evaluated here: the caller decides every boolean.
//! Unknown tags and unresolved placeholders are copied through unchanged so
//! several passes can resolve different keys.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PLACEHOLDER_START: &str = "{{";
pub const DEFAULT_PLACEHOLDER_END: &str = "}}";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("placeholder delimiters must not be empty")]
    EmptyDelimiter,
    #[error("invalid placeholder pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Values and flags available to one render call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContext {
    pub constants: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constant(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constants.insert(key.into(), value.into());
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }

    /// Unknown flags are false.
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

/// Which part of an `if` block the scanner is currently inside.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Section {
    If,
    ElseIf(String),
    Else,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElseIfBranch {
    flag: String,
    text: String,
}

/// A fully parsed `{{#if}} ... {{/if}}` block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedBlock {
    end: usize,
    if_text: String,
    else_ifs: Vec<ElseIfBranch>,
    else_text: Option<String>,
}

impl ParsedBlock {
    fn select<F>(self, is_true: bool, condition: &F) -> String
    where
        F: Fn(&str) -> bool,
    {
        if is_true {
            return self.if_text;
        }
        if let Some(branch) = self.else_ifs.into_iter().find(|b| condition(&b.flag)) {
            return branch.text;
        }
        self.else_text.unwrap_or_default()
    }
}

/// Single-pass state machine over the tags of one block.
struct BlockScanner {
    section: Section,
    buffer: String,
    depth: usize,
    if_text: String,
    else_ifs: Vec<ElseIfBranch>,
    else_text: Option<String>,
}

impl BlockScanner {
    fn new() -> Self {
        Self {
            section: Section::If,
            buffer: String::new(),
            depth: 0,
            if_text: String::new(),
            else_ifs: Vec::new(),
            else_text: None,
        }
    }

    /// Move the buffered text into the slot of the current section and enter `next`.
    fn transition(&mut self, next: Section) {
        let text = std::mem::take(&mut self.buffer);
        match std::mem::replace(&mut self.section, next) {
            Section::If => self.if_text = text,
            Section::ElseIf(flag) => self.else_ifs.push(ElseIfBranch { flag, text }),
            Section::Else => self.else_text = Some(text),
        }
    }

    fn finish(mut self, end: usize) -> ParsedBlock {
        self.transition(Section::If);
        ParsedBlock {
            end,
            if_text: self.if_text,
            else_ifs: self.else_ifs,
            else_text: self.else_text,
        }
    }
}

/// Renderer parameterized by its placeholder delimiters.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    open: String,
    close: String,
    placeholder_re: Regex,
    if_tag_re: Regex,
}

impl TemplateEngine {
    pub fn new(open: &str, close: &str) -> Result<Self, TemplateError> {
        if open.is_empty() || close.is_empty() {
            return Err(TemplateError::EmptyDelimiter);
        }
        let placeholder_re = Regex::new(&format!(
            r"{}\s*([A-Za-z0-9_.*\-]+)\s*{}",
            regex::escape(open),
            regex::escape(close)
        ))?;
        let if_tag_re = Regex::new(&format!(r"{}#if (\S+?){}", regex::escape(open), regex::escape(close)))?;
        Ok(Self {
            open: open.to_string(),
            close: close.to_string(),
            placeholder_re,
            if_tag_re,
        })
    }

    /// Replace every placeholder named `key` with `value`.
    pub fn render_constant(&self, text: &str, key: &str, value: &str) -> String {
        self.placeholder_re
            .replace_all(text, |caps: &Captures<'_>| {
                if &caps[1] == key {
                    value.to_string()
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }

    /// Resolve `{{#if flag}}...{{/if}}` blocks; `else` tags are plain text here.
    pub fn render_if(&self, text: &str, flag: &str, is_true: bool) -> String {
        self.render_blocks(text, flag, is_true, false, &|_: &str| false)
    }

    /// Resolve blocks including `else if` / `else` branches. Every `else if`
    /// condition is treated as false.
    pub fn render_if_else(&self, text: &str, flag: &str, is_true: bool) -> String {
        self.render_blocks(text, flag, is_true, true, &|_: &str| false)
    }

    /// Like [`render_if_else`](Self::render_if_else) with caller-evaluated `else if` conditions.
    pub fn render_if_else_with<F>(&self, text: &str, flag: &str, is_true: bool, condition: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        self.render_blocks(text, flag, is_true, true, &condition)
    }

    /// Conditional pass for every flag in `context`, then for any `#if` left
    /// over (those flags are false), then a constant pass for every constant.
    pub fn render(&self, text: &str, context: &TemplateContext) -> String {
        let mut out = text.to_string();
        for (flag, &value) in &context.flags {
            out = self.render_if_else_with(&out, flag, value, |name| context.flag(name));
        }
        // Unclosed blocks survive a pass, so each name is resolved once.
        let mut resolved: BTreeSet<String> = context.flags.keys().cloned().collect();
        while let Some(flag) = self.next_unresolved_if(&out, &resolved) {
            out = self.render_if_else_with(&out, &flag, context.flag(&flag), |name| context.flag(name));
            resolved.insert(flag);
        }
        for (key, value) in &context.constants {
            out = self.render_constant(&out, key, value);
        }
        out
    }

    fn next_unresolved_if(&self, text: &str, resolved: &BTreeSet<String>) -> Option<String> {
        self.if_tag_re
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .find(|flag| !resolved.contains(flag))
    }

    fn render_blocks<F>(&self, text: &str, flag: &str, is_true: bool, allow_else: bool, condition: &F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let start_tag = format!("{}#if {}{}", self.open, flag, self.close);
        let mut out = text.to_string();
        let mut search_from = 0;

        while search_from < out.len() {
            let Some(offset) = out[search_from..].find(&start_tag) else {
                break;
            };
            let block_start = search_from + offset;

            let Some(block) = self.parse_block(&out, block_start + start_tag.len(), allow_else) else {
                // Unterminated: leave this occurrence alone and look further.
                search_from = block_start + self.open.len();
                continue;
            };

            let block_end = block.end;
            let selected = block.select(is_true, condition);
            out.replace_range(block_start..block_end, &selected);
            search_from = block_start + selected.len();
        }

        out
    }

    /// Scan tags from `from` until the `/if` closing the block opened just before it.
    fn parse_block(&self, text: &str, from: usize, allow_else: bool) -> Option<ParsedBlock> {
        let mut scanner = BlockScanner::new();
        let mut idx = from;

        while idx < text.len() {
            let tag_start = idx + text[idx..].find(&self.open)?;
            scanner.buffer.push_str(&text[idx..tag_start]);

            let inner_start = tag_start + self.open.len();
            let tag_end = inner_start + text[inner_start..].find(&self.close)? + self.close.len();
            let raw_tag = &text[tag_start..tag_end];
            let content = text[inner_start..tag_end - self.close.len()].trim();
            idx = tag_end;

            if content.starts_with("#if") {
                scanner.depth += 1;
                scanner.buffer.push_str(raw_tag);
            } else if content == "/if" {
                if scanner.depth == 0 {
                    return Some(scanner.finish(tag_end));
                }
                scanner.depth -= 1;
                scanner.buffer.push_str(raw_tag);
            } else if allow_else && scanner.depth == 0 && content == "else" {
                scanner.transition(Section::Else);
            } else if let Some(other) = else_if_flag(content).filter(|_| allow_else && scanner.depth == 0) {
                scanner.transition(Section::ElseIf(other.to_string()));
            } else {
                scanner.buffer.push_str(raw_tag);
            }
        }

        None
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        // The default delimiters always produce a valid pattern.
        Self::new(DEFAULT_PLACEHOLDER_START, DEFAULT_PLACEHOLDER_END).unwrap()
    }
}

/// `else if flag` -> `flag`
fn else_if_flag(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("else")?;
    let rest = rest.trim_start().strip_prefix("if")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim()).filter(|flag| !flag.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TemplateEngine {
        TemplateEngine::default()
    }

    #[test]
    fn test_render_if() {
        assert_eq!(engine().render_if("{{#if x}}A{{/if}}", "x", true), "A");
        assert_eq!(engine().render_if("{{#if x}}A{{/if}}", "x", false), "");
        assert_eq!(engine().render_if("a{{#if x}}B{{/if}}c", "x", false), "ac");
    }

    #[test]
    fn test_render_if_treats_else_as_text() {
        assert_eq!(
            engine().render_if("{{#if x}}A{{else}}B{{/if}}", "x", true),
            "A{{else}}B"
        );
    }

    #[test]
    fn test_render_if_else() {
        let e = engine();
        assert_eq!(e.render_if_else("{{#if x}}A{{else}}B{{/if}}", "x", false), "B");
        assert_eq!(e.render_if_else("{{#if x}}A{{else}}B{{/if}}", "x", true), "A");
        assert_eq!(e.render_if_else("{{#if x}}A{{else if y}}C{{/if}}", "x", false), "");
    }

    #[test]
    fn test_else_if_selection() {
        let template = "{{#if x}}A{{else if y}}B{{else if z}}C{{else}}D{{/if}}";
        let e = engine();
        assert_eq!(e.render_if_else_with(template, "x", false, |f| f == "z"), "C");
        assert_eq!(e.render_if_else_with(template, "x", false, |f| f == "y" || f == "z"), "B");
        assert_eq!(e.render_if_else_with(template, "x", false, |_| false), "D");
        assert_eq!(e.render_if_else_with(template, "x", true, |_| true), "A");
    }

    #[test]
    fn test_multiple_blocks() {
        let template = "{{#if x}}1{{/if}}-{{#if y}}2{{/if}}-{{#if x}}3{{else}}4{{/if}}";
        assert_eq!(engine().render_if_else(template, "x", true), "1-{{#if y}}2{{/if}}-3");
        assert_eq!(engine().render_if_else(template, "x", false), "-{{#if y}}2{{/if}}-4");
    }

    #[test]
    fn test_nested_blocks_are_opaque() {
        let template = "{{#if outer}}a{{#if inner}}b{{else}}c{{/if}}d{{else}}e{{/if}}";
        let e = engine();
        assert_eq!(
            e.render_if_else(template, "outer", true),
            "a{{#if inner}}b{{else}}c{{/if}}d"
        );
        assert_eq!(e.render_if_else(template, "outer", false), "e");
        assert_eq!(
            e.render_if_else(template, "inner", false),
            "{{#if outer}}acd{{else}}e{{/if}}"
        );
    }

    #[test]
    fn test_unterminated_block_left_unchanged() {
        let template = "{{#if x}}A{{#if x}}B{{/if}}";
        // The outer occurrence never closes; the inner one still renders.
        assert_eq!(engine().render_if("{{#if x}}never closed", "x", true), "{{#if x}}never closed");
        assert_eq!(engine().render_if(template, "x", false), "{{#if x}}A");
        assert_eq!(
            engine().render_if("{{#if x}}open {{y}} and {{#if x}}B{{/if}}", "x", true),
            "{{#if x}}open {{y}} and B"
        );
    }

    #[test]
    fn test_unknown_tags_copied() {
        assert_eq!(
            engine().render_if_else("{{#if x}}Hi {{name}}!{{/if}}", "x", true),
            "Hi {{name}}!"
        );
    }

    #[test]
    fn test_render_constant() {
        let e = engine();
        assert_eq!(e.render_constant("{{unknown}}", "known", "v"), "{{unknown}}");
        assert_eq!(e.render_constant("a {{known}} b {{ known }}", "known", "v"), "a v b v");
        assert_eq!(e.render_constant("{{#if known}}", "known", "v"), "{{#if known}}");
    }

    #[test]
    fn test_custom_delimiters() {
        let e = TemplateEngine::new("<%", "%>").unwrap();
        assert_eq!(e.render_constant("<% name %> {{name}}", "name", "x"), "x {{name}}");
        assert_eq!(e.render_if_else("<%#if f%>A<%else%>B<%/if%>", "f", false), "B");
        assert!(matches!(TemplateEngine::new("", "}}"), Err(TemplateError::EmptyDelimiter)));
    }

    #[test]
    fn test_render_with_context() {
        let ctx = TemplateContext::new()
            .with_flag("git", false)
            .with_flag("ollama", true)
            .with_constant("BRANCH_NAME", "main");
        let template = "{{#if git}}Branch {{BRANCH_NAME}}{{else if ollama}}Local on {{BRANCH_NAME}}{{/if}} {{other}}";
        assert_eq!(engine().render(template, &ctx), "Local on main {{other}}");
    }

    #[test]
    fn test_render_resolves_flags_missing_from_context() {
        let ctx = TemplateContext::new().with_flag("b", true);
        assert_eq!(engine().render("{{#if a}}A{{else if b}}B{{/if}}", &ctx), "B");

        let empty = TemplateContext::new();
        assert_eq!(engine().render("x{{#if a}}A{{/if}}y", &empty), "xy");
        assert_eq!(engine().render("{{#if a}}A{{else}}{{#if c}}C{{else}}D{{/if}}{{/if}}", &empty), "D");
        // unclosed blocks are left alone
        assert_eq!(engine().render("{{#if a}}A", &empty), "{{#if a}}A");
    }
}
