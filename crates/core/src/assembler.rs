//! Builds the outbound prompt (instructions + file listings + size footer)
//! and turns an inbound LLM reply into a sanitized [`FilesPayload`].
//!
//! Instruction fragments are template files loaded through a
//! [`TemplateSource`] and cached until invalidated.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::codec::{CodecError, CodecOptions, ListingCodec, ParseError};
use crate::estimate::{estimate, SizeEstimate, SizeLimits};
use crate::payload::{FileEntry, FilesPayload};
use crate::sanitize::{sanitize_payload, strip_codefence_rule, SanitizationEngine, SanitizationRule};
use crate::template::{TemplateContext, TemplateEngine, TemplateError, DEFAULT_PLACEHOLDER_END, DEFAULT_PLACEHOLDER_START};

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// One instruction template, concatenated in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionFragment {
    pub id: String,
    pub relative_path: String,
    #[serde(default)]
    pub skip: bool,
}

impl InstructionFragment {
    pub fn new(id: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relative_path: relative_path.into(),
            skip: false,
        }
    }
}

/// Where instruction templates come from.
pub trait TemplateSource {
    /// Template text for `relative_path`, or `None` when it cannot be read.
    fn load(&self, relative_path: &str) -> Option<String>;
}

impl<T: TemplateSource + ?Sized> TemplateSource for &T {
    fn load(&self, relative_path: &str) -> Option<String> {
        (*self).load(relative_path)
    }
}

/// Templates held in memory, keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplates {
    templates: HashMap<String, String>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relative_path: impl Into<String>, text: impl Into<String>) {
        self.templates.insert(relative_path.into(), text.into());
    }

    pub fn with(mut self, relative_path: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(relative_path, text);
        self
    }
}

impl TemplateSource for InMemoryTemplates {
    fn load(&self, relative_path: &str) -> Option<String> {
        self.templates.get(relative_path).cloned()
    }
}

/// Templates read from files below a root directory.
#[derive(Debug, Clone)]
pub struct DirTemplates {
    root: PathBuf,
}

impl DirTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TemplateSource for DirTemplates {
    fn load(&self, relative_path: &str) -> Option<String> {
        let path = self.root.join(relative_path);
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(?path, error = %e, "template not readable");
                None
            }
        }
    }
}

/// Loaded templates by relative path. Missing templates are cached too, so a
/// broken path is not retried on every copy.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: HashMap<String, Option<String>>,
}

impl TemplateCache {
    pub fn get_or_load<S: TemplateSource + ?Sized>(&mut self, relative_path: &str, source: &S) -> Option<String> {
        self.entries
            .entry(relative_path.to_string())
            .or_insert_with(|| source.load(relative_path))
            .clone()
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn invalidate_path(&mut self, relative_path: &str) {
        self.entries.remove(relative_path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Value behind a placeholder key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderSource {
    /// User-defined shared variable.
    Shared(String),
    HeaderPrefix,
    Delimiter,
    HeaderRegex,
    FileStatusPrefix,
    Literal(&'static str),
}

/// Placeholder keys available to instruction templates.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderTable {
    entries: BTreeMap<String, PlaceholderSource>,
}

impl PlaceholderTable {
    /// Shared variables plus the wire-format anchors. Anchor keys win over a
    /// shared variable of the same name so prompts always match the parser.
    pub fn build(shared_variables: &BTreeMap<String, String>) -> Self {
        let mut entries: BTreeMap<String, PlaceholderSource> = shared_variables
            .iter()
            .map(|(k, v)| (k.clone(), PlaceholderSource::Shared(v.clone())))
            .collect();

        let builtins = [
            ("codeListingHeaderStartFragment", PlaceholderSource::HeaderPrefix),
            ("codeListingHeaderRegex", PlaceholderSource::HeaderRegex),
            ("techPromptDelimiter", PlaceholderSource::Delimiter),
            ("fileStatusPrefix", PlaceholderSource::FileStatusPrefix),
            ("diffMarkerDashDashDash", PlaceholderSource::Delimiter),
            ("diffMarkerAtAt", PlaceholderSource::Literal("@@")),
            ("diffMarkerPlusPlusPlus", PlaceholderSource::Literal("+++")),
            ("diffFileLabel", PlaceholderSource::Literal("File:")),
        ];
        for (key, source) in builtins {
            entries.insert(key.to_string(), source);
        }

        Self { entries }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn resolve(&self, key: &str, settings: &AssemblerSettings) -> Option<String> {
        let value = match self.entries.get(key)? {
            PlaceholderSource::Shared(v) => v.clone(),
            PlaceholderSource::HeaderPrefix => settings.codec.header_prefix.clone(),
            PlaceholderSource::Delimiter => settings.delimiter.clone(),
            PlaceholderSource::HeaderRegex => settings.codec.header_regex.clone(),
            PlaceholderSource::FileStatusPrefix => settings.codec.file_status_prefix.clone(),
            PlaceholderSource::Literal(v) => v.to_string(),
        };
        Some(value)
    }

    /// Template context with every key resolved and the configured flags.
    pub fn context(&self, settings: &AssemblerSettings) -> TemplateContext {
        let constants = self
            .entries
            .keys()
            .filter_map(|key| self.resolve(key, settings).map(|v| (key.clone(), v)))
            .collect();
        TemplateContext {
            constants,
            flags: settings.flags.clone(),
        }
    }
}

/// Resolved, profile-specific settings of a [`PromptAssembler`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerSettings {
    pub codec: CodecOptions,
    pub delimiter: String,
    pub placeholder_start: String,
    pub placeholder_end: String,
    pub fragments: Vec<InstructionFragment>,
    pub shared_variables: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    pub sanitization_rules: Vec<SanitizationRule>,
    pub limits: SizeLimits,
    pub skip_instructions: bool,
    pub skip_code_listings: bool,
    pub skip_size_stats: bool,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            codec: CodecOptions::default(),
            delimiter: "---".to_string(),
            placeholder_start: DEFAULT_PLACEHOLDER_START.to_string(),
            placeholder_end: DEFAULT_PLACEHOLDER_END.to_string(),
            fragments: Vec::new(),
            shared_variables: BTreeMap::new(),
            flags: BTreeMap::new(),
            sanitization_rules: vec![strip_codefence_rule()],
            limits: SizeLimits::default(),
            skip_instructions: false,
            skip_code_listings: false,
            skip_size_stats: false,
        }
    }
}

/// A prompt ready for the clipboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPrompt {
    pub text: String,
    /// Measured before the footer was appended.
    pub estimate: SizeEstimate,
}

pub struct PromptAssembler<S> {
    settings: AssemblerSettings,
    source: S,
    cache: TemplateCache,
    codec: ListingCodec,
    engine: TemplateEngine,
    sanitizer: SanitizationEngine,
    placeholders: PlaceholderTable,
}

impl<S: TemplateSource> PromptAssembler<S> {
    pub fn new(settings: AssemblerSettings, source: S) -> Result<Self, AssemblerError> {
        let codec = ListingCodec::new(settings.codec.clone())?;
        let engine = TemplateEngine::new(&settings.placeholder_start, &settings.placeholder_end)?;
        let sanitizer = SanitizationEngine::new(settings.sanitization_rules.iter().cloned());
        let placeholders = PlaceholderTable::build(&settings.shared_variables);
        Ok(Self {
            settings,
            source,
            cache: TemplateCache::default(),
            codec,
            engine,
            sanitizer,
            placeholders,
        })
    }

    pub fn settings(&self) -> &AssemblerSettings {
        &self.settings
    }

    pub fn codec(&self) -> &ListingCodec {
        &self.codec
    }

    pub fn placeholders(&self) -> &PlaceholderTable {
        &self.placeholders
    }

    /// Drop all cached templates, e.g. after the template files changed.
    pub fn invalidate_templates(&mut self) {
        self.cache.invalidate();
    }

    pub fn invalidate_template(&mut self, relative_path: &str) {
        self.cache.invalidate_path(relative_path);
    }

    /// Rendered instruction fragments joined by delimiter lines. Fragments that
    /// are skipped, missing or render to blank text are left out.
    pub fn build_instructions(&mut self) -> String {
        if self.settings.skip_instructions {
            return String::new();
        }

        let context = self.placeholders.context(&self.settings);
        let mut rendered = Vec::new();

        for fragment in &self.settings.fragments {
            if fragment.skip {
                continue;
            }
            let Some(text) = self.cache.get_or_load(&fragment.relative_path, &self.source) else {
                debug!(fragment = %fragment.id, path = %fragment.relative_path, "skipping missing instruction fragment");
                continue;
            };
            let text = self.engine.render(&text, &context);
            if text.trim().is_empty() {
                continue;
            }
            rendered.push(text);
        }

        rendered.join(&format!("\n{}\n", self.settings.delimiter))
    }

    /// Instructions and listings in clipboard form, with the size footer
    /// appended unless disabled.
    pub fn build_outbound(&mut self, files: &[FileEntry]) -> OutboundPrompt {
        let instructions = self.build_instructions();
        let listings = if self.settings.skip_code_listings {
            String::new()
        } else {
            self.codec.encode(files)
        };

        let mut text = if instructions.trim().is_empty() {
            listings
        } else {
            let delimiter = &self.settings.delimiter;
            format!("\n{delimiter}\n{instructions}\n{delimiter}\n{listings}")
        };

        let estimate = estimate(&text, &self.settings.limits);
        if !self.settings.skip_size_stats {
            text.push_str("\n\n");
            text.push_str(&estimate.footer_text());
            text.push('\n');
        }

        debug!(
            files = files.len(),
            lines = estimate.lines_count,
            tokens = estimate.approx_tokens_count,
            "built outbound prompt"
        );
        OutboundPrompt { text, estimate }
    }

    /// Decode and sanitize a reply pasted from the LLM.
    pub fn prepare_inbound(&self, raw_text: &str) -> Result<FilesPayload, ParseError> {
        let payload = self.codec.decode(raw_text)?;
        Ok(sanitize_payload(payload, &self.sanitizer))
    }

    /// [`prepare_inbound`](Self::prepare_inbound), re-encoded as a listing blob.
    pub fn sanitize_listing(&self, raw_text: &str) -> Result<String, ParseError> {
        let payload = self.prepare_inbound(raw_text)?;
        for warning in &payload.warnings {
            debug!("{}", warning);
        }
        Ok(self.codec.encode(&payload.files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const RULES_PATH: &str = "prompts/rules.md";

    fn settings_with_fragment() -> AssemblerSettings {
        AssemblerSettings {
            fragments: vec![InstructionFragment::new("rules", RULES_PATH)],
            skip_size_stats: true,
            ..AssemblerSettings::default()
        }
    }

    struct CountingSource {
        loads: Cell<usize>,
    }

    impl TemplateSource for CountingSource {
        fn load(&self, _relative_path: &str) -> Option<String> {
            self.loads.set(self.loads.get() + 1);
            Some("rules".to_string())
        }
    }

    #[test]
    fn test_outbound_layout() {
        let source = InMemoryTemplates::new().with(RULES_PATH, "Use {{codeListingHeaderStartFragment}}path headers.");
        let mut assembler = PromptAssembler::new(settings_with_fragment(), source).unwrap();
        let prompt = assembler.build_outbound(&[FileEntry::new("a.txt", "hi\n")]);
        assert_eq!(prompt.text, "\n---\nUse # path headers.\n---\n# a.txt\nhi\n\n");
    }

    #[test]
    fn test_fragments_joined_and_filtered() {
        let mut settings = settings_with_fragment();
        settings.fragments.push(InstructionFragment::new("blank", "prompts/blank.md"));
        settings.fragments.push(InstructionFragment::new("missing", "prompts/missing.md"));
        settings.fragments.push(InstructionFragment {
            skip: true,
            ..InstructionFragment::new("skipped", "prompts/extra.md")
        });
        settings.fragments.push(InstructionFragment::new("extra", "prompts/extra.md"));
        settings.flags.insert("verbose".to_string(), false);

        let source = InMemoryTemplates::new()
            .with(RULES_PATH, "one")
            .with("prompts/blank.md", "{{#if verbose}}noise{{/if}}\n")
            .with("prompts/extra.md", "two");
        let mut assembler = PromptAssembler::new(settings, source).unwrap();
        // skipped fragment shares a path with "extra" but only "extra" renders
        assert_eq!(assembler.build_instructions(), "one\n---\ntwo");
    }

    #[test]
    fn test_skip_flags() {
        let source = InMemoryTemplates::new().with(RULES_PATH, "rules");
        let files = [FileEntry::new("a.txt", "hi\n")];

        let mut no_instructions = PromptAssembler::new(
            AssemblerSettings {
                skip_instructions: true,
                ..settings_with_fragment()
            },
            source.clone(),
        )
        .unwrap();
        assert_eq!(no_instructions.build_outbound(&files).text, "# a.txt\nhi\n\n");

        let mut no_listings = PromptAssembler::new(
            AssemblerSettings {
                skip_code_listings: true,
                ..settings_with_fragment()
            },
            source,
        )
        .unwrap();
        assert_eq!(no_listings.build_outbound(&files).text, "\n---\nrules\n---\n");
    }

    #[test]
    fn test_size_footer_appended() {
        let settings = AssemblerSettings {
            limits: SizeLimits {
                max_lines: 1,
                max_tokens: 0,
                approx_chars_per_token: 4.0,
            },
            ..AssemblerSettings::default()
        };
        let mut assembler = PromptAssembler::new(settings, InMemoryTemplates::new()).unwrap();
        let prompt = assembler.build_outbound(&[FileEntry::new("a.txt", "hi\n")]);
        assert!(prompt.estimate.is_exceeded());
        assert!(prompt.text.starts_with("# a.txt\nhi\n\n\n\n[CONTEXT STATS] Lines: 3"));
        assert!(prompt.text.ends_with("Exceeded by: lines\n"));
    }

    #[test]
    fn test_template_cache() {
        let source = CountingSource { loads: Cell::new(0) };
        let mut assembler = PromptAssembler::new(settings_with_fragment(), &source).unwrap();
        assembler.build_instructions();
        assembler.build_instructions();
        assert_eq!(source.loads.get(), 1);

        assembler.invalidate_template(RULES_PATH);
        assembler.build_instructions();
        assert_eq!(source.loads.get(), 2);

        assembler.invalidate_templates();
        assembler.build_instructions();
        assert_eq!(source.loads.get(), 3);
    }

    #[test]
    fn test_placeholders() {
        let mut shared = BTreeMap::new();
        shared.insert("BRANCH_NAME".to_string(), "main".to_string());
        shared.insert("techPromptDelimiter".to_string(), "ignored".to_string());
        let table = PlaceholderTable::build(&shared);
        let settings = AssemblerSettings::default();

        assert_eq!(table.resolve("BRANCH_NAME", &settings).as_deref(), Some("main"));
        assert_eq!(table.resolve("techPromptDelimiter", &settings).as_deref(), Some("---"));
        assert_eq!(table.resolve("diffMarkerDashDashDash", &settings).as_deref(), Some("---"));
        assert_eq!(table.resolve("diffMarkerAtAt", &settings).as_deref(), Some("@@"));
        assert_eq!(table.resolve("diffFileLabel", &settings).as_deref(), Some("File:"));
        assert_eq!(table.resolve("fileStatusPrefix", &settings).as_deref(), Some("FILE WAS "));
        assert_eq!(table.resolve("nope", &settings), None);
    }

    #[test]
    fn test_prepare_inbound_sanitizes() {
        let assembler = PromptAssembler::new(AssemblerSettings::default(), InMemoryTemplates::new()).unwrap();
        let raw = "# src/a.ts\n```ts\nconst a = 1;\n```\n\n# README.md\n```sh\nls\n```\n";
        let payload = assembler.prepare_inbound(raw).unwrap();
        assert_eq!(payload.files[0].content, "\nconst a = 1;\n\n");
        assert_eq!(payload.files[1].content, "```sh\nls\n```\n");

        assert_eq!(assembler.prepare_inbound("no headers"), Err(ParseError::NoHeadersFound));
    }

    #[test]
    fn test_sanitize_listing_reencodes() {
        let assembler = PromptAssembler::new(AssemblerSettings::default(), InMemoryTemplates::new()).unwrap();
        let raw = "# src/a.ts\n```ts\nconst a = 1;\n```\n\n# README.md\n```sh\nls\n```\n\n# old.ts\nFILE WAS DELETED\n";
        assert_eq!(
            assembler.sanitize_listing(raw).unwrap(),
            "# src/a.ts\n\nconst a = 1;\n\n\n# README.md\n```sh\nls\n```\n\n# old.ts\nFILE WAS DELETED\n\n"
        );
        assert_eq!(assembler.sanitize_listing(""), Err(ParseError::NoHeadersFound));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = AssemblerSettings {
            placeholder_start: String::new(),
            ..AssemblerSettings::default()
        };
        assert!(matches!(
            PromptAssembler::new(settings, InMemoryTemplates::new()),
            Err(AssemblerError::Template(_))
        ));
    }
}
