//! Node.js bindings for the llm-copypaster core.
//!
//! The editor extension owns clipboard, workspace and notification access;
//! these bindings cover the pure text work: listing codec, sanitization,
//! template rendering, size estimation and prompt assembly. Persisting the
//! last failure is left to the extension's own storage.

use std::collections::HashMap;
use std::sync::Mutex;

use napi::bindgen_prelude::*;
use napi_derive::napi;

use llm_copypaster_core::{
    assembler::AssemblerSettings, build_guided_retry_prompt, builtin_templates, codec::DEFAULT_HEADER_PREFIX,
    estimate, CodecOptions, Exceeded, CopypasterConfig, FileEntry as CoreFileEntry, FileMeta, FilesPayload as CorePayload,
    InMemoryTemplates, LastFailure, ListingCodec, OperationKind, PromptAssembler as CoreAssembler, RetryStage,
    SanitizationEngine, SanitizationRule as CoreRule, SizeLimits, TemplateEngine,
};

/// A file in a listing.
#[napi(object)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    /// `EDITED_FULL`, `CREATED` or `DELETED`.
    pub operation: Option<String>,
    pub read_error: Option<String>,
}

impl From<CoreFileEntry> for FileEntry {
    fn from(entry: CoreFileEntry) -> Self {
        Self {
            path: entry.path,
            content: entry.content,
            operation: entry.operation.map(|op| op.as_marker().to_string()),
            read_error: entry.read_error,
        }
    }
}

impl TryFrom<FileEntry> for CoreFileEntry {
    type Error = Error;

    fn try_from(entry: FileEntry) -> Result<Self> {
        let mut core = CoreFileEntry::new(entry.path, entry.content);
        if let Some(marker) = entry.operation {
            let operation = marker.parse::<OperationKind>().map_err(Error::from_reason)?;
            core = core.with_operation(operation);
        }
        core.read_error = entry.read_error;
        Ok(core)
    }
}

/// Decoded reply.
#[napi(object)]
pub struct FilesPayload {
    pub files: Vec<FileEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl From<CorePayload> for FilesPayload {
    fn from(payload: CorePayload) -> Self {
        Self {
            files: payload.files.into_iter().map(Into::into).collect(),
            warnings: payload.warnings,
            errors: payload.errors,
        }
    }
}

#[napi(object)]
pub struct SanitizationRule {
    pub id: String,
    pub pattern: String,
    pub replace_with: String,
    pub disabled_for_languages: Option<Vec<String>>,
    pub disabled_for_paths: Option<Vec<String>>,
}

impl From<SanitizationRule> for CoreRule {
    fn from(rule: SanitizationRule) -> Self {
        Self {
            id: rule.id,
            pattern: rule.pattern,
            replace_with: rule.replace_with,
            disabled_for_languages: rule.disabled_for_languages.unwrap_or_default(),
            disabled_for_paths: rule.disabled_for_paths.unwrap_or_default(),
        }
    }
}

#[napi(object)]
pub struct SanitizeResult {
    pub content: String,
    /// One message per rule that failed to compile.
    pub failures: Vec<String>,
}

#[napi(object)]
pub struct PromptSizeLimits {
    pub max_lines: Option<u32>,
    pub max_tokens: Option<u32>,
    pub approx_chars_per_token: Option<f64>,
}

impl From<PromptSizeLimits> for SizeLimits {
    fn from(limits: PromptSizeLimits) -> Self {
        let defaults = SizeLimits::default();
        Self {
            max_lines: limits.max_lines.map(|v| v as usize).unwrap_or(defaults.max_lines),
            max_tokens: limits.max_tokens.map(|v| v as usize).unwrap_or(defaults.max_tokens),
            approx_chars_per_token: limits.approx_chars_per_token.unwrap_or(defaults.approx_chars_per_token),
        }
    }
}

#[napi(object)]
pub struct PromptSizeEstimate {
    pub lines_count: u32,
    pub approx_tokens_count: u32,
    pub max_lines: u32,
    pub max_tokens: u32,
    /// `LINES` and/or `TOKENS`.
    pub exceeded_by: Vec<String>,
    pub footer_text: String,
}

impl From<llm_copypaster_core::SizeEstimate> for PromptSizeEstimate {
    fn from(est: llm_copypaster_core::SizeEstimate) -> Self {
        let footer_text = est.footer_text();
        Self {
            lines_count: est.lines_count as u32,
            approx_tokens_count: est.approx_tokens_count as u32,
            max_lines: est.max_lines as u32,
            max_tokens: est.max_tokens as u32,
            exceeded_by: est
                .exceeded_by
                .iter()
                .map(|e| match e {
                    Exceeded::Lines => "LINES".to_string(),
                    Exceeded::Tokens => "TOKENS".to_string(),
                })
                .collect(),
            footer_text,
        }
    }
}

#[napi(object)]
pub struct OutboundPrompt {
    pub text: String,
    pub estimate: PromptSizeEstimate,
}

fn codec_for_prefix(header_prefix: Option<String>) -> Result<ListingCodec> {
    let options = CodecOptions::for_prefix(header_prefix.unwrap_or_else(|| DEFAULT_HEADER_PREFIX.to_string()));
    ListingCodec::new(options).map_err(|e| Error::from_reason(e.to_string()))
}

/// Serialize files into a listing blob.
#[napi]
pub fn encode_listing(files: Vec<FileEntry>, header_prefix: Option<String>) -> Result<String> {
    let codec = codec_for_prefix(header_prefix)?;
    let files = files
        .into_iter()
        .map(CoreFileEntry::try_from)
        .collect::<Result<Vec<_>>>()?;
    Ok(codec.encode(&files))
}

/// Parse a pasted blob. Throws on structural errors.
#[napi]
pub fn decode_listing(raw_text: String, header_prefix: Option<String>) -> Result<FilesPayload> {
    let codec = codec_for_prefix(header_prefix)?;
    codec
        .decode(&raw_text)
        .map(Into::into)
        .map_err(|e| Error::from_reason(e.to_string()))
}

/// Apply sanitization rules to one file's content.
#[napi]
pub fn sanitize_content(
    content: String,
    path: String,
    rules: Vec<SanitizationRule>,
    language_id: Option<String>,
) -> SanitizeResult {
    let engine = SanitizationEngine::new(rules.into_iter().map(CoreRule::from));
    let meta = match language_id.as_deref() {
        Some(language_id) => FileMeta::new(&path).with_language(language_id),
        None => FileMeta::from_path(&path),
    };
    let sanitized = engine.apply(&content, &meta);
    SanitizeResult {
        content: sanitized.content,
        failures: sanitized.failures.iter().map(ToString::to_string).collect(),
    }
}

#[napi]
pub fn render_constant(text: String, key: String, value: String) -> String {
    TemplateEngine::default().render_constant(&text, &key, &value)
}

#[napi]
pub fn render_if(text: String, flag: String, is_true: bool) -> String {
    TemplateEngine::default().render_if(&text, &flag, is_true)
}

/// `else if` branches are looked up in `flags`; missing flags count as false.
#[napi]
pub fn render_if_else(text: String, flag: String, is_true: bool, flags: Option<HashMap<String, bool>>) -> String {
    let flags = flags.unwrap_or_default();
    TemplateEngine::default().render_if_else_with(&text, &flag, is_true, |name| {
        flags.get(name).copied().unwrap_or(false)
    })
}

#[napi]
pub fn estimate_prompt_size(text: String, limits: Option<PromptSizeLimits>) -> PromptSizeEstimate {
    let limits = limits.map(SizeLimits::from).unwrap_or_default();
    estimate(&text, &limits).into()
}

/// Follow-up prompt for a rejected reply. `stage` is `validation`,
/// `sanitization` or `apply`.
#[napi(js_name = "buildGuidedRetryPrompt")]
pub fn guided_retry_prompt(
    stage: String,
    message: String,
    raw_clipboard_text: String,
    header_prefix: Option<String>,
) -> Result<String> {
    let stage = stage.parse::<RetryStage>().map_err(Error::from_reason)?;
    let failure = LastFailure::new(stage, message, raw_clipboard_text);
    Ok(build_guided_retry_prompt(
        &failure,
        header_prefix.as_deref().unwrap_or(DEFAULT_HEADER_PREFIX),
    ))
}

/// Decode a reply, apply the configured sanitization rules and re-encode it.
/// Throws on structural errors.
#[napi]
pub fn sanitize_listing(raw_text: String, config_json: Option<String>, profile: Option<String>) -> Result<String> {
    let settings = settings_from_options(&PromptAssemblerOptions {
        config_json,
        profile,
        templates: None,
    })?;
    let assembler =
        CoreAssembler::new(settings, InMemoryTemplates::new()).map_err(|e| Error::from_reason(e.to_string()))?;
    assembler
        .sanitize_listing(&raw_text)
        .map_err(|e| Error::from_reason(e.to_string()))
}

#[napi(object)]
pub struct PromptAssemblerOptions {
    /// Contents of `.llm-copypaster.json`.
    pub config_json: Option<String>,
    pub profile: Option<String>,
    /// Template text by relative path; overrides the built-in templates.
    pub templates: Option<HashMap<String, String>>,
}

/// Builds outbound prompts and prepares inbound replies for one profile.
///
/// Template text is cached; call `invalidateTemplates` after replacing it.
#[napi]
pub struct PromptAssembler {
    inner: Mutex<CoreAssembler<InMemoryTemplates>>,
}

fn settings_from_options(options: &PromptAssemblerOptions) -> Result<AssemblerSettings> {
    let base = CopypasterConfig::default();
    let config = match options.config_json.as_deref() {
        Some(json) => {
            let user = llm_copypaster_core::config::parse_user_config(json, std::path::Path::new("<inline>"))
                .map_err(|e| Error::from_reason(e.to_string()))?;
            base.merge_user(&user)
        }
        None => base,
    };
    config
        .assembler_settings(options.profile.as_deref())
        .map_err(|e| Error::from_reason(e.to_string()))
}

#[napi]
impl PromptAssembler {
    #[napi(constructor)]
    pub fn new(options: Option<PromptAssemblerOptions>) -> Result<Self> {
        let options = options.unwrap_or(PromptAssemblerOptions {
            config_json: None,
            profile: None,
            templates: None,
        });
        let settings = settings_from_options(&options)?;

        let mut source = builtin_templates();
        for (path, text) in options.templates.unwrap_or_default() {
            source.insert(path, text);
        }

        let inner = CoreAssembler::new(settings, source).map_err(|e| Error::from_reason(e.to_string()))?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    #[napi]
    pub fn build_instructions(&self) -> Result<String> {
        let mut inner = self.inner.lock().map_err(|_| Error::from_reason("Lock poisoned"))?;
        Ok(inner.build_instructions())
    }

    #[napi]
    pub fn build_outbound(&self, files: Vec<FileEntry>) -> Result<OutboundPrompt> {
        let files = files
            .into_iter()
            .map(CoreFileEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.lock().map_err(|_| Error::from_reason("Lock poisoned"))?;
        let prompt = inner.build_outbound(&files);
        Ok(OutboundPrompt {
            text: prompt.text,
            estimate: prompt.estimate.into(),
        })
    }

    /// Decode and sanitize a reply. Throws on structural errors.
    #[napi]
    pub fn prepare_inbound(&self, raw_text: String) -> Result<FilesPayload> {
        let inner = self.inner.lock().map_err(|_| Error::from_reason("Lock poisoned"))?;
        inner
            .prepare_inbound(&raw_text)
            .map(Into::into)
            .map_err(|e| Error::from_reason(e.to_string()))
    }

    /// Decode and sanitize a reply, returned as a listing blob. Throws on
    /// structural errors.
    #[napi]
    pub fn sanitize_listing(&self, raw_text: String) -> Result<String> {
        let inner = self.inner.lock().map_err(|_| Error::from_reason("Lock poisoned"))?;
        inner
            .sanitize_listing(&raw_text)
            .map_err(|e| Error::from_reason(e.to_string()))
    }

    #[napi]
    pub fn invalidate_templates(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::from_reason("Lock poisoned"))?;
        inner.invalidate_templates();
        Ok(())
    }
}
