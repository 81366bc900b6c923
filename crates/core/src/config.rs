//! Configuration: built-in defaults, a JSON user file layered on top, and
//! named profiles that override the base settings at runtime.
//!
//! Every struct deserializes with `#[serde(default)]`, so a user file only
//! needs to mention what it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::assembler::{AssemblerSettings, InstructionFragment};
use crate::codec::{
    header_regex_for_prefix, CodecError, CodecOptions, ListingCodec, DEFAULT_FILE_STATUS_PREFIX,
    DEFAULT_HEADER_PREFIX,
};
use crate::estimate::{LimitsTable, SizeLimits, DEFAULT_LIMITS_KEY};
use crate::sanitize::{strip_codefence_rule, SanitizationRule};
use crate::template::{TemplateEngine, TemplateError, DEFAULT_PLACEHOLDER_END, DEFAULT_PLACEHOLDER_START};

/// File name looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = ".llm-copypaster.json";

pub const LLM_RESPONSE_RULES_PROMPT_ID: &str = "llm-response-rules";
pub const WEB_GIT_PROMPT_ID: &str = "web-git-prompt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Profile-agnostic anchors of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsingAnchors {
    pub tech_prompt_delimiter: String,
    pub code_listing_header_start_fragment: String,
    /// Derived from the header fragment when unset.
    pub code_listing_header_regex: Option<String>,
    pub file_status_prefix: String,
    pub placeholder_start: String,
    pub placeholder_end: String,
}

impl Default for ParsingAnchors {
    fn default() -> Self {
        Self {
            tech_prompt_delimiter: "---".to_string(),
            code_listing_header_start_fragment: DEFAULT_HEADER_PREFIX.to_string(),
            code_listing_header_regex: None,
            file_status_prefix: DEFAULT_FILE_STATUS_PREFIX.to_string(),
            placeholder_start: DEFAULT_PLACEHOLDER_START.to_string(),
            placeholder_end: DEFAULT_PLACEHOLDER_END.to_string(),
        }
    }
}

impl ParsingAnchors {
    pub fn header_regex(&self) -> String {
        self.code_listing_header_regex
            .clone()
            .unwrap_or_else(|| header_regex_for_prefix(&self.code_listing_header_start_fragment))
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            header_prefix: self.code_listing_header_start_fragment.clone(),
            header_regex: self.header_regex(),
            file_status_prefix: self.file_status_prefix.clone(),
        }
    }

    fn apply(&self, overrides: &AnchorOverrides) -> Self {
        Self {
            tech_prompt_delimiter: pick(&overrides.tech_prompt_delimiter, &self.tech_prompt_delimiter),
            code_listing_header_start_fragment: pick(
                &overrides.code_listing_header_start_fragment,
                &self.code_listing_header_start_fragment,
            ),
            code_listing_header_regex: overrides
                .code_listing_header_regex
                .clone()
                .or_else(|| self.code_listing_header_regex.clone()),
            file_status_prefix: pick(&overrides.file_status_prefix, &self.file_status_prefix),
            placeholder_start: pick(&overrides.placeholder_start, &self.placeholder_start),
            placeholder_end: pick(&overrides.placeholder_end, &self.placeholder_end),
        }
    }
}

fn pick<T: Clone>(over: &Option<T>, base: &T) -> T {
    over.clone().unwrap_or_else(|| base.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Do not append the size footer to copied prompts.
    pub skip_size_stats: bool,
    /// Key into `limits_by_target`, e.g. a model name.
    pub current_target: String,
    pub limits_by_target: LimitsTable,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            skip_size_stats: false,
            current_target: DEFAULT_LIMITS_KEY.to_string(),
            limits_by_target: LimitsTable::default(),
        }
    }
}

impl ContextSettings {
    pub fn limits(&self) -> SizeLimits {
        self.limits_by_target.resolve(&self.current_target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptInstructions {
    pub shared_variables: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    pub fragments: Vec<InstructionFragment>,
}

impl Default for PromptInstructions {
    fn default() -> Self {
        let shared_variables = [
            ("BRANCH_NAME", "master"),
            ("RAW_GITHUB_BASE_URL", "https://raw.githubusercontent.com/"),
            ("BLOB_GITHUB_BASE_URL", "https://github.com/"),
            ("WEB_GIT_PROMPT_NAME", "Web Git Prompt"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            shared_variables,
            flags: BTreeMap::from([("allowFileOperations".to_string(), true)]),
            fragments: vec![
                InstructionFragment::new(LLM_RESPONSE_RULES_PROMPT_ID, crate::RESPONSE_RULES_TEMPLATE_PATH),
                InstructionFragment::new(WEB_GIT_PROMPT_ID, "prompts/web-git-prompt.md"),
            ],
        }
    }
}

/// Settings that a profile may override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileSettings {
    pub skip_tech_prompt: bool,
    pub skip_code_listings: bool,
    pub context: ContextSettings,
    pub prompt_instructions: PromptInstructions,
    pub sanitization_rules: Vec<SanitizationRule>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            skip_tech_prompt: false,
            skip_code_listings: false,
            context: ContextSettings::default(),
            prompt_instructions: PromptInstructions::default(),
            sanitization_rules: vec![strip_codefence_rule()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnchorOverrides {
    pub tech_prompt_delimiter: Option<String>,
    pub code_listing_header_start_fragment: Option<String>,
    pub code_listing_header_regex: Option<String>,
    pub file_status_prefix: Option<String>,
    pub placeholder_start: Option<String>,
    pub placeholder_end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextOverrides {
    pub skip_size_stats: Option<bool>,
    pub current_target: Option<String>,
    /// Merged into the base table by target id, field by field.
    pub limits_by_target: BTreeMap<String, SizeLimitsOverride>,
}

/// Partial [`SizeLimits`]; unset fields keep the value being overridden.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizeLimitsOverride {
    pub max_lines: Option<usize>,
    pub max_tokens: Option<usize>,
    pub approx_chars_per_token: Option<f64>,
}

impl SizeLimitsOverride {
    pub fn apply_to(&self, base: &SizeLimits) -> SizeLimits {
        SizeLimits {
            max_lines: self.max_lines.unwrap_or(base.max_lines),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            approx_chars_per_token: self.approx_chars_per_token.unwrap_or(base.approx_chars_per_token),
        }
    }

    /// `other` on top of `self`.
    pub fn layered(&self, other: &SizeLimitsOverride) -> SizeLimitsOverride {
        SizeLimitsOverride {
            max_lines: other.max_lines.or(self.max_lines),
            max_tokens: other.max_tokens.or(self.max_tokens),
            approx_chars_per_token: other.approx_chars_per_token.or(self.approx_chars_per_token),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentOverride {
    pub id: String,
    pub relative_path: Option<String>,
    pub skip: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstructionOverrides {
    /// Drop all base shared variables before adding these.
    pub replace_all_shared_variables: bool,
    pub shared_variables: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    /// Drop all base fragments before adding these.
    pub replace_all_fragments: bool,
    pub fragments: Vec<FragmentOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOverride {
    pub id: String,
    pub pattern: Option<String>,
    pub replace_with: Option<String>,
    pub disabled_for_languages: Option<Vec<String>>,
    pub disabled_for_paths: Option<Vec<String>>,
}

/// Partial settings. Rules and fragments are matched by id: known ids are
/// patched in place, unknown ids are appended when complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsOverrides {
    pub skip_tech_prompt: Option<bool>,
    pub skip_code_listings: Option<bool>,
    pub context: Option<ContextOverrides>,
    pub prompt_instructions: Option<InstructionOverrides>,
    pub replace_all_sanitization_rules: bool,
    pub sanitization_rules: Vec<RuleOverride>,
}

impl SettingsOverrides {
    /// Stack `other` on top of `self`; `other` wins where both are set.
    pub fn layered(&self, other: &SettingsOverrides) -> SettingsOverrides {
        let context = match (&self.context, &other.context) {
            (Some(base), Some(over)) => {
                let mut limits_by_target = base.limits_by_target.clone();
                for (target, limits) in &over.limits_by_target {
                    let merged = match limits_by_target.get(target) {
                        Some(existing) => existing.layered(limits),
                        None => *limits,
                    };
                    limits_by_target.insert(target.clone(), merged);
                }
                Some(ContextOverrides {
                    skip_size_stats: over.skip_size_stats.or(base.skip_size_stats),
                    current_target: over.current_target.clone().or_else(|| base.current_target.clone()),
                    limits_by_target,
                })
            }
            (base, over) => over.clone().or_else(|| base.clone()),
        };

        let prompt_instructions = match (&self.prompt_instructions, &other.prompt_instructions) {
            (Some(base), Some(over)) => {
                let mut merged = base.clone();
                if over.replace_all_shared_variables {
                    merged.replace_all_shared_variables = true;
                    merged.shared_variables.clear();
                }
                merged.shared_variables.extend(over.shared_variables.clone());
                merged.flags.extend(over.flags.clone());
                if over.replace_all_fragments {
                    merged.replace_all_fragments = true;
                    merged.fragments.clear();
                }
                merged.fragments.extend(over.fragments.iter().cloned());
                Some(merged)
            }
            (base, over) => over.clone().or_else(|| base.clone()),
        };

        let (replace_all_sanitization_rules, sanitization_rules) = if other.replace_all_sanitization_rules {
            (true, other.sanitization_rules.clone())
        } else {
            let mut rules = self.sanitization_rules.clone();
            rules.extend(other.sanitization_rules.iter().cloned());
            (self.replace_all_sanitization_rules, rules)
        };

        SettingsOverrides {
            skip_tech_prompt: other.skip_tech_prompt.or(self.skip_tech_prompt),
            skip_code_listings: other.skip_code_listings.or(self.skip_code_listings),
            context,
            prompt_instructions,
            replace_all_sanitization_rules,
            sanitization_rules,
        }
    }
}

impl ProfileSettings {
    /// Settings with `overrides` applied.
    pub fn apply(&self, overrides: &SettingsOverrides) -> ProfileSettings {
        let mut next = self.clone();

        if let Some(v) = overrides.skip_tech_prompt {
            next.skip_tech_prompt = v;
        }
        if let Some(v) = overrides.skip_code_listings {
            next.skip_code_listings = v;
        }

        if let Some(context) = &overrides.context {
            if let Some(v) = context.skip_size_stats {
                next.context.skip_size_stats = v;
            }
            if let Some(v) = &context.current_target {
                next.context.current_target = v.clone();
            }
            for (target, limits) in &context.limits_by_target {
                let base = next.context.limits_by_target.resolve(target);
                next.context
                    .limits_by_target
                    .0
                    .insert(target.clone(), limits.apply_to(&base));
            }
        }

        if let Some(instructions) = &overrides.prompt_instructions {
            apply_instruction_overrides(&mut next.prompt_instructions, instructions);
        }

        if overrides.replace_all_sanitization_rules {
            next.sanitization_rules.clear();
        }
        for rule in &overrides.sanitization_rules {
            apply_rule_override(&mut next.sanitization_rules, rule);
        }

        next
    }
}

fn apply_instruction_overrides(target: &mut PromptInstructions, overrides: &InstructionOverrides) {
    if overrides.replace_all_shared_variables {
        target.shared_variables.clear();
    }
    target
        .shared_variables
        .extend(overrides.shared_variables.clone());
    target.flags.extend(overrides.flags.clone());

    if overrides.replace_all_fragments {
        target.fragments.clear();
    }
    for over in &overrides.fragments {
        match target.fragments.iter_mut().find(|f| f.id == over.id) {
            Some(existing) => {
                if let Some(path) = &over.relative_path {
                    existing.relative_path = path.clone();
                }
                if let Some(skip) = over.skip {
                    existing.skip = skip;
                }
            }
            None => match &over.relative_path {
                Some(path) => target.fragments.push(InstructionFragment {
                    id: over.id.clone(),
                    relative_path: path.clone(),
                    skip: over.skip.unwrap_or(false),
                }),
                None => warn!(fragment = %over.id, "ignoring new instruction fragment without relativePath"),
            },
        }
    }
}

fn apply_rule_override(rules: &mut Vec<SanitizationRule>, over: &RuleOverride) {
    if let Some(existing) = rules.iter_mut().find(|r| r.id == over.id) {
        if let Some(v) = &over.pattern {
            existing.pattern = v.clone();
        }
        if let Some(v) = &over.replace_with {
            existing.replace_with = v.clone();
        }
        if let Some(v) = &over.disabled_for_languages {
            existing.disabled_for_languages = v.clone();
        }
        if let Some(v) = &over.disabled_for_paths {
            existing.disabled_for_paths = v.clone();
        }
        return;
    }

    let (Some(pattern), Some(replace_with)) = (&over.pattern, &over.replace_with) else {
        warn!(rule = %over.id, "ignoring new sanitization rule without pattern/replaceWith");
        return;
    };
    rules.push(SanitizationRule {
        id: over.id.clone(),
        pattern: pattern.clone(),
        replace_with: replace_with.clone(),
        disabled_for_languages: over.disabled_for_languages.clone().unwrap_or_default(),
        disabled_for_paths: over.disabled_for_paths.clone().unwrap_or_default(),
    });
}

/// A named set of overrides, e.g. per project or per model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub description: String,
    pub version: String,
    pub settings: SettingsOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileOverride {
    pub description: Option<String>,
    pub version: Option<String>,
    pub settings: Option<SettingsOverrides>,
}

/// Contents of the user's config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConfig {
    pub parsing_anchors: Option<AnchorOverrides>,
    pub base_settings: Option<SettingsOverrides>,
    pub replace_all_profiles: bool,
    pub profiles_by_id: BTreeMap<String, ProfileOverride>,
    pub current_profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopypasterConfig {
    pub parsing_anchors: ParsingAnchors,
    pub base_settings: ProfileSettings,
    pub profiles_by_id: BTreeMap<String, Profile>,
    pub current_profile: Option<String>,
}

impl CopypasterConfig {
    /// Layer a user config over `self`.
    pub fn merge_user(&self, user: &UserConfig) -> CopypasterConfig {
        let parsing_anchors = match &user.parsing_anchors {
            Some(over) => self.parsing_anchors.apply(over),
            None => self.parsing_anchors.clone(),
        };
        let base_settings = match &user.base_settings {
            Some(over) => self.base_settings.apply(over),
            None => self.base_settings.clone(),
        };

        let mut profiles_by_id = if user.replace_all_profiles {
            BTreeMap::new()
        } else {
            self.profiles_by_id.clone()
        };
        for (id, over) in &user.profiles_by_id {
            match profiles_by_id.get_mut(id) {
                Some(existing) => {
                    if let Some(v) = &over.description {
                        existing.description = v.clone();
                    }
                    if let Some(v) = &over.version {
                        existing.version = v.clone();
                    }
                    if let Some(settings) = &over.settings {
                        existing.settings = existing.settings.layered(settings);
                    }
                }
                None => {
                    let (Some(description), Some(version)) = (&over.description, &over.version) else {
                        warn!(profile = %id, "ignoring new profile without description/version");
                        continue;
                    };
                    profiles_by_id.insert(
                        id.clone(),
                        Profile {
                            description: description.clone(),
                            version: version.clone(),
                            settings: over.settings.clone().unwrap_or_default(),
                        },
                    );
                }
            }
        }

        CopypasterConfig {
            parsing_anchors,
            base_settings,
            profiles_by_id,
            current_profile: user.current_profile.clone().or_else(|| self.current_profile.clone()),
        }
    }

    /// Base settings with the requested (or current) profile applied.
    pub fn effective_settings(&self, profile: Option<&str>) -> Result<ProfileSettings, ConfigError> {
        let Some(id) = profile.or(self.current_profile.as_deref()) else {
            return Ok(self.base_settings.clone());
        };
        let profile = self
            .profiles_by_id
            .get(id)
            .ok_or_else(|| ConfigError::UnknownProfile(id.to_string()))?;
        Ok(self.base_settings.apply(&profile.settings))
    }

    pub fn codec_options(&self) -> CodecOptions {
        self.parsing_anchors.codec_options()
    }

    pub fn codec(&self) -> Result<ListingCodec, CodecError> {
        ListingCodec::new(self.codec_options())
    }

    pub fn template_engine(&self) -> Result<TemplateEngine, TemplateError> {
        TemplateEngine::new(
            &self.parsing_anchors.placeholder_start,
            &self.parsing_anchors.placeholder_end,
        )
    }

    /// Everything the prompt assembler needs for one profile.
    pub fn assembler_settings(&self, profile: Option<&str>) -> Result<AssemblerSettings, ConfigError> {
        let settings = self.effective_settings(profile)?;
        Ok(AssemblerSettings {
            codec: self.codec_options(),
            delimiter: self.parsing_anchors.tech_prompt_delimiter.clone(),
            placeholder_start: self.parsing_anchors.placeholder_start.clone(),
            placeholder_end: self.parsing_anchors.placeholder_end.clone(),
            limits: settings.context.limits(),
            skip_instructions: settings.skip_tech_prompt,
            skip_code_listings: settings.skip_code_listings,
            skip_size_stats: settings.context.skip_size_stats,
            fragments: settings.prompt_instructions.fragments,
            shared_variables: settings.prompt_instructions.shared_variables,
            flags: settings.prompt_instructions.flags,
            sanitization_rules: settings.sanitization_rules,
        })
    }
}

/// Parse a user config from JSON text.
pub fn parse_user_config(text: &str, path: &Path) -> Result<UserConfig, ConfigError> {
    serde_json::from_str(text).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Defaults merged with the user file at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<CopypasterConfig, ConfigError> {
    let defaults = CopypasterConfig::default();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no config file, using defaults");
            return Ok(defaults);
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let user = parse_user_config(&text, path)?;
    Ok(defaults.merge_user(&user))
}
