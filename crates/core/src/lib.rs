//! Core text interchange logic for moving source files between a workspace
//! and a chat LLM.
//!
//! Files go out as a single listing blob (optionally preceded by rendered
//! instruction fragments) and come back as a reply that is decoded,
//! sanitized and applied to disk. See [`PromptAssembler`] for the full
//! round trip.

/// Trait for token counting.
///
/// The built-in [`CharApproxTokenizer`] estimates from character counts;
/// callers with a real tokenizer can plug it into [`estimate_with`].
pub trait Tokenizer {
    /// Count the number of tokens in the given text.
    fn count_tokens(&self, text: &str) -> usize;
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn count_tokens(&self, text: &str) -> usize {
        (*self).count_tokens(text)
    }
}

pub mod assembler;
pub mod codec;
pub mod config;
pub mod estimate;
mod helpers;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod sanitize;
pub mod template;

pub use assembler::{
    AssemblerError, AssemblerSettings, DirTemplates, InMemoryTemplates, InstructionFragment, OutboundPrompt,
    PlaceholderSource, PlaceholderTable, PromptAssembler, TemplateCache, TemplateSource,
};
pub use codec::{decode_listing, encode_listing, CodecError, CodecOptions, ListingCodec, ParseError};
pub use config::{load_config, ConfigError, CopypasterConfig, ProfileSettings, CONFIG_FILE_NAME};
pub use estimate::{estimate, estimate_with, CharApproxTokenizer, Exceeded, LimitsTable, SizeEstimate, SizeLimits};
pub use helpers::language_id_for_path;
pub use payload::{FileEntry, FilesPayload, OperationKind, SourceRange};
pub use pipeline::{apply_payload, discover_files, read_file_entries, ApplyReport, PipelineError};
pub use retry::{
    build_guided_retry_prompt, load_last_failure, save_last_failure, LastFailure, RetryError, RetryStage,
    LAST_FAILURE_FILE_NAME,
};
pub use sanitize::{
    apply_sanitization_rules, sanitize_payload, FileMeta, RuleFailure, SanitizationEngine, SanitizationRule,
    SanitizedContent,
};
pub use template::{TemplateContext, TemplateEngine, TemplateError};

/// Relative path of the built-in response rules fragment.
pub const RESPONSE_RULES_TEMPLATE_PATH: &str = "prompts/llm-response-rules-prompt.md";

/// Response rules used when no template directory is configured.
pub const DEFAULT_RESPONSE_RULES_PROMPT: &str = r#"You are editing files in my workspace. Reply ONLY with complete file listings.

=== RESPONSE FORMAT ===
For every file you change, output its header line followed by the whole new content:

{{codeListingHeaderStartFragment}}relative/path/to/file.ext
<complete file content>

- Always print the WHOLE file, never a diff, a fragment or an ellipsis.
- Do not wrap file contents in code fences.
- Leave one blank line between files.
{{#if allowFileOperations}}
- To create a file, put `{{fileStatusPrefix}}CREATED` on the line right after its header.
- To delete a file, put `{{fileStatusPrefix}}DELETED` on the line right after its header and nothing else.
{{else}}
- Only edit the files listed below. Do not create or delete files.
{{/if}}

Everything between the `{{techPromptDelimiter}}` lines is instructions; my files follow the closing one.
Replies that do not follow this format will be rejected."#;

/// Template source holding only the built-in fragments.
pub fn builtin_templates() -> InMemoryTemplates {
    InMemoryTemplates::new().with(RESPONSE_RULES_TEMPLATE_PATH, DEFAULT_RESPONSE_RULES_PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_render_with_defaults() {
        let settings = CopypasterConfig::default().assembler_settings(None).unwrap();
        let mut assembler = PromptAssembler::new(settings, builtin_templates()).unwrap();
        let instructions = assembler.build_instructions();

        assert!(instructions.contains("# relative/path/to/file.ext"));
        assert!(instructions.contains("`FILE WAS DELETED`"));
        assert!(!instructions.contains("Only edit the files listed below"));
        assert!(!instructions.contains("{{"));
    }

    #[test]
    fn test_round_trip_through_assembler() {
        let settings = AssemblerSettings {
            skip_size_stats: true,
            ..CopypasterConfig::default().assembler_settings(None).unwrap()
        };
        let mut assembler = PromptAssembler::new(settings, builtin_templates()).unwrap();
        let files = vec![
            FileEntry::new("src/a.ts", "const a = 1;\n"),
            FileEntry::new("README.md", "Title\n=====\n\ntext\n"),
        ];
        let outbound = assembler.build_outbound(&files);

        // The reply echoes the listings part only.
        let listings = outbound.text.rsplit("\n---\n").next().unwrap();
        let payload = assembler.prepare_inbound(listings).unwrap();
        assert_eq!(payload.paths(), vec!["src/a.ts", "README.md"]);
        assert_eq!(payload.files[0].content, "const a = 1;\n");
    }
}
