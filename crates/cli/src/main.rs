//! CLI for moving workspace files into a chat LLM prompt and applying the
//! LLM's reply back to disk.
//!
//! `copy` prints the outbound prompt and `apply` decodes a pasted reply and
//! writes it. `sanitize` prints the cleaned reply without writing it.
//! `stats` estimates prompt size. `retry-prompt` builds the follow-up
//! message for the last reply that could not be used.

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use llm_copypaster_core::{
    apply_payload, build_guided_retry_prompt, builtin_templates, estimate, load_config, load_last_failure,
    pipeline::{expand_inputs, read_file_entries, DEFAULT_EXCLUDED_DIRS},
    save_last_failure, CopypasterConfig, DirTemplates, InMemoryTemplates, LastFailure, PromptAssembler, RetryStage,
    TemplateSource, CONFIG_FILE_NAME, LAST_FAILURE_FILE_NAME,
};

/// Copy files into an LLM prompt and apply the LLM's reply.
#[derive(Parser, Debug)]
#[command(name = "llm-copypaster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ./.llm-copypaster.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Profile to apply over the base settings
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a prompt from files and directories
    Copy {
        /// Files or directories to include
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Workspace root that listing paths are relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Directory holding instruction templates
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Write the prompt here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Decode an LLM reply and write its files
    Apply {
        /// Reply text (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Workspace root to write into
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Print the decoded payload instead of writing files
        #[arg(long)]
        dry_run: bool,
    },
    /// Decode and sanitize an LLM reply, then print it as a listing
    Sanitize {
        /// Reply text (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Write the listing here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Estimate the size of a prompt
    Stats {
        /// Prompt text (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Limits target, e.g. a model id
        #[arg(long)]
        target: Option<String>,
    },
    /// Print the follow-up prompt for a rejected reply
    ///
    /// Without --stage and --message, the last failure saved by `apply` or
    /// `sanitize` is used.
    RetryPrompt {
        /// validation, sanitization or apply
        #[arg(long, requires = "message")]
        stage: Option<RetryStage>,

        /// What went wrong
        #[arg(long, requires = "stage")]
        message: Option<String>,

        /// The rejected reply (defaults to the saved one, or empty)
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

/// Templates from a directory, falling back to the built-in ones.
struct Templates {
    dir: Option<DirTemplates>,
    builtin: InMemoryTemplates,
}

impl TemplateSource for Templates {
    fn load(&self, relative_path: &str) -> Option<String> {
        self.dir
            .as_ref()
            .and_then(|dir| dir.load(relative_path))
            .or_else(|| self.builtin.load(relative_path))
    }
}

fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}

/// Whole text of `input`, or of stdin when unset.
fn read_input(input: Option<&Path>) -> Result<String, Box<dyn std::error::Error>> {
    match input {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

/// Print the retry prompt for `failure` and keep it for `retry-prompt`.
fn report_failure(failure: &LastFailure, header_prefix: &str, failure_path: &Path) {
    eprintln!("Reply could not be used. Send this back to the LLM:\n");
    eprintln!("{}", build_guided_retry_prompt(failure, header_prefix));
    if let Err(e) = save_last_failure(failure_path, failure) {
        warn!("{}", e);
    }
}

fn run_copy(
    config: &CopypasterConfig,
    profile: Option<&str>,
    paths: &[PathBuf],
    root: &Path,
    templates: Option<PathBuf>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.assembler_settings(profile)?;
    let source = Templates {
        dir: templates.map(DirTemplates::new),
        builtin: builtin_templates(),
    };
    let mut assembler = PromptAssembler::new(settings, source)?;

    let files = expand_inputs(paths, DEFAULT_EXCLUDED_DIRS);
    if files.is_empty() {
        return Err("no files to copy".into());
    }
    let entries = read_file_entries(root, &files);
    for entry in entries.iter().filter(|e| e.read_error.is_some()) {
        warn!(path = %entry.path, "included with read error");
    }

    let prompt = assembler.build_outbound(&entries);
    match output {
        Some(path) => std::fs::write(path, &prompt.text)?,
        None => print!("{}", prompt.text),
    }
    eprintln!("{}", prompt.estimate.summary_line("Copy"));
    Ok(())
}

fn run_apply(
    config: &CopypasterConfig,
    profile: Option<&str>,
    input: Option<&Path>,
    root: &Path,
    dry_run: bool,
    failure_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let header_prefix = config.parsing_anchors.code_listing_header_start_fragment.clone();
    let assembler = PromptAssembler::new(config.assembler_settings(profile)?, builtin_templates())?;
    let raw = read_input(input)?;

    let payload = match assembler.prepare_inbound(&raw) {
        Ok(payload) => payload,
        Err(e) => {
            report_failure(&LastFailure::from_parse_error(&e, raw), &header_prefix, failure_path);
            return Err(e.into());
        }
    };
    for warning in &payload.warnings {
        warn!("{}", warning);
    }

    if dry_run {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let report = match apply_payload(root, &payload) {
        Ok(report) => report,
        Err(e) => {
            let failure = LastFailure::new(RetryStage::Apply, e.to_string(), raw);
            report_failure(&failure, &header_prefix, failure_path);
            return Err(e.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("Applied {} file(s)", report.total());
    Ok(())
}

fn run_sanitize(
    config: &CopypasterConfig,
    profile: Option<&str>,
    input: Option<&Path>,
    output: Option<&Path>,
    failure_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let header_prefix = &config.parsing_anchors.code_listing_header_start_fragment;
    let assembler = PromptAssembler::new(config.assembler_settings(profile)?, builtin_templates())?;
    let raw = read_input(input)?;

    let listing = match assembler.sanitize_listing(&raw) {
        Ok(listing) => listing,
        Err(e) => {
            report_failure(&LastFailure::from_parse_error(&e, raw), header_prefix, failure_path);
            return Err(e.into());
        }
    };
    match output {
        Some(path) => std::fs::write(path, &listing)?,
        None => print!("{}", listing),
    }
    Ok(())
}

/// Failure given on the command line, else the saved one.
fn resolve_failure(
    stage: Option<RetryStage>,
    message: Option<String>,
    input: Option<&Path>,
    failure_path: &Path,
) -> Result<LastFailure, Box<dyn std::error::Error>> {
    let raw = input.map(std::fs::read_to_string).transpose()?;
    if let (Some(stage), Some(message)) = (stage, message) {
        return Ok(LastFailure::new(stage, message, raw.unwrap_or_default()));
    }
    let mut failure = load_last_failure(failure_path)?
        .ok_or_else(|| format!("no saved failure at {}; pass --stage and --message", failure_path.display()))?;
    if let Some(raw) = raw {
        failure.raw_clipboard_text = raw;
    }
    Ok(failure)
}

fn run_stats(
    config: &CopypasterConfig,
    profile: Option<&str>,
    input: Option<&Path>,
    target: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = config.effective_settings(profile)?.context;
    let limits = match target {
        Some(target) => context.limits_by_target.resolve(target),
        None => context.limits(),
    };
    let text = read_input(input)?;
    let estimate = estimate(&text, &limits);
    println!("{}", serde_json::to_string_pretty(&estimate)?);
    eprintln!("{}", estimate.summary_line("Stats"));
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_subscriber(&args.log_level);

    let config_path = args.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    debug!(path = ?config_path, "loading config");
    let config = load_config(&config_path)?;
    let profile = args.profile.as_deref();
    let failure_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(LAST_FAILURE_FILE_NAME);

    match args.command {
        Command::Copy {
            paths,
            root,
            templates,
            output,
        } => run_copy(&config, profile, &paths, &root, templates, output.as_deref()),
        Command::Apply { input, root, dry_run } => {
            run_apply(&config, profile, input.as_deref(), &root, dry_run, &failure_path)
        }
        Command::Sanitize { input, output } => {
            run_sanitize(&config, profile, input.as_deref(), output.as_deref(), &failure_path)
        }
        Command::Stats { input, target } => run_stats(&config, profile, input.as_deref(), target.as_deref()),
        Command::RetryPrompt { stage, message, input } => {
            let failure = resolve_failure(stage, message, input.as_deref(), &failure_path)?;
            println!(
                "{}",
                build_guided_retry_prompt(&failure, &config.parsing_anchors.code_listing_header_start_fragment)
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_prompt_args() {
        let args = Args::try_parse_from(["llm-copypaster", "retry-prompt"]).unwrap();
        assert!(matches!(
            args.command,
            Command::RetryPrompt {
                stage: None,
                message: None,
                ..
            }
        ));
        assert!(Args::try_parse_from(["llm-copypaster", "retry-prompt", "--stage", "apply"]).is_err());
        let args = Args::try_parse_from(["llm-copypaster", "retry-prompt", "--stage", "apply", "--message", "m"]).unwrap();
        assert!(matches!(
            args.command,
            Command::RetryPrompt {
                stage: Some(RetryStage::Apply),
                ..
            }
        ));
    }

    #[test]
    fn test_resolve_failure_uses_saved_one() {
        let dir = tempfile::tempdir().unwrap();
        let failure_path = dir.path().join(LAST_FAILURE_FILE_NAME);
        assert!(resolve_failure(None, None, None, &failure_path).is_err());

        let saved = LastFailure::new(RetryStage::Apply, "disk full", "# a.txt\nhi\n");
        save_last_failure(&failure_path, &saved).unwrap();
        assert_eq!(resolve_failure(None, None, None, &failure_path).unwrap(), saved);

        let explicit = resolve_failure(Some(RetryStage::Validation), Some("bad".to_string()), None, &failure_path).unwrap();
        assert_eq!(explicit, LastFailure::new(RetryStage::Validation, "bad", ""));
    }

    #[test]
    fn test_failed_sanitize_saves_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reply.txt");
        std::fs::write(&input, "no headers here").unwrap();
        let failure_path = dir.path().join(LAST_FAILURE_FILE_NAME);

        let config = CopypasterConfig::default();
        assert!(run_sanitize(&config, None, Some(&input), None, &failure_path).is_err());
        let saved = load_last_failure(&failure_path).unwrap().unwrap();
        assert_eq!(saved.stage, RetryStage::Validation);
        assert_eq!(saved.raw_clipboard_text, "no headers here");
    }

    #[test]
    fn test_apply_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reply.txt");
        std::fs::write(&input, "# out/a.txt\nhello\n").unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir(&root).unwrap();
        let failure_path = dir.path().join(LAST_FAILURE_FILE_NAME);

        run_apply(&CopypasterConfig::default(), None, Some(&input), &root, false, &failure_path).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("out/a.txt")).unwrap(), "hello\n");
        assert!(!failure_path.exists());

        std::fs::write(&input, "# ../escape.txt\nx\n").unwrap();
        assert!(run_apply(&CopypasterConfig::default(), None, Some(&input), &root, false, &failure_path).is_err());
        let saved = load_last_failure(&failure_path).unwrap().unwrap();
        assert_eq!(saved.stage, RetryStage::Apply);
        assert!(saved.message.contains("../escape.txt"));
    }
}
