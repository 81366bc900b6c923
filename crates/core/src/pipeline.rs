//! Filesystem side of the round trip: collect workspace files for a prompt
//! and write a decoded reply back to disk.

use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::payload::{FileEntry, FilesPayload, OperationKind};

/// Directory names never descended into during discovery.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[".git", "target", "node_modules"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path '{0}' escapes the workspace root")]
    PathEscapesRoot(String),
}

/// What [`apply_payload`] did, as workspace-relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Deletions of files that did not exist.
    pub skipped: Vec<String>,
}

impl ApplyReport {
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// All files under `root`, sorted, skipping directories named in `excluded_dirs`.
pub fn discover_files(root: &Path, excluded_dirs: &[&str]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !excluded_dirs.iter().any(|name| e.file_name() == *name)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Expand directories in `inputs` into their files; plain files pass through.
pub fn expand_inputs(inputs: &[PathBuf], excluded_dirs: &[&str]) -> Vec<PathBuf> {
    inputs
        .iter()
        .flat_map(|input| {
            if input.is_dir() {
                discover_files(input, excluded_dirs)
            } else {
                vec![input.clone()]
            }
        })
        .collect()
}

/// `path` relative to `root` with forward slashes. Paths outside `root` are
/// kept as given.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Read `paths` in parallel, preserving input order. Unreadable files become
/// entries carrying the read error instead of content.
pub fn read_file_entries(root: &Path, paths: &[PathBuf]) -> Vec<FileEntry> {
    let entries: Vec<FileEntry> = paths
        .par_iter()
        .map(|path| {
            let relative = relative_path(root, path);
            match std::fs::read_to_string(path) {
                Ok(content) => FileEntry::new(relative, content),
                Err(e) => {
                    debug!(?path, error = %e, "file not readable");
                    FileEntry::unreadable(relative, e.to_string())
                }
            }
        })
        .collect();

    let unreadable = entries.iter().filter(|e| e.read_error.is_some()).count();
    info!(files = entries.len(), unreadable, "read workspace files");
    entries
}

/// Join a workspace-relative path onto `root`, refusing absolute paths and `..`.
pub fn resolve_target(root: &Path, relative: &str) -> Result<PathBuf, PipelineError> {
    let candidate = Path::new(relative);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(PipelineError::PathEscapesRoot(relative.to_string()));
    }
    Ok(root.join(candidate))
}

/// Write every entry of `payload` below `root`: whole-file create or
/// overwrite, or delete. All paths are checked before anything is written.
pub fn apply_payload(root: &Path, payload: &FilesPayload) -> Result<ApplyReport, PipelineError> {
    let targets = payload
        .files
        .iter()
        .map(|file| resolve_target(root, &file.path).map(|target| (file, target)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = ApplyReport::default();
    for (file, target) in targets {
        let io_err = |source| PipelineError::Io {
            path: target.clone(),
            source,
        };

        if file.effective_operation() == OperationKind::Deleted {
            if target.is_file() {
                std::fs::remove_file(&target).map_err(io_err)?;
                report.deleted.push(file.path.clone());
            } else {
                report.skipped.push(file.path.clone());
            }
            continue;
        }

        let existed = target.exists();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&target, &file.content).map_err(io_err)?;
        if existed {
            report.updated.push(file.path.clone());
        } else {
            report.created.push(file.path.clone());
        }
    }

    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        deleted = report.deleted.len(),
        "applied payload"
    );
    Ok(report)
}
