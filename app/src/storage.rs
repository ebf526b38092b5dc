use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

const MAX_SUBFOLDER_LEN: usize = 64;

/// Turns a user-supplied folder name into a single safe path component.
/// Returns `None` when nothing usable is left.
pub fn sanitize_subfolder(raw: &str) -> Option<String> {
    let flattened = raw.replace("..", "").replace(['/', '\\'], " ");
    let mut cleaned: String = flattened
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned: String = cleaned
        .trim_matches(|c: char| c == '.' || c == ' ')
        .chars()
        .take(MAX_SUBFOLDER_LEN)
        .collect();
    let cleaned = cleaned.trim_end().to_string();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        None
    } else {
        Some(cleaned)
    }
}

/// Why a requested subfolder wasn't used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SubfolderNote {
    Invalid { requested: String },
    Missing { requested: String, sanitized: String },
}

/// Picks the directory a download goes to. Never fails: a bad or missing
/// subfolder falls back to `root` with a note for the requester.
pub fn resolve_target_dir(root: &Path, subfolder: Option<&str>) -> (PathBuf, Option<SubfolderNote>) {
    let Some(requested) = subfolder.map(str::trim).filter(|s| !s.is_empty()) else {
        return (root.to_path_buf(), None);
    };

    let Some(sanitized) = sanitize_subfolder(requested) else {
        return (
            root.to_path_buf(),
            Some(SubfolderNote::Invalid {
                requested: requested.to_string(),
            }),
        );
    };

    let candidate = root.join(&sanitized);
    if candidate.is_dir() {
        (candidate, None)
    } else {
        (
            root.to_path_buf(),
            Some(SubfolderNote::Missing {
                requested: requested.to_string(),
                sanitized,
            }),
        )
    }
}

/// Deletes the finished file and any partial/intermediate files that share
/// its stem in `dir`. Returns what was removed.
pub fn remove_artifacts(dir: &Path, stem: &str) -> Vec<PathBuf> {
    if stem.is_empty() {
        return Vec::new();
    }
    let prefix = format!("{stem}.");
    remove_matching(dir, |name| name == stem || name.starts_with(&prefix))
}

/// Cleanup for when the output name couldn't be predicted: removes every
/// file carrying the ` [<source id>].` marker the fetch output template adds.
pub fn remove_source_artifacts(dir: &Path, source_id: &str) -> Vec<PathBuf> {
    if source_id.is_empty() {
        return Vec::new();
    }
    let marker = format!("[{source_id}].");
    remove_matching(dir, |name| name.contains(&marker))
}

fn remove_matching(dir: &Path, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() || !matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed download artifact");
                removed.push(entry.path().to_path_buf());
            }
            Err(err) => warn!(path = %entry.path().display(), "failed to remove artifact: {err}"),
        }
    }
    removed
}

/// Stem of a predicted output path, e.g. `Title [id]` for `Title [id].mp4`.
pub fn artifact_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Resolves a browsed file against the media root, refusing anything that
/// escapes it.
pub fn resolve_media_file(media_root: &Path, requested: &str) -> Result<PathBuf> {
    let relative = Path::new(requested.trim());
    ensure!(
        !relative.as_os_str().is_empty(),
        "no file was given"
    );
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        bail!("'{}' points outside the media folder", requested);
    }

    let joined = if relative.is_absolute() {
        relative.to_path_buf()
    } else {
        media_root.join(relative)
    };
    let resolved = joined
        .canonicalize()
        .with_context(|| format!("'{}' does not exist", requested))?;
    ensure!(
        resolved.starts_with(media_root),
        "'{}' points outside the media folder",
        requested
    );
    ensure!(resolved.is_file(), "'{}' is not a file", requested);
    Ok(resolved)
}
