use sha2::{Digest, Sha256};
use std::path::Path;

use anyhow::Result;

use crate::git;

const SLUG_MAX_LEN: usize = 42;

/// Normalize a name for use in image refs, paths and tags.
///
/// Lowercases, collapses runs of characters outside `[a-z0-9-]` into a single
/// dash and trims leading/trailing dashes. When normalization changed the
/// input, or the input was overlong, the result carries an 8-hex-char content
/// hash suffix so distinct inputs cannot collapse into the same slug.
pub fn slug(name: &str) -> String {
    let re = regex::Regex::new(r"[^a-z0-9-]+").expect("static pattern");
    let normalized = re
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string();

    if normalized == name && normalized.len() <= SLUG_MAX_LEN && !normalized.is_empty() {
        return normalized;
    }

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hex::encode(&hasher.finalize()[..4]);

    let base_len = SLUG_MAX_LEN.saturating_sub(digest.len() + 1);
    let mut base: String = normalized.chars().take(base_len).collect();
    base = base.trim_matches('-').to_string();

    if base.is_empty() {
        digest
    } else {
        format!("{base}-{digest}")
    }
}

/// Derive the project name: the explicit `--name` wins; otherwise the last
/// path segment of the git `origin` remote (with a trailing `.git` stripped)
/// when the project dir is a git working copy; otherwise the base name of the
/// project dir. The result is always slug-normalized.
pub async fn project_name(project_dir: &Path, explicit_name: Option<&str>) -> Result<String> {
    if let Some(name) = explicit_name {
        return Ok(slug(name));
    }

    if project_dir.join(".git").is_dir() {
        if let Some(url) = git::remote_origin_url(project_dir).await? {
            if let Some(repo_name) = repo_name_from_url(&url) {
                return Ok(slug(&repo_name));
            }
        }
    }

    let base = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(slug(&base))
}

fn repo_name_from_url(url: &str) -> Option<String> {
    let last = url.trim_end_matches('/').split('/').next_back()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
