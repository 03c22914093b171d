use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Minimal queries against a local git working copy. Used only for project
/// name derivation and tag resolution; failures of optional lookups are
/// reported as `None`, not errors.
async fn git_output(project_dir: &Path, args: &[&str]) -> Result<Option<String>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(project_dir)
        .args(args)
        .output()
        .await
        .context("running git")?;

    if !output.status.success() {
        return Ok(None);
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// URL of the `origin` remote, if the working copy has one.
pub async fn remote_origin_url(project_dir: &Path) -> Result<Option<String>> {
    git_output(project_dir, &["config", "--get", "remote.origin.url"]).await
}

/// Name of the currently checked-out branch. `None` on detached HEAD.
pub async fn head_branch(project_dir: &Path) -> Result<Option<String>> {
    let branch = git_output(project_dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    Ok(branch.filter(|b| b != "HEAD"))
}

/// Commit id of HEAD.
pub async fn head_commit(project_dir: &Path) -> Result<Option<String>> {
    git_output(project_dir, &["rev-parse", "HEAD"]).await
}
