use anyhow::{Context, Result};

use crate::build::{BuildOptions, Conveyor, PushOptions};
use crate::cli::{CredentialOpts, GlobalOpts, IntrospectOpts, TagOpts};
use crate::commands::common;

/// `werf bp`: build every requested image, then publish to the repo under
/// the configured tag schemes.
pub async fn run(
    global: &GlobalOpts,
    images: &[String],
    repo: Option<&str>,
    with_stages: bool,
    tags: &TagOpts,
    introspect: &IntrospectOpts,
    credentials: &CredentialOpts,
) -> Result<()> {
    let mut workspace = common::setup(global, credentials.to_options(), Some(repo)).await?;
    let repo = workspace
        .repo
        .clone()
        .context("publish repository is not resolved")?;

    let project_dir = workspace.conveyor_ctx.project_dir.clone();
    let tags_by_scheme = common::resolve_tags(&project_dir, tags).await?;

    let build_opts = BuildOptions {
        introspect_after_error: introspect.after_error,
        introspect_before_error: introspect.before_error,
    };
    let push_opts = PushOptions {
        tags_by_scheme,
        with_stages,
    };

    let mut conveyor = Conveyor::new(&workspace.config, images, workspace.conveyor_ctx)?;
    let result = conveyor.bp(&repo, build_opts, push_opts).await;

    workspace.ssh_agent.terminate();
    if result.is_ok() {
        workspace.tmp.release();
    }
    result
}
