use anyhow::Result;

use crate::build::{BuildOptions, Conveyor};
use crate::cli::{CredentialOpts, GlobalOpts, IntrospectOpts};
use crate::commands::common;

/// `werf build`: materialize every stage of every requested image.
pub async fn run(
    global: &GlobalOpts,
    images: &[String],
    introspect: &IntrospectOpts,
    credentials: &CredentialOpts,
) -> Result<()> {
    let mut workspace = common::setup(global, credentials.to_options(), None).await?;

    let build_opts = BuildOptions {
        introspect_after_error: introspect.after_error,
        introspect_before_error: introspect.before_error,
    };

    let mut conveyor = Conveyor::new(&workspace.config, images, workspace.conveyor_ctx)?;
    let result = conveyor.build(build_opts).await;

    workspace.ssh_agent.terminate();
    if result.is_ok() {
        workspace.tmp.release();
    }
    result
}
