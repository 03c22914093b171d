use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::build::{narrate, Conveyor, Phase, PushOptions};
use crate::docker::RegistryCredentials;
use crate::lock::{image_lock_name, LockOptions};
use crate::registry::{self, DIMGSTAGE_TAG_PREFIX};

/// Phase 4: publish. Optionally exports every stage as a cache tag, then
/// builds and pushes one publish layer per (scheme, tag) pair.
pub struct PushPhase {
    repo: String,
    opts: PushOptions,
}

impl PushPhase {
    pub fn new(repo: String, opts: PushOptions) -> Self {
        Self { repo, opts }
    }
}

#[async_trait]
impl Phase for PushPhase {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn run(&mut self, conveyor: &mut Conveyor) -> Result<()> {
        let creds = conveyor.authorizer().login_for_push(&self.repo);

        for dimg_index in 0..conveyor.dimgs_in_order.len() {
            let dimg = &conveyor.dimgs_in_order[dimg_index];
            let dimg_name = dimg.name().to_string();
            let display_name = dimg.display_name().to_string();
            let is_artifact = dimg.is_artifact();

            if self.opts.with_stages {
                narrate(format!("Pushing image {display_name} stages cache"));
                self.push_dimg_stages(conveyor, dimg_index, creds.as_ref())
                    .await
                    .with_context(|| format!("unable to push image {display_name} stages"))?;
            }

            if !is_artifact {
                narrate(format!("Pushing image {display_name}"));
                self.push_dimg(conveyor, dimg_index, &dimg_name, creds.as_ref())
                    .await
                    .with_context(|| format!("unable to push image {display_name}"))?;
            }
        }
        Ok(())
    }
}

impl PushPhase {
    /// Export every stage of one image to `repo:dimgstage-<signature>`,
    /// skipping tags the registry already lists.
    async fn push_dimg_stages(
        &self,
        conveyor: &Conveyor,
        dimg_index: usize,
        creds: Option<&RegistryCredentials>,
    ) -> Result<()> {
        let existing_tags = registry::dimgstage_tags(conveyor.registry(), &self.repo)
            .await
            .with_context(|| format!("fetching existing stages cache list of {}", self.repo))?;

        let stages: Vec<(String, String, String)> = conveyor.dimgs_in_order[dimg_index]
            .stages
            .iter()
            .map(|s| {
                (
                    s.name.to_string(),
                    s.signature().to_string(),
                    s.image_name().to_string(),
                )
            })
            .collect();

        for (stage_name, signature, local_name) in stages {
            let stage_tag = format!("{DIMGSTAGE_TAG_PREFIX}{signature}");
            let stage_image_name = format!("{}:{}", self.repo, stage_tag);

            if existing_tags.contains(&stage_tag) {
                narrate(format!(
                    "Ignore existing in repo image {stage_image_name} for stage {stage_name}"
                ));
                continue;
            }

            let locks = conveyor.locks().clone();
            let _guard = locks
                .lock(&image_lock_name(&stage_image_name), LockOptions::default())
                .await?;

            narrate(format!(
                "Pushing image {stage_image_name} for stage {stage_name}"
            ));
            export_image(conveyor, &local_name, &stage_image_name, creds)
                .await
                .with_context(|| format!("error pushing {stage_image_name}"))?;
        }
        Ok(())
    }

    /// Publish one image under every configured (scheme, tag) pair. A tag
    /// already present with a parent equal to the local terminal stage id is
    /// up to date and skipped.
    async fn push_dimg(
        &self,
        conveyor: &Conveyor,
        dimg_index: usize,
        dimg_name: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<()> {
        let dimg_repository = if dimg_name.is_empty() {
            self.repo.clone()
        } else {
            format!("{}/{}", self.repo, dimg_name)
        };

        let existing_tags = registry::dimg_tags(conveyor.registry(), &dimg_repository)
            .await
            .with_context(|| format!("fetching existing tags of {dimg_repository}"))?;

        let last_stage = conveyor.dimgs_in_order[dimg_index].latest_stage();
        let last_stage_image_name = last_stage.image_name().to_string();
        let last_stage_id = conveyor
            .get_image(&last_stage_image_name)?
            .id()
            .map(str::to_string)
            .unwrap_or_default();

        for (scheme, tags) in self.opts.tags_by_scheme.clone() {
            for tag in tags {
                let dimg_image_name = format!("{dimg_repository}:{tag}");

                if existing_tags.contains(&tag)
                    && self
                        .remote_is_up_to_date(conveyor, &dimg_image_name, &last_stage_id)
                        .await
                {
                    narrate(format!("Ignore existing in repo image {dimg_image_name}"));
                    continue;
                }

                let locks = conveyor.locks().clone();
                let _guard = locks
                    .lock(&image_lock_name(&dimg_image_name), LockOptions::default())
                    .await?;

                narrate(format!(
                    "Build {dimg_image_name} layer with tag scheme '{scheme}'"
                ));
                let mut recipe = crate::docker::BuildRecipe::default();
                recipe.add_label("dapp-tag-scheme", scheme.as_str());
                recipe.add_label("dapp-dimg", "true");
                conveyor
                    .engine()
                    .build(&last_stage_image_name, &dimg_image_name, &recipe, false)
                    .await
                    .with_context(|| {
                        format!("error building {dimg_image_name} with tag scheme '{scheme}'")
                    })?;

                narrate(format!("Pushing image {dimg_image_name}"));
                conveyor
                    .engine()
                    .push(&dimg_image_name, creds)
                    .await
                    .with_context(|| format!("error pushing {dimg_image_name}"))?;
            }
        }
        Ok(())
    }

    /// Whether the remote tag's parent equals the local terminal stage id.
    /// A failed parent lookup counts as "not equal": warn and re-push.
    async fn remote_is_up_to_date(
        &self,
        conveyor: &Conveyor,
        reference: &str,
        last_stage_id: &str,
    ) -> bool {
        match conveyor.registry().image_parent_id(reference).await {
            Ok(parent_id) => !last_stage_id.is_empty() && parent_id == last_stage_id,
            Err(e) => {
                warn!(image = %reference, error = %e, "cannot read remote parent id; re-pushing");
                false
            }
        }
    }
}

/// Export a local image to a remote ref: tag, push, untag.
async fn export_image(
    conveyor: &Conveyor,
    local: &str,
    remote: &str,
    creds: Option<&RegistryCredentials>,
) -> Result<()> {
    let engine = conveyor.engine();
    engine.tag(local, remote).await?;
    let pushed = engine.push(remote, creds).await;
    engine.remove_tag(remote).await?;
    pushed?;
    Ok(())
}
