use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::build::stage::{Stage, StageContext};
use crate::build::{narrate, BuildOptions, Conveyor, Phase};
use crate::error::EngineError;
use crate::lock::{image_lock_name, LockOptions};

/// Phase 3: materialize every stage image, reusing the local cache and
/// serializing builds of the same layer across processes.
pub struct BuildPhase {
    opts: BuildOptions,
}

impl BuildPhase {
    pub fn new(opts: BuildOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl Phase for BuildPhase {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn run(&mut self, conveyor: &mut Conveyor) -> Result<()> {
        for dimg_index in 0..conveyor.dimgs_in_order.len() {
            let display_name = conveyor.dimgs_in_order[dimg_index]
                .display_name()
                .to_string();
            narrate(format!("Building image {display_name}"));

            for stage_index in 0..conveyor.dimgs_in_order[dimg_index].stages.len() {
                let stage = conveyor.dimgs_in_order[dimg_index].stages[stage_index].clone();
                self.build_stage(conveyor, dimg_index, &stage)
                    .await
                    .with_context(|| {
                        format!("unable to build image {display_name} stage {}", stage.name)
                    })?;
            }
        }
        Ok(())
    }
}

impl BuildPhase {
    async fn build_stage(
        &self,
        conveyor: &mut Conveyor,
        dimg_index: usize,
        stage: &Stage,
    ) -> Result<()> {
        let image_name = stage.image_name().to_string();

        if self.reuse_if_cached(conveyor, stage, &image_name).await? {
            return Ok(());
        }

        let lock_name = image_lock_name(&image_name);
        let locks = conveyor.locks().clone();
        let _guard = locks.lock(&lock_name, LockOptions::default()).await?;

        // Another invocation may have built the layer while we waited.
        if self.reuse_if_cached(conveyor, stage, &image_name).await? {
            return Ok(());
        }

        stage.pre_run_hook(&*conveyor).await?;

        let parent = conveyor
            .get_image(&image_name)?
            .from_name()
            .map(str::to_string)
            .context("stage image has no parent")?;

        let mut image = conveyor.take_image(&image_name)?;
        let prepared = self.prepare(conveyor, dimg_index, stage, &parent, &mut image);
        if let Err(e) = prepared {
            conveyor.put_image(image);
            return Err(e);
        }

        narrate(format!("Building stage {} as {image_name}", stage.name));
        let built = conveyor
            .engine()
            .build(
                &parent,
                &image_name,
                &image.recipe,
                self.opts.introspect_after_error,
            )
            .await;

        match built {
            Ok(id) => {
                image.set_id(id);
                conveyor.put_image(image);
                Ok(())
            }
            Err(e) => {
                let recipe = image.recipe.clone();
                conveyor.put_image(image);
                Err(self.handle_build_failure(conveyor, &parent, recipe, e).await)
            }
        }
    }

    /// Reuse a locally-present stage image; records its id on the handle.
    async fn reuse_if_cached(
        &self,
        conveyor: &mut Conveyor,
        stage: &Stage,
        image_name: &str,
    ) -> Result<bool> {
        if !conveyor.engine().image_exists(image_name).await? {
            return Ok(false);
        }
        let id = conveyor.engine().image_id(image_name).await?;
        let image = conveyor.get_image_mut(image_name)?;
        if let Some(id) = id {
            image.set_id(id);
        }
        narrate(format!("Use cache image {image_name} for stage {}", stage.name));
        Ok(true)
    }

    fn prepare(
        &self,
        conveyor: &Conveyor,
        dimg_index: usize,
        stage: &Stage,
        parent: &str,
        image: &mut crate::build::image::StageImage,
    ) -> Result<()> {
        let dimg = &conveyor.dimgs_in_order[dimg_index];
        dimg.apply_mounts(conveyor.tmp_dir(), conveyor.build_dir(), &mut image.recipe)?;

        if let Some(sock) = conveyor.ssh_auth_sock() {
            image.recipe.add_volume(format!("{sock}:{sock}"));
            image
                .recipe
                .env
                .insert("SSH_AUTH_SOCK".to_string(), sock.to_string());
        }

        let prev = conveyor.get_image(parent)?.clone();
        stage.prepare_image(conveyor, &prev, image)
    }

    /// Introspection on failure: keep (or start) a container on the failed
    /// stage and surface its id with a shell hint.
    async fn handle_build_failure(
        &self,
        conveyor: &Conveyor,
        parent: &str,
        recipe: crate::docker::BuildRecipe,
        err: EngineError,
    ) -> anyhow::Error {
        if self.opts.introspect_after_error {
            if let Some(container_id) = &err.container_id {
                narrate(format!(
                    "Stage failed; introspect it with: docker exec -it {container_id} /bin/sh"
                ));
            }
            return err.into();
        }

        if self.opts.introspect_before_error {
            // Re-prepare without the failing instructions and offer a shell
            // on the clean state.
            let mut clean_recipe = recipe;
            clean_recipe.service_run_commands.clear();
            match conveyor.engine().run_detached(parent, &clean_recipe).await {
                Ok(container_id) => {
                    narrate(format!(
                        "Introspect the clean stage state with: docker exec -it {container_id} /bin/sh"
                    ));
                    return EngineError::with_container(err.message, container_id).into();
                }
                Err(e) => {
                    info!(error = %e, "failed to start introspection container");
                }
            }
        }

        err.into()
    }
}
