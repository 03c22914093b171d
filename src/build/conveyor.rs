use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::build::base_images_phase::BaseImagesPhase;
use crate::build::build_phase::BuildPhase;
use crate::build::dimg::Dimg;
use crate::build::graph;
use crate::build::image::StageImage;
use crate::build::push_phase::PushPhase;
use crate::build::signatures_phase::SignaturesPhase;
use crate::build::stage::StageContext;
use crate::build::{BuildOptions, Phase, PushOptions};
use crate::config::model::WerfConfig;
use crate::docker::{ContainerEngine, DockerAuthorizer};
use crate::lock::LockManager;
use crate::registry::DockerRegistry;

/// External handles the Conveyor needs; constructed once per invocation and
/// passed in by value. No process-wide singletons in the pipeline.
pub struct ConveyorContext {
    pub project_name: String,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub ssh_auth_sock: Option<String>,
    pub engine: Arc<dyn ContainerEngine>,
    pub registry: Arc<dyn DockerRegistry>,
    pub authorizer: DockerAuthorizer,
    pub locks: Arc<LockManager>,
}

/// The pipeline engine: owns the dependency-ordered image list and the
/// shared image-handle cache, and drives phases over them.
pub struct Conveyor {
    ctx: ConveyorContext,
    pub dimgs_in_order: Vec<Dimg>,
    images: BTreeMap<String, StageImage>,
}

impl Conveyor {
    /// Plan the image DAG from a parsed config. `images_to_process`
    /// restricts the run to the named images plus their dependencies; an
    /// empty slice means everything.
    pub fn new(
        config: &WerfConfig,
        images_to_process: &[String],
        ctx: ConveyorContext,
    ) -> Result<Self> {
        let ordered = graph::dimgs_in_order(config, images_to_process)?;
        let dimgs_in_order = ordered.iter().map(Dimg::from_config).collect();
        Ok(Self {
            ctx,
            dimgs_in_order,
            images: BTreeMap::new(),
        })
    }

    // --- accessors ---

    pub fn project_name(&self) -> &str {
        &self.ctx.project_name
    }

    pub fn project_dir(&self) -> &Path {
        &self.ctx.project_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.ctx.build_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.ctx.tmp_dir
    }

    pub fn ssh_auth_sock(&self) -> Option<&str> {
        self.ctx.ssh_auth_sock.as_deref()
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.ctx.engine.as_ref()
    }

    pub fn registry(&self) -> &dyn DockerRegistry {
        self.ctx.registry.as_ref()
    }

    pub fn authorizer(&self) -> &DockerAuthorizer {
        &self.ctx.authorizer
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.ctx.locks
    }

    pub fn get_dimg(&self, name: &str) -> Option<&Dimg> {
        self.dimgs_in_order.iter().find(|d| d.name() == name)
    }

    // --- image cache ---

    /// Return the handle for `name`, constructing it (with parent
    /// `from_image`) on first request. At most one handle exists per name.
    pub fn get_or_create_image(
        &mut self,
        from_image: Option<String>,
        name: &str,
    ) -> &mut StageImage {
        self.images
            .entry(name.to_string())
            .or_insert_with(|| StageImage::new(from_image, name))
    }

    pub fn get_image(&self, name: &str) -> Result<&StageImage> {
        self.images
            .get(name)
            .ok_or_else(|| anyhow!("image `{name}` is not registered in the image cache"))
    }

    pub fn get_image_mut(&mut self, name: &str) -> Result<&mut StageImage> {
        self.images
            .get_mut(name)
            .ok_or_else(|| anyhow!("image `{name}` is not registered in the image cache"))
    }

    /// Detach a handle from the cache for mutation; pair with `put_image`.
    pub(crate) fn take_image(&mut self, name: &str) -> Result<StageImage> {
        self.images
            .remove(name)
            .ok_or_else(|| anyhow!("image `{name}` is not registered in the image cache"))
    }

    pub(crate) fn put_image(&mut self, image: StageImage) {
        self.images.insert(image.name().to_string(), image);
    }

    /// Content-addressed local name for a stage of an image of this project.
    pub fn stage_image_name(&self, image_name: &str, signature: &str) -> String {
        if image_name.is_empty() {
            format!("conveyor/{}:{}", self.ctx.project_name, signature)
        } else {
            format!("conveyor/{}/{}:{}", self.ctx.project_name, image_name, signature)
        }
    }

    // --- operations ---

    /// Build all images: signatures, base image renewal, stage builds.
    pub async fn build(&mut self, opts: BuildOptions) -> Result<()> {
        let phases: Vec<Box<dyn Phase>> = vec![
            Box::new(SignaturesPhase),
            Box::new(BaseImagesPhase),
            Box::new(BuildPhase::new(opts)),
        ];
        self.run_phases(phases).await
    }

    /// Build, then publish to `repo` under the configured tag schemes.
    pub async fn bp(
        &mut self,
        repo: &str,
        build_opts: BuildOptions,
        push_opts: PushOptions,
    ) -> Result<()> {
        let phases: Vec<Box<dyn Phase>> = vec![
            Box::new(SignaturesPhase),
            Box::new(BaseImagesPhase),
            Box::new(BuildPhase::new(build_opts)),
            Box::new(PushPhase::new(repo.to_string(), push_opts)),
        ];
        self.run_phases(phases).await
    }

    async fn run_phases(&mut self, mut phases: Vec<Box<dyn Phase>>) -> Result<()> {
        for phase in &mut phases {
            debug!(phase = phase.name(), "running phase");
            phase
                .run(self)
                .await
                .with_context(|| format!("phase {} failed", phase.name()))?;
        }
        Ok(())
    }
}

impl StageContext for Conveyor {
    fn project_name(&self) -> &str {
        &self.ctx.project_name
    }

    fn project_dir(&self) -> &Path {
        &self.ctx.project_dir
    }

    fn tmp_dir(&self) -> &Path {
        &self.ctx.tmp_dir
    }

    /// Cached, already-computed signature of another image's terminal stage.
    /// Available for artifacts because producers are ordered before their
    /// consumers.
    fn image_latest_stage_signature(&self, image_name: &str) -> Result<String> {
        let dimg = self
            .get_dimg(image_name)
            .ok_or_else(|| anyhow!("unknown image `{image_name}`"))?;
        let signature = dimg.latest_stage().signature();
        if signature.is_empty() {
            Err(anyhow!(
                "signature of image `{image_name}` is not computed yet"
            ))
        } else {
            Ok(signature.to_string())
        }
    }

    fn image_latest_stage_image_name(&self, image_name: &str) -> Result<String> {
        let dimg = self
            .get_dimg(image_name)
            .ok_or_else(|| anyhow!("unknown image `{image_name}`"))?;
        let name = dimg.latest_stage().image_name();
        if name.is_empty() {
            Err(anyhow!(
                "image ref of image `{image_name}` is not computed yet"
            ))
        } else {
            Ok(name.to_string())
        }
    }

    fn engine(&self) -> &dyn ContainerEngine {
        self.ctx.engine.as_ref()
    }
}
