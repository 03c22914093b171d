use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::build::stage::StageContext;
use crate::build::{narrate, Conveyor, Phase};

/// Phase 2: resolve and locally materialize every image's base.
pub struct BaseImagesPhase;

#[async_trait]
impl Phase for BaseImagesPhase {
    fn name(&self) -> &'static str {
        "base-images"
    }

    async fn run(&mut self, conveyor: &mut Conveyor) -> Result<()> {
        for dimg_index in 0..conveyor.dimgs_in_order.len() {
            setup_base_image(conveyor, dimg_index)?;
            prepare_base_image(conveyor, dimg_index)
                .await
                .with_context(|| {
                    format!(
                        "preparing base image of {}",
                        conveyor.dimgs_in_order[dimg_index].display_name()
                    )
                })?;
        }
        Ok(())
    }
}

/// Resolve the base: another image's latest-stage image when `fromImage` is
/// set, the configured ref otherwise. Registers the base in the image cache.
fn setup_base_image(conveyor: &mut Conveyor, dimg_index: usize) -> Result<()> {
    let dimg = &conveyor.dimgs_in_order[dimg_index];
    let base_image_name = match dimg.base_image_dimg_name() {
        Some(dimg_name) => conveyor.image_latest_stage_image_name(dimg_name)?,
        None => dimg
            .base_image_name()
            .unwrap_or_default()
            .to_string(),
    };

    conveyor.get_or_create_image(None, &base_image_name);
    conveyor.dimgs_in_order[dimg_index].base_image = Some(base_image_name);
    Ok(())
}

/// Make the base locally available: nothing to do when the first stage is
/// already cached or the base is built by this project; otherwise refresh or
/// pull, logging in first when the base lives in the CI registry.
async fn prepare_base_image(conveyor: &Conveyor, dimg_index: usize) -> Result<()> {
    let dimg = &conveyor.dimgs_in_order[dimg_index];
    let first_stage_image = dimg.stages[0].image_name().to_string();
    let base_image_name = dimg.base_image.clone().unwrap_or_default();
    let is_dimg_base = dimg.base_image_dimg_name().is_some();

    if conveyor.engine().image_exists(&first_stage_image).await? {
        return Ok(());
    }

    if is_dimg_base {
        // The dependency's own build phase materializes it.
        return Ok(());
    }

    let mut creds = None;
    if let Ok(ci_registry) = std::env::var("CI_REGISTRY") {
        if !ci_registry.is_empty() && base_image_name.starts_with(&ci_registry) {
            creds = conveyor.authorizer().login_base_image(&ci_registry);
        }
    }

    if conveyor.engine().image_exists(&base_image_name).await? {
        // Refresh an existing copy opportunistically; a failed refresh is a
        // warning, never fatal.
        narrate(format!("Refreshing base image {base_image_name}"));
        if let Err(e) = conveyor.engine().pull(&base_image_name, creds.as_ref()).await {
            warn!(image = %base_image_name, error = %e, "cannot pull base image");
            warn!(image = %base_image_name, "using existing image without pull");
        }
        return Ok(());
    }

    narrate(format!("Pulling base image {base_image_name}"));
    conveyor
        .engine()
        .pull(&base_image_name, creds.as_ref())
        .await
        .with_context(|| format!("image {base_image_name} pull failed"))?;
    Ok(())
}
