use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::build::stage::{BaseRef, StageContext, StageKind};
use crate::build::{Conveyor, Phase};
use crate::util::sha256_hex;

/// Phase 1: compute every stage's signature as
/// `H(prev_signature || stage dependencies)`, derive the content-addressed
/// stage image name and register it in the image cache.
pub struct SignaturesPhase;

#[async_trait]
impl Phase for SignaturesPhase {
    fn name(&self) -> &'static str {
        "signatures"
    }

    async fn run(&mut self, conveyor: &mut Conveyor) -> Result<()> {
        for dimg_index in 0..conveyor.dimgs_in_order.len() {
            let dimg_name = conveyor.dimgs_in_order[dimg_index].name().to_string();
            let mut prev_signature = String::new();
            let mut prev_image_name: Option<String> = None;

            for stage_index in 0..conveyor.dimgs_in_order[dimg_index].stages.len() {
                let stage = conveyor.dimgs_in_order[dimg_index].stages[stage_index].clone();
                let dependencies = stage.get_dependencies(&*conveyor).with_context(|| {
                    format!(
                        "computing dependencies of stage {} of image {}",
                        stage.name,
                        display(&dimg_name)
                    )
                })?;

                let signature = sha256_hex(&[prev_signature.as_str(), dependencies.as_str()]);
                let image_name = conveyor.stage_image_name(&dimg_name, &signature);
                debug!(
                    image = %display(&dimg_name),
                    stage = %stage.name,
                    signature = %signature,
                    "stage signature computed"
                );

                // The first stage sits on the base image; later stages sit on
                // their predecessor.
                let parent = match prev_image_name.clone() {
                    Some(parent) => Some(parent),
                    None => resolve_base_name(conveyor, stage_index, dimg_index)?,
                };
                conveyor.get_or_create_image(parent, &image_name);

                let slot = &mut conveyor.dimgs_in_order[dimg_index].stages[stage_index];
                slot.signature = Some(signature.clone());
                slot.image_name = Some(image_name.clone());

                prev_signature = signature;
                prev_image_name = Some(image_name);
            }
        }
        Ok(())
    }
}

/// The base image ref underneath an image's first stage. For a `fromImage`
/// base this is the referenced image's terminal stage ref, already computed
/// because of dependency order.
fn resolve_base_name(
    conveyor: &Conveyor,
    stage_index: usize,
    dimg_index: usize,
) -> Result<Option<String>> {
    let stage = &conveyor.dimgs_in_order[dimg_index].stages[stage_index];
    match &stage.kind {
        StageKind::From { base, .. } => match base {
            BaseRef::Image(name) => Ok(Some(name.clone())),
            BaseRef::Dimg(dimg_name) => {
                Ok(Some(conveyor.image_latest_stage_image_name(dimg_name)?))
            }
        },
        _ => Ok(None),
    }
}

fn display(name: &str) -> &str {
    if name.is_empty() {
        "~"
    } else {
        name
    }
}
