use std::path::Path;

use crate::build::graph::OrderedImage;
use crate::build::stage::{BaseRef, Stage, StageKind, StageName};
use crate::config::model::{ArtifactImport, ImageConfig, Mount};
use crate::docker::BuildRecipe;
use crate::identity::slug;

/// In-memory representation of one image: its ordered stage sequence plus
/// base-image linkage. Created at Conveyor construction, mutated by phases
/// that fill signatures and image handles.
#[derive(Debug, Clone)]
pub struct Dimg {
    name: String,
    is_artifact: bool,
    base_image_name: Option<String>,
    base_image_dimg_name: Option<String>,
    mounts: Vec<Mount>,
    pub stages: Vec<Stage>,
    /// Cache name of the resolved base image, filled by the base-image phase.
    pub base_image: Option<String>,
}

impl Dimg {
    pub fn from_config(ordered: &OrderedImage) -> Self {
        let config = &ordered.config;
        Self {
            name: config.name.clone(),
            is_artifact: ordered.is_artifact,
            base_image_name: config.from.clone(),
            base_image_dimg_name: config.from_image.clone(),
            mounts: config.mounts.clone(),
            stages: derive_stages(config, ordered.is_artifact),
            base_image: None,
        }
    }

    /// Image name from the config; empty for the single unnamed image.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name used in log lines; the unnamed image logs as the bare project.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "~"
        } else {
            &self.name
        }
    }

    pub fn is_artifact(&self) -> bool {
        self.is_artifact
    }

    pub fn base_image_name(&self) -> Option<&str> {
        self.base_image_name.as_deref()
    }

    pub fn base_image_dimg_name(&self) -> Option<&str> {
        self.base_image_dimg_name.as_deref()
    }

    pub fn get_stage(&self, name: StageName) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Terminal stage; its image is the publishable image.
    pub fn latest_stage(&self) -> &Stage {
        self.stages.last().expect("every image has a from stage")
    }

    /// Add the declared mount binds to a stage recipe. `tmp_dir` and
    /// `build_dir` mounts are materialized under per-target subdirectories,
    /// created on demand.
    pub fn apply_mounts(
        &self,
        tmp_dir: &Path,
        build_dir: &Path,
        recipe: &mut BuildRecipe,
    ) -> anyhow::Result<()> {
        for mount in &self.mounts {
            let host = match (mount.from.as_deref(), mount.from_path.as_deref()) {
                (Some("tmp_dir"), _) => {
                    let dir = tmp_dir.join("mount").join(slug(&mount.to));
                    std::fs::create_dir_all(&dir)?;
                    dir
                }
                (Some("build_dir"), _) => {
                    let dir = build_dir.join("mount").join(slug(&mount.to));
                    std::fs::create_dir_all(&dir)?;
                    dir
                }
                (_, Some(path)) => Path::new(path).to_path_buf(),
                _ => continue,
            };
            recipe.add_volume(format!("{}:{}", host.display(), mount.to));
        }
        Ok(())
    }
}

/// The ordered stage catalogue for one image. A stage is present only when
/// the config gives it content; `from` is always first.
fn derive_stages(config: &ImageConfig, is_artifact: bool) -> Vec<Stage> {
    let mut stages = Vec::new();

    let base = match (&config.from, &config.from_image) {
        (Some(from), _) => BaseRef::Image(from.clone()),
        (None, Some(from_image)) => BaseRef::Dimg(from_image.clone()),
        (None, None) => BaseRef::Image(String::new()),
    };
    stages.push(Stage::new(
        StageName::From,
        StageKind::From {
            base,
            cache_version: config.from_cache_version.clone(),
        },
    ));

    if let Some(kind) = user_stage(config, UserStage::BeforeInstall) {
        stages.push(Stage::new(StageName::BeforeInstall, kind));
    }
    if let Some(kind) = imports_stage(config, |i| i.before.as_deref() == Some("install")) {
        stages.push(Stage::new(StageName::ImportsBeforeInstall, kind));
    }
    if !config.git.is_empty() {
        stages.push(Stage::new(
            StageName::GitArchive,
            StageKind::GitArchive {
                specs: config.git.clone(),
            },
        ));
    }
    if let Some(kind) = user_stage(config, UserStage::Install) {
        stages.push(Stage::new(StageName::Install, kind));
    }
    if let Some(kind) = imports_stage(config, |i| i.after.as_deref() == Some("install")) {
        stages.push(Stage::new(StageName::ImportsAfterInstall, kind));
    }
    if let Some(kind) = imports_stage(config, |i| i.before.as_deref() == Some("setup")) {
        stages.push(Stage::new(StageName::ImportsBeforeSetup, kind));
    }
    if let Some(kind) = user_stage(config, UserStage::Setup) {
        stages.push(Stage::new(StageName::Setup, kind));
    }
    if let Some(kind) = imports_stage(config, |i| i.after.as_deref() == Some("setup")) {
        stages.push(Stage::new(StageName::ImportsAfterSetup, kind));
    }
    if !is_artifact {
        if let Some(instructions) = &config.docker {
            stages.push(Stage::new(
                StageName::DockerInstructions,
                StageKind::DockerInstructions {
                    instructions: instructions.clone(),
                },
            ));
        }
    }

    stages
}

enum UserStage {
    BeforeInstall,
    Install,
    Setup,
}

fn user_stage(config: &ImageConfig, which: UserStage) -> Option<StageKind> {
    if let Some(shell) = &config.shell {
        let (commands, cache_version) = match which {
            UserStage::BeforeInstall => (
                &shell.before_install,
                &shell.before_install_cache_version,
            ),
            UserStage::Install => (&shell.install, &shell.install_cache_version),
            UserStage::Setup => (&shell.setup, &shell.setup_cache_version),
        };
        if !commands.is_empty() {
            return Some(StageKind::UserCommands {
                commands: commands.clone(),
                cache_version: cache_version.clone(),
            });
        }
    }
    if let Some(ansible) = &config.ansible {
        let (tasks, cache_version) = match which {
            UserStage::BeforeInstall => (
                &ansible.before_install,
                &ansible.before_install_cache_version,
            ),
            UserStage::Install => (&ansible.install, &ansible.install_cache_version),
            UserStage::Setup => (&ansible.setup, &ansible.setup_cache_version),
        };
        if !tasks.is_empty() {
            return Some(StageKind::AnsibleTasks {
                tasks: tasks.clone(),
                cache_version: cache_version.clone(),
            });
        }
    }
    None
}

fn imports_stage(
    config: &ImageConfig,
    matches: impl Fn(&&ArtifactImport) -> bool,
) -> Option<StageKind> {
    let imports: Vec<ArtifactImport> = config.import.iter().filter(matches).cloned().collect();
    if imports.is_empty() {
        None
    } else {
        Some(StageKind::ArtifactImports { imports })
    }
}
