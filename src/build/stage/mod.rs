pub mod import;

use std::path::Path;

use anyhow::{Context, Result};

use crate::build::image::StageImage;
use crate::config::model::{ArtifactImport, DockerInstructionsConfig, GitSpec};
use crate::docker::ContainerEngine;
use crate::identity::slug;
use crate::util::{sha256_hex, sorted_pairs};

/// Path inside build containers under which host-side service data
/// (artifact exports, git archives, playbooks) is mounted.
pub const CONTAINER_WERF_DIR: &str = "/.werf";

/// Stage-facing view of the Conveyor. Stages read already-computed state of
/// other images through it; `get_dependencies` must never cause container
/// work.
pub trait StageContext: Sync {
    fn project_name(&self) -> &str;
    fn project_dir(&self) -> &Path;
    fn tmp_dir(&self) -> &Path;
    /// Latest-stage signature of another image; available because images are
    /// processed in dependency order.
    fn image_latest_stage_signature(&self, image_name: &str) -> Result<String>;
    /// Latest-stage image ref of another image.
    fn image_latest_stage_image_name(&self, image_name: &str) -> Result<String>;
    fn engine(&self) -> &dyn ContainerEngine;
}

/// The fixed stage catalogue, in declaration order per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    From,
    BeforeInstall,
    ImportsBeforeInstall,
    GitArchive,
    Install,
    ImportsAfterInstall,
    ImportsBeforeSetup,
    Setup,
    ImportsAfterSetup,
    DockerInstructions,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::From => "from",
            StageName::BeforeInstall => "before_install",
            StageName::ImportsBeforeInstall => "imports_before_install",
            StageName::GitArchive => "git_archive",
            StageName::Install => "install",
            StageName::ImportsAfterInstall => "imports_after_install",
            StageName::ImportsBeforeSetup => "imports_before_setup",
            StageName::Setup => "setup",
            StageName::ImportsAfterSetup => "imports_after_setup",
            StageName::DockerInstructions => "docker_instructions",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base of an image's first stage: a plain image ref or another image of
/// this project.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseRef {
    Image(String),
    Dimg(String),
}

/// Stage-kind payload. Each kind differs only in how it serializes its
/// inputs into the signature and how it mutates the build recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    From {
        base: BaseRef,
        cache_version: Option<String>,
    },
    UserCommands {
        commands: Vec<String>,
        cache_version: Option<String>,
    },
    AnsibleTasks {
        tasks: Vec<serde_yaml::Value>,
        cache_version: Option<String>,
    },
    GitArchive {
        specs: Vec<GitSpec>,
    },
    ArtifactImports {
        imports: Vec<ArtifactImport>,
    },
    DockerInstructions {
        instructions: DockerInstructionsConfig,
    },
}

/// One layer of an image's build sequence. `signature` and `image_name` are
/// filled by the signatures phase; the image handle lives in the Conveyor's
/// cache under `image_name`.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: StageName,
    pub kind: StageKind,
    pub signature: Option<String>,
    pub image_name: Option<String>,
}

impl Stage {
    pub fn new(name: StageName, kind: StageKind) -> Self {
        Self {
            name,
            kind,
            signature: None,
            image_name: None,
        }
    }

    pub fn signature(&self) -> &str {
        self.signature.as_deref().unwrap_or_default()
    }

    pub fn image_name(&self) -> &str {
        self.image_name.as_deref().unwrap_or_default()
    }

    /// Raw input string contributing to this stage's signature. May read
    /// other images' signatures from the context but never causes container
    /// work.
    pub fn get_dependencies(&self, ctx: &dyn StageContext) -> Result<String> {
        match &self.kind {
            StageKind::From {
                base,
                cache_version,
            } => {
                let base_input = match base {
                    BaseRef::Image(name) => name.clone(),
                    BaseRef::Dimg(dimg_name) => ctx
                        .image_latest_stage_signature(dimg_name)
                        .with_context(|| format!("resolving base image `{dimg_name}`"))?,
                };
                match cache_version {
                    None => Ok(base_input),
                    Some(version) => Ok(sha256_hex(&[base_input.as_str(), version.as_str()])),
                }
            }
            StageKind::UserCommands {
                commands,
                cache_version,
            } => {
                let mut args: Vec<&str> = commands.iter().map(String::as_str).collect();
                if let Some(version) = cache_version {
                    args.push(version.as_str());
                }
                Ok(sha256_hex(&args))
            }
            StageKind::AnsibleTasks {
                tasks,
                cache_version,
            } => {
                let mut args = Vec::new();
                for task in tasks {
                    args.push(serde_yaml::to_string(task).context("serializing ansible task")?);
                }
                if let Some(version) = cache_version {
                    args.push(version.clone());
                }
                Ok(sha256_hex(&args))
            }
            StageKind::GitArchive { specs } => {
                let mut args = Vec::new();
                for spec in specs {
                    args.push(spec.url.clone().unwrap_or_default());
                    args.push(spec.branch.clone().unwrap_or_default());
                    args.push(spec.add.clone());
                    args.push(spec.to.clone());
                    args.push(spec.owner.clone());
                    args.push(spec.group.clone());
                    args.extend(sorted(&spec.include_paths));
                    args.extend(sorted(&spec.exclude_paths));
                }
                Ok(sha256_hex(&args))
            }
            StageKind::ArtifactImports { imports } => {
                let mut args = Vec::new();
                for entry in imports {
                    args.push(ctx.image_latest_stage_signature(&entry.artifact)?);
                    args.push(entry.add.clone());
                    args.push(entry.to.clone());
                    args.push(entry.group.clone());
                    args.push(entry.owner.clone());
                    args.extend(sorted(&entry.include_paths));
                    args.extend(sorted(&entry.exclude_paths));
                }
                Ok(sha256_hex(&args))
            }
            StageKind::DockerInstructions { instructions } => {
                let mut args = Vec::new();
                args.extend(sorted(&instructions.volume));
                args.extend(sorted(&instructions.expose));
                args.extend(sorted_pairs(&instructions.env));
                args.extend(sorted_pairs(&instructions.label));
                args.extend(instructions.cmd.clone());
                args.extend(instructions.entrypoint.clone());
                args.push(instructions.workdir.clone().unwrap_or_default());
                args.push(instructions.user.clone().unwrap_or_default());
                Ok(sha256_hex(&args))
            }
        }
    }

    /// Host-side preparation that must happen before the stage container
    /// runs: artifact exports, git archives, playbook materialization.
    pub async fn pre_run_hook(&self, ctx: &dyn StageContext) -> Result<()> {
        match &self.kind {
            StageKind::ArtifactImports { imports } => {
                for entry in imports {
                    import::prepare_import_data(ctx, entry).await?;
                }
                Ok(())
            }
            StageKind::GitArchive { specs } => {
                for spec in specs {
                    archive_worktree(ctx, spec).await?;
                }
                Ok(())
            }
            StageKind::AnsibleTasks { tasks, .. } => {
                write_playbook(ctx, self.name, tasks)
            }
            _ => Ok(()),
        }
    }

    /// Translate declarative inputs into recipe mutations on `image`'s
    /// builder. Deterministic for a given signature.
    pub fn prepare_image(
        &self,
        ctx: &dyn StageContext,
        _prev: &StageImage,
        image: &mut StageImage,
    ) -> Result<()> {
        match &self.kind {
            StageKind::From { .. } => Ok(()),
            StageKind::UserCommands { commands, .. } => {
                for command in commands {
                    image.recipe.add_service_run_command(command.clone());
                }
                Ok(())
            }
            StageKind::AnsibleTasks { .. } => {
                let host_dir = playbook_host_dir(ctx, self.name);
                let container_dir = playbook_container_dir(self.name);
                image
                    .recipe
                    .add_volume(format!("{}:{}:ro", host_dir.display(), container_dir));
                image.recipe.add_service_run_command(format!(
                    "ansible-playbook {container_dir}/playbook.yml"
                ));
                Ok(())
            }
            StageKind::GitArchive { specs } => {
                for spec in specs {
                    let host_dir = archive_host_dir(ctx, spec);
                    let container_dir = archive_container_dir(spec);
                    image
                        .recipe
                        .add_volume(format!("{}:{}:ro", host_dir.display(), container_dir));
                    image.recipe.add_service_run_command(import::generate_safe_cp(
                        &container_dir,
                        &spec.to,
                        &spec.owner,
                        &spec.group,
                        &spec.include_paths,
                        &spec.exclude_paths,
                    ));
                }
                Ok(())
            }
            StageKind::ArtifactImports { imports } => {
                for entry in imports {
                    import::prepare_import(ctx, entry, image)?;
                }
                Ok(())
            }
            StageKind::DockerInstructions { instructions } => {
                let recipe = &mut image.recipe;
                recipe.commit_volumes.extend(instructions.volume.clone());
                recipe.expose.extend(instructions.expose.clone());
                for (k, v) in &instructions.env {
                    recipe.env.insert(k.clone(), v.clone());
                }
                for (k, v) in &instructions.label {
                    recipe.add_label(k.clone(), v.clone());
                }
                if !instructions.cmd.is_empty() {
                    recipe.cmd = instructions.cmd.clone();
                }
                if !instructions.entrypoint.is_empty() {
                    recipe.entrypoint = instructions.entrypoint.clone();
                }
                recipe.workdir = instructions.workdir.clone();
                recipe.user = instructions.user.clone();
                Ok(())
            }
        }
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted
}

// --- git archive helpers ---

fn archive_host_dir(ctx: &dyn StageContext, spec: &GitSpec) -> std::path::PathBuf {
    ctx.tmp_dir().join("archive").join(archive_slot(spec))
}

fn archive_container_dir(spec: &GitSpec) -> String {
    format!("{CONTAINER_WERF_DIR}/archive/{}", archive_slot(spec))
}

fn archive_slot(spec: &GitSpec) -> String {
    let digest = sha256_hex(&[
        spec.url.clone().unwrap_or_default(),
        spec.add.clone(),
        spec.to.clone(),
    ]);
    digest[..16].to_string()
}

/// Export the declared subtree of the working copy into the host archive
/// dir, ready to be mounted read-only into the build container.
async fn archive_worktree(ctx: &dyn StageContext, spec: &GitSpec) -> Result<()> {
    let dest = archive_host_dir(ctx, spec);
    tokio::fs::create_dir_all(&dest)
        .await
        .with_context(|| format!("creating archive dir {}", dest.display()))?;

    let add = spec.add.trim_start_matches('/');
    let mut command = format!(
        "git -C {} archive --format=tar HEAD",
        ctx.project_dir().display()
    );
    if !add.is_empty() {
        command.push_str(&format!(" -- {add}"));
    }
    command.push_str(&format!(" | tar -x -C {}", dest.display()));

    let status = tokio::process::Command::new("sh")
        .arg("-ec")
        .arg(&command)
        .status()
        .await
        .context("running git archive")?;
    if !status.success() {
        anyhow::bail!("git archive of `{}` failed", spec.add);
    }
    Ok(())
}

// --- ansible helpers ---

fn playbook_host_dir(ctx: &dyn StageContext, stage: StageName) -> std::path::PathBuf {
    ctx.tmp_dir().join("ansible").join(stage.as_str())
}

fn playbook_container_dir(stage: StageName) -> String {
    format!("{CONTAINER_WERF_DIR}/ansible/{}", stage.as_str())
}

fn write_playbook(
    ctx: &dyn StageContext,
    stage: StageName,
    tasks: &[serde_yaml::Value],
) -> Result<()> {
    let dir = playbook_host_dir(ctx, stage);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating playbook dir {}", dir.display()))?;

    let playbook = serde_yaml::to_string(&serde_yaml::Value::Sequence(vec![serde_yaml::to_value(
        std::collections::BTreeMap::from([
            ("hosts".to_string(), serde_yaml::Value::String("all".to_string())),
            ("gather_facts".to_string(), serde_yaml::Value::Bool(false)),
            (
                "tasks".to_string(),
                serde_yaml::Value::Sequence(tasks.to_vec()),
            ),
        ]),
    )?]))
    .context("rendering playbook")?;

    std::fs::write(dir.join("playbook.yml"), playbook).context("writing playbook")?;
    Ok(())
}

/// Per-artifact label recorded on images that import from it.
pub fn artifact_label(artifact_name: &str) -> String {
    format!("werf-artifact-{}", slug(artifact_name))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::EngineError;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// Context stub resolving artifact signatures from a fixed table.
    pub struct FixedContext {
        pub signatures: BTreeMap<String, String>,
        pub tmp_dir: PathBuf,
        pub project_dir: PathBuf,
    }

    impl FixedContext {
        pub fn new(signatures: &[(&str, &str)]) -> Self {
            Self {
                signatures: signatures
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                tmp_dir: PathBuf::from("/tmp/werf-test"),
                project_dir: PathBuf::from("/project"),
            }
        }
    }

    pub struct NoEngine;

    #[async_trait::async_trait]
    impl crate::docker::ContainerEngine for NoEngine {
        async fn image_exists(&self, _: &str) -> Result<bool, EngineError> {
            unreachable!("signature computation must not touch the engine")
        }
        async fn image_id(&self, _: &str) -> Result<Option<String>, EngineError> {
            unreachable!()
        }
        async fn image_parent_id(&self, _: &str) -> Result<Option<String>, EngineError> {
            unreachable!()
        }
        async fn pull(
            &self,
            _: &str,
            _: Option<&crate::docker::RegistryCredentials>,
        ) -> Result<(), EngineError> {
            unreachable!()
        }
        async fn build(
            &self,
            _: &str,
            _: &str,
            _: &crate::docker::BuildRecipe,
            _: bool,
        ) -> Result<String, EngineError> {
            unreachable!()
        }
        async fn run(&self, _: &crate::docker::RunSpec) -> Result<(), EngineError> {
            unreachable!()
        }
        async fn run_detached(
            &self,
            _: &str,
            _: &crate::docker::BuildRecipe,
        ) -> Result<String, EngineError> {
            unreachable!()
        }
        async fn tag(&self, _: &str, _: &str) -> Result<(), EngineError> {
            unreachable!()
        }
        async fn push(
            &self,
            _: &str,
            _: Option<&crate::docker::RegistryCredentials>,
        ) -> Result<(), EngineError> {
            unreachable!()
        }
        async fn remove_tag(&self, _: &str) -> Result<(), EngineError> {
            unreachable!()
        }
    }

    static NO_ENGINE: NoEngine = NoEngine;

    impl StageContext for FixedContext {
        fn project_name(&self) -> &str {
            "test"
        }
        fn project_dir(&self) -> &Path {
            &self.project_dir
        }
        fn tmp_dir(&self) -> &Path {
            &self.tmp_dir
        }
        fn image_latest_stage_signature(&self, image_name: &str) -> Result<String> {
            self.signatures
                .get(image_name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no signature for `{image_name}`"))
        }
        fn image_latest_stage_image_name(&self, image_name: &str) -> Result<String> {
            Ok(format!("conveyor/test/{image_name}:stub"))
        }
        fn engine(&self) -> &dyn crate::docker::ContainerEngine {
            &NO_ENGINE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedContext;
    use super::*;

    #[test]
    fn from_stage_dependencies_are_the_base_ref() {
        let stage = Stage::new(
            StageName::From,
            StageKind::From {
                base: BaseRef::Image("alpine:3.18".to_string()),
                cache_version: None,
            },
        );
        let ctx = FixedContext::new(&[]);
        assert_eq!(stage.get_dependencies(&ctx).unwrap(), "alpine:3.18");
    }

    #[test]
    fn from_stage_on_dimg_uses_its_latest_signature() {
        let stage = Stage::new(
            StageName::From,
            StageKind::From {
                base: BaseRef::Dimg("base".to_string()),
                cache_version: None,
            },
        );
        let ctx = FixedContext::new(&[("base", "sig-of-base")]);
        assert_eq!(stage.get_dependencies(&ctx).unwrap(), "sig-of-base");
    }

    #[test]
    fn cache_version_changes_from_dependencies() {
        let plain = Stage::new(
            StageName::From,
            StageKind::From {
                base: BaseRef::Image("alpine:3.18".to_string()),
                cache_version: None,
            },
        );
        let versioned = Stage::new(
            StageName::From,
            StageKind::From {
                base: BaseRef::Image("alpine:3.18".to_string()),
                cache_version: Some("2".to_string()),
            },
        );
        let ctx = FixedContext::new(&[]);
        assert_ne!(
            plain.get_dependencies(&ctx).unwrap(),
            versioned.get_dependencies(&ctx).unwrap()
        );
    }

    #[test]
    fn user_command_dependencies_are_command_sensitive() {
        let ctx = FixedContext::new(&[]);
        let a = Stage::new(
            StageName::Install,
            StageKind::UserCommands {
                commands: vec!["echo hi".to_string()],
                cache_version: None,
            },
        );
        let b = Stage::new(
            StageName::Install,
            StageKind::UserCommands {
                commands: vec!["echo bye".to_string()],
                cache_version: None,
            },
        );
        assert_ne!(
            a.get_dependencies(&ctx).unwrap(),
            b.get_dependencies(&ctx).unwrap()
        );
    }

    #[test]
    fn prepare_user_commands_fills_recipe() {
        let ctx = FixedContext::new(&[]);
        let stage = Stage::new(
            StageName::Install,
            StageKind::UserCommands {
                commands: vec!["apk add curl".to_string(), "adduser -D app".to_string()],
                cache_version: None,
            },
        );
        let prev = StageImage::new(None, "prev");
        let mut image = StageImage::new(Some("prev".to_string()), "cur");
        stage.prepare_image(&ctx, &prev, &mut image).unwrap();
        assert_eq!(
            image.recipe.service_run_commands,
            vec!["apk add curl", "adduser -D app"]
        );
    }

    #[test]
    fn docker_instructions_only_touch_commit_metadata() {
        let ctx = FixedContext::new(&[]);
        let mut instructions = DockerInstructionsConfig::default();
        instructions.expose = vec!["8080/tcp".to_string()];
        instructions.cmd = vec!["/bin/app".to_string()];
        instructions
            .env
            .insert("MODE".to_string(), "production".to_string());
        let stage = Stage::new(
            StageName::DockerInstructions,
            StageKind::DockerInstructions { instructions },
        );
        let prev = StageImage::new(None, "prev");
        let mut image = StageImage::new(Some("prev".to_string()), "cur");
        stage.prepare_image(&ctx, &prev, &mut image).unwrap();
        assert!(image.recipe.service_run_commands.is_empty());
        assert_eq!(image.recipe.expose, vec!["8080/tcp"]);
        assert_eq!(image.recipe.cmd, vec!["/bin/app"]);
        assert_eq!(image.recipe.env.get("MODE").unwrap(), "production");
    }

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(StageName::From.as_str(), "from");
        assert_eq!(StageName::GitArchive.as_str(), "git_archive");
        assert_eq!(StageName::DockerInstructions.as_str(), "docker_instructions");
    }
}
