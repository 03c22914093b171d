use serde::Deserialize;
use std::collections::BTreeMap;

/// Parsed project configuration (`werf.yml`). Read-only after load.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WerfConfig {
    /// Short project identifier, used in paths and default repository names.
    /// Derived from the git remote or project dir when absent.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    /// Like `images`, but outputs are only consumable via imports and are
    /// never published.
    #[serde(default)]
    pub artifacts: Vec<ImageConfig>,
}

impl WerfConfig {
    pub fn artifact(&self, name: &str) -> Option<&ImageConfig> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageConfig {
    /// Empty for the single unnamed image.
    #[serde(default)]
    pub name: String,
    /// Base image reference. Exactly one of `from` / `fromImage` must be set.
    #[serde(default)]
    pub from: Option<String>,
    /// Name of another image in this config to use as the base.
    #[serde(default)]
    pub from_image: Option<String>,
    #[serde(default)]
    pub from_cache_version: Option<String>,
    #[serde(default)]
    pub git: Vec<GitSpec>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub shell: Option<ShellRecipe>,
    #[serde(default)]
    pub ansible: Option<AnsibleRecipe>,
    #[serde(default)]
    pub docker: Option<DockerInstructionsConfig>,
    #[serde(default)]
    pub import: Vec<ArtifactImport>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitSpec {
    /// Remote repository url; the project's own working tree when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_add")]
    pub add: String,
    pub to: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

fn default_add() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mount {
    /// One of `tmp_dir` / `build_dir`, or absolute host path via `fromPath`.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_path: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShellRecipe {
    #[serde(default)]
    pub before_install: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub before_install_cache_version: Option<String>,
    #[serde(default)]
    pub install_cache_version: Option<String>,
    #[serde(default)]
    pub setup_cache_version: Option<String>,
}

/// Ansible recipe: raw task lists per stage. Tasks are kept as YAML values;
/// their canonical dump feeds the stage signature and preparation renders
/// them into a playbook executed inside the build container.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnsibleRecipe {
    #[serde(default)]
    pub before_install: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub install: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub setup: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub before_install_cache_version: Option<String>,
    #[serde(default)]
    pub install_cache_version: Option<String>,
    #[serde(default)]
    pub setup_cache_version: Option<String>,
}

/// Plain Dockerfile-style metadata applied as the final stage of a published
/// image.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DockerInstructionsConfig {
    #[serde(default)]
    pub volume: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Declarative copy of an artifact's output tree into a consuming image.
/// Exactly one of `before` / `after` must name `install` or `setup`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactImport {
    pub artifact: String,
    #[serde(default = "default_add")]
    pub add: String,
    pub to: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

/// Stage boundaries an import may attach to.
pub const IMPORT_RELATIONS: [&str; 2] = ["install", "setup"];

impl ArtifactImport {
    pub fn relation_is_valid(rel: &str) -> bool {
        IMPORT_RELATIONS.contains(&rel)
    }
}
