use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "werf", version, about = "Build and publish pipeline for layered container images")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Change to the specified directory to find the werf config
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Use specified dir to store cache files and dirs (~/.werf by default)
    #[arg(long, global = true)]
    pub home_dir: Option<PathBuf>,

    /// Use specified dir to store tmp files and dirs
    #[arg(long, global = true)]
    pub tmp_dir: Option<PathBuf>,

    /// Use specified project name (derived from git or dir name by default)
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Enable only specified ssh keys (use system ssh-agent by default)
    #[arg(long = "ssh-key", global = true)]
    pub ssh_keys: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build images
    Build {
        /// Specific images to process (all if empty)
        images: Vec<String>,

        #[command(flatten)]
        introspect: IntrospectOpts,

        #[command(flatten)]
        credentials: CredentialOpts,
    },

    /// Build and push images
    Bp {
        /// Specific images to process (all if empty)
        images: Vec<String>,

        /// Docker repository name to push images to
        /// (CI_REGISTRY_IMAGE is used by default when available)
        #[arg(long)]
        repo: Option<String>,

        /// Push the stages cache alongside the images
        #[arg(long)]
        with_stages: bool,

        #[command(flatten)]
        tags: TagOpts,

        #[command(flatten)]
        introspect: IntrospectOpts,

        #[command(flatten)]
        credentials: CredentialOpts,
    },
}

#[derive(Debug, Args)]
pub struct IntrospectOpts {
    /// Introspect the failed stage right after the failed instruction
    #[arg(long = "introspect-error")]
    pub after_error: bool,

    /// Introspect the failed stage in its clean state, before any
    /// instruction of the stage ran
    #[arg(long = "introspect-before-error")]
    pub before_error: bool,
}

#[derive(Debug, Args)]
pub struct TagOpts {
    /// Add a custom tag (can be used multiple times)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Tag by the current git branch
    #[arg(long)]
    pub tag_branch: bool,

    /// Tag by the current git commit
    #[arg(long)]
    pub tag_commit: bool,

    /// Tag by the CI build id
    #[arg(long)]
    pub tag_build_id: bool,

    /// Tag by the CI branch and tag
    #[arg(long)]
    pub tag_ci: bool,
}

#[derive(Debug, Args, Default)]
pub struct CredentialOpts {
    /// Registry username to authorize pull of base images
    #[arg(long)]
    pub pull_username: Option<String>,

    /// Registry password to authorize pull of base images
    #[arg(long)]
    pub pull_password: Option<String>,

    /// Registry username to authorize push to the repo
    #[arg(long)]
    pub push_username: Option<String>,

    /// Registry password to authorize push to the repo
    #[arg(long)]
    pub push_password: Option<String>,

    /// Registry username for both pull and push
    #[arg(long)]
    pub registry_username: Option<String>,

    /// Registry password for both pull and push
    #[arg(long)]
    pub registry_password: Option<String>,
}

impl CredentialOpts {
    pub fn to_options(&self) -> crate::docker::CredentialOptions {
        crate::docker::CredentialOptions {
            pull_username: self.pull_username.clone(),
            pull_password: self.pull_password.clone(),
            push_username: self.push_username.clone(),
            push_password: self.push_password.clone(),
            registry_username: self.registry_username.clone(),
            registry_password: self.registry_password.clone(),
        }
    }
}
