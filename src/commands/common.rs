use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::build::conveyor::ConveyorContext;
use crate::build::TagScheme;
use crate::cli::{GlobalOpts, TagOpts};
use crate::config::model::WerfConfig;
use crate::docker::{authorizer, AuthEnv, CredentialOptions, DockerAuthorizer, DockerEngine};
use crate::home::{ProjectTmpDir, WerfHome};
use crate::identity::{project_name, slug};
use crate::lock::LockManager;
use crate::registry::HttpRegistry;
use crate::ssh_agent::SshAgent;
use crate::{config, git};

/// Everything a pipeline run needs from the host, assembled once per
/// invocation.
pub struct Workspace {
    pub config: WerfConfig,
    pub conveyor_ctx: ConveyorContext,
    pub tmp: ProjectTmpDir,
    pub ssh_agent: SshAgent,
    /// Resolved publish repository; set only when the command pushes.
    pub repo: Option<String>,
}

/// Resolve directories, config, collaborators and credentials for a run.
/// With `repo_option` given (even `None` inside), the publish repository is
/// resolved against the project name and credentials are selected for it.
pub async fn setup(
    global: &GlobalOpts,
    credentials: CredentialOptions,
    repo_option: Option<Option<&str>>,
) -> Result<Workspace> {
    let project_dir = match &global.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("getting current dir")?,
    };

    let config_path = config::discover_config(&project_dir)?;
    let (config, _source) = config::load_config(&config_path)?;

    let explicit_name = config
        .project
        .clone()
        .or_else(|| global.name.clone());
    let project_name = project_name(&project_dir, explicit_name.as_deref()).await?;
    info!(project = %project_name, dir = %project_dir.display(), "using project");

    let repo = match repo_option {
        Some(option) => Some(resolve_repo(&project_name, option)?),
        None => None,
    };
    let repo_ref = repo.as_deref();

    let home = WerfHome::resolve(global.home_dir.as_deref())?;
    let build_dir = home.project_build_dir(&project_name)?;
    let locks = Arc::new(LockManager::new(home.locks_dir()?));
    let tmp = home.create_tmp_dir(global.tmp_dir.as_deref())?;

    let env = AuthEnv::from_process();
    let docker_config_dir =
        authorizer::docker_config_dir(tmp.path(), &credentials, repo_ref, &env)?;
    let authorizer = DockerAuthorizer::new(&credentials, repo_ref, &env);

    let engine = DockerEngine::init(docker_config_dir).await?;

    let push_creds = repo_ref.and_then(|r| authorizer.login_for_push(r));
    let registry = HttpRegistry::new(push_creds);

    let ssh_agent = SshAgent::init(&global.ssh_keys)
        .await
        .context("cannot initialize ssh agent")?;
    let ssh_auth_sock = ssh_agent.auth_sock().map(str::to_string);

    let conveyor_ctx = ConveyorContext {
        project_name,
        project_dir,
        build_dir,
        tmp_dir: tmp.path().to_path_buf(),
        ssh_auth_sock,
        engine: Arc::new(engine),
        registry: Arc::new(registry),
        authorizer,
        locks,
    };

    Ok(Workspace {
        config,
        conveyor_ctx,
        tmp,
        ssh_agent,
        repo,
    })
}

/// Repository to publish into: explicit `--repo` wins, `:minikube` maps to
/// the in-cluster registry, `CI_REGISTRY_IMAGE` is the CI default.
pub fn resolve_repo(project_name: &str, repo_option: Option<&str>) -> Result<String> {
    match repo_option {
        Some(":minikube") => Ok(format!(
            "werf-registry.kube-system.svc.cluster.local:5000/{project_name}"
        )),
        Some(repo) => Ok(repo.to_string()),
        None => match std::env::var("CI_REGISTRY_IMAGE") {
            Ok(repo) if !repo.is_empty() => Ok(repo),
            _ => bail!("CI_REGISTRY_IMAGE variable or --repo option required"),
        },
    }
}

/// Expand tag flags into the scheme → tags table. Tags taken from git or CI
/// state are slug-normalized; with no tag option at all the single custom
/// tag `latest` is used.
pub async fn resolve_tags(
    project_dir: &Path,
    opts: &TagOpts,
) -> Result<BTreeMap<TagScheme, Vec<String>>> {
    let mut tags_by_scheme: BTreeMap<TagScheme, Vec<String>> = BTreeMap::new();

    if !opts.tags.is_empty() {
        tags_by_scheme.insert(TagScheme::Custom, opts.tags.clone());
    }

    if opts.tag_branch {
        let branch = git::head_branch(project_dir)
            .await?
            .context("cannot tag by branch: no branch is checked out")?;
        tags_by_scheme
            .entry(TagScheme::GitBranch)
            .or_default()
            .push(slug(&branch));
    }

    if opts.tag_commit {
        let commit = git::head_commit(project_dir)
            .await?
            .context("cannot tag by commit: no commit found")?;
        tags_by_scheme
            .entry(TagScheme::GitCommit)
            .or_default()
            .push(commit);
    }

    if opts.tag_build_id {
        let build_id = std::env::var("CI_BUILD_ID")
            .or_else(|_| std::env::var("CI_JOB_ID"))
            .ok()
            .filter(|v| !v.is_empty())
            .context("cannot tag by build id: CI_BUILD_ID/CI_JOB_ID is not set")?;
        tags_by_scheme
            .entry(TagScheme::Ci)
            .or_default()
            .push(build_id);
    }

    if opts.tag_ci {
        let ci_tag = std::env::var("CI_COMMIT_TAG").ok().filter(|v| !v.is_empty());
        let ci_branch = std::env::var("CI_COMMIT_REF_NAME")
            .ok()
            .filter(|v| !v.is_empty());
        match (ci_tag, ci_branch) {
            (Some(tag), _) => {
                tags_by_scheme
                    .entry(TagScheme::GitTag)
                    .or_default()
                    .push(slug(&tag));
            }
            (None, Some(branch)) => {
                tags_by_scheme
                    .entry(TagScheme::GitBranch)
                    .or_default()
                    .push(slug(&branch));
            }
            (None, None) => {
                bail!("cannot tag by CI: CI_COMMIT_TAG/CI_COMMIT_REF_NAME is not set")
            }
        }
    }

    if tags_by_scheme.is_empty() {
        tags_by_scheme.insert(TagScheme::Custom, vec!["latest".to_string()]);
    }
    Ok(tags_by_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_repo_wins() {
        assert_eq!(
            resolve_repo("app", Some("registry.example/app")).unwrap(),
            "registry.example/app"
        );
    }

    #[test]
    fn minikube_repo_is_expanded() {
        assert_eq!(
            resolve_repo("app", Some(":minikube")).unwrap(),
            "werf-registry.kube-system.svc.cluster.local:5000/app"
        );
    }

    fn tag_opts() -> TagOpts {
        TagOpts {
            tags: vec![],
            tag_branch: false,
            tag_commit: false,
            tag_build_id: false,
            tag_ci: false,
        }
    }

    #[tokio::test]
    async fn default_tag_is_custom_latest() {
        let dir = std::env::temp_dir();
        let tags = resolve_tags(&dir, &tag_opts()).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[&TagScheme::Custom], vec!["latest"]);
    }

    #[tokio::test]
    async fn custom_tags_suppress_the_default() {
        let dir = std::env::temp_dir();
        let mut opts = tag_opts();
        opts.tags = vec!["v1".to_string(), "stable".to_string()];
        let tags = resolve_tags(&dir, &opts).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[&TagScheme::Custom], vec!["v1", "stable"]);
    }
}
