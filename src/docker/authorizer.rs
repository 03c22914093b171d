use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::registry;

/// Username/password pair for a registry endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Credential flags as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CredentialOptions {
    pub pull_username: Option<String>,
    pub pull_password: Option<String>,
    pub push_username: Option<String>,
    pub push_password: Option<String>,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
}

/// Environment variables the credential rules consult. Snapshotted so the
/// selection logic stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct AuthEnv {
    pub docker_config: Option<String>,
    pub ignore_ci_autologin: bool,
    pub ci_registry: Option<String>,
    pub ci_job_token: Option<String>,
    pub home: Option<String>,
}

impl AuthEnv {
    /// Snapshot from the process environment. `WERF_*` wins over the legacy
    /// `DAPP_*` spelling.
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            docker_config: var("WERF_DOCKER_CONFIG").or_else(|| var("DAPP_DOCKER_CONFIG")),
            ignore_ci_autologin: var("WERF_IGNORE_CI_DOCKER_AUTOLOGIN")
                .or_else(|| var("DAPP_IGNORE_CI_DOCKER_AUTOLOGIN"))
                .is_some(),
            ci_registry: var("CI_REGISTRY"),
            ci_job_token: var("CI_JOB_TOKEN"),
            home: var("HOME"),
        }
    }
}

/// Select credentials for one direction (pull or push). First match wins:
/// explicit pair, generic pair, delegated docker config, GCR / suppressed
/// autologin, GitLab CI job token, none.
fn resolve(
    explicit: (&Option<String>, &Option<String>),
    generic: (&Option<String>, &Option<String>),
    target: Option<&str>,
    env: &AuthEnv,
) -> Option<RegistryCredentials> {
    if let (Some(username), Some(password)) = explicit {
        return Some(RegistryCredentials {
            username: username.clone(),
            password: password.clone(),
        });
    }
    if let (Some(username), Some(password)) = generic {
        return Some(RegistryCredentials {
            username: username.clone(),
            password: password.clone(),
        });
    }
    if env.docker_config.is_some() {
        return None;
    }
    if target.map(registry::is_gcr).unwrap_or(false) || env.ignore_ci_autologin {
        return None;
    }
    if let (Some(_), Some(token)) = (&env.ci_registry, &env.ci_job_token) {
        return Some(RegistryCredentials {
            username: "gitlab-ci-token".to_string(),
            password: token.clone(),
        });
    }
    None
}

/// Credential selection and pre-flight login for pull vs push endpoints.
/// Logins are memoized: at most one per endpoint per Conveyor lifetime.
#[derive(Debug)]
pub struct DockerAuthorizer {
    pull: Option<RegistryCredentials>,
    push: Option<RegistryCredentials>,
    logged_in: Mutex<HashSet<String>>,
}

impl DockerAuthorizer {
    pub fn new(options: &CredentialOptions, repo: Option<&str>, env: &AuthEnv) -> Self {
        let pull = resolve(
            (&options.pull_username, &options.pull_password),
            (&options.registry_username, &options.registry_password),
            repo,
            env,
        );
        let push = resolve(
            (&options.push_username, &options.push_password),
            (&options.registry_username, &options.registry_password),
            repo,
            env,
        );
        Self {
            pull,
            push,
            logged_in: Mutex::new(HashSet::new()),
        }
    }

    /// Credentials for pulling a base image from `registry`.
    pub fn login_base_image(&self, registry: &str) -> Option<RegistryCredentials> {
        self.login(registry, "pull", self.pull.as_ref())
    }

    /// Credentials for pushing to `repo`.
    pub fn login_for_push(&self, repo: &str) -> Option<RegistryCredentials> {
        self.login(repo, "push", self.push.as_ref())
    }

    fn login(
        &self,
        endpoint: &str,
        direction: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Option<RegistryCredentials> {
        let key = format!("{direction}:{endpoint}");
        let mut logged_in = self.logged_in.lock().expect("login table poisoned");
        if logged_in.insert(key) {
            match creds {
                Some(c) => info!(endpoint, direction, username = %c.username, "logging in"),
                None => debug!(endpoint, direction, "no credentials selected"),
            }
        }
        creds.cloned()
    }
}

/// Docker config dir for this invocation: a fresh dir under the invocation
/// tmp root when explicit credentials target a repo, else the delegated
/// `WERF_DOCKER_CONFIG`/`DAPP_DOCKER_CONFIG` dir, else `~/.docker`.
pub fn docker_config_dir(
    tmp_dir: &Path,
    options: &CredentialOptions,
    repo: Option<&str>,
    env: &AuthEnv,
) -> Result<PathBuf> {
    let has_explicit = [
        &options.pull_username,
        &options.push_username,
        &options.registry_username,
    ]
    .iter()
    .any(|u| u.is_some());

    if has_explicit && repo.is_some() {
        let dir = tmp_dir.join("docker");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating docker config dir {}", dir.display()))?;
        return Ok(dir);
    }
    if let Some(config) = &env.docker_config {
        return Ok(PathBuf::from(config));
    }
    let home = env.home.clone().unwrap_or_default();
    Ok(PathBuf::from(home).join(".docker"))
}
