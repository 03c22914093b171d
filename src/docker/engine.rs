use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerConfig, ContainerCreateBody, CreateImageInfo, HostConfig};
use bollard::query_parameters::{
    CommitContainerOptions, CreateContainerOptions, CreateImageOptions, PushImageOptions,
    RemoveContainerOptions, RemoveImageOptions, StartContainerOptions, TagImageOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;

use crate::docker::authorizer::RegistryCredentials;
use crate::error::EngineError;

/// Accumulated build recipe for one stage: run commands executed in the build
/// container plus metadata applied when the result is committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRecipe {
    pub service_run_commands: Vec<String>,
    /// `host:container[:ro]` binds for the build container.
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Labels applied on commit.
    pub labels: BTreeMap<String, String>,
    pub expose: Vec<String>,
    pub commit_volumes: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
}

impl BuildRecipe {
    pub fn add_service_run_command(&mut self, command: impl Into<String>) {
        self.service_run_commands.push(command.into());
    }

    pub fn add_volume(&mut self, bind: impl Into<String>) {
        self.volumes.push(bind.into());
    }

    pub fn add_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    /// Single shell script executed in the build container.
    pub fn shell_script(&self) -> String {
        if self.service_run_commands.is_empty() {
            "true".to_string()
        } else {
            self.service_run_commands.join(" && ")
        }
    }
}

/// One-off container run, used to export artifact trees onto the host.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub script: String,
    pub volumes: Vec<String>,
}

/// Container engine collaborator. All image mutation goes through here; the
/// Conveyor never talks to a daemon directly.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError>;

    /// Id of a local image, `None` when absent.
    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError>;

    /// Parent id of a local image, `None` when absent or parentless.
    async fn image_parent_id(&self, reference: &str) -> Result<Option<String>, EngineError>;

    async fn pull(
        &self,
        reference: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError>;

    /// Run the recipe in a container on top of `from` and commit the result
    /// as `reference`. Returns the committed image id. When
    /// `keep_failed_container` is set a failed build leaves the container
    /// behind and reports its id for introspection.
    async fn build(
        &self,
        from: &str,
        reference: &str,
        recipe: &BuildRecipe,
        keep_failed_container: bool,
    ) -> Result<String, EngineError>;

    /// Run a one-off container to completion.
    async fn run(&self, spec: &RunSpec) -> Result<(), EngineError>;

    /// Start a long-lived container on top of `from` with the recipe's
    /// volumes and env but none of its commands, for shell introspection.
    /// Returns the container id.
    async fn run_detached(&self, from: &str, recipe: &BuildRecipe) -> Result<String, EngineError>;

    async fn tag(&self, src: &str, dst: &str) -> Result<(), EngineError>;

    async fn push(
        &self,
        reference: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError>;

    async fn remove_tag(&self, reference: &str) -> Result<(), EngineError>;
}

/// bollard-backed engine implementation.
pub struct DockerEngine {
    docker: Docker,
    #[allow(dead_code)]
    config_dir: PathBuf,
}

impl DockerEngine {
    /// Connect to the local daemon and verify it is reachable. `config_dir`
    /// is the docker config selected by the authorizer for this invocation.
    pub async fn init(config_dir: PathBuf) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::new(format!("connecting to Docker daemon: {e}")))?;
        docker.ping().await.map_err(|e| {
            EngineError::new(format!("cannot connect to Docker daemon ({e}); is it running?"))
        })?;
        Ok(Self { docker, config_dir })
    }

    fn split_ref(reference: &str) -> (&str, &str) {
        match reference.rsplit_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() && !tag.contains('/') => {
                (name, tag)
            }
            _ => (reference, "latest"),
        }
    }

    async fn create_build_container(
        &self,
        from: &str,
        recipe: &BuildRecipe,
        cmd: Vec<String>,
    ) -> Result<String, EngineError> {
        let env: Vec<String> = recipe.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let host_config = HostConfig {
            binds: Some(recipe.volumes.clone()),
            ..Default::default()
        };
        let config = ContainerCreateBody {
            image: Some(from.to_string()),
            env: Some(env),
            cmd: Some(cmd),
            host_config: Some(host_config),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .map_err(|e| EngineError::new(format!("creating build container from {from}: {e}")))?;
        Ok(response.id)
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64, EngineError> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions>);
        let mut status_code = 0i64;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => status_code = response.status_code,
                // The wait endpoint reports non-zero exits as stream errors
                // carrying the response; surface the code instead.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    status_code = code;
                }
                Err(e) => {
                    return Err(EngineError::new(format!(
                        "waiting for container {container_id}: {e}"
                    )))
                }
            }
        }
        Ok(status_code)
    }

    async fn remove_container(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            tracing::warn!(container = %container_id, error = %e, "failed to remove build container");
        }
    }
}

fn to_docker_credentials(creds: Option<&RegistryCredentials>) -> Option<DockerCredentials> {
    creds.map(|c| DockerCredentials {
        username: Some(c.username.clone()),
        password: Some(c.password.clone()),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        Ok(self.docker.inspect_image(reference).await.is_ok())
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => Ok(inspect.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(EngineError::new(format!("inspecting image {reference}: {e}"))),
        }
    }

    async fn image_parent_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => Ok(inspect.parent.filter(|p| !p.is_empty())),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(EngineError::new(format!("inspecting image {reference}: {e}"))),
        }
    }

    async fn pull(
        &self,
        reference: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError> {
        let (name, tag) = Self::split_ref(reference);
        tracing::debug!(image = %reference, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };
        let mut stream =
            self.docker
                .create_image(Some(options), None, to_docker_credentials(creds));
        while let Some(result) = stream.next().await {
            let info: CreateImageInfo =
                result.map_err(|e| EngineError::new(format!("pulling {reference}: {e}")))?;
            if let Some(err) = &info.error_detail {
                return Err(EngineError::new(format!(
                    "image pull failed for {reference}: {err:?}"
                )));
            }
        }
        Ok(())
    }

    async fn build(
        &self,
        from: &str,
        reference: &str,
        recipe: &BuildRecipe,
        keep_failed_container: bool,
    ) -> Result<String, EngineError> {
        let cmd = vec![
            "/bin/sh".to_string(),
            "-ec".to_string(),
            recipe.shell_script(),
        ];
        let container_id = self.create_build_container(from, recipe, cmd).await?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| {
                EngineError::new(format!("starting build container {container_id}: {e}"))
            })?;

        let status_code = self.wait_for_exit(&container_id).await?;
        if status_code != 0 {
            if keep_failed_container {
                return Err(EngineError::with_container(
                    format!("build of {reference} failed with status {status_code}"),
                    container_id,
                ));
            }
            self.remove_container(&container_id).await;
            return Err(EngineError::new(format!(
                "build of {reference} failed with status {status_code}"
            )));
        }

        let (repo, tag) = Self::split_ref(reference);
        let exposed_ports: Vec<String> = recipe.expose.clone();
        let commit_volumes: Vec<String> = recipe.commit_volumes.clone();

        let commit_config = ContainerConfig {
            labels: Some(recipe.labels.clone().into_iter().collect()),
            env: if recipe.env.is_empty() {
                None
            } else {
                Some(recipe.env.iter().map(|(k, v)| format!("{k}={v}")).collect())
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            volumes: if commit_volumes.is_empty() {
                None
            } else {
                Some(commit_volumes)
            },
            cmd: if recipe.cmd.is_empty() {
                None
            } else {
                Some(recipe.cmd.clone())
            },
            entrypoint: if recipe.entrypoint.is_empty() {
                None
            } else {
                Some(recipe.entrypoint.clone())
            },
            working_dir: recipe.workdir.clone(),
            user: recipe.user.clone(),
            ..Default::default()
        };
        let options = CommitContainerOptions {
            container: Some(container_id.clone()),
            repo: Some(repo.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };
        let commit = self
            .docker
            .commit_container(options, commit_config)
            .await
            .map_err(|e| EngineError::new(format!("committing {reference}: {e}")));

        self.remove_container(&container_id).await;
        let commit = commit?;
        tracing::debug!(image = %reference, id = %commit.id, "image committed");
        Ok(commit.id)
    }

    async fn run(&self, spec: &RunSpec) -> Result<(), EngineError> {
        let recipe = BuildRecipe {
            volumes: spec.volumes.clone(),
            ..Default::default()
        };
        let cmd = vec!["/bin/sh".to_string(), "-ec".to_string(), spec.script.clone()];
        let container_id = self.create_build_container(&spec.image, &recipe, cmd).await?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| EngineError::new(format!("starting container {container_id}: {e}")))?;

        let status_code = self.wait_for_exit(&container_id).await;
        self.remove_container(&container_id).await;

        match status_code? {
            0 => Ok(()),
            code => Err(EngineError::new(format!(
                "container run of {} failed with status {code}",
                spec.image
            ))),
        }
    }

    async fn run_detached(&self, from: &str, recipe: &BuildRecipe) -> Result<String, EngineError> {
        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ];
        let container_id = self.create_build_container(from, recipe, cmd).await?;
        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| {
                EngineError::new(format!("starting introspection container {container_id}: {e}"))
            })?;
        Ok(container_id)
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<(), EngineError> {
        let (repo, tag) = Self::split_ref(dst);
        let options = TagImageOptions {
            repo: Some(repo.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };
        self.docker
            .tag_image(src, Some(options))
            .await
            .map_err(|e| EngineError::new(format!("tagging {src} as {dst}: {e}")))
    }

    async fn push(
        &self,
        reference: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError> {
        let (repo, tag) = Self::split_ref(reference);
        let options = PushImageOptions {
            tag: Some(tag.to_string()),
            ..Default::default()
        };
        let mut stream =
            self.docker
                .push_image(repo, Some(options), to_docker_credentials(creds));
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| EngineError::new(format!("pushing {reference}: {e}")))?;
            if let Some(err) = info.error_detail.and_then(|d| d.message) {
                return Err(EngineError::new(format!("push of {reference} failed: {err}")));
            }
        }
        Ok(())
    }

    async fn remove_tag(&self, reference: &str) -> Result<(), EngineError> {
        match self
            .docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(EngineError::new(format!("removing tag {reference}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ref_with_tag() {
        assert_eq!(DockerEngine::split_ref("alpine:3.18"), ("alpine", "3.18"));
    }

    #[test]
    fn split_ref_without_tag() {
        assert_eq!(DockerEngine::split_ref("alpine"), ("alpine", "latest"));
    }

    #[test]
    fn split_ref_with_registry_port() {
        assert_eq!(
            DockerEngine::split_ref("registry.local:5000/acme/app"),
            ("registry.local:5000/acme/app", "latest")
        );
        assert_eq!(
            DockerEngine::split_ref("registry.local:5000/acme/app:v1"),
            ("registry.local:5000/acme/app", "v1")
        );
    }

    #[test]
    fn shell_script_joins_commands() {
        let mut recipe = BuildRecipe::default();
        recipe.add_service_run_command("apk add curl");
        recipe.add_service_run_command("adduser -D app");
        assert_eq!(recipe.shell_script(), "apk add curl && adduser -D app");
    }

    #[test]
    fn shell_script_defaults_to_noop() {
        assert_eq!(BuildRecipe::default().shell_script(), "true");
    }
}
