#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use werf::build::conveyor::{Conveyor, ConveyorContext};
use werf::config::model::WerfConfig;
use werf::docker::{
    AuthEnv, BuildRecipe, ContainerEngine, CredentialOptions, DockerAuthorizer,
    RegistryCredentials, RunSpec,
};
use werf::error::{EngineError, RegistryError};
use werf::lock::LockManager;
use werf::registry::DockerRegistry;
use werf::util::sha256_hex;

/// Shared state behind the fake engine and fake registry: a local image
/// store, a remote tag store, and call recordings.
#[derive(Debug, Default)]
pub struct World {
    pub images: BTreeMap<String, FakeImage>,
    pub pulls: Vec<String>,
    pub builds: Vec<String>,
    pub runs: Vec<String>,
    pub pushes: Vec<String>,
    pub remote_tags: BTreeMap<String, Vec<String>>,
    pub remote_parents: BTreeMap<String, String>,
    /// Builds whose script contains this substring fail.
    pub fail_command_containing: Option<String>,
    /// Artificial latency per build, to widen race windows in lock tests.
    pub build_delay: Option<Duration>,
    counter: u64,
}

#[derive(Debug, Clone)]
pub struct FakeImage {
    pub id: String,
    pub parent: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl World {
    pub fn shared() -> Arc<Mutex<World>> {
        Arc::new(Mutex::new(World::default()))
    }

    fn next_container(&mut self) -> String {
        self.counter += 1;
        format!("container-{}", self.counter)
    }
}

#[derive(Clone)]
pub struct FakeEngine(pub Arc<Mutex<World>>);

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        Ok(self.0.lock().unwrap().images.contains_key(reference))
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .images
            .get(reference)
            .map(|i| i.id.clone()))
    }

    async fn image_parent_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .images
            .get(reference)
            .and_then(|i| i.parent.clone()))
    }

    async fn pull(
        &self,
        reference: &str,
        _creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError> {
        let mut world = self.0.lock().unwrap();
        world.pulls.push(reference.to_string());
        world.images.insert(
            reference.to_string(),
            FakeImage {
                id: format!("sha256:{}", &sha256_hex(&[reference])[..12]),
                parent: None,
                labels: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn build(
        &self,
        from: &str,
        reference: &str,
        recipe: &BuildRecipe,
        keep_failed_container: bool,
    ) -> Result<String, EngineError> {
        let script = recipe.shell_script();
        let (delay, failure, parent) = {
            let mut world = self.0.lock().unwrap();
            let should_fail = world
                .fail_command_containing
                .as_deref()
                .is_some_and(|needle| script.contains(needle));
            let failure = if should_fail {
                Some(if keep_failed_container {
                    EngineError::with_container(
                        format!("build of {reference} failed"),
                        world.next_container(),
                    )
                } else {
                    EngineError::new(format!("build of {reference} failed"))
                })
            } else {
                None
            };
            let parent = world.images.get(from).map(|i| i.id.clone());
            (world.build_delay, failure, parent)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let parent = parent
            .ok_or_else(|| EngineError::new(format!("base image {from} is not present")))?;
        // Deterministic: two builds of the same layer commit the same id.
        let id = format!(
            "sha256:{}",
            &sha256_hex(&[parent.as_str(), reference, script.as_str()])[..12]
        );

        let mut world = self.0.lock().unwrap();
        world.builds.push(reference.to_string());
        world.images.insert(
            reference.to_string(),
            FakeImage {
                id: id.clone(),
                parent: Some(parent),
                labels: recipe.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn run(&self, spec: &RunSpec) -> Result<(), EngineError> {
        let mut world = self.0.lock().unwrap();
        if !world.images.contains_key(&spec.image) {
            return Err(EngineError::new(format!(
                "image {} is not present",
                spec.image
            )));
        }
        world.runs.push(spec.image.clone());
        Ok(())
    }

    async fn run_detached(
        &self,
        _from: &str,
        _recipe: &BuildRecipe,
    ) -> Result<String, EngineError> {
        Ok(self.0.lock().unwrap().next_container())
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<(), EngineError> {
        let mut world = self.0.lock().unwrap();
        let image = world
            .images
            .get(src)
            .cloned()
            .ok_or_else(|| EngineError::new(format!("image {src} is not present")))?;
        world.images.insert(dst.to_string(), image);
        Ok(())
    }

    async fn push(
        &self,
        reference: &str,
        _creds: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError> {
        let mut world = self.0.lock().unwrap();
        let image = world
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::new(format!("image {reference} is not present")))?;
        world.pushes.push(reference.to_string());

        let (repo, tag) = match reference.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (reference.to_string(), "latest".to_string()),
        };
        let tags = world.remote_tags.entry(repo).or_default();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
        if let Some(parent) = image.parent {
            world.remote_parents.insert(reference.to_string(), parent);
        }
        Ok(())
    }

    async fn remove_tag(&self, reference: &str) -> Result<(), EngineError> {
        self.0.lock().unwrap().images.remove(reference);
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeRegistry(pub Arc<Mutex<World>>);

#[async_trait]
impl DockerRegistry for FakeRegistry {
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .remote_tags
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    async fn image_parent_id(&self, reference: &str) -> Result<String, RegistryError> {
        self.0
            .lock()
            .unwrap()
            .remote_parents
            .get(reference)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                what: "manifest",
                reference: reference.to_string(),
            })
    }
}

/// A project on disk plus the fake collaborators a Conveyor needs.
pub struct TestProject {
    pub dir: TempDir,
    pub world: Arc<Mutex<World>>,
    pub config: WerfConfig,
    locks_dir: PathBuf,
}

impl TestProject {
    pub fn new(config_yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("werf.yml"), config_yaml).unwrap();
        let config = werf::config::parse_str(config_yaml, "werf.yml").unwrap();
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(&locks_dir).unwrap();
        Self {
            dir,
            world: World::shared(),
            config,
            locks_dir,
        }
    }

    /// A fresh Conveyor over this project's shared world, as a new
    /// invocation would construct it.
    pub fn conveyor(&self) -> Conveyor {
        self.conveyor_for_images(&[])
    }

    pub fn conveyor_for_images(&self, images: &[String]) -> Conveyor {
        let tmp_dir = self.dir.path().join("tmp");
        let build_dir = self.dir.path().join("build");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        std::fs::create_dir_all(&build_dir).unwrap();

        let ctx = ConveyorContext {
            project_name: "testproj".to_string(),
            project_dir: self.dir.path().to_path_buf(),
            build_dir,
            tmp_dir,
            ssh_auth_sock: None,
            engine: Arc::new(FakeEngine(Arc::clone(&self.world))),
            registry: Arc::new(FakeRegistry(Arc::clone(&self.world))),
            authorizer: DockerAuthorizer::new(
                &CredentialOptions::default(),
                None,
                &AuthEnv::default(),
            ),
            locks: Arc::new(LockManager::new(self.locks_dir.clone())),
        };
        Conveyor::new(&self.config, images, ctx).unwrap()
    }

    pub fn builds(&self) -> Vec<String> {
        self.world.lock().unwrap().builds.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.world.lock().unwrap().pulls.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.world.lock().unwrap().pushes.clone()
    }
}
