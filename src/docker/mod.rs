pub mod authorizer;
pub mod engine;

pub use authorizer::{AuthEnv, CredentialOptions, DockerAuthorizer, RegistryCredentials};
pub use engine::{BuildRecipe, ContainerEngine, DockerEngine, RunSpec};
