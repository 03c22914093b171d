use thiserror::Error;

/// Dependency-graph failures, raised before any phase runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected involving image '{0}'")]
    Cycle(String),
    #[error("image '{image}' references '{reference}', which is not defined")]
    MissingReference { image: String, reference: String },
}

/// Lock acquisition or release failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to acquire lock '{name}': {source}")]
    Acquire {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timeout acquiring lock '{name}' after {seconds}s")]
    Timeout { name: String, seconds: u64 },
    #[error("unlock of '{name}' which is not held")]
    NotHeld { name: String },
}

/// Container engine build/run/push failures. Carries the failed container id
/// when one was left behind for introspection.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub container_id: Option<String>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            container_id: None,
        }
    }

    pub fn with_container(message: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            container_id: Some(container_id.into()),
        }
    }
}

/// Remote registry transport, auth, or not-found failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry auth failed for {repo}: {status}")]
    Auth { repo: String, status: u16 },
    #[error("{what} not found in registry: {reference}")]
    NotFound { what: &'static str, reference: String },
    #[error("unexpected registry response for {url}: {detail}")]
    BadResponse { url: String, detail: String },
}

/// Process exit code for a failed run, per error kind:
/// 2 for configuration errors, 3 for lock failures, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<crate::config::ConfigError>() || cause.is::<GraphError>() {
            return 2;
        }
        if cause.is::<LockError>() {
            return 3;
        }
    }
    1
}
