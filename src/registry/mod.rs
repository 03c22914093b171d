use async_trait::async_trait;
use serde::Deserialize;

use crate::docker::RegistryCredentials;
use crate::error::RegistryError;

/// Tag prefix under which stage cache layers are published.
pub const DIMGSTAGE_TAG_PREFIX: &str = "dimgstage-";

/// Remote registry collaborator. Network and auth errors are propagated
/// verbatim; each caller decides how to react.
#[async_trait]
pub trait DockerRegistry: Send + Sync {
    /// All tags of a repository. A repository the registry has never seen
    /// yields an empty list, not an error.
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, RegistryError>;

    /// Parent image id recorded for a remote `repo:tag` reference.
    async fn image_parent_id(&self, reference: &str) -> Result<String, RegistryError>;
}

/// Stage-cache tags (`dimgstage-*`) present in a repository.
pub async fn dimgstage_tags(
    registry: &dyn DockerRegistry,
    repo: &str,
) -> Result<Vec<String>, RegistryError> {
    Ok(registry
        .list_tags(repo)
        .await?
        .into_iter()
        .filter(|t| t.starts_with(DIMGSTAGE_TAG_PREFIX))
        .collect())
}

/// Published image tags (everything except the stage cache) in a repository.
pub async fn dimg_tags(
    registry: &dyn DockerRegistry,
    repo: &str,
) -> Result<Vec<String>, RegistryError> {
    Ok(registry
        .list_tags(repo)
        .await?
        .into_iter()
        .filter(|t| !t.starts_with(DIMGSTAGE_TAG_PREFIX))
        .collect())
}

/// Whether a reference points at Google Container Registry.
pub fn is_gcr(reference: &str) -> bool {
    let host = registry_host(reference);
    host == "gcr.io" || host.ends_with(".gcr.io")
}

/// Host component of an image reference. References without an explicit
/// registry host belong to the default registry.
pub fn registry_host(reference: &str) -> &str {
    let first = reference.split('/').next().unwrap_or(reference);
    if first.contains('.') || first.contains(':') || first == "localhost" {
        first
    } else {
        "registry-1.docker.io"
    }
}

fn split_repo(repo: &str) -> (String, String) {
    let host = registry_host(repo);
    let path = repo
        .strip_prefix(host)
        .map(|p| p.trim_start_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or(repo);
    (host.to_string(), path.to_string())
}

fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

/// Registry HTTP API v2 client.
pub struct HttpRegistry {
    client: reqwest::Client,
    creds: Option<RegistryCredentials>,
}

#[derive(Debug, Deserialize)]
struct TagsListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ManifestV1Response {
    #[serde(default)]
    history: Vec<ManifestV1History>,
}

#[derive(Debug, Deserialize)]
struct ManifestV1History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    parent: Option<String>,
}

impl HttpRegistry {
    pub fn new(creds: Option<RegistryCredentials>) -> Self {
        Self {
            client: reqwest::Client::new(),
            creds,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(creds) = &self.creds {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        req
    }
}

#[async_trait]
impl DockerRegistry for HttpRegistry {
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, RegistryError> {
        let (host, path) = split_repo(repo);
        let url = format!("https://{host}/v2/{path}/tags/list");
        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.clone(),
                source,
            })?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(RegistryError::Auth {
                    repo: repo.to_string(),
                    status: response.status().as_u16(),
                })
            }
            404 => return Ok(Vec::new()),
            _ => {}
        }
        let body: TagsListResponse =
            response
                .json()
                .await
                .map_err(|source| RegistryError::Transport {
                    url: url.clone(),
                    source,
                })?;
        Ok(body.tags.unwrap_or_default())
    }

    async fn image_parent_id(&self, reference: &str) -> Result<String, RegistryError> {
        let (repo, tag) = split_reference(reference);
        let (host, path) = split_repo(&repo);
        let url = format!("https://{host}/v2/{path}/manifests/{tag}");
        let response = self
            .request(&url)
            .header(
                reqwest::header::ACCEPT,
                "application/vnd.docker.distribution.manifest.v1+json",
            )
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.clone(),
                source,
            })?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(RegistryError::Auth {
                    repo,
                    status: response.status().as_u16(),
                })
            }
            404 => {
                return Err(RegistryError::NotFound {
                    what: "manifest",
                    reference: reference.to_string(),
                })
            }
            _ => {}
        }
        let manifest: ManifestV1Response =
            response
                .json()
                .await
                .map_err(|source| RegistryError::Transport {
                    url: url.clone(),
                    source,
                })?;

        let top = manifest
            .history
            .first()
            .ok_or_else(|| RegistryError::BadResponse {
                url: url.clone(),
                detail: "manifest has no history entries".to_string(),
            })?;
        let compat: V1Compatibility =
            serde_json::from_str(&top.v1_compatibility).map_err(|e| RegistryError::BadResponse {
                url: url.clone(),
                detail: format!("unparsable v1Compatibility: {e}"),
            })?;
        compat.parent.ok_or_else(|| RegistryError::BadResponse {
            url,
            detail: "v1Compatibility has no parent".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcr_hosts_are_recognised() {
        assert!(is_gcr("gcr.io/acme/app"));
        assert!(is_gcr("eu.gcr.io/acme/app"));
        assert!(!is_gcr("registry.example/acme/app"));
        assert!(!is_gcr("ubuntu"));
        assert!(!is_gcr("notgcr.io/acme/app"));
    }

    #[test]
    fn host_defaults_to_docker_hub() {
        assert_eq!(registry_host("library/alpine"), "registry-1.docker.io");
        assert_eq!(registry_host("registry.local:5000/app"), "registry.local:5000");
        assert_eq!(registry_host("localhost/app"), "localhost");
    }

    #[test]
    fn repo_splits_into_host_and_path() {
        assert_eq!(
            split_repo("registry.example/proj/app"),
            ("registry.example".to_string(), "proj/app".to_string())
        );
    }

    #[test]
    fn reference_splits_tag() {
        assert_eq!(
            split_reference("registry.example/proj:main"),
            ("registry.example/proj".to_string(), "main".to_string())
        );
        assert_eq!(
            split_reference("registry.example:5000/proj"),
            ("registry.example:5000/proj".to_string(), "latest".to_string())
        );
    }

    struct StaticRegistry(Vec<String>);

    #[async_trait]
    impl DockerRegistry for StaticRegistry {
        async fn list_tags(&self, _repo: &str) -> Result<Vec<String>, RegistryError> {
            Ok(self.0.clone())
        }

        async fn image_parent_id(&self, reference: &str) -> Result<String, RegistryError> {
            Err(RegistryError::NotFound {
                what: "manifest",
                reference: reference.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn stage_tags_are_split_from_publish_tags() {
        let registry = StaticRegistry(vec![
            "dimgstage-aaa".to_string(),
            "main".to_string(),
            "dimgstage-bbb".to_string(),
            "v1.2".to_string(),
        ]);
        assert_eq!(
            dimgstage_tags(&registry, "r").await.unwrap(),
            vec!["dimgstage-aaa", "dimgstage-bbb"]
        );
        assert_eq!(dimg_tags(&registry, "r").await.unwrap(), vec!["main", "v1.2"]);
    }
}
