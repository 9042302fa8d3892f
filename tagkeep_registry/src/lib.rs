//! Typed client for the upstream Distribution registry.
//!
//! The cleaner only needs two operations: delete a tag and probe whether a
//! manifest still exists. Both are exposed behind the [`TagRegistry`] trait
//! so the eviction loop can be exercised against in-memory fakes.

use async_trait::async_trait;
use reqwest::{StatusCode, Url, header};
use tracing::debug;

pub mod gc;

pub use gc::{GcRunner, RegistryGc};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A parsed canonical reference `<host>/<repo>:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub host: String,
    pub repo: String,
    pub tag: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefParseError {
    #[error("reference {0:?} has no host segment")]
    MissingHost(String),
    #[error("reference {0:?} has no tag")]
    MissingTag(String),
}

impl Reference {
    /// Parses a canonical name. The host is everything before the first
    /// `/` (it may carry a port, so the tag is split off at the *last*
    /// `:`).
    pub fn parse(canonical: &str) -> Result<Self, RefParseError> {
        let (host, rest) = canonical
            .split_once('/')
            .ok_or_else(|| RefParseError::MissingHost(canonical.to_string()))?;
        let (repo, tag) = rest
            .rsplit_once(':')
            .ok_or_else(|| RefParseError::MissingTag(canonical.to_string()))?;
        if host.is_empty() || repo.is_empty() || tag.is_empty() {
            return Err(RefParseError::MissingTag(canonical.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repo, self.tag)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The tag or manifest is not present upstream.
    #[error("manifest not found")]
    NotFound,
    #[error("registry returned status {0}")]
    Status(StatusCode),
    #[error("registry returned no Docker-Content-Digest for {0}")]
    MissingDigest(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Registry operations used by the eviction loop.
#[async_trait]
pub trait TagRegistry: Send + Sync {
    /// Deletes a tag. `Err(RegistryError::NotFound)` means the tag was
    /// already gone, which callers treat as success.
    async fn tag_delete(&self, reference: &Reference) -> Result<(), RegistryError>;

    /// Whether the manifest for `reference` still exists upstream. Used as
    /// a secondary probe after an unexplained delete failure.
    async fn manifest_exists(&self, reference: &Reference) -> Result<bool, RegistryError>;
}

/// HTTP client against a single upstream registry.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base: Url,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(scheme: &str, host: &str) -> anyhow::Result<Self> {
        let base = Url::parse(&format!("{scheme}://{host}"))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base.as_str().trim_end_matches('/'),
            repo,
            reference
        )
    }
}

#[async_trait]
impl TagRegistry for HttpRegistry {
    /// The Distribution API deletes manifests by digest, so the tag is
    /// first resolved with a HEAD and the returned
    /// `Docker-Content-Digest` is what gets deleted.
    async fn tag_delete(&self, reference: &Reference) -> Result<(), RegistryError> {
        let url = self.manifest_url(&reference.repo, &reference.tag);
        let head = self
            .client
            .head(&url)
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;
        if head.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound);
        }
        if !head.status().is_success() {
            return Err(RegistryError::Status(head.status()));
        }
        let digest = head
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::MissingDigest(reference.to_string()))?
            .to_string();
        debug!(%reference, %digest, "resolved manifest digest");

        let delete = self
            .client
            .delete(self.manifest_url(&reference.repo, &digest))
            .send()
            .await?;
        match delete.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound),
            status if status.is_success() => Ok(()),
            status => Err(RegistryError::Status(status)),
        }
    }

    async fn manifest_exists(&self, reference: &Reference) -> Result<bool, RegistryError> {
        let resp = self
            .client
            .get(self.manifest_url(&reference.repo, &reference.tag))
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(RegistryError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_with_port_and_nested_repo() {
        let r = Reference::parse("127.0.0.1:5000/library/alpine:3.18").unwrap();
        assert_eq!(r.host, "127.0.0.1:5000");
        assert_eq!(r.repo, "library/alpine");
        assert_eq!(r.tag, "3.18");
        assert_eq!(r.to_string(), "127.0.0.1:5000/library/alpine:3.18");
    }

    #[test]
    fn rejects_incomplete_references() {
        assert_eq!(
            Reference::parse("no-host-segment"),
            Err(RefParseError::MissingHost("no-host-segment".to_string()))
        );
        assert!(matches!(
            Reference::parse("registry.example.com/repo-without-tag"),
            Err(RefParseError::MissingTag(_))
        ));
        assert!(matches!(
            Reference::parse("host/:empty"),
            Err(RefParseError::MissingTag(_))
        ));
    }

    #[test]
    fn manifest_url_keeps_nested_repo_segments() {
        let registry = HttpRegistry::new("http", "127.0.0.1:5000").unwrap();
        assert_eq!(
            registry.manifest_url("library/alpine", "3.18"),
            "http://127.0.0.1:5000/v2/library/alpine/manifests/3.18"
        );
    }
}
