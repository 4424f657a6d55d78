//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use packsmith_common::{PackError, PackResult};
use packsmith_oci::digest::split_digest;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Registry hostname (with port, if any).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` -> pinned by digest
    ///
    /// # Errors
    ///
    /// Returns [`PackError::InvalidReference`] for empty names, upper-case
    /// repositories, empty tags and malformed digests.
    pub fn parse(input: &str) -> PackResult<Self> {
        let trimmed = input.trim();
        let invalid = |reason: &str| PackError::InvalidReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name, reference) = if let Some((name, digest)) = trimmed.split_once('@') {
            if split_digest(digest).is_none() {
                return Err(invalid("digest must be sha256 followed by 64 hex characters"));
            }
            (name, ImageTag::Digest(digest.to_string()))
        } else {
            match trimmed.rfind(':') {
                // A colon before the last slash belongs to a registry port.
                Some(idx) if !trimmed[idx + 1..].contains('/') => {
                    let tag = &trimmed[idx + 1..];
                    if tag.is_empty() {
                        return Err(invalid("tag is empty"));
                    }
                    (&trimmed[..idx], ImageTag::Tag(tag.to_string()))
                }
                _ => (trimmed, ImageTag::Tag(Self::DEFAULT_TAG.to_string())),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("repository path has an empty component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Tag or digest string, without separator.
    #[must_use]
    pub fn tag_or_digest(&self) -> &str {
        match &self.reference {
            ImageTag::Tag(t) | ImageTag::Digest(t) => t,
        }
    }

    /// Repository qualified by its registry, without tag or digest.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Base URL of the registry API.
    ///
    /// Docker Hub is served from `registry-1.docker.io`; loopback registries
    /// are spoken to over plain HTTP.
    #[must_use]
    pub fn registry_url(&self) -> String {
        if self.registry == Self::DEFAULT_REGISTRY {
            return "https://registry-1.docker.io".to_string();
        }
        let host = self.registry.split(':').next().unwrap_or_default();
        if host == "localhost" || host == "127.0.0.1" {
            format!("http://{}", self.registry)
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
