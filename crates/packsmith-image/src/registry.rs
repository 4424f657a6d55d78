use std::collections::HashMap;

use bytes::Bytes;
use packsmith_common::{PackError, PackResult};
use packsmith_oci::{ImageIndex, ImageManifest, Platform, media_types, sha256_digest};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;

use crate::reference::ImageReference;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// Credentials for one registry, supplied by the caller.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

/// An image fetched from a registry, as raw blobs.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Manifest bytes, exactly as served.
    pub manifest: Bytes,
    /// Config blob.
    pub config: Bytes,
    /// Layer blobs in manifest order.
    pub layers: Vec<Bytes>,
}

/// OCI distribution client for a single registry.
///
/// A client caches the bearer token of the last authentication, so one
/// client should be used per pull or push.
pub struct RegistryClient {
    client: Client,
    base_url: String,
    registry: String,
    auth: Option<RegistryAuth>,
    token: Option<String>,
    basic: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

impl RegistryClient {
    /// Create a client for a registry API base URL.
    pub fn new(client: Client, base_url: impl Into<String>, registry: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            registry: registry.into(),
            auth: None,
            token: None,
            basic: false,
        }
    }

    /// Create a client for the registry hosting `reference`.
    pub fn for_reference(client: Client, reference: &ImageReference) -> Self {
        Self::new(client, reference.registry_url(), reference.registry.clone())
    }

    /// Set authentication.
    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Pull manifest, config and layers of an image.
    ///
    /// Multi-platform indexes are narrowed to `platform`.
    pub async fn pull(
        &mut self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> PackResult<PulledImage> {
        tracing::info!(reference = %reference, "Pulling image");

        let (mut manifest_bytes, mut media_type) = self
            .get_manifest(reference, reference.tag_or_digest())
            .await?;

        if media_type == media_types::INDEX || media_type == media_types::DOCKER_INDEX {
            let index: ImageIndex = serde_json::from_slice(&manifest_bytes)?;
            let descriptor =
                index
                    .manifest_for(platform)
                    .ok_or_else(|| PackError::ImageNotFound {
                        reference: format!(
                            "{reference} for {}/{}",
                            platform.os, platform.architecture
                        ),
                    })?;
            let digest = descriptor.digest.clone();
            (manifest_bytes, media_type) = self.get_manifest(reference, &digest).await?;
        }
        ensure_image_manifest(reference, &media_type)?;

        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let repository = reference.repository.as_str();
        let config = self.get_blob(repository, &manifest.config.digest).await?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (i, layer) in manifest.layers.iter().enumerate() {
            layers.push(self.get_blob(repository, &layer.digest).await?);
            tracing::debug!(
                layer = i + 1,
                total = manifest.layers.len(),
                digest = %layer.digest,
                "Layer downloaded"
            );
        }

        Ok(PulledImage {
            manifest: manifest_bytes,
            config,
            layers,
        })
    }

    /// Push config, layers and manifest; returns the manifest digest.
    ///
    /// Blobs already present in the repository are skipped. The manifest is
    /// written last, so a failed push never leaves a tag pointing at an
    /// incomplete image.
    pub async fn push(
        &mut self,
        reference: &ImageReference,
        manifest: &Bytes,
        config: &Bytes,
        layers: &[Bytes],
    ) -> PackResult<String> {
        tracing::info!(reference = %reference, layers = layers.len(), "Pushing image");
        let repository = reference.repository.as_str();

        for blob in layers.iter().chain(std::iter::once(config)) {
            let digest = sha256_digest(blob);
            if self.blob_exists(repository, &digest).await? {
                tracing::debug!(digest = %digest, "Blob already present");
                continue;
            }
            self.upload_blob(repository, &digest, blob.clone()).await?;
        }

        self.put_manifest(reference, manifest.clone()).await
    }

    /// Fetch a manifest; returns its bytes and media type.
    pub async fn get_manifest(
        &mut self,
        reference: &ImageReference,
        tag_or_digest: &str,
    ) -> PackResult<(Bytes, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, reference.repository, tag_or_digest
        );
        tracing::debug!(url = %url, "Getting manifest");

        let response = self
            .send(&reference.repository, "pull", |c| {
                c.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PackError::ImageNotFound {
                    reference: reference.to_string(),
                });
            }
            s => return Err(status_error(s, "manifest request")),
        }

        let declared_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let body = response.bytes().await.map_err(transport_error)?;

        let media_type = match declared_type {
            Some(t) if !t.is_empty() && t != "application/json" => t,
            _ => sniff_media_type(&body)?,
        };

        if tag_or_digest.starts_with("sha256:") {
            verify(tag_or_digest, &body)?;
        }

        Ok((body, media_type))
    }

    /// Fetch a blob and verify its digest.
    pub async fn get_blob(&mut self, repository: &str, digest: &str) -> PackResult<Bytes> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, digest);
        tracing::debug!(url = %url, "Getting blob");

        let response = self.send(repository, "pull", |c| c.get(&url)).await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PackError::BlobNotFound {
                    digest: digest.to_string(),
                });
            }
            s => return Err(status_error(s, "blob request")),
        }

        let body = response.bytes().await.map_err(transport_error)?;
        verify(digest, &body)?;
        Ok(body)
    }

    async fn blob_exists(&mut self, repository: &str, digest: &str) -> PackResult<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, digest);
        let response = self
            .send(repository, "pull,push", |c| c.head(&url))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(s, "blob check")),
        }
    }

    async fn upload_blob(&mut self, repository: &str, digest: &str, data: Bytes) -> PackResult<()> {
        let start = format!("{}/v2/{}/blobs/uploads/", self.base_url, repository);
        let response = self
            .send(repository, "pull,push", |c| c.post(&start))
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(status_error(response.status(), "upload start"));
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PackError::Registry {
                status: response.status().as_u16(),
                message: "upload response has no Location header".to_string(),
            })?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{}", self.base_url, location)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let url = format!("{location}{separator}digest={digest}");

        let response = self
            .send(repository, "pull,push", |c| {
                c.put(&url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "blob upload"));
        }

        tracing::debug!(digest = %digest, size = data.len(), "Blob uploaded");
        Ok(())
    }

    async fn put_manifest(&mut self, reference: &ImageReference, manifest: Bytes) -> PackResult<String> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url,
            reference.repository,
            reference.tag_or_digest()
        );
        let digest = sha256_digest(&manifest);

        let response = self
            .send(&reference.repository, "pull,push", |c| {
                c.put(&url)
                    .header(header::CONTENT_TYPE, media_types::MANIFEST)
                    .body(manifest.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "manifest upload"));
        }

        tracing::info!(reference = %reference, digest = %digest, "Manifest pushed");
        Ok(digest)
    }

    /// Send a request, authenticating at most once on a 401 challenge.
    async fn send<F>(&mut self, repository: &str, actions: &str, build: F) -> PackResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut challenged = false;
        loop {
            let mut request = build(&self.client);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            } else if let (true, Some(auth)) = (self.basic, &self.auth) {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }

            let response = request.send().await.map_err(transport_error)?;
            match response.status() {
                StatusCode::UNAUTHORIZED if !challenged => {
                    challenged = true;
                    self.authenticate(repository, actions, &response).await?;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(PackError::Unauthorized {
                        registry: self.registry.clone(),
                    });
                }
                _ => return Ok(response),
            }
        }
    }

    async fn authenticate(
        &mut self,
        repository: &str,
        actions: &str,
        response: &Response,
    ) -> PackResult<()> {
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PackError::Unauthorized {
                registry: self.registry.clone(),
            })?;

        tracing::debug!(header = challenge, "Authenticating");

        if challenge.starts_with("Basic") {
            if self.auth.is_none() {
                return Err(PackError::Unauthorized {
                    registry: self.registry.clone(),
                });
            }
            self.basic = true;
            return Ok(());
        }

        let params = parse_challenge(challenge);
        let realm = params.get("realm").ok_or_else(|| PackError::Registry {
            status: 401,
            message: "Missing realm in Www-Authenticate".to_string(),
        })?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:{actions}"));

        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        let mut request = self.client.get(realm).query(&query);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let token_response = request.send().await.map_err(transport_error)?;
        match token_response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PackError::Unauthorized {
                    registry: self.registry.clone(),
                });
            }
            s => return Err(status_error(s, "token request")),
        }

        let token: TokenResponse = token_response.json().await.map_err(transport_error)?;
        self.token = Some(token.token.or(token.access_token).ok_or_else(|| {
            PackError::Registry {
                status: 200,
                message: "No token in response".to_string(),
            }
        })?);

        Ok(())
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    challenge
        .trim_start_matches("Bearer")
        .trim()
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

fn ensure_image_manifest(reference: &ImageReference, media_type: &str) -> PackResult<()> {
    if ImageManifest::is_manifest_media_type(media_type) {
        Ok(())
    } else {
        Err(PackError::UnsupportedMediaType {
            reference: reference.to_string(),
            media_type: media_type.to_string(),
        })
    }
}

fn sniff_media_type(body: &[u8]) -> PackResult<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
    }

    let probe: Probe = serde_json::from_slice(body)?;
    Ok(match (probe.media_type, probe.manifests) {
        (Some(t), _) => t,
        (None, Some(_)) => media_types::INDEX.to_string(),
        (None, None) => media_types::MANIFEST.to_string(),
    })
}

fn verify(expected: &str, body: &[u8]) -> PackResult<()> {
    let actual = sha256_digest(body);
    if actual == expected {
        Ok(())
    } else {
        Err(PackError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

fn transport_error(err: reqwest::Error) -> PackError {
    if err.is_timeout() {
        PackError::Timeout {
            operation: err
                .url()
                .map_or_else(|| "registry request".to_string(), ToString::to_string),
        }
    } else if err.is_decode() {
        PackError::Serialization(err.to_string())
    } else {
        PackError::Network {
            message: err.to_string(),
        }
    }
}

fn status_error(status: StatusCode, what: &str) -> PackError {
    PackError::Registry {
        status: status.as_u16(),
        message: format!("{what} failed: {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parsing() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
    }

    #[test]
    fn media_type_sniffing() {
        assert_eq!(
            sniff_media_type(br#"{"schemaVersion":2,"manifests":[]}"#).unwrap(),
            media_types::INDEX
        );
        assert_eq!(
            sniff_media_type(br#"{"schemaVersion":2,"config":{}}"#).unwrap(),
            media_types::MANIFEST
        );
        assert_eq!(
            sniff_media_type(
                br#"{"mediaType":"application/vnd.docker.distribution.manifest.list.v2+json"}"#
            )
            .unwrap(),
            media_types::DOCKER_INDEX
        );
    }

    #[test]
    fn only_image_manifests_are_pulled() {
        let reference = ImageReference::parse("registry.example.com/builder:1").unwrap();
        assert!(ensure_image_manifest(&reference, media_types::MANIFEST).is_ok());
        assert!(ensure_image_manifest(&reference, media_types::DOCKER_MANIFEST).is_ok());

        let err = ensure_image_manifest(&reference, media_types::INDEX).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedMediaType { .. }));
        let err = ensure_image_manifest(
            &reference,
            "application/vnd.docker.distribution.manifest.v1+prettyjws",
        )
        .unwrap_err();
        assert!(err.to_string().contains("manifest.v1+prettyjws"));
        assert!(!err.is_transient());
    }

    #[test]
    fn status_errors_classify() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "x").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "x").is_transient());
    }

    #[test]
    fn digest_verification() {
        let digest = sha256_digest(b"blob");
        assert!(verify(&digest, b"blob").is_ok());
        assert!(matches!(
            verify(&digest, b"other"),
            Err(PackError::DigestMismatch { .. })
        ));
    }
}
