use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use packsmith_common::{PackError, PackResult};
use packsmith_image::{ImageReference, ImageStore, LocalImage, RegistryAuth, RegistryClient};
use packsmith_oci::Platform;
use parking_lot::Mutex;

use super::ImageClient;
use crate::assemble::AssembledImage;

/// [`ImageClient`] backed by the on-disk store and the OCI distribution API.
pub struct StoreClient {
    store: Mutex<ImageStore>,
    http: reqwest::Client,
    platform: Platform,
    auth: Option<RegistryAuth>,
}

impl StoreClient {
    /// Open the store at `root`.
    pub fn open(root: &Path) -> PackResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("packsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PackError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            store: Mutex::new(ImageStore::new(root)?),
            http,
            platform: Platform::host(),
            auth: None,
        })
    }

    /// Credentials for every registry this client talks to.
    #[must_use]
    pub fn with_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }

    fn registry(&self, reference: &ImageReference) -> RegistryClient {
        let client = RegistryClient::for_reference(self.http.clone(), reference);
        match &self.auth {
            Some(auth) => client.with_auth(auth.clone()),
            None => client,
        }
    }
}

#[async_trait]
impl ImageClient for StoreClient {
    async fn find_local(&self, reference: &ImageReference) -> PackResult<Option<LocalImage>> {
        self.store.lock().load(reference)
    }

    async fn pull(&self, reference: &ImageReference) -> PackResult<LocalImage> {
        let pulled = self.registry(reference).pull(reference, &self.platform).await?;
        self.store
            .lock()
            .save(reference, &pulled.manifest, &pulled.config, &pulled.layers)
    }

    async fn read_blob(&self, digest: &str) -> PackResult<Bytes> {
        self.store
            .lock()
            .get_blob(digest)?
            .ok_or_else(|| PackError::BlobNotFound {
                digest: digest.to_string(),
            })
    }

    async fn save(&self, image: &AssembledImage) -> PackResult<String> {
        let saved =
            self.store
                .lock()
                .save(&image.reference, &image.manifest, &image.config, &image.layers)?;
        Ok(saved.digest)
    }

    async fn push(&self, image: &AssembledImage) -> PackResult<String> {
        self.registry(&image.reference)
            .push(&image.reference, &image.manifest, &image.config, &image.layers)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let client = StoreClient::open(temp.path()).unwrap();
        let err = client.read_blob("sha256:abc").await.unwrap_err();
        assert!(matches!(err, PackError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_image_is_absent() {
        let temp = tempfile::tempdir().unwrap();
        let client = StoreClient::open(temp.path()).unwrap();
        let reference = ImageReference::parse("example.com/stacks/build:1").unwrap();
        assert!(client.find_local(&reference).await.unwrap().is_none());
    }
}
