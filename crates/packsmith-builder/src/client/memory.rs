use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use packsmith_common::{PackError, PackResult};
use packsmith_image::{ImageReference, Layer, LocalImage};
use packsmith_oci::image::{ExecutionConfig, RootFs};
use packsmith_oci::{Descriptor, ImageConfig, ImageManifest, media_types, sha256_digest};
use parking_lot::Mutex;

use super::{ImageClient, PackageLookup};
use crate::assemble::AssembledImage;

/// An image held by [`MemoryClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    /// Manifest bytes.
    pub manifest: Bytes,
    /// Config bytes.
    pub config: Bytes,
    /// Layer blobs in manifest order.
    pub layers: Vec<Bytes>,
}

impl MemoryImage {
    /// Build an image from layers and labels.
    pub fn new(layers: Vec<Layer>, labels: BTreeMap<String, String>) -> PackResult<Self> {
        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: Some(ExecutionConfig {
                labels,
                ..ExecutionConfig::default()
            }),
            rootfs: RootFs {
                diff_ids: layers.iter().map(|l| l.digest.clone()).collect(),
                ..RootFs::default()
            },
            ..ImageConfig::default()
        };
        let config = Bytes::from(serde_json::to_vec(&config)?);
        let manifest = ImageManifest::new(
            Descriptor::for_blob(media_types::CONFIG, &config),
            layers
                .iter()
                .map(|l| Descriptor::for_blob(media_types::LAYER_TAR, &l.data))
                .collect(),
        );
        Ok(Self {
            manifest: Bytes::from(serde_json::to_vec(&manifest)?),
            config,
            layers: layers.into_iter().map(|l| l.data).collect(),
        })
    }

    /// Manifest digest.
    #[must_use]
    pub fn digest(&self) -> String {
        sha256_digest(&self.manifest)
    }

    fn to_local(&self, reference: &ImageReference) -> PackResult<LocalImage> {
        LocalImage::from_parts(reference.clone(), &self.manifest, &self.config)
    }
}

#[derive(Default)]
struct MemoryState {
    local: BTreeMap<ImageReference, MemoryImage>,
    remote: BTreeMap<ImageReference, MemoryImage>,
    blobs: HashMap<String, Bytes>,
    failures: HashMap<ImageReference, VecDeque<PackError>>,
    delays: HashMap<ImageReference, Duration>,
    pulls: Vec<ImageReference>,
    saved: Vec<AssembledImage>,
    pushed: Vec<AssembledImage>,
}

impl MemoryState {
    fn keep_local(&mut self, reference: &ImageReference, image: MemoryImage) {
        for blob in image.layers.iter().chain([&image.config, &image.manifest]) {
            self.blobs.insert(sha256_digest(blob), blob.clone());
        }
        self.local.insert(reference.clone(), image);
    }
}

/// In-memory [`ImageClient`].
///
/// Holds separate "local" and "remote" image sets, records every pull, save
/// and push, and can inject pull failures and delays per reference.
#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<MemoryState>,
}

impl MemoryClient {
    /// Empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an image available for pulling.
    pub fn add_remote(&self, reference: &ImageReference, image: MemoryImage) {
        self.state.lock().remote.insert(reference.clone(), image);
    }

    /// Make an image present locally.
    pub fn add_local(&self, reference: &ImageReference, image: MemoryImage) {
        self.state.lock().keep_local(reference, image);
    }

    /// Fail the next pulls of `reference` with `errors`, in order.
    pub fn fail_pulls(&self, reference: &ImageReference, errors: Vec<PackError>) {
        self.state
            .lock()
            .failures
            .entry(reference.clone())
            .or_default()
            .extend(errors);
    }

    /// Delay every pull of `reference`.
    pub fn delay_pulls(&self, reference: &ImageReference, delay: Duration) {
        self.state.lock().delays.insert(reference.clone(), delay);
    }

    /// Drop a locally held blob. The image listing it stays visible.
    pub fn remove_blob(&self, digest: &str) {
        self.state.lock().blobs.remove(digest);
    }

    /// Pull attempts of `reference`, failed ones included.
    #[must_use]
    pub fn pull_count(&self, reference: &ImageReference) -> usize {
        self.state
            .lock()
            .pulls
            .iter()
            .filter(|r| *r == reference)
            .count()
    }

    /// Pull attempts across all references.
    #[must_use]
    pub fn total_pulls(&self) -> usize {
        self.state.lock().pulls.len()
    }

    /// Images saved so far.
    #[must_use]
    pub fn saved(&self) -> Vec<AssembledImage> {
        self.state.lock().saved.clone()
    }

    /// Images pushed so far.
    #[must_use]
    pub fn pushed(&self) -> Vec<AssembledImage> {
        self.state.lock().pushed.clone()
    }
}

#[async_trait]
impl ImageClient for MemoryClient {
    async fn find_local(&self, reference: &ImageReference) -> PackResult<Option<LocalImage>> {
        self.state
            .lock()
            .local
            .get(reference)
            .map(|image| image.to_local(reference))
            .transpose()
    }

    async fn pull(&self, reference: &ImageReference) -> PackResult<LocalImage> {
        let delay = {
            let mut state = self.state.lock();
            state.pulls.push(reference.clone());
            if let Some(err) = state
                .failures
                .get_mut(reference)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            state.delays.get(reference).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let image = state
            .remote
            .get(reference)
            .cloned()
            .ok_or_else(|| PackError::ImageNotFound {
                reference: reference.to_string(),
            })?;
        let local = image.to_local(reference)?;
        state.keep_local(reference, image);
        Ok(local)
    }

    async fn read_blob(&self, digest: &str) -> PackResult<Bytes> {
        self.state
            .lock()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| PackError::BlobNotFound {
                digest: digest.to_string(),
            })
    }

    async fn save(&self, image: &AssembledImage) -> PackResult<String> {
        let mut state = self.state.lock();
        state.keep_local(
            &image.reference,
            MemoryImage {
                manifest: image.manifest.clone(),
                config: image.config.clone(),
                layers: image.layers.clone(),
            },
        );
        state.saved.push(image.clone());
        Ok(image.digest.clone())
    }

    async fn push(&self, image: &AssembledImage) -> PackResult<String> {
        let mut state = self.state.lock();
        state.remote.insert(
            image.reference.clone(),
            MemoryImage {
                manifest: image.manifest.clone(),
                config: image.config.clone(),
                layers: image.layers.clone(),
            },
        );
        state.pushed.push(image.clone());
        Ok(image.digest.clone())
    }
}

/// In-memory [`PackageLookup`].
#[derive(Default)]
pub struct MemoryLookup {
    packages: Mutex<BTreeMap<(String, String), ImageReference>>,
    lookups: Mutex<Vec<String>>,
}

impl MemoryLookup {
    /// Empty lookup.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package version.
    pub fn insert(&self, id: &str, version: &str, reference: ImageReference) {
        self.packages
            .lock()
            .insert((id.to_string(), version.to_string()), reference);
    }

    /// Registry URLs consulted so far.
    #[must_use]
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl PackageLookup for MemoryLookup {
    async fn lookup(
        &self,
        registry_url: &str,
        id: &str,
        version: Option<&str>,
    ) -> PackResult<ImageReference> {
        self.lookups.lock().push(registry_url.to_string());
        let packages = self.packages.lock();
        let found = match version {
            Some(version) => packages.get(&(id.to_string(), version.to_string())),
            None => packages
                .iter()
                .filter(|((pid, _), _)| pid == id)
                .max_by(|((_, a), _), ((_, b), _)| super::index::compare_versions(a, b))
                .map(|(_, reference)| reference),
        };
        found.cloned().ok_or_else(|| PackError::ImageNotFound {
            reference: format!(
                "urn:cnb:registry:{id}{}",
                version.map(|v| format!("@{v}")).unwrap_or_default()
            ),
        })
    }
}
