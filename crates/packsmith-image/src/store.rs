//! Image store.
//!
//! This module provides local storage for container images in OCI format:
//! content-addressed blobs plus a repository index mapping tags to manifest
//! digests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use packsmith_common::{PackError, PackResult};
use packsmith_oci::{Descriptor, ImageConfig, ImageManifest, sha256_digest};
use serde::{Deserialize, Serialize};

use crate::reference::{ImageReference, ImageTag};

const BLOBS_DIR: &str = "blobs/sha256";
const REPOSITORIES_FILE: &str = "repositories.json";

/// Local image store.
pub struct ImageStore {
    /// Storage root directory.
    root: PathBuf,
    /// Repository index.
    repositories: BTreeMap<String, RepositoryIndex>,
}

/// Tags of one repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RepositoryIndex {
    /// Tag to manifest digest mapping.
    tags: BTreeMap<String, String>,
}

/// An image whose manifest and config are available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// Reference the image was stored or found under.
    pub reference: ImageReference,
    /// Manifest digest.
    pub digest: String,
    /// Parsed manifest.
    pub manifest: ImageManifest,
    /// Parsed config.
    pub config: ImageConfig,
}

/// A layer of an image, paired with its uncompressed digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayer {
    /// Layer descriptor from the manifest.
    pub descriptor: Descriptor,
    /// Diff ID from the config.
    pub diff_id: String,
}

impl LocalImage {
    /// Build from raw manifest and config bytes.
    pub fn from_parts(
        reference: ImageReference,
        manifest_bytes: &[u8],
        config_bytes: &[u8],
    ) -> PackResult<Self> {
        let manifest: ImageManifest = serde_json::from_slice(manifest_bytes)?;
        let config: ImageConfig = serde_json::from_slice(config_bytes)?;
        let actual = sha256_digest(config_bytes);
        if actual != manifest.config.digest {
            return Err(PackError::DigestMismatch {
                expected: manifest.config.digest,
                actual,
            });
        }
        Ok(Self {
            reference,
            digest: sha256_digest(manifest_bytes),
            manifest,
            config,
        })
    }

    /// Layers, base first, with their diff IDs.
    pub fn layers(&self) -> PackResult<Vec<ImageLayer>> {
        let diff_ids = &self.config.rootfs.diff_ids;
        if diff_ids.len() != self.manifest.layers.len() {
            return Err(PackError::Internal {
                message: format!(
                    "{} lists {} layers but {} diff IDs",
                    self.reference,
                    self.manifest.layers.len(),
                    diff_ids.len()
                ),
            });
        }
        Ok(self
            .manifest
            .layers
            .iter()
            .zip(diff_ids)
            .map(|(descriptor, diff_id)| ImageLayer {
                descriptor: descriptor.clone(),
                diff_id: diff_id.clone(),
            })
            .collect())
    }

    /// Total size of config and layers.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.manifest.config.size + self.manifest.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

impl ImageStore {
    /// Open (or create) an image store.
    pub fn new(root: impl Into<PathBuf>) -> PackResult<Self> {
        let root = root.into();

        fs::create_dir_all(root.join(BLOBS_DIR))?;
        let repositories = Self::load_repositories(&root)?;

        Ok(Self { root, repositories })
    }

    fn load_repositories(root: &Path) -> PackResult<BTreeMap<String, RepositoryIndex>> {
        let path = root.join(REPOSITORIES_FILE);

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(BTreeMap::new())
        }
    }

    fn save_repositories(&self) -> PackResult<()> {
        let path = self.root.join(REPOSITORIES_FILE);
        let content = serde_json::to_string_pretty(&self.repositories)?;
        // Write-then-rename so a crash never leaves a truncated index.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Save an image to the store.
    ///
    /// `layers` must be given in manifest order; each is verified against
    /// its descriptor digest before the tag is recorded.
    pub fn save(
        &mut self,
        reference: &ImageReference,
        manifest_bytes: &[u8],
        config_bytes: &[u8],
        layers: &[Bytes],
    ) -> PackResult<LocalImage> {
        tracing::info!(reference = %reference, "Saving image to store");

        let image = LocalImage::from_parts(reference.clone(), manifest_bytes, config_bytes)?;
        if image.manifest.layers.len() != layers.len() {
            return Err(PackError::Internal {
                message: format!(
                    "manifest for {reference} lists {} layers, {} supplied",
                    image.manifest.layers.len(),
                    layers.len()
                ),
            });
        }

        for (descriptor, data) in image.manifest.layers.iter().zip(layers) {
            let digest = self.store_blob(data)?;
            if digest != descriptor.digest {
                return Err(PackError::DigestMismatch {
                    expected: descriptor.digest.clone(),
                    actual: digest,
                });
            }
        }
        self.store_blob(config_bytes)?;
        self.store_blob(manifest_bytes)?;

        if let ImageTag::Tag(tag) = &reference.reference {
            self.repositories
                .entry(reference.name())
                .or_default()
                .tags
                .insert(tag.clone(), image.digest.clone());
            self.save_repositories()?;
        }

        tracing::info!(
            reference = %reference,
            digest = %image.digest,
            layers = layers.len(),
            size = image.size(),
            "Image saved"
        );

        Ok(image)
    }

    /// Load an image from the store.
    ///
    /// Returns `None` when the reference is unknown or any of its manifest,
    /// config or layer blobs is missing.
    pub fn load(&self, reference: &ImageReference) -> PackResult<Option<LocalImage>> {
        tracing::debug!(reference = %reference, "Loading image from store");

        let digest = match &reference.reference {
            ImageTag::Digest(d) => d.clone(),
            ImageTag::Tag(tag) => match self
                .repositories
                .get(&reference.name())
                .and_then(|index| index.tags.get(tag))
            {
                Some(d) => d.clone(),
                None => return Ok(None),
            },
        };

        let Some(manifest_bytes) = self.get_blob(&digest)? else {
            return Ok(None);
        };
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let Some(config_bytes) = self.get_blob(&manifest.config.digest)? else {
            return Ok(None);
        };
        if manifest.layers.iter().any(|l| !self.has_blob(&l.digest)) {
            tracing::debug!(reference = %reference, "Image has missing layers");
            return Ok(None);
        }

        LocalImage::from_parts(reference.clone(), &manifest_bytes, &config_bytes).map(Some)
    }

    /// Store a blob and return its digest.
    pub fn store_blob(&self, data: &[u8]) -> PackResult<String> {
        let digest = sha256_digest(data);
        let blob_path = self.blob_path(&digest);

        if !blob_path.exists() {
            if let Some(parent) = blob_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = blob_path.with_extension("partial");
            fs::write(&tmp, data)?;
            fs::rename(&tmp, &blob_path)?;
            tracing::debug!(digest = %digest, size = data.len(), "Blob stored");
        }

        Ok(digest)
    }

    /// Get a blob by digest.
    pub fn get_blob(&self, digest: &str) -> PackResult<Option<Bytes>> {
        let blob_path = self.blob_path(digest);

        if blob_path.exists() {
            Ok(Some(Bytes::from(fs::read(&blob_path)?)))
        } else {
            Ok(None)
        }
    }

    /// Check if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join(BLOBS_DIR).join(hash)
    }
}

#[cfg(test)]
mod tests {
    use packsmith_oci::image::{ExecutionConfig, RootFs};
    use packsmith_oci::media_types;

    use super::*;

    fn image_parts(layer: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let config = ImageConfig {
            architecture: "amd64".into(),
            os: "linux".into(),
            config: Some(ExecutionConfig::default()),
            rootfs: RootFs {
                fs_type: "layers".into(),
                diff_ids: vec![sha256_digest(layer)],
            },
            ..ImageConfig::default()
        };
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let manifest = ImageManifest::new(
            Descriptor::for_blob(media_types::CONFIG, &config_bytes),
            vec![Descriptor::for_blob(media_types::LAYER_TAR, layer)],
        );
        (serde_json::to_vec(&manifest).unwrap(), config_bytes)
    }

    #[test]
    fn test_store_blob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp_dir.path()).unwrap();

        let data = b"hello world";
        let digest = store.store_blob(data).unwrap();

        assert!(digest.starts_with("sha256:"));
        assert!(store.has_blob(&digest));
        assert_eq!(store.get_blob(&digest).unwrap().unwrap(), &data[..]);
    }

    #[test]
    fn save_then_load_by_tag_and_digest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = ImageStore::new(temp_dir.path()).unwrap();
        let reference = ImageReference::parse("example.com/stacks/build:1").unwrap();
        let (manifest, config) = image_parts(b"base layer");

        let saved = store
            .save(&reference, &manifest, &config, &[Bytes::from_static(b"base layer")])
            .unwrap();
        let loaded = store.load(&reference).unwrap().unwrap();
        assert_eq!(saved, loaded);
        assert_eq!(loaded.layers().unwrap().len(), 1);

        let by_digest =
            ImageReference::parse(&format!("example.com/stacks/build@{}", saved.digest)).unwrap();
        assert_eq!(store.load(&by_digest).unwrap().unwrap().digest, saved.digest);

        // The index survives reopening.
        let reopened = ImageStore::new(temp_dir.path()).unwrap();
        assert!(reopened.load(&reference).unwrap().is_some());
    }

    #[test]
    fn save_rejects_tampered_layer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = ImageStore::new(temp_dir.path()).unwrap();
        let reference = ImageReference::parse("example.com/stacks/build:1").unwrap();
        let (manifest, config) = image_parts(b"base layer");

        let err = store
            .save(&reference, &manifest, &config, &[Bytes::from_static(b"other")])
            .unwrap_err();
        assert!(matches!(err, PackError::DigestMismatch { .. }));
        assert!(store.load(&reference).unwrap().is_none());
    }

    #[test]
    fn unknown_reference_is_absent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp_dir.path()).unwrap();
        let reference = ImageReference::parse("alpine:3.19").unwrap();
        assert!(store.load(&reference).unwrap().is_none());
    }
}
