//! Collaborators the pipeline talks to: the image store and the buildpack
//! registry lookup.
//!
//! The pipeline only depends on the traits here. [`StoreClient`] and
//! [`RegistryIndex`] are the real implementations; [`MemoryClient`] and
//! [`MemoryLookup`] are in-memory fakes with the same call contracts.

mod index;
mod memory;
mod store;

use async_trait::async_trait;
use bytes::Bytes;
use packsmith_common::PackResult;
use packsmith_image::{ImageReference, LocalImage};

pub use index::RegistryIndex;
pub use memory::{MemoryClient, MemoryImage, MemoryLookup};
pub use store::StoreClient;

use crate::assemble::AssembledImage;

/// Image store and registry client.
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Image present locally, if any. Never touches the network.
    async fn find_local(&self, reference: &ImageReference) -> PackResult<Option<LocalImage>>;

    /// Fetch an image from its registry and keep it locally.
    async fn pull(&self, reference: &ImageReference) -> PackResult<LocalImage>;

    /// Read a locally held blob.
    async fn read_blob(&self, digest: &str) -> PackResult<Bytes>;

    /// Save an image locally; returns the manifest digest.
    async fn save(&self, image: &AssembledImage) -> PackResult<String>;

    /// Publish an image to its registry; returns the manifest digest.
    async fn push(&self, image: &AssembledImage) -> PackResult<String>;
}

/// Maps registry package ids to image references.
#[async_trait]
pub trait PackageLookup: Send + Sync {
    /// Resolve `id` (and `version`, or the latest when absent) in the index at
    /// `registry_url`.
    async fn lookup(
        &self,
        registry_url: &str,
        id: &str,
        version: Option<&str>,
    ) -> PackResult<ImageReference>;
}
