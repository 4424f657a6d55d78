//! # packsmith-image
//!
//! Container image plumbing for packsmith.
//!
//! This crate provides:
//! - Image reference parsing
//! - Deterministic layer tarballs
//! - A local content-addressed image store
//! - An OCI distribution registry client

#![warn(missing_docs)]

pub mod layer;
pub mod reference;
/// Image registry client.
pub mod registry;
/// Local image store.
pub mod store;

pub use layer::{Layer, LayerWriter};
pub use reference::ImageReference;
pub use registry::{PulledImage, RegistryAuth, RegistryClient};
pub use store::{ImageStore, LocalImage};
