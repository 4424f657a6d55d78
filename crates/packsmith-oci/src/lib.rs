//! # packsmith-oci
//!
//! OCI (Open Container Initiative) image specification types for packsmith.
//!
//! This crate provides Rust types for:
//! - Image manifests, indexes and descriptors
//! - Image configuration
//! - Content digests
//!
//! Every map is ordered so that serializing the same value twice yields the
//! same bytes, and therefore the same digest.

#![warn(missing_docs)]

pub mod digest;
pub mod image;

pub use digest::sha256_digest;
pub use image::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform, media_types};
