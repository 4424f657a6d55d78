//! # packsmith-common
//!
//! Shared utilities and types for packsmith.
//!
//! This crate provides common functionality used across all packsmith crates:
//! - Standard filesystem paths (data root, image store, staging)
//! - Common error types shared by the image store, registry client and
//!   builder pipeline

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{PackError, PackResult};
pub use paths::PackPaths;
