//! # packsmith-builder
//!
//! Creates buildpack builder images from a `builder.toml` description.
//!
//! A run goes through these stages, in order:
//! - the policy gate checks flags, then the parsed configuration
//! - the order validator checks detection groups against declared modules
//! - the resolver fetches every module under the pull policy
//! - the assembler lays the modules over the base image and hands the result
//!   to the image store or registry
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use packsmith_builder::client::{RegistryIndex, StoreClient};
//! use packsmith_builder::{BuilderCreator, CreateFlags, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StoreClient::open(std::path::Path::new("/var/lib/packsmith/store"))?;
//! let lookup = RegistryIndex::new(reqwest::Client::new());
//! let creator = BuilderCreator::new(Arc::new(client), Arc::new(lookup), Settings::default());
//!
//! let outcome = creator
//!     .create(&CreateFlags {
//!         image_name: "example/builder".to_string(),
//!         config_path: Some("builder.toml".into()),
//!         ..CreateFlags::default()
//!     })
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("{}", outcome.digest);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod assemble;
pub mod cli;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod module;
pub mod order;
pub mod pipeline;
pub mod policy;
pub mod resolve;
pub mod settings;

pub use assemble::{AssembledImage, BuilderAssembler};
pub use config::BuilderConfig;
pub use diagnostics::{Diagnostics, Finding, Severity};
pub use error::{BuilderError, BuilderResult, ConfigError};
pub use pipeline::{BuilderCreator, CancelHandle, CancelToken, CreateFailure, CreateOutcome, cancel_pair};
pub use policy::{CreateFlags, PullPolicy};
pub use settings::Settings;
