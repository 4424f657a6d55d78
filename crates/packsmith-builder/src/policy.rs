//! Flag and feature-gate checks.
//!
//! Everything here runs before any module is fetched, so a bad invocation
//! fails without touching the network.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use packsmith_image::ImageReference;

use crate::config::BuilderConfig;
use crate::error::BuilderError;
use crate::settings::Settings;

/// Default buildpack registry index.
pub const OFFICIAL_REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/buildpacks/registry-index/main";

const REGISTRY_EXPERIMENTAL: &str = "Support for buildpack registries is currently experimental.";
const EXTENSIONS_EXPERIMENTAL: &str =
    "builder config contains image extensions; support for image extensions is currently experimental";

/// When remote images are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Always fetch.
    Always,
    /// Only use what is present locally.
    Never,
    /// Fetch only what is missing locally.
    #[default]
    IfNotPresent,
}

impl FromStr for PullPolicy {
    type Err = BuilderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "if-not-present" => Ok(Self::IfNotPresent),
            other => Err(BuilderError::UnknownPullPolicy {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::IfNotPresent => "if-not-present",
        })
    }
}

/// Flags of `builder create`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateFlags {
    /// Name of the builder image.
    pub image_name: String,
    /// `--config`.
    pub config_path: Option<PathBuf>,
    /// `--publish`.
    pub publish: bool,
    /// `--pull-policy`.
    pub pull_policy: Option<String>,
    /// `--buildpack-registry`.
    pub registry: Option<String>,
}

/// Outcome of the flag checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Builder image reference.
    pub image: ImageReference,
    /// Configuration file.
    pub config_path: PathBuf,
    /// Parsed pull policy.
    pub pull_policy: PullPolicy,
    /// Publish to a registry instead of saving locally.
    pub publish: bool,
    /// Buildpack registry index used for `urn:cnb:registry:` modules.
    pub registry_url: String,
}

/// Applies the flag and feature-gate rules.
#[derive(Debug, Clone, Copy)]
pub struct PolicyGate<'a> {
    settings: &'a Settings,
}

impl<'a> PolicyGate<'a> {
    /// Gate for one run.
    #[must_use]
    pub const fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Check flags before the configuration file is read.
    pub fn check_flags(&self, flags: &CreateFlags) -> Result<PolicyDecision, BuilderError> {
        let pull_policy = match flags
            .pull_policy
            .as_deref()
            .or(self.settings.pull_policy.as_deref())
        {
            Some(value) => value.parse()?,
            None => PullPolicy::default(),
        };

        if flags.publish && pull_policy == PullPolicy::Never {
            return Err(BuilderError::FlagConflict);
        }

        if flags.registry.is_some() && !self.settings.experimental {
            return Err(BuilderError::experimental(REGISTRY_EXPERIMENTAL));
        }

        let Some(config_path) = flags.config_path.clone() else {
            return Err(BuilderError::MissingConfigPath);
        };

        let image = ImageReference::parse(&flags.image_name).map_err(|e| {
            BuilderError::InvalidImageName {
                name: flags.image_name.clone(),
                reason: e.to_string(),
            }
        })?;

        let registry_url = self.registry_url(flags.registry.as_deref())?;

        tracing::debug!(
            image = %image,
            pull_policy = %pull_policy,
            publish = flags.publish,
            registry = %registry_url,
            "Flags accepted"
        );

        Ok(PolicyDecision {
            image,
            config_path,
            pull_policy,
            publish: flags.publish,
            registry_url,
        })
    }

    /// Check experimental gates against a parsed configuration.
    pub fn check_config(&self, config: &BuilderConfig) -> Result<(), BuilderError> {
        if self.settings.experimental {
            return Ok(());
        }
        if config.uses_extensions() {
            return Err(BuilderError::experimental(EXTENSIONS_EXPERIMENTAL));
        }
        if config.uses_registry() {
            return Err(BuilderError::experimental(REGISTRY_EXPERIMENTAL));
        }
        Ok(())
    }

    fn registry_url(&self, requested: Option<&str>) -> Result<String, BuilderError> {
        match requested {
            None | Some("official") => Ok(OFFICIAL_REGISTRY_URL.to_string()),
            Some(name) => {
                if let Some(registry) = self.settings.registry(name) {
                    Ok(registry.url.trim_end_matches('/').to_string())
                } else if name.starts_with("https://") || name.starts_with("http://") {
                    Ok(name.trim_end_matches('/').to_string())
                } else {
                    Err(BuilderError::UnknownRegistry {
                        name: name.to_string(),
                    })
                }
            }
        }
    }
}
