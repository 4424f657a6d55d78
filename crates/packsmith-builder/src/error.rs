//! Builder pipeline errors.

use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use packsmith_common::PackError;
use thiserror::Error;

/// Result type alias using [`BuilderError`].
pub type BuilderResult<T> = Result<T, BuilderError>;

/// Errors raised while reading a builder configuration document.
#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    /// The document is not well-formed.
    #[error("invalid builder config syntax at line {line}, column {column}: {message}")]
    #[diagnostic(code(packsmith::config::syntax))]
    Syntax {
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
        /// Parser message.
        message: String,
    },

    /// The document is well-formed but has the wrong shape.
    #[error("invalid builder config: {message}")]
    #[diagnostic(code(packsmith::config::schema))]
    Schema {
        /// What is missing or malformed.
        message: String,
    },

    /// The document could not be read.
    #[error("reading builder config '{}': {source}", path.display())]
    #[diagnostic(code(packsmith::config::read))]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Why a module could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionReason {
    /// Content does not exist where the reference points.
    NotFound(String),
    /// The registry refused the supplied credentials.
    Unauthorized(String),
    /// Transient failures persisted past the attempt ceiling.
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        last: String,
    },
    /// Content exists but is not a usable module.
    InvalidContent(String),
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(detail) => write!(f, "not found: {detail}"),
            Self::Unauthorized(detail) => write!(f, "unauthorized: {detail}"),
            Self::RetryExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::InvalidContent(detail) => write!(f, "invalid content: {detail}"),
        }
    }
}

/// Terminal errors of `builder create`.
#[derive(Error, Diagnostic, Debug)]
pub enum BuilderError {
    /// `--publish` combined with pull policy `never`.
    #[error(
        "--publish and --pull-policy never cannot be used together. The --publish flag requires the use of remote images."
    )]
    #[diagnostic(code(packsmith::policy::flag_conflict))]
    FlagConflict,

    /// Pull policy string is not one of the known policies.
    #[error("parsing pull policy {value}: invalid pull policy {value}")]
    #[diagnostic(
        code(packsmith::policy::pull_policy),
        help("Use one of: always, never, if-not-present")
    )]
    UnknownPullPolicy {
        /// The offending value.
        value: String,
    },

    /// An experimental capability was used without enabling experimental mode.
    #[error("{message}")]
    #[diagnostic(
        code(packsmith::policy::experimental),
        help("Enable experimental features with --experimental or `experimental = true` in the packsmith config")
    )]
    ExperimentalFeatureRequired {
        /// Names the capability.
        message: String,
    },

    /// No configuration path was given.
    #[error("Please provide a builder config path, using --config.")]
    #[diagnostic(code(packsmith::policy::missing_config))]
    MissingConfigPath,

    /// `--buildpack-registry` names no configured registry.
    #[error("unknown buildpack registry '{name}'")]
    #[diagnostic(
        code(packsmith::policy::unknown_registry),
        help("Add it under [[registries]] in the packsmith config, or pass an http(s) URL")
    )]
    UnknownRegistry {
        /// The requested name.
        name: String,
    },

    /// The builder image name is not a valid image reference.
    #[error("invalid builder image name '{name}': {reason}")]
    #[diagnostic(code(packsmith::policy::image_name))]
    InvalidImageName {
        /// The requested name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or parsing the configuration failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Order groups reference modules that are not declared.
    #[error("builder order references undeclared modules: {}", ids.join(", "))]
    #[diagnostic(
        code(packsmith::order::unresolved),
        help("Declare each module under [[buildpacks]] or [[extensions]] before using it in an order group")
    )]
    UnresolvedOrderReference {
        /// Offending ids, in encounter order.
        ids: Vec<String>,
    },

    /// A module could not be resolved.
    #[error("resolving {module}: {reason}")]
    #[diagnostic(code(packsmith::resolve))]
    ModuleResolution {
        /// Module description, e.g. `buildpack 'example/node@1.0.0'`.
        module: String,
        /// Failure classification.
        reason: ResolutionReason,
    },

    /// Building the image from resolved content failed.
    #[error("assembling builder: {message}")]
    #[diagnostic(code(packsmith::assemble))]
    Assembly {
        /// What failed.
        message: String,
    },

    /// Saving or publishing the assembled image failed.
    #[error("storing builder image {reference}: {source}")]
    #[diagnostic(code(packsmith::store))]
    Store {
        /// Target reference.
        reference: String,
        /// Underlying error.
        source: PackError,
    },

    /// The run was cancelled.
    #[error("builder creation was cancelled")]
    #[diagnostic(code(packsmith::cancelled))]
    Cancelled,

    /// A worker task failed unexpectedly.
    #[error("internal error: {message}")]
    #[diagnostic(code(packsmith::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl BuilderError {
    pub(crate) fn experimental(message: impl Into<String>) -> Self {
        Self::ExperimentalFeatureRequired {
            message: message.into(),
        }
    }

    pub(crate) fn assembly(message: impl Into<String>) -> Self {
        Self::Assembly {
            message: message.into(),
        }
    }
}

impl From<PackError> for ResolutionReason {
    fn from(err: PackError) -> Self {
        match err {
            PackError::ImageNotFound { .. } | PackError::BlobNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            PackError::Unauthorized { .. } => Self::Unauthorized(err.to_string()),
            other => Self::InvalidContent(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_input() {
        let err = BuilderError::UnknownPullPolicy {
            value: "sometimes".into(),
        };
        assert!(err.to_string().starts_with("parsing pull policy sometimes"));

        let err = BuilderError::UnresolvedOrderReference {
            ids: vec!["a/one".into(), "b/two".into()],
        };
        assert_eq!(
            err.to_string(),
            "builder order references undeclared modules: a/one, b/two"
        );
    }

    #[test]
    fn pack_errors_classify() {
        let reason: ResolutionReason = PackError::Unauthorized {
            registry: "ghcr.io".into(),
        }
        .into();
        assert!(matches!(reason, ResolutionReason::Unauthorized(_)));

        let reason: ResolutionReason = PackError::ImageNotFound {
            reference: "x".into(),
        }
        .into();
        assert!(matches!(reason, ResolutionReason::NotFound(_)));
    }
}
