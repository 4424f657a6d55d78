//! Common error types for packsmith.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PackError`].
pub type PackResult<T> = Result<T, PackError>;

/// Errors shared by the image store, registry client and registry lookup.
#[derive(Error, Diagnostic, Debug)]
pub enum PackError {
    /// Image not found, locally or in a registry.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(packsmith::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Blob not found in the content store.
    #[error("Blob not found: {digest}")]
    #[diagnostic(code(packsmith::image::blob_not_found))]
    BlobNotFound {
        /// The missing digest.
        digest: String,
    },

    /// Content did not hash to the digest it was recorded under.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(packsmith::image::digest_mismatch))]
    DigestMismatch {
        /// Digest the content was expected to have.
        expected: String,
        /// Digest the content actually has.
        actual: String,
    },

    /// Invalid image reference.
    #[error("Invalid image reference '{reference}': {reason}")]
    #[diagnostic(
        code(packsmith::image::invalid_reference),
        help("Use formats like 'alpine', 'alpine:3.19', 'ghcr.io/org/app:v1' or 'app@sha256:...'")
    )]
    InvalidReference {
        /// The rejected reference.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Registry rejected the supplied credentials (or none were supplied).
    #[error("Unauthorized to access {registry}")]
    #[diagnostic(
        code(packsmith::registry::unauthorized),
        help("Check the registry credentials supplied to packsmith")
    )]
    Unauthorized {
        /// Registry host.
        registry: String,
    },

    /// Transport-level failure (connect, reset, body read).
    #[error("Network error: {message}")]
    #[diagnostic(code(packsmith::network))]
    Network {
        /// The error message.
        message: String,
    },

    /// An operation exceeded its time limit.
    #[error("Timed out: {operation}")]
    #[diagnostic(code(packsmith::timeout))]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Registry answered with an unexpected status.
    #[error("Registry error ({status}): {message}")]
    #[diagnostic(code(packsmith::registry))]
    Registry {
        /// HTTP status code.
        status: u16,
        /// The error message.
        message: String,
    },

    /// Manifest of a kind packsmith cannot read as a single image.
    #[error("Unsupported manifest type '{media_type}' for {reference}")]
    #[diagnostic(
        code(packsmith::image::media_type),
        help("Only OCI and Docker v2 image manifests and indexes are supported")
    )]
    UnsupportedMediaType {
        /// The image reference.
        reference: String,
        /// The media type the registry returned.
        media_type: String,
    },

    /// Archive entry whose path climbs out of the archive root.
    #[error("Archive entry '{path}' escapes the archive root")]
    #[diagnostic(code(packsmith::image::unsafe_path))]
    UnsafeArchivePath {
        /// The entry path as stored in the archive.
        path: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(packsmith::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(packsmith::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(packsmith::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(packsmith::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/packsmith/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl PackError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Transport failures, timeouts, throttling and server-side errors are
    /// transient. Authentication, not-found and local failures are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Registry { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PackError::ImageNotFound {
            reference: "docker.io/library/alpine:3.19".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Image not found: docker.io/library/alpine:3.19"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PackError = io_err.into();
        assert!(matches!(err, PackError::Io(_)));
    }

    #[test]
    fn transient_classification() {
        assert!(PackError::Network {
            message: "connection reset".into()
        }
        .is_transient());
        assert!(PackError::Timeout {
            operation: "pull".into()
        }
        .is_transient());
        assert!(PackError::Registry {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(PackError::Registry {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!PackError::Registry {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!PackError::Unauthorized {
            registry: "ghcr.io".into()
        }
        .is_transient());
        assert!(!PackError::ImageNotFound {
            reference: "x".into()
        }
        .is_transient());
    }
}
