//! Standard filesystem paths for packsmith.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for packsmith data.
pub static PACKSMITH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PACKSMITH_ROOT").map_or_else(
        |_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("packsmith")
        },
        PathBuf::from,
    )
});

/// Default location of the user settings file.
pub static PACKSMITH_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PACKSMITH_CONFIG").map_or_else(
        |_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/etc"))
                .join("packsmith")
                .join("config.toml")
        },
        PathBuf::from,
    )
});

/// Standard paths used by packsmith.
#[derive(Debug, Clone)]
pub struct PackPaths {
    /// Root data directory.
    pub root: PathBuf,
}

impl PackPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the local image store.
    #[must_use]
    pub fn store(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Parent directory for per-run staging areas.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// User settings file.
    #[must_use]
    pub fn settings_file() -> PathBuf {
        PACKSMITH_CONFIG.clone()
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.store())?;
        std::fs::create_dir_all(self.staging())?;
        tracing::debug!(root = %self.root.display(), "Created packsmith directories");
        Ok(())
    }
}

impl Default for PackPaths {
    fn default() -> Self {
        Self {
            root: PACKSMITH_ROOT.clone(),
        }
    }
}
