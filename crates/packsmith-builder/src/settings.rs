//! User settings.
//!
//! Read from `$XDG_CONFIG_HOME/packsmith/config.toml` (or `PACKSMITH_CONFIG`)
//! and threaded explicitly through the pipeline; nothing here is global.

use std::path::Path;

use packsmith_common::{PackError, PackResult};
use serde::Deserialize;

use crate::resolve::RetryPolicy;

/// Default number of modules fetched at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// A named buildpack registry index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistrySetting {
    /// Name used with `--buildpack-registry`.
    pub name: String,
    /// Index base URL.
    pub url: String,
}

/// Settings for one run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Enables experimental capabilities.
    pub experimental: bool,
    /// Pull policy used when no flag is given.
    pub pull_policy: Option<String>,
    /// Concurrent module fetches.
    pub concurrency: usize,
    /// Known registries.
    pub registries: Vec<RegistrySetting>,
    /// Retry limits for fetches.
    #[serde(skip)]
    pub retry: RetryPolicy,
    /// Styled terminal output.
    #[serde(skip)]
    pub color: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            experimental: false,
            pull_policy: None,
            concurrency: DEFAULT_CONCURRENCY,
            registries: Vec::new(),
            retry: RetryPolicy::default(),
            color: true,
        }
    }
}

impl Settings {
    /// Load settings; a missing file yields the defaults.
    pub fn load(path: &Path) -> PackResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|message| PackError::Config {
            message: format!("{}: {message}", path.display()),
        })
    }

    /// Parse settings text.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut settings: Self = toml::from_str(text).map_err(|e| e.message().to_string())?;
        settings.concurrency = settings.concurrency.max(1);
        Ok(settings)
    }

    /// Look up a registry by name.
    #[must_use]
    pub fn registry(&self, name: &str) -> Option<&RegistrySetting> {
        self.registries.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::parse("").unwrap();
        assert!(!settings.experimental);
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
        assert!(settings.pull_policy.is_none());
        assert!(settings.color);
    }

    #[test]
    fn full_file() {
        let settings = Settings::parse(
            r#"
            experimental = true
            pull-policy = "never"
            concurrency = 0

            [[registries]]
            name = "corp"
            url = "https://index.example.com"
            "#,
        )
        .unwrap();

        assert!(settings.experimental);
        assert_eq!(settings.pull_policy.as_deref(), Some("never"));
        assert_eq!(settings.concurrency, 1);
        assert_eq!(
            settings.registry("corp").map(|r| r.url.as_str()),
            Some("https://index.example.com")
        );
    }

    #[test]
    fn missing_file_is_default() {
        let temp = tempfile::tempdir().unwrap();
        let settings = Settings::load(&temp.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn malformed_file_names_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "experimental = \"yes\"").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
