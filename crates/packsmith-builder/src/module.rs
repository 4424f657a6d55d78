//! Module references, order groups and module metadata values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use packsmith_image::ImageReference;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Locator prefix for registry-hosted packages.
pub const REGISTRY_URN_PREFIX: &str = "urn:cnb:registry:";

static MODULE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9][A-Za-z0-9._-]*)*$")
        .unwrap_or_else(|e| unreachable!("module id pattern: {e}"))
});

/// Ids the lifecycle reserves for itself.
const RESERVED_IDS: &[&str] = &["app", "config", "sbom"];

/// Buildpack or extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    /// Contributes detect/build behavior.
    Buildpack,
    /// Customizes the build or run base image.
    Extension,
}

impl ModuleKind {
    /// Directory under `/cnb` that holds modules of this kind.
    #[must_use]
    pub const fn dir(self) -> &'static str {
        match self {
            Self::Buildpack => "buildpacks",
            Self::Extension => "extensions",
        }
    }

    /// Descriptor file at the root of a module.
    #[must_use]
    pub const fn descriptor_file(self) -> &'static str {
        match self {
            Self::Buildpack => "buildpack.toml",
            Self::Extension => "extension.toml",
        }
    }

    /// Table name inside the descriptor file.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Buildpack => "buildpack",
            Self::Extension => "extension",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Namespaced module identifier, e.g. `example/node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// Validate an id.
    pub fn parse(id: &str) -> Result<Self, String> {
        if RESERVED_IDS.contains(&id) {
            return Err(format!("'{id}' is a reserved id"));
        }
        if !MODULE_ID.is_match(id) {
            return Err(format!(
                "'{id}' is not a valid id; use letters, digits, '.', '-', '_' and '/'"
            ));
        }
        Ok(Self(id.to_string()))
    }

    /// The id as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path-safe form used for directory names.
    #[must_use]
    pub fn escaped(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl TryFrom<String> for ModuleId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a module's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Directory or archive on the local filesystem.
    LocalPath(PathBuf),
    /// OCI image (a buildpackage).
    Image(ImageReference),
    /// Package published in a buildpack registry.
    Registry {
        /// Registry id, `namespace/name`.
        id: String,
        /// Requested version; latest when absent.
        version: Option<String>,
    },
    /// Declared with neither `uri` nor `image`.
    Bare,
}

impl ModuleSource {
    /// Classify a declaration's locator.
    ///
    /// Relative paths are resolved against `base_dir`, the directory holding
    /// the configuration file.
    pub fn classify(uri: Option<&str>, image: Option<&str>, base_dir: &Path) -> Result<Self, String> {
        match (uri, image) {
            (Some(_), Some(_)) => Err("set either 'uri' or 'image', not both".to_string()),
            (None, Some(image)) => parse_image(image),
            (None, None) => Ok(Self::Bare),
            (Some(uri), None) => {
                if let Some(rest) = uri.strip_prefix(REGISTRY_URN_PREFIX) {
                    let (id, version) = match rest.split_once('@') {
                        Some((id, version)) => (id, Some(version.to_string())),
                        None => (rest, None),
                    };
                    if id.is_empty() || version.as_deref() == Some("") {
                        return Err(format!("malformed registry locator '{uri}'"));
                    }
                    Ok(Self::Registry {
                        id: id.to_string(),
                        version,
                    })
                } else if let Some(image) = uri.strip_prefix("docker://") {
                    parse_image(image)
                } else {
                    let path = uri.strip_prefix("file://").unwrap_or(uri);
                    if path.is_empty() {
                        return Err("'uri' is empty".to_string());
                    }
                    let path = Path::new(path);
                    Ok(Self::LocalPath(if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        base_dir.join(path)
                    }))
                }
            }
        }
    }

    /// Whether resolving this source needs the buildpack registry.
    #[must_use]
    pub const fn is_registry(&self) -> bool {
        matches!(self, Self::Registry { .. })
    }
}

fn parse_image(image: &str) -> Result<ModuleSource, String> {
    ImageReference::parse(image)
        .map(ModuleSource::Image)
        .map_err(|e| e.to_string())
}

/// A declared buildpack or extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReference {
    /// Buildpack or extension.
    pub kind: ModuleKind,
    /// Module id.
    pub id: ModuleId,
    /// Declared version.
    pub version: Option<String>,
    /// Content source.
    pub source: ModuleSource,
    /// Carried into the builder metadata.
    pub optional: bool,
}

impl ModuleReference {
    /// `id@version`, or just the id.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{v}", self.id),
            None => self.id.to_string(),
        }
    }
}

impl fmt::Display for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.display_name())
    }
}

/// One member of a detection group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupElement {
    /// Module id.
    pub id: String,
    /// Pinned version; any declared version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether detection may skip this module.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// One detection alternative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    /// Modules tried together.
    #[serde(default)]
    pub group: Vec<GroupElement>,
}

/// Module-level metadata value from a descriptor's `[metadata]` table.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// String.
    String(String),
    /// Integer.
    Integer(i64),
    /// Float.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// Array.
    Array(Vec<MetadataValue>),
    /// Table with ordered keys.
    Table(BTreeMap<String, MetadataValue>),
    /// Any other value, kept as its TOML text.
    Opaque(String),
}

impl MetadataValue {
    /// Convert a TOML table into ordered metadata.
    #[must_use]
    pub fn table_from_toml(table: &toml::Table) -> BTreeMap<String, Self> {
        table
            .iter()
            .map(|(k, v)| (k.clone(), Self::from(v)))
            .collect()
    }

    /// Back to TOML.
    #[must_use]
    pub fn to_toml(&self) -> toml::Value {
        match self {
            Self::String(s) => toml::Value::String(s.clone()),
            Self::Integer(i) => toml::Value::Integer(*i),
            Self::Float(f) => toml::Value::Float(*f),
            Self::Boolean(b) => toml::Value::Boolean(*b),
            Self::Array(items) => toml::Value::Array(items.iter().map(Self::to_toml).collect()),
            Self::Table(map) => toml::Value::Table(
                map.iter().map(|(k, v)| (k.clone(), v.to_toml())).collect(),
            ),
            Self::Opaque(text) => toml::Value::String(text.clone()),
        }
    }
}

impl From<&toml::Value> for MetadataValue {
    fn from(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::String(s.clone()),
            toml::Value::Integer(i) => Self::Integer(*i),
            toml::Value::Float(f) => Self::Float(*f),
            toml::Value::Boolean(b) => Self::Boolean(*b),
            toml::Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
            toml::Value::Table(table) => Self::Table(Self::table_from_toml(table)),
            other => Self::Opaque(other.to_string()),
        }
    }
}

impl Serialize for MetadataValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_toml().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_ids() {
        assert!(ModuleId::parse("example/node").is_ok());
        assert!(ModuleId::parse("some.buildpack").is_ok());
        assert!(ModuleId::parse("heroku/nodejs-engine").is_ok());
        assert!(ModuleId::parse("").is_err());
        assert!(ModuleId::parse("/leading").is_err());
        assert!(ModuleId::parse("two//slashes").is_err());
        assert!(ModuleId::parse("has space").is_err());
        assert!(ModuleId::parse("app").is_err());
        assert_eq!(ModuleId::parse("a/b/c").unwrap().escaped(), "a_b_c");
    }

    #[test]
    fn classify_locators() {
        let base = Path::new("/work/builder");

        assert_eq!(
            ModuleSource::classify(Some("./node"), None, base).unwrap(),
            ModuleSource::LocalPath(PathBuf::from("/work/builder/./node"))
        );
        assert_eq!(
            ModuleSource::classify(Some("file:///abs/node.tgz"), None, base).unwrap(),
            ModuleSource::LocalPath(PathBuf::from("/abs/node.tgz"))
        );
        assert_eq!(
            ModuleSource::classify(Some("urn:cnb:registry:example/node@1.2.3"), None, base).unwrap(),
            ModuleSource::Registry {
                id: "example/node".into(),
                version: Some("1.2.3".into())
            }
        );
        assert!(matches!(
            ModuleSource::classify(Some("docker://ghcr.io/example/node:1"), None, base).unwrap(),
            ModuleSource::Image(_)
        ));
        assert!(matches!(
            ModuleSource::classify(None, Some("ghcr.io/example/node:1"), base).unwrap(),
            ModuleSource::Image(_)
        ));
        assert_eq!(
            ModuleSource::classify(None, None, base).unwrap(),
            ModuleSource::Bare
        );
    }

    #[test]
    fn classify_rejects_ambiguous_or_malformed() {
        let base = Path::new(".");
        assert!(ModuleSource::classify(Some("./x"), Some("ghcr.io/x:1"), base).is_err());
        assert!(ModuleSource::classify(Some("urn:cnb:registry:x@"), None, base).is_err());
        assert!(ModuleSource::classify(Some("docker://Not/Valid"), None, base).is_err());
    }

    #[test]
    fn metadata_keeps_shapes() {
        let table: toml::Table = toml::from_str(
            r#"
            name = "node"
            retries = 3
            ratio = 0.5
            enabled = true
            tags = ["a", "b"]
            released = 1979-05-27T07:32:00Z
            [nested]
            key = "value"
            "#,
        )
        .unwrap();

        let metadata = MetadataValue::table_from_toml(&table);
        assert_eq!(metadata["name"], MetadataValue::String("node".into()));
        assert_eq!(metadata["retries"], MetadataValue::Integer(3));
        assert_eq!(metadata["enabled"], MetadataValue::Boolean(true));
        assert!(matches!(metadata["tags"], MetadataValue::Array(ref a) if a.len() == 2));
        assert!(matches!(metadata["nested"], MetadataValue::Table(_)));
        assert!(matches!(metadata["released"], MetadataValue::Opaque(ref s) if s.starts_with("1979")));

        let json = serde_json::to_value(MetadataValue::Table(metadata)).unwrap();
        assert_eq!(json["nested"]["key"], "value");
        assert_eq!(json["ratio"], 0.5);
    }
}
