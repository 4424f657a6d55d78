//! Builder configuration (`builder.toml`) parsing.
//!
//! Parsing happens in two stages: the bytes are first read as a TOML table,
//! which yields syntax errors with a line and column, and the table is then
//! mapped onto the typed configuration, which yields schema errors. No
//! cross-field validation happens here.

use std::path::{Path, PathBuf};

use packsmith_image::ImageReference;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::module::{GroupElement, ModuleId, ModuleKind, ModuleReference, ModuleSource, OrderEntry};

/// A parsed builder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Free-form description, copied into the builder metadata.
    pub description: Option<String>,
    /// Declared buildpacks, in document order.
    pub buildpacks: Vec<ModuleReference>,
    /// Declared extensions, in document order.
    pub extensions: Vec<ModuleReference>,
    /// Buildpack detection order.
    pub order: Vec<OrderEntry>,
    /// Extension detection order.
    pub order_extensions: Vec<OrderEntry>,
    /// Legacy stack table.
    pub stack: Option<StackConfig>,
    /// Run image table.
    pub run: RunConfig,
    /// Build image table.
    pub build: BuildConfig,
}

/// `[stack]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StackConfig {
    /// Stack id.
    #[serde(default)]
    pub id: Option<String>,
    /// Build image reference.
    #[serde(default)]
    pub build_image: Option<String>,
    /// Run image reference.
    #[serde(default)]
    pub run_image: Option<String>,
    /// Run image mirrors.
    #[serde(default)]
    pub run_image_mirrors: Vec<String>,
}

/// `[run]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run images, preferred first.
    #[serde(default)]
    pub images: Vec<RunImage>,
}

/// `[[run.images]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImage {
    /// Image reference.
    pub image: String,
    /// Mirrors of the image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

/// `[build]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Base image for the builder.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    buildpacks: Vec<RawModule>,
    #[serde(default)]
    extensions: Vec<RawModule>,
    #[serde(default)]
    order: Vec<RawOrderEntry>,
    #[serde(default)]
    order_extensions: Vec<RawOrderEntry>,
    #[serde(default)]
    stack: Option<StackConfig>,
    #[serde(default)]
    run: RunConfig,
    #[serde(default)]
    build: BuildConfig,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    id: Option<String>,
    version: Option<String>,
    uri: Option<String>,
    image: Option<String>,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Deserialize)]
struct RawOrderEntry {
    #[serde(default)]
    group: Vec<RawGroupElement>,
}

#[derive(Debug, Deserialize)]
struct RawGroupElement {
    id: Option<String>,
    version: Option<String>,
    #[serde(default)]
    optional: bool,
}

impl BuilderConfig {
    /// Parse a document; relative paths resolve against the working directory.
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        Self::parse_in(bytes, Path::new("."))
    }

    /// Parse a document whose relative paths resolve against `base_dir`.
    pub fn parse_in(bytes: &[u8], base_dir: &Path) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            let (line, column) = line_column(&bytes[..e.valid_up_to()]);
            ConfigError::Syntax {
                line,
                column,
                message: "document is not valid UTF-8".to_string(),
            }
        })?;

        let table: toml::Table = toml::from_str(text).map_err(|e| {
            let offset = e.span().map_or(0, |span| span.start);
            let (line, column) = line_column(&text.as_bytes()[..offset.min(text.len())]);
            ConfigError::Syntax {
                line,
                column,
                message: e.message().to_string(),
            }
        })?;

        tracing::trace!(keys = table.len(), "Builder config is well-formed");

        // The text is known to be valid TOML, so any error here is about shape.
        let raw: RawConfig = toml::from_str(text).map_err(|e| schema(e.message()))?;

        let buildpacks = parse_modules(ModuleKind::Buildpack, raw.buildpacks, base_dir)?;
        let extensions = parse_modules(ModuleKind::Extension, raw.extensions, base_dir)?;
        let order = parse_order(raw.order, "order")?;
        let order_extensions = parse_order(raw.order_extensions, "order-extensions")?;

        let config = Self {
            description: raw.description,
            buildpacks,
            extensions,
            order,
            order_extensions,
            stack: raw.stack,
            run: raw.run,
            build: raw.build,
        };
        config.base_image()?;
        Ok(config)
    }

    /// Read and parse a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        tracing::debug!(path = %path.display(), "Parsing builder config");
        Self::parse_in(&bytes, &base_dir)
    }

    /// All declared modules: buildpacks first, then extensions.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleReference> {
        self.buildpacks.iter().chain(&self.extensions)
    }

    /// Whether any extension field is in use.
    #[must_use]
    pub fn uses_extensions(&self) -> bool {
        !self.extensions.is_empty() || !self.order_extensions.is_empty()
    }

    /// Whether any module is sourced from a buildpack registry.
    #[must_use]
    pub fn uses_registry(&self) -> bool {
        self.modules().any(|m| m.source.is_registry())
    }

    /// Base image: `[build].image`, else `[stack].build-image`.
    pub fn base_image(&self) -> Result<Option<ImageReference>, ConfigError> {
        let image = self
            .build
            .image
            .as_deref()
            .or_else(|| self.stack.as_ref().and_then(|s| s.build_image.as_deref()));
        image
            .map(|i| {
                ImageReference::parse(i).map_err(|e| schema(&format!("build image: {e}")))
            })
            .transpose()
    }
}

fn parse_modules(
    kind: ModuleKind,
    raw: Vec<RawModule>,
    base_dir: &Path,
) -> Result<Vec<ModuleReference>, ConfigError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, module)| {
            let at = format!("{}[{index}]", kind.dir());
            let id = module
                .id
                .ok_or_else(|| schema(&format!("{at}: missing required field 'id'")))?;
            let id = ModuleId::parse(&id).map_err(|e| schema(&format!("{at}: {e}")))?;
            let source = ModuleSource::classify(module.uri.as_deref(), module.image.as_deref(), base_dir)
                .map_err(|e| schema(&format!("{at} ({id}): {e}")))?;
            Ok(ModuleReference {
                kind,
                id,
                version: module.version.filter(|v| !v.is_empty()),
                source,
                optional: module.optional,
            })
        })
        .collect()
}

fn parse_order(raw: Vec<RawOrderEntry>, table: &str) -> Result<Vec<OrderEntry>, ConfigError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let group = entry
                .group
                .into_iter()
                .enumerate()
                .map(|(j, element)| {
                    let id = element.id.ok_or_else(|| {
                        schema(&format!("{table}[{i}].group[{j}]: missing required field 'id'"))
                    })?;
                    Ok(GroupElement {
                        id,
                        version: element.version.filter(|v| !v.is_empty()),
                        optional: element.optional,
                    })
                })
                .collect::<Result<_, ConfigError>>()?;
            Ok(OrderEntry { group })
        })
        .collect()
}

fn schema(message: &str) -> ConfigError {
    ConfigError::Schema {
        message: message.to_string(),
    }
}

/// 1-based line and column of the position just past `prefix`.
fn line_column(prefix: &[u8]) -> (usize, usize) {
    let line = prefix.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = prefix
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |p| p + 1);
    let column = String::from_utf8_lossy(&prefix[line_start..]).chars().count() + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
description = "Example builder"

[[buildpacks]]
id = "some.buildpack"

[[buildpacks]]
id = "example/node"
version = "1.2.3"
uri = "./node"

[[order]]
[[order.group]]
id = "some.buildpack"

[[order.group]]
id = "example/node"
version = "1.2.3"
optional = true

[stack]
id = "io.buildpacks.stacks.jammy"
build-image = "example.com/stacks/build:jammy"
run-image = "example.com/stacks/run:jammy"
run-image-mirrors = ["mirror.example.com/stacks/run:jammy"]
"#;

    #[test]
    fn parse_valid_config() {
        let config = BuilderConfig::parse_in(VALID.as_bytes(), Path::new("/cfg")).unwrap();

        assert_eq!(config.description.as_deref(), Some("Example builder"));
        assert_eq!(config.buildpacks.len(), 2);
        assert_eq!(config.buildpacks[0].source, ModuleSource::Bare);
        assert_eq!(
            config.buildpacks[1].source,
            ModuleSource::LocalPath(PathBuf::from("/cfg/./node"))
        );
        assert_eq!(config.order.len(), 1);
        assert_eq!(config.order[0].group.len(), 2);
        assert!(config.order[0].group[1].optional);
        assert!(config.extensions.is_empty());
        assert!(!config.uses_extensions());
        assert_eq!(
            config.base_image().unwrap().unwrap().to_string(),
            "example.com/stacks/build:jammy"
        );
    }

    #[test]
    fn build_image_takes_precedence_over_stack() {
        let text = format!("{VALID}\n[build]\nimage = \"example.com/base:2\"\n");
        let config = BuilderConfig::parse(text.as_bytes()).unwrap();
        assert_eq!(
            config.base_image().unwrap().unwrap().to_string(),
            "example.com/base:2"
        );
    }

    #[test]
    fn syntax_error_has_location() {
        let text = "[[buildpacks]]\nid = \"a\"\nversion = \n";
        match BuilderConfig::parse(text.as_bytes()).unwrap_err() {
            ConfigError::Syntax { line, column, .. } => {
                assert_eq!(line, 3);
                assert!(column > 1);
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn non_utf8_is_syntax_error() {
        let bytes = b"description = \"ok\"\n\xff\xfe";
        assert!(matches!(
            BuilderConfig::parse(bytes).unwrap_err(),
            ConfigError::Syntax { line: 2, column: 1, .. }
        ));
    }

    #[test]
    fn missing_id_is_schema_error() {
        let text = "[[buildpacks]]\nversion = \"1.0\"\n";
        let err = BuilderConfig::parse(text.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }));
        assert!(err.to_string().contains("buildpacks[0]"));

        let text = "[[order]]\n[[order.group]]\nversion = \"1.0\"\n";
        let err = BuilderConfig::parse(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("order[0].group[0]"));
    }

    #[test]
    fn wrong_shape_is_schema_error() {
        let text = "buildpacks = \"not a list\"\n";
        assert!(matches!(
            BuilderConfig::parse(text.as_bytes()).unwrap_err(),
            ConfigError::Schema { .. }
        ));
    }

    #[test]
    fn no_cross_field_validation() {
        let text = "[[order]]\n[[order.group]]\nid = \"undeclared/module\"\n";
        let config = BuilderConfig::parse(text.as_bytes()).unwrap();
        assert!(config.buildpacks.is_empty());
        assert_eq!(config.order[0].group[0].id, "undeclared/module");
    }

    #[test]
    fn extensions_are_detected() {
        let text = "[[order-extensions]]\n[[order-extensions.group]]\nid = \"ext/one\"\n";
        let config = BuilderConfig::parse(text.as_bytes()).unwrap();
        assert!(config.uses_extensions());
        assert_eq!(config.order_extensions.len(), 1);
    }

    #[test]
    fn registry_uris_are_detected() {
        let text = "[[buildpacks]]\nid = \"example/node\"\nuri = \"urn:cnb:registry:example/node@1.0.0\"\n";
        let config = BuilderConfig::parse(text.as_bytes()).unwrap();
        assert!(config.uses_registry());
    }

    #[test]
    fn unreadable_file_is_read_error() {
        let err = BuilderConfig::from_file(Path::new("/definitely/not/here/builder.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/definitely/not/here/builder.toml"));
    }
}
