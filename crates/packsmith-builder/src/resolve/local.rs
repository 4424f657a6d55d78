//! Local module directories and archives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use packsmith_image::LayerWriter;
use packsmith_image::layer::{ArchiveEntry, EntryKind, read_entries};
use serde::{Deserialize, Serialize};

use crate::error::ResolutionReason;
use crate::module::{MetadataValue, ModuleKind, ModuleReference};

const ARCHIVE_SUFFIXES: &[&str] = &[".tar", ".tgz", ".tar.gz", ".cnb"];

/// Identity and metadata of a module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleInfo {
    /// Module id.
    pub id: String,
    /// Resolved version.
    pub version: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Homepage.
    pub homepage: Option<String>,
    /// Buildpack API version.
    pub api: Option<String>,
    /// Supported targets.
    pub targets: Vec<Target>,
    /// `[metadata]` table.
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// A platform a module supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Operating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// Architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    api: Option<String>,
    buildpack: Option<RawIdentity>,
    extension: Option<RawIdentity>,
    #[serde(default)]
    targets: Vec<Target>,
    #[serde(default)]
    metadata: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    id: String,
    version: Option<String>,
    name: Option<String>,
    homepage: Option<String>,
}

impl ModuleInfo {
    /// Identity known from the declaration alone.
    #[must_use]
    pub fn declared(reference: &ModuleReference) -> Self {
        Self {
            id: reference.id.to_string(),
            version: reference.version.clone(),
            ..Self::default()
        }
    }

    /// Parse `buildpack.toml` or `extension.toml`.
    pub fn parse_descriptor(kind: ModuleKind, text: &str) -> Result<Self, String> {
        let raw: RawDescriptor = toml::from_str(text).map_err(|e| e.message().to_string())?;
        let identity = match kind {
            ModuleKind::Buildpack => raw.buildpack,
            ModuleKind::Extension => raw.extension,
        }
        .ok_or_else(|| format!("missing [{}] table", kind.table()))?;

        Ok(Self {
            id: identity.id,
            version: identity.version,
            name: identity.name,
            homepage: identity.homepage,
            api: raw.api,
            targets: raw.targets,
            metadata: MetadataValue::table_from_toml(&raw.metadata),
        })
    }
}

/// A local module written to the staging area as a layer.
#[derive(Debug)]
pub struct StagedModule {
    /// Descriptor contents with the resolved version.
    pub info: ModuleInfo,
    /// Layer file in the staging area.
    pub path: PathBuf,
    /// Layer digest.
    pub digest: String,
}

/// Verify a local module and write it into `staging` as a layer under
/// `cnb/<kind>/<escaped-id>/<version>/`.
pub fn stage(
    reference: &ModuleReference,
    source: &Path,
    staging: &Path,
) -> Result<StagedModule, ResolutionReason> {
    if !source.exists() {
        return Err(ResolutionReason::NotFound(format!(
            "{} does not exist",
            source.display()
        )));
    }

    let kind = reference.kind;
    let (info, layer) = if source.is_dir() {
        let descriptor = source.join(kind.descriptor_file());
        let text = std::fs::read_to_string(&descriptor).map_err(|_| {
            ResolutionReason::InvalidContent(format!(
                "{} has no {}",
                source.display(),
                kind.descriptor_file()
            ))
        })?;
        let info = identify(reference, source, &text)?;
        let mut writer = LayerWriter::new();
        writer.add_tree(&prefix(reference, &info), source)?;
        (info, writer.finish()?)
    } else {
        let name = source.to_string_lossy();
        if !ARCHIVE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return Err(ResolutionReason::InvalidContent(format!(
                "{} is neither a directory nor a .tar or .tgz archive",
                source.display()
            )));
        }
        let data = std::fs::read(source).map_err(|e| {
            ResolutionReason::InvalidContent(format!("reading {}: {e}", source.display()))
        })?;
        let mut entries = read_entries(&data)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let text = entries
            .iter()
            .find_map(|e| match &e.kind {
                EntryKind::File(content) if e.path == kind.descriptor_file() => {
                    Some(String::from_utf8_lossy(content).into_owned())
                }
                _ => None,
            })
            .ok_or_else(|| {
                ResolutionReason::InvalidContent(format!(
                    "{} has no {}",
                    source.display(),
                    kind.descriptor_file()
                ))
            })?;
        let info = identify(reference, source, &text)?;
        let prefix = prefix(reference, &info);
        let mut writer = LayerWriter::new();
        writer.add_dir(&prefix)?;
        for ArchiveEntry { path, mode, kind } in entries {
            let target = format!("{prefix}/{path}");
            match kind {
                EntryKind::Dir => writer.add_dir(&target)?,
                EntryKind::File(content) => writer.add_file(&target, mode, &content)?,
                EntryKind::Symlink(link) => writer.add_symlink(&target, &link)?,
            }
        }
        (info, writer.finish()?)
    };

    let hex = layer.digest.trim_start_matches("sha256:");
    let path = staging.join(format!("{hex}.tar"));
    std::fs::write(&path, &layer.data).map_err(|e| {
        ResolutionReason::InvalidContent(format!("staging {}: {e}", path.display()))
    })?;

    tracing::debug!(
        module = %reference,
        digest = %layer.digest,
        size = layer.data.len(),
        "Local module staged"
    );

    Ok(StagedModule {
        info,
        path,
        digest: layer.digest,
    })
}

fn identify(
    reference: &ModuleReference,
    source: &Path,
    descriptor: &str,
) -> Result<ModuleInfo, ResolutionReason> {
    let invalid = |detail: String| {
        ResolutionReason::InvalidContent(format!(
            "{} in {}: {detail}",
            reference.kind.descriptor_file(),
            source.display()
        ))
    };

    let mut info = ModuleInfo::parse_descriptor(reference.kind, descriptor).map_err(invalid)?;
    if info.id != reference.id.as_str() {
        return Err(invalid(format!(
            "declares id '{}', expected '{}'",
            info.id, reference.id
        )));
    }
    match (&reference.version, &info.version) {
        (Some(declared), Some(found)) if declared != found => {
            return Err(invalid(format!(
                "declares version '{found}', expected '{declared}'"
            )));
        }
        (Some(declared), None) => info.version = Some(declared.clone()),
        (None, None) => return Err(invalid("declares no version".to_string())),
        _ => {}
    }
    Ok(info)
}

fn prefix(reference: &ModuleReference, info: &ModuleInfo) -> String {
    format!(
        "cnb/{}/{}/{}",
        reference.kind.dir(),
        reference.id.escaped(),
        info.version.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use packsmith_image::layer::read_entries;

    use super::*;
    use crate::module::{ModuleId, ModuleSource};

    const DESCRIPTOR: &str = r#"
api = "0.10"

[buildpack]
id = "example/node"
version = "1.2.3"
name = "Node.js"
homepage = "https://example.com/node"

[[targets]]
os = "linux"
arch = "amd64"

[metadata]
default-version = "20"
"#;

    fn reference(version: Option<&str>) -> ModuleReference {
        ModuleReference {
            kind: ModuleKind::Buildpack,
            id: ModuleId::parse("example/node").unwrap(),
            version: version.map(str::to_string),
            source: ModuleSource::Bare,
            optional: false,
        }
    }

    fn module_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("buildpack.toml"), DESCRIPTOR).unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/build"), "#!/bin/sh\n").unwrap();
        dir
    }

    #[test]
    fn descriptor_parsing() {
        let info = ModuleInfo::parse_descriptor(ModuleKind::Buildpack, DESCRIPTOR).unwrap();
        assert_eq!(info.id, "example/node");
        assert_eq!(info.api.as_deref(), Some("0.10"));
        assert_eq!(info.targets[0].arch.as_deref(), Some("amd64"));
        assert_eq!(
            info.metadata["default-version"],
            MetadataValue::String("20".into())
        );

        let err = ModuleInfo::parse_descriptor(ModuleKind::Extension, DESCRIPTOR).unwrap_err();
        assert!(err.contains("[extension]"));
    }

    #[test]
    fn stages_directory_under_module_prefix() {
        let dir = module_dir();
        let staging = tempfile::tempdir().unwrap();

        let staged = stage(&reference(Some("1.2.3")), dir.path(), staging.path()).unwrap();
        assert_eq!(staged.info.name.as_deref(), Some("Node.js"));

        let data = std::fs::read(&staged.path).unwrap();
        let paths: Vec<_> = read_entries(&data).unwrap().into_iter().map(|e| e.path).collect();
        assert!(paths.contains(&"cnb/buildpacks/example_node/1.2.3/buildpack.toml".to_string()));
        assert!(paths.contains(&"cnb/buildpacks/example_node/1.2.3/bin/build".to_string()));
    }

    #[test]
    fn staging_is_reproducible() {
        let dir = module_dir();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();

        let a = stage(&reference(None), dir.path(), first.path()).unwrap();
        let b = stage(&reference(None), dir.path(), second.path()).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.info.version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn archive_and_directory_agree() {
        let dir = module_dir();
        let mut writer = LayerWriter::new();
        writer.add_tree("", dir.path()).unwrap();
        let tar = writer.finish().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tar.data).unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let archive = archive_dir.path().join("node.tgz");
        std::fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let staging = tempfile::tempdir().unwrap();
        let from_archive = stage(&reference(None), &archive, staging.path()).unwrap();
        let from_dir = stage(&reference(None), dir.path(), staging.path()).unwrap();
        assert_eq!(from_archive.digest, from_dir.digest);
    }

    #[test]
    fn missing_path_is_not_found() {
        let staging = tempfile::tempdir().unwrap();
        let err = stage(
            &reference(None),
            Path::new("/no/such/buildpack"),
            staging.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ResolutionReason::NotFound(_)));
    }

    #[test]
    fn missing_descriptor_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let err = stage(&reference(None), dir.path(), staging.path()).unwrap_err();
        assert!(matches!(err, ResolutionReason::InvalidContent(ref m) if m.contains("buildpack.toml")));
    }

    #[test]
    fn identity_mismatch_is_invalid() {
        let dir = module_dir();
        let staging = tempfile::tempdir().unwrap();

        let other = ModuleReference {
            id: ModuleId::parse("example/go").unwrap(),
            ..reference(None)
        };
        assert!(matches!(
            stage(&other, dir.path(), staging.path()),
            Err(ResolutionReason::InvalidContent(_))
        ));
        assert!(matches!(
            stage(&reference(Some("9.9.9")), dir.path(), staging.path()),
            Err(ResolutionReason::InvalidContent(_))
        ));
    }
}
