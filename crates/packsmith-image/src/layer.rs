//! Layer tarballs.
//!
//! Layers written here are reproducible: entries carry a fixed timestamp,
//! root ownership and normalized permissions, and directory trees are walked
//! in file-name order. Writing the same content twice yields identical bytes.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path};

use bytes::Bytes;
use flate2::read::GzDecoder;
use packsmith_common::{PackError, PackResult};
use packsmith_oci::sha256_digest;
use tar::{EntryType, Header};

/// Timestamp stamped on every entry: 1980-01-01T00:00:01Z.
pub const NORMALIZED_MTIME: u64 = 315_532_801;

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// A finished, uncompressed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Tar bytes.
    pub data: Bytes,
    /// Digest of `data`; also the diff ID since the layer is uncompressed.
    pub digest: String,
}

/// Builds a reproducible layer tarball.
pub struct LayerWriter {
    builder: tar::Builder<Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl LayerWriter {
    /// Start an empty layer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
            dirs: BTreeSet::new(),
        }
    }

    /// Add a directory and any missing parents.
    pub fn add_dir(&mut self, path: &str) -> PackResult<()> {
        let path = normalize(path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            if self.dirs.insert(current.clone()) {
                let mut header = header(EntryType::Directory, DIR_MODE, 0);
                self.builder
                    .append_data(&mut header, format!("{current}/"), std::io::empty())?;
            }
        }
        Ok(())
    }

    /// Add a regular file. Only the executable bit of `mode` is kept.
    pub fn add_file(&mut self, path: &str, mode: u32, data: &[u8]) -> PackResult<()> {
        let path = normalize(path);
        self.add_parent(&path)?;
        let mode = if mode & 0o111 == 0 { FILE_MODE } else { EXEC_MODE };
        let mut header = header(EntryType::Regular, mode, data.len() as u64);
        self.builder.append_data(&mut header, &path, data)?;
        Ok(())
    }

    /// Add a symbolic link.
    pub fn add_symlink(&mut self, path: &str, target: &str) -> PackResult<()> {
        let path = normalize(path);
        self.add_parent(&path)?;
        let mut header = header(EntryType::Symlink, 0o777, 0);
        self.builder.append_link(&mut header, &path, target)?;
        Ok(())
    }

    /// Copy a directory tree from disk under `prefix`.
    pub fn add_tree(&mut self, prefix: &str, source: &Path) -> PackResult<()> {
        self.add_dir(prefix)?;
        let walker = walkdir::WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1);

        for entry in walker {
            let entry = entry.map_err(|e| PackError::Io(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| PackError::Internal {
                    message: format!("walked outside {}: {e}", source.display()),
                })?;
            let relative = relative.to_string_lossy().replace('\\', "/");
            let target = format!("{}/{}", normalize(prefix), relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.add_dir(&target)?;
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                self.add_symlink(&target, &link.to_string_lossy())?;
            } else {
                let data = std::fs::read(entry.path())?;
                self.add_file(&target, file_mode(entry.path())?, &data)?;
            }
        }
        Ok(())
    }

    /// Finish the archive.
    pub fn finish(self) -> PackResult<Layer> {
        let data = Bytes::from(self.builder.into_inner()?);
        let digest = sha256_digest(&data);
        tracing::debug!(digest = %digest, size = data.len(), "Layer written");
        Ok(Layer { data, digest })
    }

    fn add_parent(&mut self, path: &str) -> PackResult<()> {
        match path.rsplit_once('/') {
            Some((parent, _)) => self.add_dir(parent),
            None => Ok(()),
        }
    }
}

impl Default for LayerWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of an entry read back from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory.
    Dir,
    /// Regular file with its content.
    File(Vec<u8>),
    /// Symbolic link with its target.
    Symlink(String),
}

/// One entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative path, without leading `./` or `/`.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Entry kind.
    pub kind: EntryKind,
}

/// Read every entry of a tar archive, gzip-compressed or not.
///
/// Hard links, devices and other special entries are skipped. An entry
/// whose path contains a `..` component fails the whole read.
pub fn read_entries(data: &[u8]) -> PackResult<Vec<ArchiveEntry>> {
    let reader: Box<dyn Read + '_> = if data.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };

    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?;
        if raw.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PackError::UnsafeArchivePath {
                path: raw.to_string_lossy().into_owned(),
            });
        }
        let path = normalize(&raw.to_string_lossy());
        if path.is_empty() {
            continue;
        }
        let mode = entry.header().mode()?;
        let kind = match entry.header().entry_type() {
            EntryType::Directory => EntryKind::Dir,
            EntryType::Regular | EntryType::Continuous => {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                EntryKind::File(content)
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().into_owned())
                    .unwrap_or_default();
                EntryKind::Symlink(target)
            }
            other => {
                tracing::debug!(path = %path, kind = ?other, "Skipping archive entry");
                continue;
            }
        };
        entries.push(ArchiveEntry { path, mode, kind });
    }
    Ok(entries)
}

fn header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(NORMALIZED_MTIME);
    header.set_size(size);
    header
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./")
        .trim_matches('/')
        .to_string()
}

#[cfg(unix)]
fn file_mode(path: &Path) -> PackResult<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> PackResult<u32> {
    Ok(FILE_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_gives_identical_bytes() {
        let build = || {
            let mut writer = LayerWriter::new();
            writer.add_file("cnb/order.toml", 0o600, b"[[order]]\n").unwrap();
            writer.add_file("cnb/bin/detect", 0o700, b"#!/bin/sh\n").unwrap();
            writer.finish().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn parents_are_written_once_and_modes_normalized() {
        let mut writer = LayerWriter::new();
        writer.add_file("cnb/a/one", 0o600, b"1").unwrap();
        writer.add_file("cnb/a/two", 0o711, b"2").unwrap();
        let layer = writer.finish().unwrap();

        let entries = read_entries(&layer.data).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["cnb", "cnb/a", "cnb/a/one", "cnb/a/two"]);
        assert_eq!(entries[2].mode, 0o644);
        assert_eq!(entries[3].mode, 0o755);
        assert_eq!(entries[3].kind, EntryKind::File(b"2".to_vec()));
    }

    #[test]
    fn tree_is_walked_in_name_order() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("bin")).unwrap();
        std::fs::write(temp.path().join("zeta.txt"), "z").unwrap();
        std::fs::write(temp.path().join("bin/build"), "b").unwrap();
        std::fs::write(temp.path().join("alpha.txt"), "a").unwrap();

        let mut writer = LayerWriter::new();
        writer.add_tree("cnb/buildpacks/x/1.0", temp.path()).unwrap();
        let layer = writer.finish().unwrap();

        let paths: Vec<_> = read_entries(&layer.data)
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            paths,
            [
                "cnb",
                "cnb/buildpacks",
                "cnb/buildpacks/x",
                "cnb/buildpacks/x/1.0",
                "cnb/buildpacks/x/1.0/alpha.txt",
                "cnb/buildpacks/x/1.0/bin",
                "cnb/buildpacks/x/1.0/bin/build",
                "cnb/buildpacks/x/1.0/zeta.txt",
            ]
        );
    }

    #[test]
    fn parent_components_are_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut entry = header(EntryType::Regular, 0o644, 4);
        let name = b"cnb/buildpacks/x/1.0/../../../etc/passwd";
        entry.as_old_mut().name[..name.len()].copy_from_slice(name);
        entry.set_cksum();
        builder.append(&entry, &b"root"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let err = read_entries(&data).unwrap_err();
        assert!(matches!(
            err,
            PackError::UnsafeArchivePath { ref path } if path.ends_with("../etc/passwd")
        ));
    }

    #[test]
    fn reads_gzip_archives() {
        use std::io::Write;

        let mut writer = LayerWriter::new();
        writer.add_file("buildpack.toml", 0o644, b"api = \"0.10\"").unwrap();
        let layer = writer.finish().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&layer.data).unwrap();
        let compressed = encoder.finish().unwrap();

        let entries = read_entries(&compressed).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "buildpack.toml");
    }
}
