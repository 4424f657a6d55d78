//! Builder image assembly.
//!
//! Layers are laid down as: the base image's layers, one layer (or a
//! package's layers) per resolved module in declaration order, then a single
//! metadata layer with `cnb/order.toml`, `cnb/stack.toml` and
//! `cnb/modules.toml`. Everything that ends up in the image is serialized
//! from ordered maps with fixed timestamps, so the same inputs always give
//! the same manifest digest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use packsmith_common::PackError;
use packsmith_image::layer::NORMALIZED_MTIME;
use packsmith_image::{ImageReference, LayerWriter, LocalImage};
use packsmith_oci::image::{ExecutionConfig, HistoryEntry, RootFs};
use packsmith_oci::{Descriptor, ImageConfig, ImageManifest, Platform, media_types, sha256_digest};
use serde::{Deserialize, Serialize};

use crate::client::ImageClient;
use crate::config::{BuilderConfig, RunImage};
use crate::error::{BuilderError, BuilderResult};
use crate::module::{ModuleKind, OrderEntry};
use crate::resolve::{ModuleContent, ModuleInfo, ResolvedModule, Target};

/// Builder metadata label.
pub const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";
/// Buildpack order label.
pub const ORDER_LABEL: &str = "io.buildpacks.buildpack.order";
/// Extension order label.
pub const ORDER_EXTENSIONS_LABEL: &str = "io.buildpacks.buildpack.order-extensions";
/// Module layer index label.
pub const LAYERS_LABEL: &str = "io.buildpacks.buildpack.layers";
/// Stack id label.
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

/// Detection orders written into the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrderMetadata {
    /// Buildpack groups.
    pub order: Vec<OrderEntry>,
    /// Extension groups.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_extensions: Vec<OrderEntry>,
}

impl OrderMetadata {
    /// Orders as declared.
    #[must_use]
    pub fn from_config(config: &BuilderConfig) -> Self {
        Self {
            order: config.order.clone(),
            order_extensions: config.order_extensions.clone(),
        }
    }

    /// Pin unversioned group elements to the first resolved version of their id.
    #[must_use]
    pub fn pinned(&self, modules: &[ResolvedModule]) -> Self {
        let pin = |kind: ModuleKind, entries: &[OrderEntry]| -> Vec<OrderEntry> {
            entries
                .iter()
                .map(|entry| OrderEntry {
                    group: entry
                        .group
                        .iter()
                        .map(|element| {
                            let mut element = element.clone();
                            if element.version.is_none() {
                                element.version = modules
                                    .iter()
                                    .filter(|m| m.reference.kind == kind)
                                    .filter(|m| m.info.id == element.id)
                                    .find_map(|m| m.info.version.clone());
                            }
                            element
                        })
                        .collect(),
                })
                .collect()
        };
        Self {
            order: pin(ModuleKind::Buildpack, &self.order),
            order_extensions: pin(ModuleKind::Extension, &self.order_extensions),
        }
    }
}

/// Stack and run image information written into the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StackMetadata {
    /// Stack id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Run images, preferred first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_images: Vec<RunImage>,
}

impl StackMetadata {
    /// `[[run.images]]`, falling back to the legacy `[stack]` run image.
    #[must_use]
    pub fn from_config(config: &BuilderConfig) -> Self {
        let stack = config.stack.as_ref();
        let run_images = if config.run.images.is_empty() {
            stack
                .and_then(|s| {
                    s.run_image.as_ref().map(|image| RunImage {
                        image: image.clone(),
                        mirrors: s.run_image_mirrors.clone(),
                    })
                })
                .into_iter()
                .collect()
        } else {
            config.run.images.clone()
        };
        Self {
            id: stack.and_then(|s| s.id.clone()),
            run_images,
        }
    }
}

/// A finished builder image, ready to save or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledImage {
    /// Target reference.
    pub reference: ImageReference,
    /// Manifest digest.
    pub digest: String,
    /// Manifest bytes.
    pub manifest: Bytes,
    /// Config bytes.
    pub config: Bytes,
    /// Layer blobs in manifest order.
    pub layers: Vec<Bytes>,
}

/// Puts resolved modules on top of a base image.
pub struct BuilderAssembler {
    client: Arc<dyn ImageClient>,
    description: Option<String>,
}

struct Layers {
    descriptors: Vec<Descriptor>,
    diff_ids: Vec<String>,
    blobs: Vec<Bytes>,
    history: Vec<HistoryEntry>,
    seen: BTreeSet<String>,
}

impl Layers {
    fn push(&mut self, descriptor: Descriptor, diff_id: String, blob: Bytes, created_by: String) {
        self.seen.insert(descriptor.digest.clone());
        self.descriptors.push(descriptor);
        self.diff_ids.push(diff_id);
        self.blobs.push(blob);
        self.history.push(HistoryEntry {
            created: Some(created()),
            created_by: Some(created_by),
            comment: None,
            empty_layer: false,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api: Option<String>,
    #[serde(rename = "layerDiffID")]
    layer_diff_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    targets: Vec<Target>,
}

type LayerIndex = BTreeMap<String, BTreeMap<String, LayerEntry>>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuilderLabel<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    buildpacks: Vec<ModuleSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extensions: Vec<ModuleSummary>,
    stack: StackLabel<'a>,
    created_by: CreatedBy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StackLabel<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_image: Option<&'a RunImage>,
}

#[derive(Serialize)]
struct CreatedBy {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ModuleSummary {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ModulesFile {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    buildpacks: Vec<ModuleRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extensions: Vec<ModuleRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ModuleRecord {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    optional: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    targets: Vec<Target>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, crate::module::MetadataValue>,
}

impl ModuleRecord {
    fn new(module: &ResolvedModule) -> Self {
        let ModuleInfo {
            id,
            version,
            name,
            homepage,
            api,
            targets,
            metadata,
        } = module.info.clone();
        Self {
            id,
            version,
            name,
            homepage,
            api,
            optional: module.reference.optional,
            targets,
            metadata,
        }
    }
}

impl BuilderAssembler {
    /// Assembler reading base and package layers through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn ImageClient>) -> Self {
        Self {
            client,
            description: None,
        }
    }

    /// Description recorded in the builder metadata label.
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Build the image for `reference`.
    ///
    /// A module layer whose digest is already in the image is not added
    /// again. Nothing is written anywhere; the caller saves or pushes.
    pub async fn assemble(
        &self,
        reference: ImageReference,
        base: Option<LocalImage>,
        modules: Vec<ResolvedModule>,
        order: &OrderMetadata,
        stack: &StackMetadata,
    ) -> BuilderResult<AssembledImage> {
        tracing::info!(
            image = %reference,
            base = %base.as_ref().map_or_else(|| "scratch".to_string(), |b| b.reference.to_string()),
            modules = modules.len(),
            "Assembling builder"
        );

        let mut layers = Layers {
            descriptors: Vec::new(),
            diff_ids: Vec::new(),
            blobs: Vec::new(),
            history: Vec::new(),
            seen: BTreeSet::new(),
        };

        let (platform, mut execution, base_history) = match &base {
            Some(base) => {
                for layer in base.layers().map_err(|e| {
                    BuilderError::assembly(format!("base image {}: {e}", base.reference))
                })? {
                    let blob = self.blob(&layer.descriptor.digest, &base.reference).await?;
                    layers.seen.insert(layer.descriptor.digest.clone());
                    layers.descriptors.push(layer.descriptor);
                    layers.diff_ids.push(layer.diff_id);
                    layers.blobs.push(blob);
                }
                (
                    Platform {
                        os: base.config.os.clone(),
                        architecture: base.config.architecture.clone(),
                        variant: base.config.variant.clone(),
                    },
                    base.config.config.clone().unwrap_or_default(),
                    base.config.history.clone(),
                )
            }
            None => (Platform::host(), ExecutionConfig::default(), Vec::new()),
        };
        let base_layer_count = layers.descriptors.len();

        let mut index = LayerIndex::new();
        for module in &modules {
            self.add_module(module, &mut layers, &mut index).await?;
        }

        let order = order.pinned(&modules);
        let metadata_layer = metadata_layer(&modules, &order, stack)?;
        let metadata_digest = sha256_digest(&metadata_layer);
        layers.push(
            Descriptor::for_blob(media_types::LAYER_TAR, &metadata_layer),
            metadata_digest,
            metadata_layer,
            "packsmith: builder metadata".to_string(),
        );

        execution.labels.extend(self.labels(&modules, &order, stack, &index)?);

        // History must line up with the layers; keep it only when the base's does.
        let history = if base_history.iter().filter(|h| !h.empty_layer).count() == base_layer_count {
            base_history.into_iter().chain(layers.history).collect()
        } else {
            Vec::new()
        };

        let config = ImageConfig {
            created: Some(created()),
            author: None,
            architecture: platform.architecture,
            os: platform.os,
            variant: platform.variant,
            config: Some(execution),
            rootfs: RootFs {
                diff_ids: layers.diff_ids,
                ..RootFs::default()
            },
            history,
        };
        let config = Bytes::from(serde_json::to_vec(&config).map_err(serialization)?);
        let manifest = ImageManifest::new(
            Descriptor::for_blob(media_types::CONFIG, &config),
            layers.descriptors,
        );
        let manifest = Bytes::from(serde_json::to_vec(&manifest).map_err(serialization)?);
        let digest = sha256_digest(&manifest);

        tracing::info!(
            image = %reference,
            digest = %digest,
            layers = layers.blobs.len(),
            "Builder assembled"
        );
        Ok(AssembledImage {
            reference,
            digest,
            manifest,
            config,
            layers: layers.blobs,
        })
    }

    async fn add_module(
        &self,
        module: &ResolvedModule,
        layers: &mut Layers,
        index: &mut LayerIndex,
    ) -> BuilderResult<()> {
        let created_by = format!("packsmith: {}", module.reference);
        match &module.content {
            ModuleContent::Bare => {
                tracing::debug!(module = %module.reference, "No content to add");
            }
            ModuleContent::Staged { path, digest } => {
                let blob = tokio::fs::read(path).await.map_err(|e| {
                    BuilderError::assembly(format!(
                        "staged content for {} is missing: {e}",
                        module.reference
                    ))
                })?;
                let blob = Bytes::from(blob);
                if sha256_digest(&blob) != *digest {
                    return Err(BuilderError::assembly(format!(
                        "staged content for {} changed since it was resolved",
                        module.reference
                    )));
                }
                record(index, module, digest.clone());
                if layers.seen.contains(digest) {
                    tracing::debug!(module = %module.reference, digest = %digest, "Layer already present");
                    return Ok(());
                }
                layers.push(
                    Descriptor::for_blob(media_types::LAYER_TAR, &blob),
                    digest.clone(),
                    blob,
                    created_by,
                );
            }
            ModuleContent::Image { image } => {
                let image_layers = image.layers().map_err(|e| {
                    BuilderError::assembly(format!("{}: {e}", module.reference))
                })?;

                match image
                    .config
                    .label(LAYERS_LABEL)
                    .map(serde_json::from_str::<LayerIndex>)
                {
                    Some(Ok(packaged)) => {
                        for (id, versions) in packaged {
                            index.entry(id).or_default().extend(versions);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(BuilderError::assembly(format!(
                            "{}: malformed {LAYERS_LABEL} label: {e}",
                            module.reference
                        )));
                    }
                    None => {
                        if let Some(top) = image_layers.last() {
                            record(index, module, top.diff_id.clone());
                        }
                    }
                }

                for layer in image_layers {
                    if layers.seen.contains(&layer.descriptor.digest) {
                        tracing::debug!(
                            module = %module.reference,
                            digest = %layer.descriptor.digest,
                            "Layer already present"
                        );
                        continue;
                    }
                    let blob = self.blob(&layer.descriptor.digest, &image.reference).await?;
                    layers.push(layer.descriptor, layer.diff_id, blob, created_by.clone());
                }
            }
        }
        Ok(())
    }

    async fn blob(&self, digest: &str, image: &ImageReference) -> BuilderResult<Bytes> {
        self.client.read_blob(digest).await.map_err(|e| {
            BuilderError::assembly(format!("reading layer {digest} of {image}: {e}"))
        })
    }

    fn labels(
        &self,
        modules: &[ResolvedModule],
        order: &OrderMetadata,
        stack: &StackMetadata,
        index: &LayerIndex,
    ) -> BuilderResult<BTreeMap<String, String>> {
        let summaries = |kind: ModuleKind| -> Vec<ModuleSummary> {
            modules
                .iter()
                .filter(|m| m.reference.kind == kind)
                .map(|m| ModuleSummary {
                    id: m.info.id.clone(),
                    version: m.info.version.clone(),
                    homepage: m.info.homepage.clone(),
                })
                .collect()
        };
        let builder = BuilderLabel {
            description: self.description.as_deref(),
            buildpacks: summaries(ModuleKind::Buildpack),
            extensions: summaries(ModuleKind::Extension),
            stack: StackLabel {
                run_image: stack.run_images.first(),
            },
            created_by: CreatedBy {
                name: "packsmith",
                version: env!("CARGO_PKG_VERSION"),
            },
        };

        let mut labels = BTreeMap::new();
        labels.insert(BUILDER_METADATA_LABEL.to_string(), json(&builder)?);
        labels.insert(ORDER_LABEL.to_string(), json(&order.order)?);
        if !order.order_extensions.is_empty() {
            labels.insert(ORDER_EXTENSIONS_LABEL.to_string(), json(&order.order_extensions)?);
        }
        labels.insert(LAYERS_LABEL.to_string(), json(index)?);
        if let Some(id) = &stack.id {
            labels.insert(STACK_ID_LABEL.to_string(), id.clone());
        }
        Ok(labels)
    }
}

fn record(index: &mut LayerIndex, module: &ResolvedModule, diff_id: String) {
    let info = &module.info;
    let Some(version) = &info.version else {
        return;
    };
    index.entry(info.id.clone()).or_default().insert(
        version.clone(),
        LayerEntry {
            api: info.api.clone(),
            layer_diff_id: diff_id,
            name: info.name.clone(),
            homepage: info.homepage.clone(),
            targets: info.targets.clone(),
        },
    );
}

fn metadata_layer(
    modules: &[ResolvedModule],
    order: &OrderMetadata,
    stack: &StackMetadata,
) -> BuilderResult<Bytes> {
    let records = |kind: ModuleKind| -> Vec<ModuleRecord> {
        modules
            .iter()
            .filter(|m| m.reference.kind == kind)
            .map(ModuleRecord::new)
            .collect()
    };
    let modules_file = ModulesFile {
        buildpacks: records(ModuleKind::Buildpack),
        extensions: records(ModuleKind::Extension),
    };

    let layer_error = |e: PackError| BuilderError::assembly(format!("writing metadata layer: {e}"));
    let mut writer = LayerWriter::new();
    for (path, content) in [
        ("cnb/order.toml", toml_text(order)?),
        ("cnb/stack.toml", toml_text(stack)?),
        ("cnb/modules.toml", toml_text(&modules_file)?),
    ] {
        writer
            .add_file(path, 0o644, content.as_bytes())
            .map_err(layer_error)?;
    }
    Ok(writer.finish().map_err(layer_error)?.data)
}

fn created() -> String {
    let seconds = i64::try_from(NORMALIZED_MTIME).unwrap_or_default();
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn json<T: Serialize + ?Sized>(value: &T) -> BuilderResult<String> {
    serde_json::to_string(value).map_err(serialization)
}

fn toml_text<T: Serialize + ?Sized>(value: &T) -> BuilderResult<String> {
    toml::to_string(value)
        .map_err(|e| BuilderError::assembly(format!("writing builder metadata: {e}")))
}

fn serialization(err: serde_json::Error) -> BuilderError {
    BuilderError::assembly(format!("encoding image metadata: {err}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use packsmith_image::layer::{EntryKind, read_entries};

    use super::*;
    use crate::client::{MemoryClient, MemoryImage};
    use crate::diagnostics::Diagnostics;
    use crate::module::{GroupElement, ModuleId, ModuleReference, ModuleSource};

    fn staged(dir: &std::path::Path, id: &str, version: &str, content: &[u8]) -> ResolvedModule {
        let mut writer = LayerWriter::new();
        writer
            .add_file(&format!("cnb/buildpacks/{}/{version}/bin/build", id.replace('/', "_")), 0o755, content)
            .unwrap();
        let layer = writer.finish().unwrap();
        let path = dir.join(format!("{}.tar", layer.digest.trim_start_matches("sha256:")));
        std::fs::write(&path, &layer.data).unwrap();

        ResolvedModule {
            reference: ModuleReference {
                kind: ModuleKind::Buildpack,
                id: ModuleId::parse(id).unwrap(),
                version: Some(version.to_string()),
                source: ModuleSource::LocalPath(PathBuf::from("/unused")),
                optional: false,
            },
            info: ModuleInfo {
                id: id.to_string(),
                version: Some(version.to_string()),
                api: Some("0.10".to_string()),
                ..ModuleInfo::default()
            },
            content: ModuleContent::Staged {
                path,
                digest: layer.digest,
            },
            diagnostics: Diagnostics::new(),
        }
    }

    fn order(ids: &[&str]) -> OrderMetadata {
        OrderMetadata {
            order: vec![OrderEntry {
                group: ids
                    .iter()
                    .map(|id| GroupElement {
                        id: (*id).to_string(),
                        version: None,
                        optional: false,
                    })
                    .collect(),
            }],
            order_extensions: Vec::new(),
        }
    }

    fn target() -> ImageReference {
        ImageReference::parse("registry.example.com/builder:latest").unwrap()
    }

    fn config_of(image: &AssembledImage) -> ImageConfig {
        serde_json::from_slice(&image.config).unwrap()
    }

    #[tokio::test]
    async fn module_layers_follow_base_layers() {
        let client = Arc::new(MemoryClient::new());
        let mut base_writer = LayerWriter::new();
        base_writer.add_file("etc/os-release", 0o644, b"ID=test\n").unwrap();
        let base_layer = base_writer.finish().unwrap();
        let base_ref = ImageReference::parse("registry.example.com/base:1").unwrap();
        client.add_local(
            &base_ref,
            MemoryImage::new(vec![base_layer.clone()], BTreeMap::new()).unwrap(),
        );
        let base = client.find_local(&base_ref).await.unwrap().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let modules = vec![
            staged(dir.path(), "example/a", "1.0.0", b"a"),
            staged(dir.path(), "example/b", "2.0.0", b"b"),
        ];
        let a_digest = match &modules[0].content {
            ModuleContent::Staged { digest, .. } => digest.clone(),
            _ => unreachable!(),
        };

        let image = BuilderAssembler::new(client)
            .assemble(
                target(),
                Some(base),
                modules,
                &order(&["example/a", "example/b"]),
                &StackMetadata::default(),
            )
            .await
            .unwrap();

        let config = config_of(&image);
        assert_eq!(config.rootfs.diff_ids.len(), 4);
        assert_eq!(config.rootfs.diff_ids[0], base_layer.digest);
        assert_eq!(config.rootfs.diff_ids[1], a_digest);
        assert_eq!(config.created.as_deref(), Some("1980-01-01T00:00:01Z"));
        assert_eq!(image.layers.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_layers_are_added_once() {
        let client = Arc::new(MemoryClient::new());
        let dir = tempfile::tempdir().unwrap();
        let first = staged(dir.path(), "example/a", "1.0.0", b"same");
        let second = ResolvedModule {
            reference: ModuleReference {
                optional: true,
                ..first.reference.clone()
            },
            ..first.clone()
        };

        let image = BuilderAssembler::new(client)
            .assemble(target(), None, vec![first, second], &order(&["example/a"]), &StackMetadata::default())
            .await
            .unwrap();
        assert_eq!(config_of(&image).rootfs.diff_ids.len(), 2);
    }

    #[tokio::test]
    async fn labels_and_metadata_layer() {
        let client = Arc::new(MemoryClient::new());
        let dir = tempfile::tempdir().unwrap();
        let stack = StackMetadata {
            id: Some("io.buildpacks.stacks.jammy".into()),
            run_images: vec![RunImage {
                image: "registry.example.com/run:1".into(),
                mirrors: Vec::new(),
            }],
        };

        let image = BuilderAssembler::new(client)
            .with_description(Some("test builder".into()))
            .assemble(
                target(),
                None,
                vec![staged(dir.path(), "example/a", "1.0.0", b"a")],
                &order(&["example/a"]),
                &stack,
            )
            .await
            .unwrap();

        let labels = config_of(&image).labels();
        assert_eq!(labels[STACK_ID_LABEL], "io.buildpacks.stacks.jammy");
        assert!(!labels.contains_key(ORDER_EXTENSIONS_LABEL));

        let order: serde_json::Value = serde_json::from_str(&labels[ORDER_LABEL]).unwrap();
        assert_eq!(order[0]["group"][0]["version"], "1.0.0");

        let layers: serde_json::Value = serde_json::from_str(&labels[LAYERS_LABEL]).unwrap();
        assert_eq!(layers["example/a"]["1.0.0"]["api"], "0.10");

        let builder: serde_json::Value = serde_json::from_str(&labels[BUILDER_METADATA_LABEL]).unwrap();
        assert_eq!(builder["description"], "test builder");
        assert_eq!(builder["stack"]["runImage"]["image"], "registry.example.com/run:1");

        let metadata = read_entries(image.layers.last().unwrap()).unwrap();
        let order_toml = metadata
            .iter()
            .find(|e| e.path == "cnb/order.toml")
            .map(|e| match &e.kind {
                EntryKind::File(data) => String::from_utf8(data.clone()).unwrap(),
                _ => String::new(),
            })
            .unwrap();
        assert!(order_toml.contains("example/a"));
        assert!(metadata.iter().any(|e| e.path == "cnb/modules.toml"));
        assert!(metadata.iter().any(|e| e.path == "cnb/stack.toml"));
    }

    #[tokio::test]
    async fn assembly_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let build = || async {
            BuilderAssembler::new(Arc::new(MemoryClient::new()))
                .assemble(
                    target(),
                    None,
                    vec![staged(dir.path(), "example/a", "1.0.0", b"a")],
                    &order(&["example/a"]),
                    &StackMetadata::default(),
                )
                .await
                .unwrap()
        };
        assert_eq!(build().await.digest, build().await.digest);
    }

    #[tokio::test]
    async fn missing_staged_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        let module = staged(dir.path(), "example/a", "1.0.0", b"a");
        if let ModuleContent::Staged { path, .. } = &module.content {
            std::fs::remove_file(path).unwrap();
        }

        let err = BuilderAssembler::new(Arc::new(MemoryClient::new()))
            .assemble(target(), None, vec![module], &order(&["example/a"]), &StackMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::Assembly { .. }));
    }

    #[test]
    fn stack_metadata_falls_back_to_legacy_table() {
        let config = BuilderConfig::parse(
            br#"
            [stack]
            id = "io.buildpacks.stacks.jammy"
            run-image = "registry.example.com/run:1"
            run-image-mirrors = ["mirror.example.com/run:1"]
            "#,
        )
        .unwrap();
        let stack = StackMetadata::from_config(&config);
        assert_eq!(stack.id.as_deref(), Some("io.buildpacks.stacks.jammy"));
        assert_eq!(stack.run_images[0].mirrors, ["mirror.example.com/run:1"]);
    }
}
