//! Integration tests for packsmith-image.

use bytes::Bytes;
use packsmith_image::layer::{EntryKind, read_entries};
use packsmith_image::{ImageReference, ImageStore, LayerWriter};
use packsmith_oci::image::RootFs;
use packsmith_oci::{Descriptor, ImageConfig, ImageManifest, media_types, sha256_digest};
use tempfile::tempdir;

fn write_image(store: &mut ImageStore, reference: &str, layers: &[Bytes]) -> String {
    let config = ImageConfig {
        architecture: "amd64".into(),
        os: "linux".into(),
        rootfs: RootFs {
            fs_type: "layers".into(),
            diff_ids: layers.iter().map(|l| sha256_digest(l)).collect(),
        },
        ..ImageConfig::default()
    };
    let config_bytes = serde_json::to_vec(&config).unwrap();
    let manifest = ImageManifest::new(
        Descriptor::for_blob(media_types::CONFIG, &config_bytes),
        layers
            .iter()
            .map(|l| Descriptor::for_blob(media_types::LAYER_TAR, l))
            .collect(),
    );
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

    let reference = ImageReference::parse(reference).unwrap();
    store
        .save(&reference, &manifest_bytes, &config_bytes, layers)
        .unwrap()
        .digest
}

#[test]
fn test_blob_storage() {
    let temp = tempdir().unwrap();
    let store = ImageStore::new(temp.path()).unwrap();

    let data = b"test blob content";
    let digest = store.store_blob(data).unwrap();
    assert!(digest.starts_with("sha256:"));

    let retrieved = store.get_blob(&digest).unwrap().unwrap();
    assert_eq!(retrieved, &data[..]);

    assert!(store.has_blob(&digest));
    assert!(!store.has_blob("sha256:nonexistent"));
}

#[test]
fn stored_layers_read_back_intact() {
    let temp = tempdir().unwrap();
    let mut store = ImageStore::new(temp.path()).unwrap();

    let mut writer = LayerWriter::new();
    writer
        .add_file("cnb/buildpacks/example_node/1.0.0/bin/build", 0o755, b"#!/bin/sh\n")
        .unwrap();
    let layer = writer.finish().unwrap();

    write_image(&mut store, "registry.example.com/buildpacks/node:1.0.0", &[layer.data]);

    let reference = ImageReference::parse("registry.example.com/buildpacks/node:1.0.0").unwrap();
    let image = store.load(&reference).unwrap().unwrap();
    let layers = image.layers().unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].descriptor.digest, layers[0].diff_id);

    let blob = store.get_blob(&layers[0].descriptor.digest).unwrap().unwrap();
    let entries = read_entries(&blob).unwrap();
    let build = entries
        .iter()
        .find(|e| e.path.ends_with("bin/build"))
        .unwrap();
    assert_eq!(build.mode, 0o755);
    assert_eq!(build.kind, EntryKind::File(b"#!/bin/sh\n".to_vec()));
}

#[test]
fn retagging_points_at_latest_save() {
    let temp = tempdir().unwrap();
    let mut store = ImageStore::new(temp.path()).unwrap();

    let first = write_image(&mut store, "example.com/builder:latest", &[Bytes::from_static(b"one")]);
    let second = write_image(&mut store, "example.com/builder:latest", &[Bytes::from_static(b"two")]);
    assert_ne!(first, second);

    let reference = ImageReference::parse("example.com/builder:latest").unwrap();
    assert_eq!(store.load(&reference).unwrap().unwrap().digest, second);
}

#[test]
fn missing_layer_blob_hides_image() {
    let temp = tempdir().unwrap();
    let mut store = ImageStore::new(temp.path()).unwrap();
    let layer = Bytes::from_static(b"layer");
    write_image(&mut store, "example.com/run:1", &[layer.clone()]);

    let hash = sha256_digest(&layer);
    let path = temp
        .path()
        .join("blobs/sha256")
        .join(hash.trim_start_matches("sha256:"));
    std::fs::remove_file(path).unwrap();

    let reference = ImageReference::parse("example.com/run:1").unwrap();
    assert!(store.load(&reference).unwrap().is_none());
}
