//! Offline Source Adapter (C8) exercised end-to-end: a bundle directory
//! is built on disk and read back through the same `RepoSource`/manifest
//! interfaces the networked TUF and registry clients use.

use otacore::offline::OfflineSource;
use otacore::tuf::{RepoSource, Role};

fn write(path: &std::path::Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn offline_bundle_serves_root_rotation_sequence() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("tuf/1.root.json"), b"{\"v\":1}");
    write(&dir.path().join("tuf/2.root.json"), b"{\"v\":2}");
    write(&dir.path().join("tuf/timestamp.json"), b"{}");
    write(&dir.path().join("tuf/snapshot.json"), b"{}");
    write(&dir.path().join("tuf/targets.json"), b"{}");

    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let source = OfflineSource::new(root);
    assert!(source.has_any_target());

    assert_eq!(source.fetch_role(Role::Root, Some(1)).unwrap(), b"{\"v\":1}");
    assert_eq!(source.fetch_role(Role::Root, Some(2)).unwrap(), b"{\"v\":2}");
    assert!(matches!(
        source.fetch_role(Role::Root, Some(3)).unwrap_err(),
        otacore::error::TufError::TargetNotFound(_)
    ));
    assert!(source.fetch_role(Role::Timestamp, None).is_ok());
}

#[test]
fn offline_bundle_serves_blobs_by_digest() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("blobs/sha256/deadbeef"), b"manifest-bytes");

    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let source = OfflineSource::new(root);

    let manifest = source.get_manifest("sha256:deadbeef").unwrap();
    assert_eq!(manifest, b"manifest-bytes");

    let path = source.blob_path("sha256:deadbeef").unwrap();
    assert!(path.as_str().ends_with("deadbeef"));

    assert!(source.get_manifest("sha256:notpresent").is_err());
}
