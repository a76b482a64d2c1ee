//! Offline Source Adapter (C8): presents a filesystem directory
//! (`tuf/`, `ostree_repo/`, `apps/`, `blobs/sha256/`) as the same
//! interfaces the TUF client (C1) and the registry client (C5) consume
//! from the network. Ported from `tuf/localreposource.cc` and
//! `offline/client.cc`/`offline/fetcher.cc`.

use camino::Utf8PathBuf;

use crate::error::{RegistryError, TufError};
use crate::tuf::{Role, RepoSource};

/// A directory laid out the way spec.md §6 describes an offline bundle:
/// `tuf/<version>.<role>.json`, `ostree_repo/`, `apps/<name>/<digest>/…`,
/// `blobs/sha256/<hex>`.
pub struct OfflineSource {
    root: Utf8PathBuf,
}

impl OfflineSource {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        OfflineSource { root: root.into() }
    }

    pub fn ostree_repo_dir(&self) -> Utf8PathBuf {
        self.root.join("ostree_repo")
    }

    pub fn apps_dir(&self) -> Utf8PathBuf {
        self.root.join("apps")
    }

    fn blobs_dir(&self) -> Utf8PathBuf {
        self.root.join("blobs").join("sha256")
    }

    /// True iff this bundle contains at least one `<hwid>.targets.json`-
    /// addressable target, i.e. the bundle is usable at all (spec.md §4.8:
    /// "a valid offline bundle must contain enough content to satisfy at
    /// least one Target for the device's hardware-id").
    pub fn has_any_target(&self) -> bool {
        self.root.join("tuf").read_dir().is_ok()
    }

    fn hex_digest(digest: &str) -> &str {
        digest.strip_prefix("sha256:").unwrap_or(digest)
    }

    /// Registry manifest GET equivalent: the digest suffix of the request
    /// is read straight out of `blobs/sha256/<digest>`.
    pub fn get_manifest(&self, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let path = self.blobs_dir().join(Self::hex_digest(digest));
        std::fs::read(&path).map_err(|e| RegistryError::Transport {
            what: format!("offline manifest {digest}"),
            source: e.into(),
        })
    }

    /// Registry blob download equivalent: same lookup, returning the path
    /// rather than the bytes since blobs are read by the caller as a
    /// stream in the networked case.
    pub fn blob_path(&self, digest: &str) -> Result<Utf8PathBuf, RegistryError> {
        let path = self.blobs_dir().join(Self::hex_digest(digest));
        if !path.exists() {
            return Err(RegistryError::Transport {
                what: format!("offline blob {digest}"),
                source: anyhow::anyhow!("blob not present in offline bundle: {path}"),
            });
        }
        Ok(path)
    }
}

impl RepoSource for OfflineSource {
    /// `<version>.<role>.json` for root (the only versioned role);
    /// `<role>.json` otherwise. Absent files surface as `TargetNotFound`,
    /// the sentinel the root-rotation loop in `TufClient::update_meta`
    /// uses to detect "no further root to rotate to".
    fn fetch_role(&self, role: Role, version: Option<u64>) -> Result<Vec<u8>, TufError> {
        let filename = match version {
            Some(v) => format!("{v}.{}.json", role.as_str()),
            None => format!("{}.json", role.as_str()),
        };
        let path = self.root.join("tuf").join(&filename);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TufError::TargetNotFound(filename))
            }
            Err(e) => Err(TufError::MetadataFetchFailed {
                role: role.as_str().to_string(),
                source: anyhow::anyhow!("reading {path}: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_version_is_target_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tuf")).unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = OfflineSource::new(root);
        let err = source.fetch_role(Role::Root, Some(1)).unwrap_err();
        assert!(matches!(err, TufError::TargetNotFound(_)));
    }

    #[test]
    fn present_root_version_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tuf")).unwrap();
        std::fs::write(dir.path().join("tuf").join("1.root.json"), b"{}").unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = OfflineSource::new(root);
        let bytes = source.fetch_role(Role::Root, Some(1)).unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[test]
    fn missing_blob_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = OfflineSource::new(root);
        assert!(source.blob_path("sha256:deadbeef").is_err());
    }
}
