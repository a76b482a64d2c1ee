//! Advisory OS-level file locking (spec.md §5): at most one update cycle
//! per device at a time. Ported from the original's `create_lock`/`Lock`,
//! using `fs2` the way `containers-bootc`'s `StatefileSaved::acquire_write_lock`
//! takes a system-wide write lock.

use std::fs::{File, OpenOptions};

use camino::Utf8Path;
use fs2::FileExt;
use tracing::info;

use crate::error::InstallError;

/// A held exclusive advisory lock, released on drop.
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Acquires an exclusive lock on `path`, blocking until available.
    /// Creates the lockfile if absent.
    pub fn acquire(path: &Utf8Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        info!(path = %path, "acquiring lock");
        file.lock_exclusive()?;
        Ok(LockGuard { file })
    }

    /// Attempts the lock without blocking; fails fast with
    /// `AnotherInstanceRunning` if another process holds it.
    pub fn try_acquire(path: &Utf8Path) -> Result<Self, InstallError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| InstallError::CorruptState(format!("opening lock file {path}: {e}")))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockGuard { file }),
            Err(_) => Err(InstallError::AnotherInstanceRunning),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The set of well-known lock paths the embedder owns (spec.md §9: "these
/// become an explicit `LockSet` owned by the embedder"). The core takes
/// references to lock handles and releases them deterministically on any
/// exit path, rather than reaching for process-wide globals.
pub struct LockSet {
    pub update_lockfile: camino::Utf8PathBuf,
    pub download_lockfile: camino::Utf8PathBuf,
}

impl LockSet {
    pub fn new(
        update_lockfile: impl Into<camino::Utf8PathBuf>,
        download_lockfile: impl Into<camino::Utf8PathBuf>,
    ) -> Self {
        LockSet {
            update_lockfile: update_lockfile.into(),
            download_lockfile: download_lockfile.into(),
        }
    }

    /// Acquires the update-cycle lock; fails fast if another instance holds
    /// it. Read-only inspection operations never call this.
    pub fn acquire_update_lock(&self) -> Result<LockGuard, InstallError> {
        LockGuard::try_acquire(&self.update_lockfile)
    }

    pub fn acquire_download_lock(&self) -> std::io::Result<LockGuard> {
        LockGuard::acquire(&self.download_lockfile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("update.lock");
        let _first = LockGuard::try_acquire(&path).unwrap();
        let second = LockGuard::try_acquire(&path);
        assert!(matches!(second, Err(InstallError::AnotherInstanceRunning)));
    }

    #[test]
    fn lock_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("update.lock");
        {
            let _guard = LockGuard::try_acquire(&path).unwrap();
        }
        let _again = LockGuard::try_acquire(&path).unwrap();
    }
}
