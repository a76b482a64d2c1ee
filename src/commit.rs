//! Commit Store Adapter (C3): the capability the core uses to fetch,
//! verify, and deploy a rootfs commit. The store implementation itself
//! (OSTree or otherwise) is out of scope; this trait is the seam.

use crate::error::CommitStoreError;
use crate::flow::FlowControl;

/// A source the commit store can pull objects from — either the network
/// (HTTPS, delegated to the store's own transport) or an offline directory
/// (C8 presents this for `ostree_repo/`).
pub trait CommitSource: Send + Sync {
    fn describe(&self) -> String;
}

/// Capability record replacing the original's `PackageManagerInterface`
/// inheritance (spec.md §9): a struct of trait methods rather than virtual
/// dispatch, substitutable at construction time.
pub trait CommitStore: Send + Sync {
    fn has_commit(&self, hash: &str) -> Result<bool, CommitStoreError>;

    /// Atomic from the caller's point of view: on failure the store is
    /// left unchanged.
    fn pull_commit(
        &self,
        hash: &str,
        source: &dyn CommitSource,
        flow: &FlowControl,
    ) -> Result<(), CommitStoreError>;

    /// Makes `hash` the pending deployment; the next boot will try it.
    fn deploy(&self, hash: &str) -> Result<(), CommitStoreError>;

    fn list_deployments(&self) -> Result<Vec<String>, CommitStoreError>;

    fn current_booted_hash(&self) -> Result<String, CommitStoreError>;
    fn pending_hash(&self) -> Result<Option<String>, CommitStoreError>;
    fn rollback_hash(&self) -> Result<Option<String>, CommitStoreError>;

    /// Forwarded to the underlying commit store's own garbage-collection
    /// reserved-space setting.
    fn set_min_free_space(&self, percent_or_bytes: MinFreeSpace) -> Result<(), CommitStoreError>;
}

#[derive(Debug, Clone, Copy)]
pub enum MinFreeSpace {
    Percent(u32),
    Bytes(u64),
}
