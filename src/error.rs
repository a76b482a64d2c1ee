//! Error taxonomy (spec §7). One enum per component; the install state
//! machine is the only place that pattern-matches across all of them.

use thiserror::Error;

/// TUF-layer failures (C1).
#[derive(Debug, Error)]
pub enum TufError {
    #[error("metadata for role {role} failed validation: {reason}")]
    MetadataInvalid { role: String, reason: String },

    #[error("failed to fetch {role}: {source}")]
    MetadataFetchFailed {
        role: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{role} metadata expired at {expires}")]
    ExpiredMetadata { role: String, expires: String },

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("cooperative cancellation requested")]
    Cancelled,
}

/// Storage accounting failures (C2).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("insufficient space at {path}: required {required} available {available}")]
    InsufficientSpace {
        path: String,
        required: u64,
        available: u64,
    },

    #[error("failed to stat volume at {path}: {reason}")]
    StatFailed { path: String, reason: String },
}

/// OCI distribution client failures (C5).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry advertises unsupported auth scheme: {0}")]
    UnsupportedAuthScheme(String),

    #[error("bearer token exchange failed: {0}")]
    AuthFailed(String),

    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    VerificationFailed {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("declared size exceeded while streaming {what}")]
    SizeExceeded { what: String },

    #[error("transport error fetching {what}: {source}")]
    Transport {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cooperative cancellation requested")]
    Cancelled,
}

/// App Engine failures (C4).
#[derive(Debug, Error)]
pub enum AppEngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("insufficient space to fetch app {app}: required {required} available {available}")]
    InsufficientSpace {
        app: String,
        required: u64,
        available: u64,
    },

    #[error("compose manifest for {app} failed validation: {reason}")]
    ComposeInvalid { app: String, reason: String },

    #[error("failed to materialize images for {app}: {reason}")]
    InstallFailed { app: String, reason: String },

    #[error("failed to start containers for {app}: {reason}")]
    StartFailed { app: String, reason: String },

    #[error("io error operating on app {app}: {source}")]
    Io {
        app: String,
        #[source]
        source: std::io::Error,
    },
}

/// Commit store adapter failures (C3), as surfaced back to the core.
#[derive(Debug, Error)]
pub enum CommitStoreError {
    #[error("insufficient space pulling commit {hash}: required {required} available {available}")]
    InsufficientSpace {
        hash: String,
        required: u64,
        available: u64,
    },

    #[error("failed to pull commit {hash}: {reason}")]
    PullFailed { hash: String, reason: String },

    #[error("failed to deploy commit {hash}: {reason}")]
    DeployFailed { hash: String, reason: String },
}

/// Install state machine failures (C7), the union the state machine
/// actually matches on to decide rollback behavior.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Tuf(#[from] TufError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    CommitStore(#[from] CommitStoreError),

    #[error(transparent)]
    App(#[from] AppEngineError),

    #[error("another update instance is already running")]
    AnotherInstanceRunning,

    #[error("a prior boot-firmware update needs a reboot-confirmation before proceeding")]
    BootFwNeedsCompletion,

    #[error("apps failed to start after reboot: {0}")]
    AppsStartFailed(String),

    #[error("cooperative cancellation requested")]
    Cancelled,

    #[error("persisted state is inconsistent: {0}")]
    CorruptState(String),
}

impl InstallError {
    /// True if this failure class should trigger the rollback path rather
    /// than simply surfacing to the caller (spec §4.7, §7).
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            InstallError::App(_)
                | InstallError::CommitStore(_)
                | InstallError::AppsStartFailed(_)
        )
    }
}
