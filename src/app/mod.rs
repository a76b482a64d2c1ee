//! App Engine (C4): content-addressed fetch, integrity verification,
//! install-into-runtime, start, stop, prune of container applications.

pub mod engine;
pub mod state;

pub use engine::DefaultAppEngine;
pub use state::AppState;

use crate::error::AppEngineError;
use crate::flow::FlowControl;
use crate::target::App;

/// Capability record replacing the original's `AppEngine` virtual-dispatch
/// hierarchy (`ctr::AppEngine` over `Docker::RestorableAppEngine`): a
/// trait object substitutable at construction time (spec.md §9). Blocking
/// by design, per spec.md §5: the core is single-threaded and cooperative
/// within one update cycle.
pub trait AppEngine: Send + Sync {
    /// Idempotent and resumable: if the store already contains every
    /// referenced object bit-identically, no network I/O occurs.
    fn fetch(&self, app: &App, flow: &FlowControl) -> Result<(), AppEngineError>;

    /// Re-runs compose-manifest validation.
    fn verify(&self, app: &App) -> Result<(), AppEngineError>;

    /// Materializes images into the container runtime store and creates
    /// containers; does not start them.
    fn install(&self, app: &App) -> Result<(), AppEngineError>;

    /// `up -d --remove-orphans`.
    fn run(&self, app: &App) -> Result<(), AppEngineError>;

    fn stop(&self, app: &App) -> Result<(), AppEngineError>;
    fn remove(&self, app: &App) -> Result<(), AppEngineError>;

    fn is_fetched(&self, app: &App) -> bool;
    fn is_running(&self, app: &App) -> bool;

    /// Removes apps not in `shortlist` and deletes blobs unreferenced by
    /// any shortlisted app's transitive image layers.
    fn prune(&self, shortlist: &[String]) -> Result<(), AppEngineError>;
}
