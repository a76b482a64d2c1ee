//! Shared fixtures for integration tests: in-memory fakes of the C3/C4
//! capability traits, plus the small `Target` builder every scenario
//! needs. Mirrors the teacher's own `tests/common/mod.rs` role.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use otacore::app::AppEngine;
use otacore::commit::{CommitSource, CommitStore, MinFreeSpace};
use otacore::error::{AppEngineError, CommitStoreError};
use otacore::flow::FlowControl;
use otacore::target::{App, Target, Version};

pub struct FakeSource;
impl CommitSource for FakeSource {
    fn describe(&self) -> String {
        "fake".into()
    }
}

/// A commit store whose pull can be made to fail with `InsufficientSpace`
/// for a chosen digest, to exercise the cached no-space short-circuit.
pub struct FakeCommitStore {
    pub has: Mutex<BTreeSet<String>>,
    pub booted: Mutex<String>,
    pub fail_space_for: Mutex<Option<(String, u64)>>,
}

impl FakeCommitStore {
    pub fn new(booted: &str) -> Self {
        FakeCommitStore {
            has: Mutex::new(BTreeSet::new()),
            booted: Mutex::new(booted.to_string()),
            fail_space_for: Mutex::new(None),
        }
    }

    pub fn fail_with_no_space(&self, digest: &str, required: u64) {
        *self.fail_space_for.lock().unwrap() = Some((digest.to_string(), required));
    }
}

impl CommitStore for FakeCommitStore {
    fn has_commit(&self, hash: &str) -> Result<bool, CommitStoreError> {
        Ok(self.has.lock().unwrap().contains(hash))
    }

    fn pull_commit(&self, hash: &str, _source: &dyn CommitSource, _flow: &FlowControl) -> Result<(), CommitStoreError> {
        if let Some((digest, required)) = self.fail_space_for.lock().unwrap().clone() {
            if digest == hash {
                return Err(CommitStoreError::InsufficientSpace {
                    hash: hash.to_string(),
                    required,
                    available: 0,
                });
            }
        }
        self.has.lock().unwrap().insert(hash.to_string());
        Ok(())
    }

    fn deploy(&self, hash: &str) -> Result<(), CommitStoreError> {
        *self.booted.lock().unwrap() = hash.to_string();
        Ok(())
    }

    fn list_deployments(&self) -> Result<Vec<String>, CommitStoreError> {
        Ok(vec![self.booted.lock().unwrap().clone()])
    }

    fn current_booted_hash(&self) -> Result<String, CommitStoreError> {
        Ok(self.booted.lock().unwrap().clone())
    }

    fn pending_hash(&self) -> Result<Option<String>, CommitStoreError> {
        Ok(None)
    }

    fn rollback_hash(&self) -> Result<Option<String>, CommitStoreError> {
        Ok(None)
    }

    fn set_min_free_space(&self, _p: MinFreeSpace) -> Result<(), CommitStoreError> {
        Ok(())
    }
}

/// An app engine that records every `fetch`/`run` call so tests can assert
/// on call counts (e.g. "zero apps means zero container calls").
pub struct FakeAppEngine {
    pub fail_run_for: Mutex<BTreeSet<String>>,
    pub fetch_calls: Mutex<Vec<String>>,
    pub run_calls: Mutex<Vec<String>>,
}

impl FakeAppEngine {
    pub fn new() -> Self {
        FakeAppEngine {
            fail_run_for: Mutex::new(BTreeSet::new()),
            fetch_calls: Mutex::new(Vec::new()),
            run_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_run(&self, app_name: &str) {
        self.fail_run_for.lock().unwrap().insert(app_name.to_string());
    }
}

impl AppEngine for FakeAppEngine {
    fn fetch(&self, app: &App, _flow: &FlowControl) -> Result<(), AppEngineError> {
        self.fetch_calls.lock().unwrap().push(app.name.clone());
        Ok(())
    }

    fn verify(&self, _app: &App) -> Result<(), AppEngineError> {
        Ok(())
    }

    fn install(&self, _app: &App) -> Result<(), AppEngineError> {
        Ok(())
    }

    fn run(&self, app: &App) -> Result<(), AppEngineError> {
        self.run_calls.lock().unwrap().push(app.name.clone());
        if self.fail_run_for.lock().unwrap().contains(&app.name) {
            Err(AppEngineError::StartFailed {
                app: app.name.clone(),
                reason: "simulated failure".into(),
            })
        } else {
            Ok(())
        }
    }

    fn stop(&self, _app: &App) -> Result<(), AppEngineError> {
        Ok(())
    }

    fn remove(&self, _app: &App) -> Result<(), AppEngineError> {
        Ok(())
    }

    fn is_fetched(&self, _app: &App) -> bool {
        true
    }

    fn is_running(&self, app: &App) -> bool {
        !self.fail_run_for.lock().unwrap().contains(&app.name)
    }

    fn prune(&self, _shortlist: &[String]) -> Result<(), AppEngineError> {
        Ok(())
    }
}

pub fn mk_target(name: &str, sha: &str, version: &str) -> Target {
    Target {
        name: name.to_string(),
        version: Version::new(version),
        sha256: sha.to_string(),
        hardware_ids: BTreeSet::new(),
        tags: BTreeSet::new(),
        apps: BTreeMap::new(),
        bootfw_version: None,
        initial: false,
    }
}

pub fn mk_app(name: &str, digest: &str) -> App {
    App {
        name: name.to_string(),
        uri: format!("hub/factory/{name}@sha256:{digest}"),
    }
}

pub fn state_dir() -> (Utf8PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (path, dir)
}
