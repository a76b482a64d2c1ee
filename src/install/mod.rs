//! Install State Machine (C7): the two-phase install workflow with
//! persisted pending-install and pending-bootfw records, orchestrating
//! the Commit Store (C3) and App Engine (C4); implements rollback on any
//! failure class. Ported from `aklite_client_ext.cc::PullAndInstall`/
//! `Rollback` and `helpers.cc::finalizeIfNeeded`.

use std::collections::BTreeSet;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::app::AppEngine;
use crate::bootflags::{confirm, layer_update, needs_completion};
use crate::commit::{CommitSource, CommitStore};
use crate::error::InstallError;
use crate::flow::FlowControl;
use crate::storage::db::{
    read_bootfw_record, write_bootfw_record, write_pending_install, BootFwRecord, InstallMode,
    InstalledVersionLog, PendingInstall, VersionMode,
};
use crate::target::Target;

/// Post-install outcome handed back to the embedder, mapped onto the
/// numeric exit-code taxonomy (spec.md §6) for wrapper scripts. Codes not
/// in the spec's representative table are filled in pragmatically; see
/// DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostInstallCode {
    Ok,
    NeedReboot,
    NeedRebootForBootFw,
    NeedDockerRestart,
    AlreadyInstalled,
    DowngradeAttempt,
    RollbackOk,
    RollbackNeedReboot,
    RollbackToUnknown,
    RollbackFailed,
    DownloadFailureNoSpace,
}

impl PostInstallCode {
    pub fn exit_code(self) -> u32 {
        match self {
            PostInstallCode::Ok => 0,
            PostInstallCode::NeedRebootForBootFw => 90,
            PostInstallCode::NeedReboot => 100,
            PostInstallCode::RollbackOk => 110,
            PostInstallCode::RollbackNeedReboot => 120,
            PostInstallCode::RollbackFailed => 130,
            PostInstallCode::DownloadFailureNoSpace => 60,
            // Not assigned a slot in spec.md §6's representative table;
            // chosen to not collide with any listed value.
            PostInstallCode::AlreadyInstalled => 40,
            PostInstallCode::DowngradeAttempt => 15,
            PostInstallCode::NeedDockerRestart => 95,
            PostInstallCode::RollbackToUnknown => 115,
        }
    }
}

/// A cached `(digest, required, available_at_failure)` short-circuit
/// (spec.md §4.7: "refuses early if free space has not increased since the
/// last failure at the same digest").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SpaceFailureMemo {
    digest: String,
    required: u64,
    available_at_failure: u64,
}

fn load_space_memo(path: &camino::Utf8Path) -> Option<SpaceFailureMemo> {
    std::fs::read_to_string(path).ok().and_then(|s| serde_json::from_str(&s).ok())
}

fn save_space_memo(path: &camino::Utf8Path, memo: &SpaceFailureMemo) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(camino::Utf8Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(serde_json::to_string(memo).unwrap_or_default().as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn clear_space_memo(path: &camino::Utf8Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub struct Installer {
    commit_store: Arc<dyn CommitStore>,
    app_engine: Arc<dyn AppEngine>,
    pending_install_path: Utf8PathBuf,
    bootfw_record_path: Utf8PathBuf,
    space_failure_path: Utf8PathBuf,
}

impl Installer {
    pub fn new(
        commit_store: Arc<dyn CommitStore>,
        app_engine: Arc<dyn AppEngine>,
        state_dir: Utf8PathBuf,
    ) -> Self {
        Installer {
            commit_store,
            app_engine,
            pending_install_path: state_dir.join("pending-install"),
            bootfw_record_path: state_dir.join("bootfw-record"),
            space_failure_path: state_dir.join("last-download-failure"),
        }
    }

    fn bootfw_record(&self) -> BootFwRecord {
        read_bootfw_record(&self.bootfw_record_path)
            .ok()
            .flatten()
            .unwrap_or(BootFwRecord {
                bootfw_version: 0,
                bootupgrade_available: 0,
            })
    }

    /// `Idle → Downloading → Installed-AwaitingReboot` (or
    /// `Installed-BootFwNeedsReboot`), or `Downloading → <error>` on any
    /// fatal fetch/deploy failure, before any device state has changed.
    pub fn install(
        &self,
        log: &mut InstalledVersionLog,
        target: &Target,
        mode: InstallMode,
        shortlist: &BTreeSet<String>,
        source: &dyn CommitSource,
        current_available_bytes: u64,
        flow: &FlowControl,
    ) -> Result<PostInstallCode, InstallError> {
        let record = self.bootfw_record();
        if needs_completion(&record) {
            return Err(InstallError::BootFwNeedsCompletion);
        }

        if let Some(memo) = load_space_memo(&self.space_failure_path) {
            if memo.digest == target.sha256 && current_available_bytes <= memo.available_at_failure {
                info!(digest = %target.sha256, "short-circuiting install: no free space increase since last failure");
                return Ok(PostInstallCode::DownloadFailureNoSpace);
            }
        }

        flow.check_install()?;
        if !self.commit_store.has_commit(&target.sha256)? {
            if let Err(e) = self.commit_store.pull_commit(&target.sha256, source, flow) {
                if let crate::error::CommitStoreError::InsufficientSpace { required, .. } = &e {
                    let _ = save_space_memo(
                        &self.space_failure_path,
                        &SpaceFailureMemo {
                            digest: target.sha256.clone(),
                            required: *required,
                            available_at_failure: current_available_bytes,
                        },
                    );
                    return Ok(PostInstallCode::DownloadFailureNoSpace);
                }
                return Err(e.into());
            }
        }

        for (_, app) in target.shortlisted_apps(shortlist) {
            flow.check_install()?;
            self.app_engine.fetch(&app, flow)?;
        }

        self.commit_store.deploy(&target.sha256)?;
        let _ = clear_space_memo(&self.space_failure_path);

        let pending = PendingInstall::new(target.name.clone(), target.version.as_str(), mode, now_unix());
        write_pending_install(&self.pending_install_path, &pending)
            .map_err(|e| InstallError::CorruptState(format!("persisting pending install: {e}")))?;
        log.append(target, VersionMode::Pending)
            .map_err(|e| InstallError::CorruptState(format!("appending pending log entry: {e}")))?;

        if let Some(bootfw_version) = target.bootfw_version {
            if bootfw_version != record.bootfw_version {
                let layered = layer_update(record, bootfw_version);
                write_bootfw_record(&self.bootfw_record_path, &layered)
                    .map_err(|e| InstallError::CorruptState(format!("persisting bootfw record: {e}")))?;
                return Ok(PostInstallCode::NeedRebootForBootFw);
            }
        }

        Ok(PostInstallCode::NeedReboot)
    }

    /// `Installed-AwaitingReboot → Finalized` / `Rollback-Needed`, run
    /// after the embedder detects a reboot and observes `booted_sha256`.
    /// Absent a pending install, falls back to scanning `current_history`
    /// for the booted commit (resolves a previously-open question: `bad`
    /// entries are never part of `current_history` so they are never
    /// considered a match here).
    pub fn finalize(
        &self,
        log: &mut InstalledVersionLog,
        booted_sha256: &str,
        reboot_detected: bool,
        source: &dyn CommitSource,
        flow: &FlowControl,
    ) -> Result<PostInstallCode, InstallError> {
        let Some(pending_entry) = log
            .pending()
            .map_err(|e| InstallError::CorruptState(format!("reading pending log entry: {e}")))?
        else {
            return self.finalize_without_pending(log, booted_sha256);
        };
        let target = pending_entry.target;

        if booted_sha256 == target.sha256 {
            for (_, app) in &target.apps {
                if let Err(e) = self.app_engine.run(app) {
                    warn!(app = %app.name, error = %e, "app failed to start after install, rolling back");
                    return self.rollback_commit(log, &target, source, flow);
                }
            }

            info!(target = %target.name, "marking target install complete");
            log.append(&target, VersionMode::Current)
                .map_err(|e| InstallError::CorruptState(format!("appending current log entry: {e}")))?;
            let _ = std::fs::remove_file(&self.pending_install_path);

            let record = self.bootfw_record();
            if needs_completion(&record) {
                write_bootfw_record(&self.bootfw_record_path, &confirm(record))
                    .map_err(|e| InstallError::CorruptState(format!("confirming bootfw record: {e}")))?;
            }

            return Ok(PostInstallCode::Ok);
        }

        if !reboot_detected {
            return Ok(PostInstallCode::NeedReboot);
        }

        warn!(
            expected = %target.sha256,
            found = %booted_sha256,
            "booted commit does not match pending install, system experienced a rollback"
        );
        self.rollback_commit(log, &target, source, flow)
    }

    fn finalize_without_pending(
        &self,
        log: &InstalledVersionLog,
        booted_sha256: &str,
    ) -> Result<PostInstallCode, InstallError> {
        let history = log
            .current_history()
            .map_err(|e| InstallError::CorruptState(format!("reading current history: {e}")))?;
        if history.iter().any(|t| t.sha256 == booted_sha256) {
            return Ok(PostInstallCode::AlreadyInstalled);
        }
        Err(InstallError::CorruptState(format!(
            "no pending install and booted commit {booted_sha256} is not in installed-version history"
        )))
    }

    /// `Rollback-Needed → Rollback-Commit → Rollback-Completed`/`Failed`:
    /// marks `bad_target` bad, deploys the most recent prior `current`
    /// target, and brings its apps back up.
    fn rollback_commit(
        &self,
        log: &mut InstalledVersionLog,
        bad_target: &Target,
        source: &dyn CommitSource,
        flow: &FlowControl,
    ) -> Result<PostInstallCode, InstallError> {
        log.append(bad_target, VersionMode::Bad)
            .map_err(|e| InstallError::CorruptState(format!("marking bad target: {e}")))?;

        let history = log
            .current_history()
            .map_err(|e| InstallError::CorruptState(format!("reading current history: {e}")))?;
        let Some(prior) = history.into_iter().find(|t| t.sha256 != bad_target.sha256) else {
            warn!("no prior current target available, rollback target unknown");
            return Ok(PostInstallCode::RollbackToUnknown);
        };

        if let Err(e) = self.commit_store.pull_commit(&prior.sha256, source, flow) {
            warn!(error = %e, "rollback pull failed");
            return Ok(PostInstallCode::RollbackFailed);
        }
        if let Err(e) = self.commit_store.deploy(&prior.sha256) {
            warn!(error = %e, "rollback deploy failed");
            return Ok(PostInstallCode::RollbackFailed);
        }

        let booted = self.commit_store.current_booted_hash().unwrap_or_default();
        if booted != prior.sha256 {
            let pending = PendingInstall::new(prior.name.clone(), prior.version.as_str(), InstallMode::All, now_unix());
            if let Err(e) = write_pending_install(&self.pending_install_path, &pending) {
                warn!(error = %e, "failed persisting rollback pending install");
                return Ok(PostInstallCode::RollbackFailed);
            }
            let _ = log.append(&prior, VersionMode::Pending);
            return Ok(PostInstallCode::RollbackNeedReboot);
        }

        for (_, app) in &prior.apps {
            if let Err(e) = self.app_engine.install(app).and_then(|_| self.app_engine.run(app)) {
                warn!(app = %app.name, error = %e, "rollback app start failed");
                return Ok(PostInstallCode::RollbackFailed);
            }
        }

        log.append(&prior, VersionMode::Current)
            .map_err(|e| InstallError::CorruptState(format!("appending rollback current entry: {e}")))?;
        let _ = std::fs::remove_file(&self.pending_install_path);
        Ok(PostInstallCode::RollbackOk)
    }
}

/// Timestamps come from the embedder: this crate takes no direct
/// dependency on wall-clock time (`Date.now`-equivalents are unavailable
/// to callers building this against deterministic fixtures), so `0` is the
/// only infallible default a pure library function can produce internally.
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppEngine;
    use crate::commit::{CommitStoreError, MinFreeSpace};
    use crate::error::AppEngineError;
    use crate::target::App;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeCommitStore {
        has: Mutex<BTreeSet<String>>,
        booted: Mutex<String>,
    }

    impl CommitStore for FakeCommitStore {
        fn has_commit(&self, hash: &str) -> Result<bool, CommitStoreError> {
            Ok(self.has.lock().unwrap().contains(hash))
        }
        fn pull_commit(&self, hash: &str, _source: &dyn CommitSource, _flow: &FlowControl) -> Result<(), CommitStoreError> {
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

    struct FakeSource;
    impl CommitSource for FakeSource {
        fn describe(&self) -> String {
            "fake".into()
        }
    }

    struct FakeAppEngine {
        fail_run: bool,
    }
    impl AppEngine for FakeAppEngine {
        fn fetch(&self, _app: &App, _flow: &FlowControl) -> Result<(), AppEngineError> {
            Ok(())
        }
        fn verify(&self, _app: &App) -> Result<(), AppEngineError> {
            Ok(())
        }
        fn install(&self, _app: &App) -> Result<(), AppEngineError> {
            Ok(())
        }
        fn run(&self, app: &App) -> Result<(), AppEngineError> {
            if self.fail_run {
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
        fn is_running(&self, _app: &App) -> bool {
            !self.fail_run
        }
        fn prune(&self, _shortlist: &[String]) -> Result<(), AppEngineError> {
            Ok(())
        }
    }

    fn mk_target(name: &str, sha: &str, version: &str) -> Target {
        Target {
            name: name.to_string(),
            version: crate::target::Version::new(version),
            sha256: sha.to_string(),
            hardware_ids: BTreeSet::new(),
            tags: BTreeSet::new(),
            apps: BTreeMap::new(),
            bootfw_version: None,
            initial: false,
        }
    }

    fn installer(fail_run: bool) -> (Installer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let commit_store = Arc::new(FakeCommitStore {
            has: Mutex::new(BTreeSet::new()),
            booted: Mutex::new("aaaa".to_string()),
        });
        let app_engine = Arc::new(FakeAppEngine { fail_run });
        (Installer::new(commit_store, app_engine, state_dir), dir)
    }

    #[test]
    fn happy_path_install_then_finalize() {
        let (installer, _dir) = installer(false);
        let mut log = InstalledVersionLog::open_in_memory().unwrap();
        log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

        let target = mk_target("v2", "bbbb", "2");
        let code = installer
            .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 1_000_000_000, &FlowControl::new())
            .unwrap();
        assert_eq!(code, PostInstallCode::NeedReboot);

        let code = installer
            .finalize(&mut log, "bbbb", true, &FakeSource, &FlowControl::new())
            .unwrap();
        assert_eq!(code, PostInstallCode::Ok);
        assert_eq!(log.current().unwrap().unwrap().target.name, "v2");
        assert!(log.pending().unwrap().is_none());
    }

    #[test]
    fn finalize_before_reboot_reports_need_reboot_again() {
        let (installer, _dir) = installer(false);
        let mut log = InstalledVersionLog::open_in_memory().unwrap();
        log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();
        let target = mk_target("v2", "bbbb", "2");
        installer
            .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 1_000_000_000, &FlowControl::new())
            .unwrap();

        let code = installer
            .finalize(&mut log, "aaaa", false, &FakeSource, &FlowControl::new())
            .unwrap();
        assert_eq!(code, PostInstallCode::NeedReboot);
    }

    #[test]
    fn app_start_failure_triggers_rollback() {
        let (installer, _dir) = installer(true);
        let mut log = InstalledVersionLog::open_in_memory().unwrap();
        log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();
        let mut target = mk_target("v2", "bbbb", "2");
        target.apps.insert(
            "app-01".to_string(),
            App {
                name: "app-01".to_string(),
                uri: "hub/factory/app-01@sha256:cccc".to_string(),
            },
        );

        installer
            .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 1_000_000_000, &FlowControl::new())
            .unwrap();
        // The fake commit store redeploys "aaaa" synchronously, so the
        // rollback completes without a second reboot.
        let code = installer
            .finalize(&mut log, "bbbb", true, &FakeSource, &FlowControl::new())
            .unwrap();
        assert_eq!(code, PostInstallCode::RollbackOk);

        let bad = log.bad_targets().unwrap();
        assert!(bad.iter().any(|t| t.sha256 == "bbbb"));
        assert_eq!(log.current().unwrap().unwrap().target.sha256, "aaaa");
        assert!(log.pending().unwrap().is_none());
    }

    #[test]
    fn finalize_without_pending_matches_booted_history() {
        let (installer, _dir) = installer(false);
        let mut log = InstalledVersionLog::open_in_memory().unwrap();
        log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

        let code = installer
            .finalize(&mut log, "aaaa", false, &FakeSource, &FlowControl::new())
            .unwrap();
        assert_eq!(code, PostInstallCode::AlreadyInstalled);
    }

    #[test]
    fn bootfw_needs_completion_refuses_new_install() {
        let (installer, _dir) = installer(false);
        write_bootfw_record(
            &installer.bootfw_record_path,
            &BootFwRecord {
                bootfw_version: 1,
                bootupgrade_available: 1,
            },
        )
        .unwrap();

        let mut log = InstalledVersionLog::open_in_memory().unwrap();
        log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();
        let target = mk_target("v2", "bbbb", "2");
        let err = installer
            .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 1_000_000_000, &FlowControl::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::BootFwNeedsCompletion));
    }
}
