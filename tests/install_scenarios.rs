//! End-to-end install/finalize/rollback scenarios over the Install State
//! Machine (C7), exercising the fakes from `tests/common` the way
//! spec.md §8's worked examples describe.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{mk_app, mk_target, state_dir, FakeAppEngine, FakeCommitStore, FakeSource};
use otacore::flow::FlowControl;
use otacore::install::{Installer, PostInstallCode};
use otacore::storage::db::{InstallMode, InstalledVersionLog, VersionMode};

fn open_log(state_dir: &camino::Utf8Path) -> InstalledVersionLog {
    InstalledVersionLog::open(&state_dir.join("installed-versions.sqlite")).unwrap()
}

#[test]
fn happy_path_rootfs_and_app_update() {
    let (dir, _guard) = state_dir();
    let mut log = open_log(&dir);
    log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

    let commit_store = Arc::new(FakeCommitStore::new("aaaa"));
    let app_engine = Arc::new(FakeAppEngine::new());
    let installer = Installer::new(commit_store, app_engine.clone(), dir);

    let mut target = mk_target("v2", "bbbb", "2");
    target.apps.insert("shellhttpd".to_string(), mk_app("shellhttpd", "1111"));

    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 10_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::NeedReboot);
    assert_eq!(app_engine.fetch_calls.lock().unwrap().as_slice(), ["shellhttpd"]);

    let code = installer
        .finalize(&mut log, "bbbb", true, &FakeSource, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::Ok);
    assert_eq!(app_engine.run_calls.lock().unwrap().as_slice(), ["shellhttpd"]);
    assert_eq!(log.current().unwrap().unwrap().target.sha256, "bbbb");
}

#[test]
fn app_only_update_has_no_apps_means_no_container_calls() {
    let (dir, _guard) = state_dir();
    let mut log = open_log(&dir);
    log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

    let commit_store = Arc::new(FakeCommitStore::new("aaaa"));
    let app_engine = Arc::new(FakeAppEngine::new());
    let installer = Installer::new(commit_store, app_engine.clone(), dir);

    // Same rootfs commit, zero shortlisted apps: fetch/run are never
    // invoked for this target.
    let target = mk_target("v1", "aaaa", "1");
    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 10_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::NeedReboot);
    assert!(app_engine.fetch_calls.lock().unwrap().is_empty());

    let code = installer
        .finalize(&mut log, "aaaa", true, &FakeSource, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::Ok);
    assert!(app_engine.run_calls.lock().unwrap().is_empty());
}

#[test]
fn rollback_on_app_start_failure_marks_target_bad() {
    let (dir, _guard) = state_dir();
    let mut log = open_log(&dir);
    log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

    let commit_store = Arc::new(FakeCommitStore::new("aaaa"));
    let app_engine = Arc::new(FakeAppEngine::new());
    app_engine.fail_run("shellhttpd");
    let installer = Installer::new(commit_store, app_engine.clone(), dir);

    let mut target = mk_target("v2", "bbbb", "2");
    target.apps.insert("shellhttpd".to_string(), mk_app("shellhttpd", "1111"));

    installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 10_000_000, &FlowControl::new())
        .unwrap();

    // The app fails to start post-reboot: finalize drives the rollback
    // transition itself (spec.md §8 scenario 4) rather than leaving the
    // broken target recorded as current. The prior target ("aaaa") has no
    // apps, so the commit-store redeploy completes without a further
    // reboot and the cycle ends in RollbackOk.
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
fn insufficient_space_caches_and_short_circuits_retry() {
    let (dir, _guard) = state_dir();
    let mut log = open_log(&dir);
    log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

    let commit_store = Arc::new(FakeCommitStore::new("aaaa"));
    commit_store.fail_with_no_space("bbbb", 500_000_000);
    let app_engine = Arc::new(FakeAppEngine::new());
    let installer = Installer::new(commit_store, app_engine, dir);

    let target = mk_target("v2", "bbbb", "2");

    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 100_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::DownloadFailureNoSpace);

    // Retrying with no increase in available space short-circuits without
    // touching the commit store again (it would still fail the same way,
    // but the memo means the attempt isn't even made).
    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 100_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::DownloadFailureNoSpace);

    // Freed-up space lifts the short-circuit (the underlying store is
    // still configured to fail for "bbbb", so the retry surfaces the same
    // outcome, but it had to actually ask this time).
    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 900_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::DownloadFailureNoSpace);
}

#[test]
fn boot_firmware_and_reboot_sequence_yields_bootfw_code() {
    let (dir, _guard) = state_dir();
    let mut log = open_log(&dir);
    log.append(&mk_target("v1", "aaaa", "1"), VersionMode::Current).unwrap();

    let commit_store = Arc::new(FakeCommitStore::new("aaaa"));
    let app_engine = Arc::new(FakeAppEngine::new());
    let installer = Installer::new(commit_store, app_engine, dir);

    let mut target = mk_target("v2", "bbbb", "2");
    target.bootfw_version = Some(7);

    let code = installer
        .install(&mut log, &target, InstallMode::All, &BTreeSet::new(), &FakeSource, 10_000_000, &FlowControl::new())
        .unwrap();
    assert_eq!(code, PostInstallCode::NeedRebootForBootFw);

    // A second install attempt before the boot-fw update is confirmed
    // must be refused outright, leaving device state untouched.
    let target2 = mk_target("v3", "cccc", "3");
    let err = installer
        .install(&mut log, &target2, InstallMode::All, &BTreeSet::new(), &FakeSource, 10_000_000, &FlowControl::new())
        .unwrap_err();
    assert!(matches!(err, otacore::error::InstallError::BootFwNeedsCompletion));
}
