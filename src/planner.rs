//! Update Planner (C6): pure logic over in-memory Targets, ported from
//! `aklite_client_ext.cc::GetTargetToInstall`. No I/O beyond the
//! caller-supplied "is this app running?" closure.

use std::collections::BTreeSet;

use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    NoUpdate,
    UpdateNewVersion,
    UpdateSyncApps,
    UpdateRollback,
    BadRollbackTarget,
    RollbackTargetNotFound,
    TargetAlreadyInstalled,
    TufTargetNotFound,
    BadCheckinStatus,
}

#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub kind: PlanKind,
    pub effective_target: Option<Target>,
    pub reason: String,
}

impl UpdatePlan {
    fn new(kind: PlanKind, effective_target: Option<Target>, reason: impl Into<String>) -> Self {
        UpdatePlan {
            kind,
            effective_target,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanFlags {
    pub allow_bad_target: bool,
    pub force_apps_sync: bool,
    pub offline_mode: bool,
    pub auto_downgrade: bool,
}

/// Everything the Planner needs to know about persisted history, without
/// owning the `InstalledVersionLog` itself.
pub trait PlanHistory {
    fn is_bad(&self, target: &Target) -> bool;
    /// Most recent `current` target strictly earlier than `exclude`, by
    /// log order (spec.md §4.6 rule 3), or `None` if there is none.
    fn most_recent_before(&self, exclude: &Target) -> Option<Target>;
}

/// Restricts `target.apps` to `shortlist` and reports which shortlisted
/// apps are not currently running, per `is_running`.
fn apps_to_update(target: &Target, shortlist: &BTreeSet<String>, is_running: &dyn Fn(&str) -> bool) -> BTreeSet<String> {
    target
        .shortlisted_apps(shortlist)
        .into_keys()
        .filter(|name| !is_running(name))
        .collect()
}

/// `GetTargetToInstall` (spec.md §4.6): the 7-rule sequence in order.
pub fn plan(
    current: &Target,
    candidate: &Target,
    requested_version: Option<&str>,
    shortlist: &BTreeSet<String>,
    flags: PlanFlags,
    history: &dyn PlanHistory,
    is_running: &dyn Fn(&str) -> bool,
) -> UpdatePlan {
    // Rule 1
    if candidate.is_unknown() {
        return UpdatePlan::new(PlanKind::TufTargetNotFound, None, "candidate target unresolved");
    }

    // Rule 2
    if !flags.auto_downgrade && requested_version.is_none() && candidate.version < current.version {
        return UpdatePlan::new(PlanKind::NoUpdate, None, "downgrade refused without explicit request");
    }

    // Rule 3
    if history.is_bad(current) && candidate.name == current.name {
        return match history.most_recent_before(current) {
            None => UpdatePlan::new(PlanKind::RollbackTargetNotFound, None, "current target is bad, no prior target to roll back to"),
            Some(prior) if history.is_bad(&prior) => {
                UpdatePlan::new(PlanKind::BadRollbackTarget, Some(prior), "prior rollback candidate is itself bad")
            }
            Some(prior) => UpdatePlan::new(PlanKind::UpdateRollback, Some(prior), "current target marked bad, rolling back"),
        };
    }

    // Rule 4: bad candidate without override falls through treating
    // candidate as current for the sync-apps comparison below.
    let effective_candidate = if history.is_bad(candidate) && !flags.allow_bad_target {
        current
    } else {
        candidate
    };

    // Rule 5
    if effective_candidate.name != current.name {
        return UpdatePlan::new(PlanKind::UpdateNewVersion, Some(effective_candidate.clone()), "new target version available");
    }

    // Rule 6
    let to_update = apps_to_update(current, shortlist, is_running);
    if !to_update.is_empty() || flags.force_apps_sync {
        let mut synced = current.clone();
        synced.apps = current.shortlisted_apps(shortlist);
        return UpdatePlan::new(PlanKind::UpdateSyncApps, Some(synced), "shortlisted apps out of sync with running set");
    }

    // Rule 7
    if flags.offline_mode {
        UpdatePlan::new(PlanKind::TargetAlreadyInstalled, Some(current.clone()), "offline bundle target already installed")
    } else {
        UpdatePlan::new(PlanKind::NoUpdate, Some(current.clone()), "no update available")
    }
}
