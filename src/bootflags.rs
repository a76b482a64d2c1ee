//! `BootFlags` capability (spec.md §1): bootloader variable backend the
//! core consumes, plus the `BootFwRecord` semantics layered on top of it.

use anyhow::Result;

use crate::storage::db::BootFwRecord;

pub trait BootFlags: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// Whether a prior boot-firmware update still needs a reboot-confirmation
/// before the install state machine can proceed (spec.md §4.7).
pub fn needs_completion(record: &BootFwRecord) -> bool {
    record.bootupgrade_available > 0
}

/// Marks the record to require a further reboot-confirmation, layering a
/// second update on top of a still-unconfirmed one (spec.md §3:
/// `bootupgrade_available = 2`).
pub fn layer_update(record: BootFwRecord, new_bootfw_version: u32) -> BootFwRecord {
    let bootupgrade_available = if record.bootupgrade_available > 0 { 2 } else { 1 };
    BootFwRecord {
        bootfw_version: new_bootfw_version,
        bootupgrade_available,
    }
}

/// Clears the confirmation flag after a reboot lands on the expected
/// version (mirrors `bootloader.rebootFlagClear()` in `finalizeIfNeeded`).
pub fn confirm(record: BootFwRecord) -> BootFwRecord {
    BootFwRecord {
        bootfw_version: record.bootfw_version,
        bootupgrade_available: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layering_on_unconfirmed_update_yields_two() {
        let r = BootFwRecord {
            bootfw_version: 1,
            bootupgrade_available: 1,
        };
        let layered = layer_update(r, 2);
        assert_eq!(layered.bootupgrade_available, 2);
    }

    #[test]
    fn confirm_clears_flag() {
        let r = BootFwRecord {
            bootfw_version: 2,
            bootupgrade_available: 2,
        };
        assert_eq!(confirm(r).bootupgrade_available, 0);
    }
}
