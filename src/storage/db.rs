//! Persisted core state: `InstalledVersionLog`, `PendingInstall`,
//! `BootFwRecord`, and device-info report memos (spec.md §3, §6).
//!
//! The installed-versions log is the linearization point across cycles
//! (spec.md §5): it is an append-only SQLite table so that a reader always
//! observes a consistent `(current, pending, bad[])` triple even across a
//! crash mid-append. `PendingInstall` and `BootFwRecord` are small enough
//! that write-temp-then-rename is the simpler crash-safe mechanism, the
//! same pattern the App Engine uses for its per-app `.state` files.

use camino::Utf8Path;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::target::Target;

/// `mode` of a log entry (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionMode {
    Current,
    Pending,
    None,
    Bad,
}

impl VersionMode {
    fn as_str(self) -> &'static str {
        match self {
            VersionMode::Current => "current",
            VersionMode::Pending => "pending",
            VersionMode::None => "none",
            VersionMode::Bad => "bad",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "current" => VersionMode::Current,
            "pending" => VersionMode::Pending,
            "bad" => VersionMode::Bad,
            _ => VersionMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub target: Target,
    pub mode: VersionMode,
}

/// Append-only mapping `name -> record { target, mode }`. At most one
/// `pending` entry, at most one `current` entry at any time (spec.md §3).
pub struct InstalledVersionLog {
    conn: Connection,
}

impl InstalledVersionLog {
    pub fn open(db_path: &Utf8Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS installed_versions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                target_json TEXT NOT NULL,
                mode TEXT NOT NULL
            );",
        )?;
        Ok(InstalledVersionLog { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE installed_versions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                target_json TEXT NOT NULL,
                mode TEXT NOT NULL
            );",
        )?;
        Ok(InstalledVersionLog { conn })
    }

    /// Appends a record inside a single transaction. When `mode` is
    /// `Current` or `Pending`, any pre-existing entry with that mode is
    /// demoted to `None` first, preserving the at-most-one invariant
    /// atomically.
    #[instrument(skip(self, target))]
    pub fn append(&mut self, target: &Target, mode: VersionMode) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        if matches!(mode, VersionMode::Current | VersionMode::Pending) {
            tx.execute(
                "UPDATE installed_versions SET mode = 'none'
                 WHERE mode = ?1 AND seq = (SELECT MAX(seq) FROM installed_versions WHERE mode = ?1)",
                params![mode.as_str()],
            )?;
        }
        let target_json = serde_json::to_string(target)
            .expect("Target serialization is infallible for well-formed in-memory values");
        tx.execute(
            "INSERT INTO installed_versions (name, target_json, mode) VALUES (?1, ?2, ?3)",
            params![target.name, target_json, mode.as_str()],
        )?;
        tx.commit()
    }

    fn latest_with_mode(&self, mode: VersionMode) -> rusqlite::Result<Option<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_json, mode FROM installed_versions
             WHERE mode = ?1 ORDER BY seq DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![mode.as_str()])?;
        if let Some(row) = rows.next()? {
            let target_json: String = row.get(0)?;
            let target: Target = serde_json::from_str(&target_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(Some(LogEntry { target, mode }))
        } else {
            Ok(None)
        }
    }

    pub fn current(&self) -> rusqlite::Result<Option<LogEntry>> {
        self.latest_with_mode(VersionMode::Current)
    }

    pub fn pending(&self) -> rusqlite::Result<Option<LogEntry>> {
        self.latest_with_mode(VersionMode::Pending)
    }

    /// All targets ever marked `bad` (rolled back from).
    pub fn bad_targets(&self) -> rusqlite::Result<Vec<Target>> {
        let mut stmt = self
            .conn
            .prepare("SELECT target_json FROM installed_versions WHERE mode = 'bad'")?;
        let rows = stmt.query_map([], |row| {
            let target_json: String = row.get(0)?;
            Ok(target_json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            let target_json = r?;
            let target: Target = serde_json::from_str(&target_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            out.push(target);
        }
        Ok(out)
    }

    /// Every successfully-current target, most recent first: used by
    /// rollback to find "the most recent successfully-installed earlier
    /// Target" (spec.md §4.6 rule 3).
    pub fn current_history(&self) -> rusqlite::Result<Vec<Target>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_json FROM installed_versions WHERE mode = 'current' ORDER BY seq DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let target_json: String = row.get(0)?;
            Ok(target_json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            let target_json = r?;
            let target: Target = serde_json::from_str(&target_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            out.push(target);
        }
        Ok(out)
    }

    /// `known_local_target`: true if `target`'s sha256 is known locally but
    /// is neither the current nor the pending entry — a suspect target used
    /// to decide `is_bad_target` for planner rule 4.
    pub fn known_local_target(&self, target: &Target) -> rusqlite::Result<bool> {
        if let Some(current) = self.current()? {
            if current.target.sha256 == target.sha256 {
                return Ok(false);
            }
        }
        let pending_sha = self.pending()?.map(|p| p.target.sha256);
        let mut stmt = self
            .conn
            .prepare("SELECT target_json FROM installed_versions ORDER BY seq DESC")?;
        let rows = stmt.query_map([], |row| {
            let target_json: String = row.get(0)?;
            Ok(target_json)
        })?;
        for r in rows {
            let target_json = r?;
            let t: Target = serde_json::from_str(&target_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            if t.sha256 == target.sha256 {
                if pending_sha.as_deref() == Some(target.sha256.as_str()) {
                    continue;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `mode` of a PendingInstall: whether the rootfs-commit half of the
/// install was performed, or only apps (spec.md §9 supplement: mirrors the
/// original's partial-install enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallMode {
    All,
    OstreeOnly,
}

/// Written atomically after `CommitStore::deploy` succeeds and before
/// reboot; cleared after a successful finalize or rollback commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInstall {
    pub target_name: String,
    pub correlation_id: String,
    pub mode: InstallMode,
    pub created_at: i64,
}

impl PendingInstall {
    pub fn new(target_name: impl Into<String>, version_or_name: &str, mode: InstallMode, created_at: i64) -> Self {
        PendingInstall {
            target_name: target_name.into(),
            correlation_id: generate_correlation_id(version_or_name),
            mode,
            created_at,
        }
    }
}

/// `{version-or-name}-{uuid}`, mirroring `generate_correlation_id` in the
/// original: prefer `custom_version`, fall back to the target name.
pub fn generate_correlation_id(version_or_name: &str) -> String {
    format!("{version_or_name}-{}", Uuid::new_v4())
}

fn write_atomic(path: &Utf8Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write-temp-then-rename persistence for `PendingInstall`.
pub fn write_pending_install(path: &Utf8Path, pending: &PendingInstall) -> anyhow::Result<()> {
    let json = serde_json::to_string(pending)?;
    write_atomic(path, &json)?;
    Ok(())
}

pub fn read_pending_install(path: &Utf8Path) -> anyhow::Result<Option<PendingInstall>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn clear_pending_install(path: &Utf8Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `bootupgrade_available` semantics (spec.md §3): 0 no pending boot-fw
/// update; 1 update downloaded awaiting reboot-confirmation; 2 a further
/// update layered on top of a still-unconfirmed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootFwRecord {
    pub bootfw_version: u32,
    pub bootupgrade_available: u8,
}

pub fn write_bootfw_record(path: &Utf8Path, record: &BootFwRecord) -> anyhow::Result<()> {
    let json = serde_json::to_string(record)?;
    write_atomic(path, &json)?;
    Ok(())
}

pub fn read_bootfw_record(path: &Utf8Path) -> anyhow::Result<Option<BootFwRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Opaque SHA-256 memos of the last-reported network/hardware info blobs,
/// used only to avoid redundant `ReportSink` traffic (spec.md §9
/// supplement; original: `last_network_info_reported_`,
/// `last_hw_info_reported_`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMemo {
    pub last_network_info_hash: Option<String>,
    pub last_hw_info_hash: Option<String>,
}

impl ReportMemo {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Utf8Path) -> anyhow::Result<()> {
        write_atomic(path, &serde_json::to_string(self)?)?;
        Ok(())
    }
}
