//! Per-app on-disk state (spec.md §3, §4.4): `.meta/.version` and
//! `.meta/.state`, both written via write-temp-then-rename.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AppState {
    Unknown = 0,
    Downloaded = 1,
    Verified = 2,
    Pulled = 3,
    Installed = 4,
    Started = 5,
}

impl AppState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AppState::Downloaded,
            2 => AppState::Verified,
            3 => AppState::Pulled,
            4 => AppState::Installed,
            5 => AppState::Started,
            _ => AppState::Unknown,
        }
    }
}

fn write_atomic(path: &Utf8Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Reads `<app_dir>/.meta/.version` and `.state`. If the stored URI differs
/// from `expected_uri`, the existing state is irrelevant and `Unknown` is
/// returned (spec.md §4.4).
pub fn load(app_dir: &Utf8Path, expected_uri: &str) -> (AppState, Option<String>) {
    let meta_dir = app_dir.join(".meta");
    let version_path = meta_dir.join(".version");
    let state_path = meta_dir.join(".state");

    let stored_uri = std::fs::read_to_string(&version_path).ok().map(|s| s.trim().to_string());
    if stored_uri.as_deref() != Some(expected_uri) {
        return (AppState::Unknown, stored_uri);
    }

    let state = std::fs::read_to_string(&state_path)
        .ok()
        .and_then(|s| s.trim().parse::<u8>().ok())
        .map(AppState::from_u8)
        .unwrap_or(AppState::Unknown);
    (state, stored_uri)
}

pub fn save(app_dir: &Utf8Path, uri: &str, state: AppState) -> std::io::Result<()> {
    let meta_dir = app_dir.join(".meta");
    write_atomic(&meta_dir.join(".version"), uri)?;
    write_atomic(&meta_dir.join(".state"), &(state as u8).to_string())
}
