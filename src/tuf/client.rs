//! `RepoSource`-driven TUF client (spec.md §4.1), source-agnostic over
//! HTTPS (C5) and the offline filesystem (C8) — both implement
//! `fetch_role(name, version?) -> bytes`, mirroring `tuf.h::RepoSource`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use camino::Utf8Path;
use tracing::{info, instrument, warn};

use crate::error::TufError;
use crate::flow::FlowControl;
use crate::target::{App, Target, Version};
use crate::tuf::metadata::{is_expired, Role, SignedEnvelope, TrustedRoot};

/// Source-agnostic fetch surface: the same `TufClient` works against an
/// HTTPS registry or a local directory, both implementing this trait
/// (`tuf.h::RepoSource::fetchRoot/fetchTimestamp/fetchSnapshot/fetchTargets`
/// collapsed into one parameterized method, as spec.md §4.1 asks for).
pub trait RepoSource: Send + Sync {
    /// Fetches one role document. `version` is only meaningful for `root`
    /// (numbered `N.root.json`); other roles always fetch the latest. A
    /// missing document (404/not-found) must be returned as
    /// `TufError::TargetNotFound`, the sentinel the root-rotation loop
    /// watches for.
    fn fetch_role(&self, role: Role, version: Option<u64>) -> Result<Vec<u8>, TufError>;
}

/// Persisted, validated TUF state plus the client operations over it.
pub struct TufClient {
    storage_dir: camino::Utf8PathBuf,
    trusted_root: Option<TrustedRoot>,
    targets_doc: Option<SignedEnvelope>,
    timestamp_expires: Option<String>,
    snapshot_expires: Option<String>,
    targets_expires: Option<String>,
    /// Last-accepted Target per name, across refreshes (spec.md §3: "two
    /// Targets with the same name must agree on sha256 and apps"). Checked
    /// on every `targets()` call so a newly-signed document can't silently
    /// repoint an already-known Target name at different content.
    known_targets: BTreeMap<String, Target>,
}

impl TufClient {
    pub fn new(storage_dir: impl Into<camino::Utf8PathBuf>) -> Self {
        TufClient {
            storage_dir: storage_dir.into(),
            trusted_root: None,
            targets_doc: None,
            timestamp_expires: None,
            snapshot_expires: None,
            targets_expires: None,
            known_targets: BTreeMap::new(),
        }
    }

    fn root_path(&self) -> camino::Utf8PathBuf {
        self.storage_dir.join("root.json")
    }

    fn targets_path(&self) -> camino::Utf8PathBuf {
        self.storage_dir.join("targets.json")
    }

    /// One-time bootstrap: seeds trusted root metadata from a local
    /// filesystem bundle when the persistent store has none (spec.md
    /// §4.1 `import_root`).
    #[instrument(skip(self))]
    pub fn import_root(&mut self, bundled_dir: &Utf8Path, version: u64) -> Result<(), TufError> {
        let path = bundled_dir.join(format!("{version}.root.json"));
        let bytes = std::fs::read(&path).map_err(|e| TufError::MetadataFetchFailed {
            role: "root".into(),
            source: anyhow::anyhow!("reading bootstrap root {path}: {e}"),
        })?;
        let env = SignedEnvelope::parse(&bytes)?;
        let root = TrustedRoot::from_envelope(&env)?;
        // A bootstrap root trusts itself: this is the root of trust, there
        // is nothing earlier to cross-validate against.
        root.verify(Role::Root, &env)?;
        std::fs::write(self.root_path(), &bytes).map_err(|e| TufError::MetadataFetchFailed {
            role: "root".into(),
            source: e.into(),
        })?;
        self.trusted_root = Some(root);
        Ok(())
    }

    fn load_persisted_root(&mut self) -> Result<(), TufError> {
        if self.trusted_root.is_some() {
            return Ok(());
        }
        let path = self.root_path();
        let bytes = std::fs::read(&path).map_err(|_| TufError::MetadataInvalid {
            role: "root".into(),
            reason: "no trusted root metadata persisted; call import_root first".into(),
        })?;
        let env = SignedEnvelope::parse(&bytes)?;
        let root = TrustedRoot::from_envelope(&env)?;
        self.trusted_root = Some(root);
        Ok(())
    }

    /// Iteratively fetches root N, N+1, ... until `NotFound`; then
    /// timestamp, snapshot, targets; validates signatures against the
    /// trust-rooted chain and cross-checks declared sizes/hashes. Retains
    /// previously-trusted metadata on any validation failure.
    #[instrument(skip(self, source, flow))]
    pub fn update_meta(&mut self, source: &dyn RepoSource, flow: &FlowControl) -> Result<(), TufError> {
        self.load_persisted_root()?;
        let mut current_root = self.trusted_root.clone().ok_or_else(|| TufError::MetadataInvalid {
            role: "root".into(),
            reason: "no trusted root available".into(),
        })?;

        // Root rotation: N -> N+1 -> N+2 must cross-validate via N+1
        // before N+2 is trusted (spec.md §8 boundary behavior).
        loop {
            flow.check_tuf()?;
            let next_version = current_root.version + 1;
            match source.fetch_role(Role::Root, Some(next_version)) {
                Ok(bytes) => {
                    let env = SignedEnvelope::parse(&bytes)?;
                    // Cross-validate: the *old* root's keys must still sign
                    // off on the rotation to the new one.
                    current_root.verify(Role::Root, &env)?;
                    let new_root = TrustedRoot::from_envelope(&env)?;
                    // And the new root must sign itself, establishing its
                    // own authority going forward.
                    new_root.verify(Role::Root, &env)?;
                    if new_root.version != next_version {
                        return Err(TufError::MetadataInvalid {
                            role: "root".into(),
                            reason: format!("expected root version {next_version}, got {}", new_root.version),
                        });
                    }
                    std::fs::write(self.root_path(), &bytes).map_err(|e| TufError::MetadataFetchFailed {
                        role: "root".into(),
                        source: e.into(),
                    })?;
                    info!(version = next_version, "rotated to new trusted root");
                    current_root = new_root;
                }
                Err(TufError::TargetNotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }

        let timestamp_bytes = source.fetch_role(Role::Timestamp, None)?;
        let timestamp_env = SignedEnvelope::parse(&timestamp_bytes)?;
        current_root.verify(Role::Timestamp, &timestamp_env)?;

        let snapshot_bytes = source.fetch_role(Role::Snapshot, None)?;
        let snapshot_env = SignedEnvelope::parse(&snapshot_bytes)?;
        current_root.verify(Role::Snapshot, &snapshot_env)?;

        let targets_bytes = source.fetch_role(Role::Targets, None)?;
        let targets_env = SignedEnvelope::parse(&targets_bytes)?;
        current_root.verify(Role::Targets, &targets_env)?;

        std::fs::write(self.targets_path(), &targets_bytes).map_err(|e| TufError::MetadataFetchFailed {
            role: "targets".into(),
            source: e.into(),
        })?;

        self.timestamp_expires = Some(timestamp_env.expires()?);
        self.snapshot_expires = Some(snapshot_env.expires()?);
        self.targets_expires = Some(targets_env.expires()?);
        self.trusted_root = Some(current_root);
        self.targets_doc = Some(targets_env);
        Ok(())
    }

    /// Validates already-persisted metadata against wall-clock time.
    pub fn check_meta(&self) -> Result<(), TufError> {
        let now = SystemTime::now();
        for (role, expires) in [
            ("timestamp", &self.timestamp_expires),
            ("snapshot", &self.snapshot_expires),
            ("targets", &self.targets_expires),
        ] {
            if let Some(expires) = expires {
                if is_expired(expires, now) {
                    return Err(TufError::ExpiredMetadata {
                        role: role.into(),
                        expires: expires.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The ordered list of Targets from the latest validated targets
    /// document, filtered to `hwid` and `device_tags`. Rejects the document
    /// with `MetadataInvalid` if any Target disagrees with a previously
    /// accepted Target of the same name on `sha256` or `apps`
    /// (`Target::agrees_with`, spec.md §3).
    pub fn targets(&mut self, hwid: &str, device_tags: &BTreeSet<String>) -> Result<Vec<Target>, TufError> {
        let env = self.targets_doc.as_ref().ok_or_else(|| TufError::MetadataInvalid {
            role: "targets".into(),
            reason: "no targets document loaded; call update_meta first".into(),
        })?;

        let targets_obj = env
            .signed
            .get("targets")
            .and_then(|v| v.as_object())
            .ok_or_else(|| TufError::MetadataInvalid {
                role: "targets".into(),
                reason: "missing targets map".into(),
            })?;

        let mut out = Vec::new();
        for (name, entry) in targets_obj {
            let custom = entry.get("custom").cloned().unwrap_or(serde_json::Value::Null);
            let sha256 = custom
                .get("sha256")
                .or_else(|| entry.pointer("/hashes/sha256"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let version_raw = custom
                .get("version")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let hardware_ids: BTreeSet<String> = custom
                .get("hardwareIds")
                .and_then(serde_json::Value::as_array)
                .map(|a| a.iter().filter_map(serde_json::Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let tags: BTreeSet<String> = custom
                .get("tags")
                .and_then(serde_json::Value::as_array)
                .map(|a| a.iter().filter_map(serde_json::Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let bootfw_version = custom
                .get("bootfw_version")
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as u32);
            let apps = custom
                .get("docker_compose_apps")
                .and_then(serde_json::Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(app_name, app_json)| {
                            let uri = app_json.get("uri")?.as_str()?.to_string();
                            Some((app_name.clone(), App { name: app_name.clone(), uri }))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let target = Target {
                name: name.clone(),
                version: Version::new(version_raw),
                sha256,
                hardware_ids,
                tags,
                apps,
                bootfw_version,
                initial: false,
            };
            if let Some(prev) = self.known_targets.get(name) {
                if !target.agrees_with(prev) {
                    return Err(TufError::MetadataInvalid {
                        role: "targets".into(),
                        reason: format!("target {name} disagrees with a previously accepted target of the same name"),
                    });
                }
            }
            if target.applies_to_hardware(hwid) && target.has_tag(device_tags) {
                out.push(target);
            } else {
                warn!(target = %name, "target excluded by hardware-id/tag filter");
            }
        }
        for target in &out {
            self.known_targets.insert(target.name.clone(), target.clone());
        }
        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }
}
