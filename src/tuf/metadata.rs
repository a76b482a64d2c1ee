//! TUF metadata shapes and signature verification, ported from the
//! signed-envelope structure the original consumes through `libaktualizr`'s
//! `Uptane::MetaPack`/`Uptane::Root` (not carried into the pack, but the
//! wire shape is standard TUF and is what `tuf.h::RepoSource` fetches).

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Verifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TufError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Root,
    Timestamp,
    Snapshot,
    Targets,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Timestamp => "timestamp",
            Role::Snapshot => "snapshot",
            Role::Targets => "targets",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Signature {
    pub keyid: String,
    pub method: String,
    pub sig: String,
}

/// The outer `{signed: ..., signatures: [...]}` envelope every TUF
/// metadata document is wrapped in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignedEnvelope {
    pub signed: Value,
    pub signatures: Vec<Signature>,
}

impl SignedEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, TufError> {
        serde_json::from_slice(bytes).map_err(|e| TufError::MetadataInvalid {
            role: "unknown".into(),
            reason: format!("malformed JSON envelope: {e}"),
        })
    }

    pub fn expires(&self) -> Result<String, TufError> {
        self.signed
            .get("expires")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TufError::MetadataInvalid {
                role: "unknown".into(),
                reason: "missing expires field".into(),
            })
    }

    pub fn version(&self) -> Option<u64> {
        self.signed.get("version").and_then(Value::as_u64)
    }

    /// Canonical JSON of the `signed` body, the bytes that were actually
    /// signed (spec treats any consistent canonicalization as sufficient:
    /// TUF mandates a deterministic serialization, here the sorted-keys
    /// serde_json output).
    pub fn canonical_signed_bytes(&self) -> Result<Vec<u8>, TufError> {
        serde_json::to_vec(&self.signed).map_err(|e| TufError::MetadataInvalid {
            role: "unknown".into(),
            reason: format!("failed to canonicalize signed body: {e}"),
        })
    }
}

/// A public key as declared in root metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublicKey {
    pub keytype: String,
    pub keyval_public: String,
}

/// The `root` role's trusted key/threshold configuration for every other
/// role, and its own self-referential threshold.
#[derive(Debug, Clone)]
pub struct TrustedRoot {
    pub version: u64,
    pub keys: BTreeMap<String, PublicKey>,
    pub roles: BTreeMap<Role, RoleKeys>,
}

#[derive(Debug, Clone)]
pub struct RoleKeys {
    pub keyids: BTreeSet<String>,
    pub threshold: usize,
}

impl TrustedRoot {
    pub fn from_envelope(env: &SignedEnvelope) -> Result<Self, TufError> {
        let version = env.version().ok_or_else(|| TufError::MetadataInvalid {
            role: "root".into(),
            reason: "missing version".into(),
        })?;

        let keys_json = env.signed.get("keys").ok_or_else(|| TufError::MetadataInvalid {
            role: "root".into(),
            reason: "missing keys map".into(),
        })?;
        let mut keys = BTreeMap::new();
        if let Some(obj) = keys_json.as_object() {
            for (keyid, k) in obj {
                let keytype = k
                    .get("keytype")
                    .and_then(Value::as_str)
                    .unwrap_or("ed25519")
                    .to_string();
                let keyval_public = k
                    .get("keyval")
                    .and_then(|kv| kv.get("public"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| TufError::MetadataInvalid {
                        role: "root".into(),
                        reason: format!("key {keyid} missing keyval.public"),
                    })?
                    .to_string();
                keys.insert(keyid.clone(), PublicKey { keytype, keyval_public });
            }
        }

        let roles_json = env.signed.get("roles").ok_or_else(|| TufError::MetadataInvalid {
            role: "root".into(),
            reason: "missing roles map".into(),
        })?;
        let mut roles = BTreeMap::new();
        for role in [Role::Root, Role::Timestamp, Role::Snapshot, Role::Targets] {
            let entry = roles_json.get(role.as_str()).ok_or_else(|| TufError::MetadataInvalid {
                role: role.as_str().into(),
                reason: "root metadata is missing this role's key declaration".into(),
            })?;
            let keyids: BTreeSet<String> = entry
                .get("keyids")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let threshold = entry.get("threshold").and_then(Value::as_u64).unwrap_or(1) as usize;
            roles.insert(role, RoleKeys { keyids, threshold });
        }

        Ok(TrustedRoot { version, keys, roles })
    }

    /// Verifies `env` against this root's key/threshold declaration for
    /// `role`. Fails closed: any missing key, bad signature, or
    /// under-threshold signature count is `MetadataInvalid`.
    pub fn verify(&self, role: Role, env: &SignedEnvelope) -> Result<(), TufError> {
        let role_keys = self.roles.get(&role).ok_or_else(|| TufError::MetadataInvalid {
            role: role.as_str().into(),
            reason: "no trusted keys declared for role".into(),
        })?;

        let signed_bytes = env.canonical_signed_bytes()?;
        let mut valid = 0usize;
        let mut seen = BTreeSet::new();

        for sig in &env.signatures {
            if !role_keys.keyids.contains(&sig.keyid) || !seen.insert(sig.keyid.clone()) {
                continue;
            }
            let Some(key) = self.keys.get(&sig.keyid) else {
                continue;
            };
            if verify_signature(key, &signed_bytes, sig).unwrap_or(false) {
                valid += 1;
            }
        }

        if valid < role_keys.threshold {
            return Err(TufError::MetadataInvalid {
                role: role.as_str().into(),
                reason: format!(
                    "signature threshold not met: {valid} valid of {} required",
                    role_keys.threshold
                ),
            });
        }
        Ok(())
    }
}

fn verify_signature(key: &PublicKey, signed_bytes: &[u8], sig: &Signature) -> Result<bool, TufError> {
    let key_der = hex::decode(&key.keyval_public).map_err(|e| TufError::MetadataInvalid {
        role: "unknown".into(),
        reason: format!("bad key encoding for {}: {e}", sig.keyid),
    })?;
    let sig_bytes = hex::decode(&sig.sig).map_err(|e| TufError::MetadataInvalid {
        role: "unknown".into(),
        reason: format!("bad signature encoding from {}: {e}", sig.keyid),
    })?;

    let pkey = match key.keytype.as_str() {
        "ed25519" => PKey::public_key_from_raw_bytes(&key_der, openssl::pkey::Id::ED25519),
        _ => PKey::public_key_from_der(&key_der),
    }
    .map_err(|e| TufError::MetadataInvalid {
        role: "unknown".into(),
        reason: format!("unparseable public key {}: {e}", sig.keyid),
    })?;

    let valid = if key.keytype == "ed25519" {
        let mut verifier = Verifier::new_without_digest(&pkey).map_err(|e| TufError::MetadataInvalid {
            role: "unknown".into(),
            reason: e.to_string(),
        })?;
        verifier
            .verify_oneshot(&sig_bytes, signed_bytes)
            .unwrap_or(false)
    } else {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).map_err(|e| TufError::MetadataInvalid {
            role: "unknown".into(),
            reason: e.to_string(),
        })?;
        verifier.update(signed_bytes).ok();
        verifier.verify(&sig_bytes).unwrap_or(false)
    };
    Ok(valid)
}

/// True if `expires` (an RFC 3339 timestamp) is in the past relative to
/// `now`.
pub fn is_expired(expires: &str, now: SystemTime) -> bool {
    let Ok(expires_secs) = httpdate_or_rfc3339_to_unix(expires) else {
        return true;
    };
    let now_secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    expires_secs < now_secs
}

fn httpdate_or_rfc3339_to_unix(s: &str) -> Result<u64, ()> {
    // Minimal RFC3339 parser: YYYY-MM-DDTHH:MM:SSZ, sufficient for the
    // fixed-format timestamps TUF metadata actually uses.
    let bytes = s.as_bytes();
    if bytes.len() < 19 {
        return Err(());
    }
    let year: i64 = s[0..4].parse().map_err(|_| ())?;
    let month: i64 = s[5..7].parse().map_err(|_| ())?;
    let day: i64 = s[8..10].parse().map_err(|_| ())?;
    let hour: i64 = s[11..13].parse().map_err(|_| ())?;
    let min: i64 = s[14..16].parse().map_err(|_| ())?;
    let sec: i64 = s[17..19].parse().map_err(|_| ())?;

    let days_since_epoch = days_from_civil(year, month, day);
    let secs = days_since_epoch * 86_400 + hour * 3_600 + min * 60 + sec;
    if secs < 0 {
        return Err(());
    }
    Ok(secs as u64)
}

/// Howard Hinnant's `days_from_civil` algorithm for Gregorian-date to
/// days-since-epoch conversion, avoiding a chrono dependency for this one
/// calculation.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
