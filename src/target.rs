//! The canonical in-memory Target type (C10): version ordering, tag/hwid
//! filtering, apps iteration, shortlist intersection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// An app entry within a Target's apps map: name plus its registry URI
/// (`<registry-host>/<factory>/<app>@sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub uri: String,
}

impl App {
    /// The digest suffix of `uri`, e.g. `sha256:cccc...`, or `None` if the
    /// URI has no `@` separator.
    pub fn digest(&self) -> Option<&str> {
        self.uri.rsplit_once('@').map(|(_, digest)| digest)
    }
}

/// A Target's version, compared with lexicographic-numeric ordering
/// (spec.md §3, §8): segments are compared numerically when both sides are
/// numeric, else bytewise; an unparseable version sorts as `-1` and can
/// never be "latest".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
}

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Version { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `custom.version` parsed to a non-negative integer, or `-1` if it
    /// doesn't parse (spec.md §4.1).
    pub fn as_i64(&self) -> i64 {
        self.raw.parse::<i64>().ok().filter(|v| *v >= 0).unwrap_or(-1)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // `as_i64()` is the authoritative ordering value: it already puts
        // every unparseable version below every parseable one (spec.md
        // §4.1's "-1" sentinel), which a byte-for-byte strverscmp cannot
        // guarantee once a digit and a non-digit byte disagree. Only fall
        // through to the segment-wise comparison to break ties between two
        // versions that map to the same `as_i64()` value (e.g. "007" vs
        // "7", or two differently-spelled unparseable strings).
        match self.as_i64().cmp(&other.as_i64()) {
            Ordering::Equal => strverscmp(&self.raw, &other.raw),
            other => other,
        }
    }
}

/// A `strverscmp`-style comparison (mirrors the original's use of glibc
/// `strverscmp` via `Target::Version::operator<`): runs of digits compare
/// numerically (leading zeros tolerated), everything else compares bytewise.
/// Used by `Version::cmp` only to break ties between versions that already
/// agree on `as_i64()` (see there for why numeric-vs-non-numeric ordering
/// must not be decided here).
fn strverscmp(a: &str, b: &str) -> Ordering {
    let ab = a.as_bytes();
    let bb = b.as_bytes();
    let mut i = 0usize;
    let mut j = 0usize;

    while i < ab.len() && j < bb.len() {
        let (ac, bc) = (ab[i], bb[j]);
        if ac.is_ascii_digit() && bc.is_ascii_digit() {
            let istart = i;
            let jstart = j;
            while i < ab.len() && ab[i].is_ascii_digit() {
                i += 1;
            }
            while j < bb.len() && bb[j].is_ascii_digit() {
                j += 1;
            }
            let a_seg = trim_leading_zeros(&ab[istart..i]);
            let b_seg = trim_leading_zeros(&bb[jstart..j]);
            match a_seg.len().cmp(&b_seg.len()) {
                Ordering::Equal => match a_seg.cmp(b_seg) {
                    Ordering::Equal => continue,
                    other => return other,
                },
                other => return other,
            }
        } else if ac != bc {
            return ac.cmp(&bc);
        } else {
            i += 1;
            j += 1;
        }
    }
    (ab.len() - i).cmp(&(bb.len() - j))
}

fn trim_leading_zeros(seg: &[u8]) -> &[u8] {
    let non_zero = seg.iter().position(|&b| b != b'0').unwrap_or(seg.len() - 1);
    &seg[non_zero.min(seg.len().saturating_sub(1))..]
}

/// A single logical Target: one (rootfs commit, set-of-apps) tuple signed
/// into TUF metadata by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(with = "version_serde")]
    pub version: Version,
    pub sha256: String,
    pub hardware_ids: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub apps: BTreeMap<String, App>,
    pub bootfw_version: Option<u32>,
    /// True for the synthetic initial Target synthesized from the booted
    /// commit when no installed-versions log exists yet.
    pub initial: bool,
}

mod version_serde {
    use super::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Version, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Version::new(raw))
    }
}

impl Target {
    /// The "unknown" sentinel target: a name of `"unknown"` marks a Target
    /// that could not be resolved (mirrors `TufTarget::IsUnknown`).
    pub fn is_unknown(&self) -> bool {
        self.name == "unknown"
    }

    /// True iff the device's hardware-id is a member of this Target's set.
    pub fn applies_to_hardware(&self, hwid: &str) -> bool {
        self.hardware_ids.is_empty() || self.hardware_ids.contains(hwid)
    }

    /// True iff the device's tag set intersects this Target's tags, or the
    /// device tag set is empty (accept all).
    pub fn has_tag(&self, device_tags: &BTreeSet<String>) -> bool {
        if device_tags.is_empty() {
            return true;
        }
        self.tags.iter().any(|t| device_tags.contains(t))
    }

    /// The subset of this Target's apps present in `shortlist`. An empty
    /// shortlist means "no restriction": all apps are kept.
    pub fn shortlisted_apps(&self, shortlist: &BTreeSet<String>) -> BTreeMap<String, App> {
        if shortlist.is_empty() {
            return self.apps.clone();
        }
        self.apps
            .iter()
            .filter(|(name, _)| shortlist.contains(*name))
            .map(|(n, a)| (n.clone(), a.clone()))
            .collect()
    }

    /// Two Targets with the same name must agree on `sha256` and `apps`
    /// (spec.md §3 invariant); otherwise the signing backend's metadata is
    /// internally inconsistent and must be rejected.
    pub fn agrees_with(&self, other: &Target) -> bool {
        self.name != other.name || (self.sha256 == other.sha256 && self.apps == other.apps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_numeric_ordering() {
        assert!(Version::new("2") < Version::new("10"));
        assert!(Version::new("0") < Version::new("1"));
        assert!(Version::new("0") > Version::new(""));
    }

    #[test]
    fn version_non_numeric_sorts_as_minus_one() {
        let abc = Version::new("abc");
        assert_eq!(abc.as_i64(), -1);
        assert!(abc < Version::new("0"));
    }

    #[test]
    fn version_leading_zeros_tolerated() {
        assert_eq!(Version::new("007").cmp(&Version::new("7")), Ordering::Equal);
    }

    fn mk_target(name: &str, sha: &str) -> Target {
        Target {
            name: name.to_string(),
            version: Version::new("1"),
            sha256: sha.to_string(),
            hardware_ids: BTreeSet::new(),
            tags: BTreeSet::new(),
            apps: BTreeMap::new(),
            bootfw_version: None,
            initial: false,
        }
    }

    #[test]
    fn hwid_empty_set_applies_everywhere() {
        let t = mk_target("a", "aaaa");
        assert!(t.applies_to_hardware("rpi4"));
    }

    #[test]
    fn tags_empty_device_set_accepts_all() {
        let mut t = mk_target("a", "aaaa");
        t.tags.insert("devel".into());
        assert!(t.has_tag(&BTreeSet::new()));
    }

    #[test]
    fn agreement_invariant_rejects_divergent_same_name_targets() {
        let a = mk_target("v2", "aaaa");
        let b = mk_target("v2", "bbbb");
        assert!(!a.agrees_with(&b));
    }
}
