//! `<storage>/current-target` writer: a newline-separated `KEY="VALUE"`
//! file written on every successful current-target transition (spec.md §6),
//! ported from `LiteClient::writeCurrentTarget`.

use camino::Utf8Path;

use crate::target::Target;

/// Custom-data fields a Target may carry that get mirrored into
/// `current-target`, only when non-empty (spec.md §9 supplement).
#[derive(Debug, Clone, Default)]
pub struct CurrentTargetCustomData {
    pub lmp_manifest_sha: Option<String>,
    pub meta_subscriber_overrides_sha: Option<String>,
    pub containers_sha: Option<String>,
}

pub fn render(target: &Target, custom: &CurrentTargetCustomData) -> String {
    let mut out = String::new();
    out.push_str(&format!("TARGET_NAME=\"{}\"\n", target.name));
    out.push_str(&format!("CUSTOM_VERSION=\"{}\"\n", target.version.as_str()));
    if let Some(v) = custom.lmp_manifest_sha.as_ref().filter(|v| !v.is_empty()) {
        out.push_str(&format!("LMP_MANIFEST_SHA=\"{v}\"\n"));
    }
    if let Some(v) = custom
        .meta_subscriber_overrides_sha
        .as_ref()
        .filter(|v| !v.is_empty())
    {
        out.push_str(&format!("META_SUBSCRIBER_OVERRIDES_SHA=\"{v}\"\n"));
    }
    if let Some(v) = custom.containers_sha.as_ref().filter(|v| !v.is_empty()) {
        out.push_str(&format!("CONTAINERS_SHA=\"{v}\"\n"));
    }
    out
}

pub fn write(path: &Utf8Path, target: &Target, custom: &CurrentTargetCustomData) -> std::io::Result<()> {
    std::fs::write(path, render(target, custom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn mk_target() -> Target {
        Target {
            name: "v2".to_string(),
            version: crate::target::Version::new("2"),
            sha256: "bbbb".to_string(),
            hardware_ids: BTreeSet::new(),
            tags: BTreeSet::new(),
            apps: BTreeMap::new(),
            bootfw_version: None,
            initial: false,
        }
    }

    #[test]
    fn omits_empty_optional_fields() {
        let rendered = render(&mk_target(), &CurrentTargetCustomData::default());
        assert_eq!(rendered, "TARGET_NAME=\"v2\"\nCUSTOM_VERSION=\"2\"\n");
    }

    #[test]
    fn includes_present_optional_fields() {
        let custom = CurrentTargetCustomData {
            lmp_manifest_sha: Some("aaaa".into()),
            meta_subscriber_overrides_sha: None,
            containers_sha: Some("cccc".into()),
        };
        let rendered = render(&mk_target(), &custom);
        assert_eq!(
            rendered,
            "TARGET_NAME=\"v2\"\nCUSTOM_VERSION=\"2\"\nLMP_MANIFEST_SHA=\"aaaa\"\nCONTAINERS_SHA=\"cccc\"\n"
        );
    }
}
