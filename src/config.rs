//! Structured configuration object (spec §9's enumerated option set).
//!
//! Parsing CLI flags or an on-disk config file into this struct is the
//! embedder's job; the core only consumes the finished `Config`. `DOCKER_HOST`
//! is the one environment variable the core itself reads, as a default for
//! `docker_host` when the embedder leaves it unset.

use std::collections::BTreeSet;
use std::env;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

fn default_docker_host() -> String {
    env::var("DOCKER_HOST").unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string())
}

fn default_storage_watermark() -> u32 {
    95
}

fn default_reserved_space_percent() -> u32 {
    5
}

fn default_reserved_space_delta() -> u32 {
    5
}

/// The recognized, enumerated configuration surface. Unlike the original's
/// loose string maps, every option the core consults has a name and a type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Apps this device is configured to care about; apps outside it are
    /// neither fetched nor started (the "shortlist").
    #[serde(default)]
    pub compose_apps: BTreeSet<String>,

    pub compose_apps_root: Utf8PathBuf,
    pub reset_apps_root: Utf8PathBuf,
    pub images_data_root: Utf8PathBuf,

    #[serde(default = "default_docker_compose_bin")]
    pub docker_compose_bin: Utf8PathBuf,
    #[serde(default = "default_composectl_bin")]
    pub composectl_bin: Utf8PathBuf,

    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Percent of volume capacity at which the accountant refuses further
    /// writes regardless of the per-call reserved-space figure.
    #[serde(default = "default_storage_watermark")]
    pub storage_watermark: u32,

    /// Bounded by `MinReservedStorageSpacePercentageDelta` and
    /// `MaxReservedStorageSpacePercentageDelta` at the embedder layer; the
    /// core takes the resolved value as given.
    #[serde(default = "default_reserved_space_percent")]
    pub reserved_space_percent: u32,
    #[serde(default = "default_reserved_space_delta")]
    pub reserved_space_delta: u32,

    #[serde(default)]
    pub create_containers_before_reboot: bool,

    /// Device tag set; a Target applies iff its tags intersect this set, or
    /// this set is empty.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub callback_program: Option<Utf8PathBuf>,

    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub full_status_check: bool,
}

fn default_docker_compose_bin() -> Utf8PathBuf {
    Utf8PathBuf::from("/usr/bin/docker-compose")
}

fn default_composectl_bin() -> Utf8PathBuf {
    Utf8PathBuf::from("/usr/bin/composectl")
}

impl Config {
    /// Parses a config object from JSON, the way an embedder would load it
    /// from disk before constructing the core.
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_json::from_str(s)?;
        Ok(cfg)
    }
}
