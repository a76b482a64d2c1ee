//! `Runtime` capability (spec.md §1): the container runtime daemon and
//! compose-style orchestrator the core consumes rather than implements.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub app_name: String,
    pub service_name: String,
    pub image_digest: String,
    pub running: bool,
}

pub trait Runtime: Send + Sync {
    fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    fn prune_images(&self, keep_digests: &[String]) -> Result<()>;
    fn prune_containers(&self, keep_apps: &[String]) -> Result<()>;
    fn load_image(&self, oci_layout_dir: &camino::Utf8Path) -> Result<()>;
}
