//! Provisioner trait: the seam between the bootstrap and the VM/DNS layer.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::inventory::Inventory;

/// What a teardown removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyScope {
    /// VMs, disks and cloud-init media only; DNS records survive.
    ComputeOnly,
    /// Everything the provisioner manages, DNS included.
    Everything,
}

impl std::fmt::Display for DestroyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComputeOnly => write!(f, "compute resources (DNS preserved)"),
            Self::Everything => write!(f, "all infrastructure including DNS"),
        }
    }
}

/// Trait for the declarative infrastructure provisioner.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or converge VMs and DNS records for the inventory.
    async fn apply(&self, cluster_name: &str, inventory: &Inventory, image_path: &Path) -> Result<()>;

    /// Node name → MAC address, as emitted by the provisioner.
    async fn node_macs(&self) -> Result<BTreeMap<String, String>>;

    /// Tear down provisioned resources.
    async fn destroy(&self, scope: DestroyScope) -> Result<()>;

    /// Human-readable VM power states, for diagnostics.
    async fn power_states(&self) -> Result<String>;
}
