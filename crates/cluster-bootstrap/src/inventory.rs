//! Declarative node inventory.
//!
//! The inventory is the `nodes:` list of the run configuration file. It is
//! read once at the start of a run and never mutated afterwards.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, Result};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs etcd and the Kubernetes API server.
    ControlPlane,
    /// Runs workloads only.
    Worker,
    /// HAProxy in front of the control plane (not a Talos node).
    LoadBalancer,
}

impl NodeRole {
    /// Whether this node runs Talos and must be discovered and configured.
    #[must_use]
    pub fn is_talos(self) -> bool {
        !matches!(self, Self::LoadBalancer)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
            Self::LoadBalancer => write!(f, "load-balancer"),
        }
    }
}

/// A user-declared node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node name (also the VM name and hostname).
    pub name: String,
    /// Node role.
    pub role: NodeRole,
    /// Static address the node converges to.
    pub ip: IpAddr,
    /// Default gateway.
    pub gateway: IpAddr,
    /// Ordered DNS servers.
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    /// Virtual CPUs.
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Root disk size in GiB.
    pub disk_size_gib: u64,
}

/// The full node list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory {
    nodes: Vec<NodeSpec>,
}

impl Inventory {
    /// Build and validate an inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if names are duplicated, no control-plane node is
    /// declared, more than one load balancer is declared, or sizing is zero.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self> {
        let inventory = Self { nodes };
        inventory.validate()?;
        Ok(inventory)
    }

    /// Validate invariants of the node list.
    ///
    /// # Errors
    ///
    /// See [`Inventory::new`].
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(BootstrapError::Config("node name must not be empty".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(BootstrapError::Config(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            if node.vcpus == 0 || node.memory_mib == 0 || node.disk_size_gib == 0 {
                return Err(BootstrapError::Config(format!(
                    "node '{}' must have non-zero vcpus, memory_mib and disk_size_gib",
                    node.name
                )));
            }
        }

        if self.control_planes().next().is_none() {
            return Err(BootstrapError::Config(
                "inventory must declare at least one control-plane node".into(),
            ));
        }

        if self
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::LoadBalancer)
            .count()
            > 1
        {
            return Err(BootstrapError::Config(
                "inventory may declare at most one load-balancer node".into(),
            ));
        }

        Ok(())
    }

    /// All nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Look up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Control-plane nodes in declaration order.
    pub fn control_planes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.by_role(NodeRole::ControlPlane)
    }

    /// Worker nodes in declaration order.
    pub fn workers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.by_role(NodeRole::Worker)
    }

    /// Nodes that run Talos (everything except the load balancer).
    pub fn talos_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role.is_talos())
    }

    /// The load balancer, if declared.
    #[must_use]
    pub fn load_balancer(&self) -> Option<&NodeSpec> {
        self.by_role(NodeRole::LoadBalancer).next()
    }

    fn by_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(move |n| n.role == role)
    }
}
