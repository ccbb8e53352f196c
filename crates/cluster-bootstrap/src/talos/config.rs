//! Talos machine configuration generation.
//!
//! Base configs come from `talosctl gen config`; everything node- or
//! cluster-specific is expressed as typed patches serialized with
//! `serde_yaml`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::inventory::{NodeRole, NodeSpec};

/// Default Talos version.
pub const DEFAULT_TALOS_VERSION: &str = "v1.9.5";

/// Inputs to `talosctl gen config`.
#[derive(Debug, Clone)]
pub struct GenConfigRequest {
    /// Cluster name.
    pub cluster_name: String,
    /// Kubernetes API endpoint (e.g. `https://10.0.0.10:6443`).
    pub endpoint: String,
    /// Secrets bundle to reuse.
    pub secrets: PathBuf,
    /// Output directory for generated configs.
    pub output_dir: PathBuf,
    /// Install disk (e.g., `/dev/vda`).
    pub install_disk: String,
    /// Talos version the configs target.
    pub talos_version: Option<String>,
    /// Kubernetes version to pin.
    pub kubernetes_version: Option<String>,
    /// Cluster-wide patch files.
    pub patches: Vec<PathBuf>,
}

impl GenConfigRequest {
    /// Create a request with defaults for everything but identity and paths.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        endpoint: impl Into<String>,
        secrets: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoint: endpoint.into(),
            secrets: secrets.into(),
            output_dir: output_dir.into(),
            install_disk: "/dev/vda".to_string(),
            talos_version: None,
            kubernetes_version: None,
            patches: Vec::new(),
        }
    }

    /// Set the install disk.
    #[must_use]
    pub fn with_install_disk(mut self, disk: impl Into<String>) -> Self {
        self.install_disk = disk.into();
        self
    }

    /// Set the Talos version.
    #[must_use]
    pub fn with_talos_version(mut self, version: impl Into<String>) -> Self {
        self.talos_version = Some(version.into());
        self
    }

    /// Pin the Kubernetes version.
    #[must_use]
    pub fn with_kubernetes_version(mut self, version: Option<String>) -> Self {
        self.kubernetes_version = version;
        self
    }

    /// Add a cluster-wide patch file.
    #[must_use]
    pub fn with_patch(mut self, patch: impl Into<PathBuf>) -> Self {
        self.patches.push(patch.into());
        self
    }

    /// Arguments for talosctl.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "gen".to_string(),
            "config".to_string(),
            self.cluster_name.clone(),
            self.endpoint.clone(),
            "--with-secrets".to_string(),
            self.secrets.display().to_string(),
            "--output-dir".to_string(),
            self.output_dir.display().to_string(),
            "--install-disk".to_string(),
            self.install_disk.clone(),
            "--with-docs=false".to_string(),
            "--with-examples=false".to_string(),
            "--force".to_string(),
        ];
        if let Some(version) = &self.talos_version {
            args.push("--talos-version".to_string());
            args.push(version.clone());
        }
        if let Some(version) = &self.kubernetes_version {
            args.push("--kubernetes-version".to_string());
            args.push(version.clone());
        }
        for patch in &self.patches {
            args.push("--config-patch".to_string());
            args.push(format!("@{}", patch.display()));
        }
        args
    }
}

/// Paths to generated Talos configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfigs {
    /// Path to controlplane.yaml.
    pub controlplane: PathBuf,
    /// Path to worker.yaml.
    pub worker: PathBuf,
    /// Path to talosconfig.
    pub talosconfig: PathBuf,
}

impl GeneratedConfigs {
    /// The file names `talosctl gen config` writes into `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            controlplane: dir.join("controlplane.yaml"),
            worker: dir.join("worker.yaml"),
            talosconfig: dir.join("talosconfig"),
        }
    }

    /// Base config for a role.
    #[must_use]
    pub fn base_for(&self, role: NodeRole) -> &Path {
        match role {
            NodeRole::ControlPlane => &self.controlplane,
            NodeRole::Worker | NodeRole::LoadBalancer => &self.worker,
        }
    }
}

/// kube-proxy handling in the cluster patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KubeProxyMode {
    /// Disabled entirely (Cilium replaces it).
    #[default]
    Disabled,
    /// IPVS mode.
    Ipvs,
    /// iptables mode.
    Iptables,
}

/// A Talos machine config patch (strategic merge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachinePatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachinePatch {
    pub network: NetworkPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPatch {
    pub hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<IpAddr>,
    pub interfaces: Vec<InterfacePatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfacePatch {
    pub device_selector: DeviceSelector,
    pub dhcp: bool,
    pub addresses: Vec<String>,
    pub routes: Vec<RoutePatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    pub hardware_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutePatch {
    pub network: String,
    pub gateway: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterPatch {
    pub network: ClusterNetworkPatch,
    pub proxy: ProxyPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterNetworkPatch {
    pub cni: CniPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CniPatch {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyPatch {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl MachineConfigPatch {
    /// Cluster-wide patch: no default CNI, kube-proxy per `proxy`.
    #[must_use]
    pub fn cluster(proxy: KubeProxyMode) -> Self {
        let proxy = match proxy {
            KubeProxyMode::Disabled => ProxyPatch {
                disabled: true,
                mode: None,
            },
            KubeProxyMode::Ipvs => ProxyPatch {
                disabled: false,
                mode: Some("ipvs".to_string()),
            },
            KubeProxyMode::Iptables => ProxyPatch {
                disabled: false,
                mode: Some("iptables".to_string()),
            },
        };

        Self {
            machine: None,
            cluster: Some(ClusterPatch {
                network: ClusterNetworkPatch {
                    cni: CniPatch {
                        name: "none".to_string(),
                    },
                },
                proxy,
            }),
        }
    }

    /// Per-node patch pinning hostname, static address, route and DNS to the
    /// NIC with the provisioned MAC.
    #[must_use]
    pub fn node(node: &NodeSpec, mac: &str, prefix_len: u8) -> Self {
        let default_route = if node.gateway.is_ipv4() {
            "0.0.0.0/0"
        } else {
            "::/0"
        };

        Self {
            machine: Some(MachinePatch {
                network: NetworkPatch {
                    hostname: node.name.clone(),
                    nameservers: node.nameservers.clone(),
                    interfaces: vec![InterfacePatch {
                        device_selector: DeviceSelector {
                            hardware_addr: mac.to_string(),
                        },
                        dhcp: false,
                        addresses: vec![format!("{}/{prefix_len}", node.ip)],
                        routes: vec![RoutePatch {
                            network: default_route.to_string(),
                            gateway: node.gateway,
                        }],
                    }],
                },
            }),
            cluster: None,
        }
    }

    /// Render as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::node;

    #[test]
    fn test_gen_config_args() {
        let request = GenConfigRequest::new("lab", "https://10.0.0.10:6443", "/out/secrets.yaml", "/out")
            .with_talos_version("v1.9.5")
            .with_patch("/out/patches/cluster.yaml");
        let args = request.args();

        assert_eq!(&args[..4], &["gen", "config", "lab", "https://10.0.0.10:6443"]);
        assert!(args.windows(2).any(|w| w == ["--with-secrets", "/out/secrets.yaml"]));
        assert!(args.windows(2).any(|w| w == ["--install-disk", "/dev/vda"]));
        assert!(args.windows(2).any(|w| w == ["--talos-version", "v1.9.5"]));
        assert!(args.windows(2).any(|w| w == ["--config-patch", "@/out/patches/cluster.yaml"]));
        assert!(!args.contains(&"--kubernetes-version".to_string()));
    }

    #[test]
    fn test_node_patch_yaml() {
        let spec = node("cp-1", NodeRole::ControlPlane, "10.0.0.11");
        let yaml = MachineConfigPatch::node(&spec, "52:54:00:aa:bb:01", 24)
            .to_yaml()
            .unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let network = &value["machine"]["network"];
        assert_eq!(network["hostname"].as_str(), Some("cp-1"));
        assert_eq!(network["nameservers"][0].as_str(), Some("10.0.0.1"));

        let iface = &network["interfaces"][0];
        assert_eq!(iface["deviceSelector"]["hardwareAddr"].as_str(), Some("52:54:00:aa:bb:01"));
        assert_eq!(iface["dhcp"].as_bool(), Some(false));
        assert_eq!(iface["addresses"][0].as_str(), Some("10.0.0.11/24"));
        assert_eq!(iface["routes"][0]["network"].as_str(), Some("0.0.0.0/0"));
        assert_eq!(iface["routes"][0]["gateway"].as_str(), Some("10.0.0.1"));
        assert!(value.get("cluster").is_none());
    }

    #[test]
    fn test_cluster_patch_disables_cni_and_proxy() {
        let yaml = MachineConfigPatch::cluster(KubeProxyMode::Disabled)
            .to_yaml()
            .unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(value["cluster"]["network"]["cni"]["name"].as_str(), Some("none"));
        assert_eq!(value["cluster"]["proxy"]["disabled"].as_bool(), Some(true));
        assert!(value.get("machine").is_none());
    }

    #[test]
    fn test_cluster_patch_ipvs() {
        let patch = MachineConfigPatch::cluster(KubeProxyMode::Ipvs);
        let proxy = &patch.cluster.unwrap().proxy;
        assert!(!proxy.disabled);
        assert_eq!(proxy.mode.as_deref(), Some("ipvs"));
    }

    #[test]
    fn test_base_for_role() {
        let configs = GeneratedConfigs::in_dir(Path::new("/out"));
        assert_eq!(configs.base_for(NodeRole::ControlPlane), Path::new("/out/controlplane.yaml"));
        assert_eq!(configs.base_for(NodeRole::Worker), Path::new("/out/worker.yaml"));
    }
}
