//! Run configuration.
//!
//! One YAML file describes the cluster, the node inventory and every tool
//! setting. It is loaded and validated once, combined with the skip flags
//! from the command line, and passed by reference to every phase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifacts::Artifacts;
use crate::cilium::CiliumConfig;
use crate::discovery::ScanSettings;
use crate::error::{BootstrapError, Result};
use crate::gitops::GitOpsSettings;
use crate::image::ImageSettings;
use crate::inventory::Inventory;
use crate::poll::{PollSpec, RetryConfig};
use crate::providers::TerraformSettings;
use crate::state::SkipFlags;
use crate::talos::{KubeProxyMode, DEFAULT_TALOS_VERSION, K8S_API_PORT};

/// Cluster identity and machine-config inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Name of the cluster.
    pub name: String,
    /// API endpoint host; the load balancer (or first control plane) when unset.
    pub endpoint: Option<String>,
    /// Talos version for boot media and configs.
    pub talos_version: String,
    /// Kubernetes version to pin.
    pub kubernetes_version: Option<String>,
    /// Disk Talos installs to.
    pub install_disk: String,
    /// Prefix length of the node network.
    pub prefix_len: u8,
    /// Keep kube-proxy in this mode instead of disabling it.
    #[serde(with = "kube_proxy_mode")]
    pub kube_proxy: KubeProxyMode,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "talos".to_string(),
            endpoint: None,
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            kubernetes_version: None,
            install_disk: "/dev/vda".to_string(),
            prefix_len: 24,
            kube_proxy: KubeProxyMode::Disabled,
        }
    }
}

mod kube_proxy_mode {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::talos::KubeProxyMode;

    pub fn serialize<S: Serializer>(mode: &KubeProxyMode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(match mode {
            KubeProxyMode::Disabled => "disabled",
            KubeProxyMode::Ipvs => "ipvs",
            KubeProxyMode::Iptables => "iptables",
        })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<KubeProxyMode, D::Error> {
        match String::deserialize(d)?.to_lowercase().as_str() {
            "disabled" | "none" => Ok(KubeProxyMode::Disabled),
            "ipvs" => Ok(KubeProxyMode::Ipvs),
            "iptables" => Ok(KubeProxyMode::Iptables),
            other => Err(serde::de::Error::custom(format!(
                "Unknown kube_proxy mode: {other}. Supported: disabled, ipvs, iptables"
            ))),
        }
    }
}

/// Retry counts, intervals and wait ceilings, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Ceiling for a single external command.
    pub command_timeout: u64,
    /// Delay between discovery scans.
    pub discovery_interval: u64,
    /// Discovery scans before giving up.
    pub discovery_attempts: u32,
    /// Config apply attempts per node.
    pub apply_attempts: u32,
    /// Delay between config apply attempts.
    pub apply_delay: u64,
    /// Bootstrap call attempts.
    pub bootstrap_attempts: u32,
    /// Delay between bootstrap call attempts.
    pub bootstrap_delay: u64,
    /// Interval for readiness waits.
    pub poll_interval: u64,
    /// Progress line every this many readiness probes.
    pub progress_every: u32,
    /// HAProxy API port wait.
    pub haproxy_wait: u64,
    /// Wait for the first control plane to accept authenticated calls.
    pub control_plane_wait: u64,
    /// Wait for every control plane after bootstrap.
    pub quorum_wait: u64,
    /// Wait for workers after bootstrap.
    pub worker_wait: u64,
    /// Kubernetes API wait.
    pub kube_api_wait: u64,
    /// Cilium agent wait.
    pub cilium_wait: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout: 300,
            discovery_interval: 5,
            discovery_attempts: 24,
            apply_attempts: 3,
            apply_delay: 5,
            bootstrap_attempts: 3,
            bootstrap_delay: 15,
            poll_interval: 10,
            progress_every: 6,
            haproxy_wait: 300,
            control_plane_wait: 600,
            quorum_wait: 600,
            worker_wait: 600,
            kube_api_wait: 600,
            cilium_wait: 600,
        }
    }
}

impl Timing {
    /// Per-command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    /// Discovery schedule: `discovery_attempts` scans `discovery_interval` apart.
    #[must_use]
    pub fn discovery_poll(&self) -> PollSpec {
        let interval = Duration::from_secs(self.discovery_interval);
        PollSpec::new(interval, interval * self.discovery_attempts.saturating_sub(1))
            .with_progress_every(self.progress_every)
    }

    /// Readiness wait of `max_wait_secs` at the standard interval.
    #[must_use]
    pub fn wait(&self, max_wait_secs: u64) -> PollSpec {
        PollSpec::new(
            Duration::from_secs(self.poll_interval),
            Duration::from_secs(max_wait_secs),
        )
        .with_progress_every(self.progress_every)
    }

    /// Per-node config apply retry policy.
    #[must_use]
    pub fn apply_retry(&self) -> RetryConfig {
        RetryConfig::fixed(self.apply_attempts, Duration::from_secs(self.apply_delay))
    }

    /// Bootstrap call retry policy.
    #[must_use]
    pub fn bootstrap_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.bootstrap_attempts,
            Duration::from_secs(self.bootstrap_delay),
        )
    }
}

/// Full run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub terraform: TerraformSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub cilium: CiliumConfig,
    #[serde(default)]
    pub gitops: GitOpsSettings,
    #[serde(default)]
    pub timing: Timing,
    /// Directory for generated artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Node inventory.
    pub nodes: Inventory,
    /// Phases to skip; set from the command line.
    #[serde(skip)]
    pub skip: SkipFlags,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("_out")
}

impl RunConfig {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Set the phases to skip.
    #[must_use]
    pub fn with_skip(mut self, skip: SkipFlags) -> Self {
        self.skip = skip;
        self
    }

    /// Check invariants not expressed by the types.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let name = &self.cluster.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(BootstrapError::Config(format!(
                "Cluster name '{name}' must be non-empty lowercase alphanumerics and dashes"
            )));
        }

        if !self.cluster.talos_version.starts_with('v') {
            return Err(BootstrapError::Config(format!(
                "Talos version '{}' must look like v1.9.5",
                self.cluster.talos_version
            )));
        }

        let max_prefix = if self.nodes.nodes().iter().all(|n| n.ip.is_ipv4()) {
            32
        } else {
            128
        };
        if self.cluster.prefix_len == 0 || self.cluster.prefix_len > max_prefix {
            return Err(BootstrapError::Config(format!(
                "Prefix length {} is out of range",
                self.cluster.prefix_len
            )));
        }

        let t = &self.timing;
        if t.discovery_attempts == 0 || t.apply_attempts == 0 || t.bootstrap_attempts == 0 {
            return Err(BootstrapError::Config(
                "Attempt counts must be at least 1".to_string(),
            ));
        }
        if t.discovery_interval == 0 || t.poll_interval == 0 || t.command_timeout == 0 {
            return Err(BootstrapError::Config(
                "Intervals and timeouts must be non-zero".to_string(),
            ));
        }

        if self.terraform.compute_targets.is_empty() {
            return Err(BootstrapError::Config(
                "terraform.compute_targets must name at least one resource".to_string(),
            ));
        }

        self.nodes.validate()
    }

    /// Host the Kubernetes API is reached through.
    #[must_use]
    pub fn endpoint_host(&self) -> String {
        if let Some(endpoint) = &self.cluster.endpoint {
            return endpoint.clone();
        }
        self.nodes
            .load_balancer()
            .or_else(|| self.nodes.control_planes().next())
            .map(|n| n.ip.to_string())
            .unwrap_or_default()
    }

    /// Kubernetes API URL passed to `talosctl gen config`.
    #[must_use]
    pub fn cluster_endpoint(&self) -> String {
        let host = self.endpoint_host();
        if host.contains(':') && !host.starts_with('[') {
            format!("https://[{host}]:{K8S_API_PORT}")
        } else {
            format!("https://{host}:{K8S_API_PORT}")
        }
    }

    /// Generated artifact layout.
    #[must_use]
    pub fn artifacts(&self) -> Artifacts {
        Artifacts::new(&self.output_dir)
    }
}
