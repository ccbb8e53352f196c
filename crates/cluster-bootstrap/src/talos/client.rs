//! Talos API access through talosctl.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::config::{GenConfigRequest, GeneratedConfigs};
use crate::error::{BootstrapError, Result};
use crate::exec;
use crate::probe::{TcpConnectProbe, TcpProbe};

/// Default Talos API port.
pub const TALOS_API_PORT: u16 = 50000;

/// Default Kubernetes API port.
pub const K8S_API_PORT: u16 = 6443;

/// Trust level at which a node's Talos API answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeReadiness {
    /// Nothing answers.
    Unreachable,
    /// Maintenance mode: answers unauthenticated calls only.
    ReachableInsecure,
    /// Configured and rebooted: accepts certificate-authenticated calls.
    ReachableAuthenticated,
}

impl std::fmt::Display for NodeReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::ReachableInsecure => write!(f, "reachable-insecure"),
            Self::ReachableAuthenticated => write!(f, "reachable-authenticated"),
        }
    }
}

/// Operations the bootstrap needs from Talos.
#[async_trait]
pub trait TalosApi: Send + Sync {
    /// Whether the node answers unauthenticated (maintenance mode) calls.
    async fn probe_insecure(&self, ip: IpAddr) -> bool;

    /// Whether the node accepts authenticated calls.
    async fn probe_authenticated(&self, ip: IpAddr) -> bool;

    /// Current readiness of a node.
    async fn readiness(&self, ip: IpAddr) -> NodeReadiness {
        if self.probe_authenticated(ip).await {
            NodeReadiness::ReachableAuthenticated
        } else if self.probe_insecure(ip).await {
            NodeReadiness::ReachableInsecure
        } else {
            NodeReadiness::Unreachable
        }
    }

    /// Push machine configuration; the node installs and reboots.
    async fn apply_config(&self, ip: IpAddr, config: &Path) -> Result<()>;

    /// One-shot etcd initialization.
    async fn bootstrap(&self, ip: IpAddr) -> Result<()>;

    /// Fetch a kubeconfig for the cluster.
    async fn kubeconfig(&self, ip: IpAddr, output: &Path) -> Result<()>;

    /// Generate a cluster secrets bundle.
    async fn gen_secrets(&self, output: &Path) -> Result<()>;

    /// Generate base machine configs from a secrets bundle.
    async fn gen_config(&self, request: &GenConfigRequest) -> Result<GeneratedConfigs>;

    /// Apply a patch file to a base config, writing the result.
    async fn patch_config(&self, base: &Path, patch: &Path, output: &Path) -> Result<()>;
}

/// [`TalosApi`] backed by the talosctl CLI.
#[derive(Debug, Clone)]
pub struct TalosCtl {
    talosconfig: PathBuf,
    command_timeout: Duration,
    probe: TcpConnectProbe,
}

impl TalosCtl {
    /// Create a talosctl client using the given talosconfig.
    #[must_use]
    pub fn new(talosconfig: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            talosconfig: talosconfig.into(),
            command_timeout,
            probe: TcpConnectProbe::new(Duration::from_secs(3)),
        }
    }

    /// A talosctl command targeting one node with the cluster talosconfig.
    ///
    /// `-e` is always passed because the generated talosconfig has no
    /// endpoints.
    fn authenticated(&self, ip: IpAddr) -> Command {
        let ip = ip.to_string();
        let mut cmd = Command::new("talosctl");
        cmd.arg("--talosconfig")
            .arg(&self.talosconfig)
            .args(["-e", &ip, "-n", &ip]);
        cmd
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(15).min(self.command_timeout)
    }

    async fn port_open(&self, ip: IpAddr) -> bool {
        self.probe
            .reachable(SocketAddr::new(ip, TALOS_API_PORT))
            .await
    }
}

#[async_trait]
impl TalosApi for TalosCtl {
    async fn probe_insecure(&self, ip: IpAddr) -> bool {
        if !self.port_open(ip).await {
            return false;
        }

        let ip = ip.to_string();
        let mut cmd = Command::new("talosctl");
        cmd.args(["version", "--insecure", "-e", &ip, "-n", &ip]);
        match exec::run(cmd, self.probe_timeout()).await {
            Ok(out) => out.status.success(),
            Err(e) => {
                debug!("Insecure probe of {ip} failed: {e}");
                false
            }
        }
    }

    async fn probe_authenticated(&self, ip: IpAddr) -> bool {
        if !self.port_open(ip).await {
            return false;
        }

        let mut cmd = self.authenticated(ip);
        cmd.arg("version");
        match exec::run(cmd, self.probe_timeout()).await {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).contains("Server:"),
            Ok(out) => {
                debug!(
                    "Version check on {ip} not ready: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                false
            }
            Err(e) => {
                debug!("Version check on {ip} failed: {e}");
                false
            }
        }
    }

    async fn apply_config(&self, ip: IpAddr, config: &Path) -> Result<()> {
        info!("Applying Talos config to {ip}...");
        debug!("  Config: {}", config.display());

        let ip = ip.to_string();
        let mut cmd = Command::new("talosctl");
        cmd.args(["apply-config", "--insecure", "--mode", "reboot", "-n", &ip, "-e", &ip, "--file"])
            .arg(config);
        exec::run_checked(cmd, self.command_timeout).await?;

        info!("✅ Config applied to {ip}; node will install and reboot.");
        Ok(())
    }

    async fn bootstrap(&self, ip: IpAddr) -> Result<()> {
        info!("Bootstrapping Talos cluster on {ip}...");

        let mut cmd = self.authenticated(ip);
        cmd.arg("bootstrap");
        match exec::run_checked(cmd, self.command_timeout).await {
            Ok(_) => {
                info!("✅ Cluster bootstrapped!");
                Ok(())
            }
            Err(BootstrapError::CommandFailed { stderr, .. })
                if stderr.contains("AlreadyExists")
                    || stderr.contains("already bootstrapped")
                    || stderr.contains("etcd is already running") =>
            {
                warn!("Cluster appears to already be bootstrapped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn kubeconfig(&self, ip: IpAddr, output: &Path) -> Result<()> {
        info!("Fetching kubeconfig...");

        let mut cmd = self.authenticated(ip);
        cmd.args(["kubeconfig", "--force"]).arg(output);
        exec::run_checked(cmd, self.command_timeout).await?;

        info!("✅ Kubeconfig saved to: {}", output.display());
        Ok(())
    }

    async fn gen_secrets(&self, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Generating Talos secrets...");
        let mut cmd = Command::new("talosctl");
        cmd.args(["gen", "secrets", "-o"]).arg(output);
        exec::run_checked(cmd, self.command_timeout).await?;

        info!("✅ Secrets generated: {}", output.display());
        Ok(())
    }

    async fn gen_config(&self, request: &GenConfigRequest) -> Result<GeneratedConfigs> {
        info!(
            "Generating Talos config for cluster '{}'...",
            request.cluster_name
        );

        let mut cmd = Command::new("talosctl");
        cmd.args(request.args());
        exec::run_checked(cmd, self.command_timeout).await?;

        let configs = GeneratedConfigs::in_dir(&request.output_dir);
        info!("✅ Configs generated:");
        info!("   - {}", configs.controlplane.display());
        info!("   - {}", configs.worker.display());
        info!("   - {}", configs.talosconfig.display());
        Ok(configs)
    }

    async fn patch_config(&self, base: &Path, patch: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new("talosctl");
        cmd.args(["machineconfig", "patch"])
            .arg(base)
            .arg("--patch")
            .arg(format!("@{}", patch.display()))
            .arg("--output")
            .arg(output);
        exec::run_checked(cmd, self.command_timeout).await?;
        Ok(())
    }
}
