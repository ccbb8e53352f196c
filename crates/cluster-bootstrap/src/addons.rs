//! Post-bootstrap installation: kubeconfig, Cilium and GitOps.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cilium::{self, CiliumConfig};
use crate::config::RunConfig;
use crate::error::Result as BootstrapResult;
use crate::gitops::{self, GitOpsEngine, GitOpsSettings};
use crate::poll::poll_until;
use crate::talos::TalosApi;
use crate::ui;

/// Cluster-side operations of the addons phase.
#[async_trait]
pub trait Addons: Send + Sync {
    /// Whether the Kubernetes API answers.
    async fn api_ready(&self, kubeconfig: &Path) -> bool;

    /// Install the CNI.
    async fn install_cilium(&self, kubeconfig: &Path, config: &CiliumConfig) -> BootstrapResult<()>;

    /// Whether every Cilium agent is ready.
    async fn cilium_ready(&self, kubeconfig: &Path) -> bool;

    /// Install the GitOps controller.
    async fn install_gitops(&self, kubeconfig: &Path, settings: &GitOpsSettings) -> BootstrapResult<()>;
}

/// [`Addons`] backed by the Kubernetes API and the cilium/kubectl/flux CLIs.
#[derive(Debug, Clone)]
pub struct KubeAddons {
    command_timeout: Duration,
}

impl KubeAddons {
    /// Create with the given ceiling for CLI installs.
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn client(kubeconfig: &Path) -> Result<Client> {
        let raw = Kubeconfig::read_from(kubeconfig)
            .with_context(|| format!("Failed to read kubeconfig from {}", kubeconfig.display()))?;

        let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
            .await
            .context("Failed to create Kubernetes config from kubeconfig")?;

        Client::try_from(config).context("Failed to create Kubernetes client")
    }
}

#[async_trait]
impl Addons for KubeAddons {
    async fn api_ready(&self, kubeconfig: &Path) -> bool {
        let client = match Self::client(kubeconfig).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Kubernetes client not available: {e:#}");
                return false;
            }
        };

        match client.apiserver_version().await {
            Ok(version) => {
                debug!(version = %version.git_version, "Kubernetes API answered");
                true
            }
            Err(e) => {
                debug!("Kubernetes API not ready: {e}");
                false
            }
        }
    }

    async fn install_cilium(&self, kubeconfig: &Path, config: &CiliumConfig) -> BootstrapResult<()> {
        cilium::install_cilium(kubeconfig, config, self.command_timeout).await
    }

    async fn cilium_ready(&self, kubeconfig: &Path) -> bool {
        let client = match Self::client(kubeconfig).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Kubernetes client not available: {e:#}");
                return false;
            }
        };

        cilium::agents_ready(client).await.unwrap_or_else(|e| {
            debug!("Cilium agent check failed: {e}");
            false
        })
    }

    async fn install_gitops(&self, kubeconfig: &Path, settings: &GitOpsSettings) -> BootstrapResult<()> {
        gitops::install(kubeconfig, settings, self.command_timeout).await
    }
}

/// What the addons phase achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddonsReport {
    /// Cilium agents became ready in time.
    pub cilium_ready: bool,
    /// GitOps engine installed, if one was requested.
    pub gitops_installed: Option<bool>,
}

impl AddonsReport {
    /// Whether anything ended with a warning.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.cilium_ready || self.gitops_installed == Some(false)
    }
}

/// Fetch a kubeconfig from `api_node`, install Cilium and the GitOps engine.
///
/// # Errors
///
/// Returns an error if the kubeconfig cannot be fetched, the Kubernetes API
/// never becomes ready, or the Cilium install fails. Slow Cilium agents and
/// GitOps failures are warnings.
pub async fn install_addons(
    config: &RunConfig,
    talos: &dyn TalosApi,
    addons: &dyn Addons,
    api_node: IpAddr,
) -> Result<AddonsReport> {
    let kubeconfig_path = config.artifacts().kubeconfig();
    let kubeconfig = kubeconfig_path.as_path();
    talos
        .kubeconfig(api_node, kubeconfig)
        .await
        .context("Failed to fetch kubeconfig")?;

    let timing = &config.timing;
    let api = poll_until("Kubernetes API", &timing.wait(timing.kube_api_wait), move || {
        addons.api_ready(kubeconfig)
    })
    .await;
    if !api.is_ready() {
        bail!(
            "Kubernetes API did not become ready within {}s",
            timing.kube_api_wait
        );
    }
    ui::print_success("Kubernetes API is ready");

    addons
        .install_cilium(kubeconfig, &config.cilium)
        .await
        .context("Cilium installation failed")?;

    let agents = poll_until("Cilium agents", &timing.wait(timing.cilium_wait), move || {
        addons.cilium_ready(kubeconfig)
    })
    .await;
    let cilium_ready = agents.is_ready();
    if cilium_ready {
        ui::print_success(&format!("Cilium {} is ready", config.cilium.version));
    } else {
        ui::print_warning("Cilium agents are not ready yet; check `cilium status`");
    }

    let gitops_installed = match config.gitops.engine {
        GitOpsEngine::None => {
            info!("No GitOps engine requested");
            None
        }
        engine => match addons.install_gitops(kubeconfig, &config.gitops).await {
            Ok(()) => {
                ui::print_success(&format!("{engine} installed"));
                Some(true)
            }
            Err(e) => {
                warn!("GitOps installation failed: {e}");
                ui::print_warning(&format!("{engine} installation failed: {e}"));
                Some(false)
            }
        },
    };

    Ok(AddonsReport {
        cilium_ready,
        gitops_installed,
    })
}
