//! GitOps controller installation (ArgoCD or Flux).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};
use crate::exec;

/// Which GitOps controller to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitOpsEngine {
    /// Argo CD from its upstream install manifest.
    #[default]
    Argocd,
    /// Flux via the flux CLI.
    Flux,
    /// Skip GitOps installation.
    None,
}

impl std::fmt::Display for GitOpsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argocd => write!(f, "argocd"),
            Self::Flux => write!(f, "flux"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Argo CD settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgoCdSettings {
    /// Namespace to install into.
    pub namespace: String,
    /// Install manifest URL.
    pub manifest_url: String,
}

impl Default for ArgoCdSettings {
    fn default() -> Self {
        Self {
            namespace: "argocd".to_string(),
            manifest_url:
                "https://raw.githubusercontent.com/argoproj/argo-cd/stable/manifests/install.yaml"
                    .to_string(),
        }
    }
}

/// Flux settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxSettings {
    /// Git repository to bootstrap from; plain `flux install` when unset.
    pub repository_url: Option<String>,
    /// Branch to track.
    pub branch: String,
    /// Path inside the repository holding the cluster manifests.
    pub path: String,
}

impl Default for FluxSettings {
    fn default() -> Self {
        Self {
            repository_url: None,
            branch: "main".to_string(),
            path: "clusters/default".to_string(),
        }
    }
}

/// GitOps settings section of the run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOpsSettings {
    /// Controller to install.
    pub engine: GitOpsEngine,
    /// Argo CD settings.
    pub argocd: ArgoCdSettings,
    /// Flux settings.
    pub flux: FluxSettings,
}

impl FluxSettings {
    /// Arguments for the flux CLI.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match &self.repository_url {
            Some(url) => vec![
                "bootstrap".to_string(),
                "git".to_string(),
                format!("--url={url}"),
                format!("--branch={}", self.branch),
                format!("--path={}", self.path),
                "--silent".to_string(),
            ],
            None => vec!["install".to_string()],
        }
    }
}

/// Install the configured GitOps controller.
///
/// # Errors
///
/// Returns an error if kubectl or flux fails.
pub async fn install(kubeconfig: &Path, settings: &GitOpsSettings, timeout: Duration) -> Result<()> {
    match settings.engine {
        GitOpsEngine::Argocd => install_argocd(kubeconfig, &settings.argocd, timeout).await,
        GitOpsEngine::Flux => install_flux(kubeconfig, &settings.flux, timeout).await,
        GitOpsEngine::None => {
            debug!("GitOps installation disabled");
            Ok(())
        }
    }
}

async fn install_argocd(kubeconfig: &Path, settings: &ArgoCdSettings, timeout: Duration) -> Result<()> {
    info!(namespace = %settings.namespace, "Installing Argo CD");

    let mut create_ns = Command::new("kubectl");
    create_ns
        .arg("--kubeconfig")
        .arg(kubeconfig)
        .args(["create", "namespace", &settings.namespace]);
    match exec::run_checked(create_ns, timeout).await {
        Ok(_) => {}
        Err(BootstrapError::CommandFailed { stderr, .. }) if stderr.contains("AlreadyExists") => {
            debug!("Namespace {} already exists", settings.namespace);
        }
        Err(e) => return Err(e),
    }

    let mut apply = Command::new("kubectl");
    apply
        .arg("--kubeconfig")
        .arg(kubeconfig)
        .args([
            "apply",
            "--server-side",
            "-n",
            &settings.namespace,
            "-f",
            &settings.manifest_url,
        ]);
    exec::run_checked(apply, timeout).await?;

    info!("Argo CD manifests applied");
    Ok(())
}

async fn install_flux(kubeconfig: &Path, settings: &FluxSettings, timeout: Duration) -> Result<()> {
    info!(
        repository = settings.repository_url.as_deref().unwrap_or("-"),
        "Installing Flux"
    );

    let mut cmd = Command::new("flux");
    cmd.arg("--kubeconfig").arg(kubeconfig).args(settings.args());
    exec::run_checked(cmd, timeout).await?;

    info!("Flux installed");
    Ok(())
}
