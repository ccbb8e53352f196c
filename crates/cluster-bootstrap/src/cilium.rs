//! Cilium CNI installation.
//!
//! The Talos machine configs disable the default CNI and kube-proxy, so
//! Cilium is installed with kube-proxy replacement through KubePrism
//! (`localhost:7445`) and the capability set Talos requires.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::Result;
use crate::exec;

/// Label selector for the Cilium agent pods.
pub const CILIUM_AGENT_SELECTOR: &str = "k8s-app=cilium";

/// Cilium configuration for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiliumConfig {
    /// Cilium version to install (e.g., "1.16.4").
    pub version: String,
    /// API server host seen from the nodes (KubePrism on Talos).
    pub k8s_service_host: String,
    /// API server port seen from the nodes.
    pub k8s_service_port: u16,
    /// Enable Hubble for network observability.
    pub enable_hubble: bool,
    /// Extra `--set` values, applied after the defaults.
    pub values: BTreeMap<String, String>,
}

impl Default for CiliumConfig {
    fn default() -> Self {
        Self {
            version: "1.16.4".to_string(),
            k8s_service_host: "localhost".to_string(),
            k8s_service_port: 7445,
            enable_hubble: false,
            values: BTreeMap::new(),
        }
    }
}

impl CiliumConfig {
    /// Helm values passed to `cilium install`, in order.
    #[must_use]
    pub fn helm_values(&self) -> Vec<(String, String)> {
        let mut values: BTreeMap<String, String> = [
            ("ipam.mode", "kubernetes".to_string()),
            ("kubeProxyReplacement", "true".to_string()),
            ("k8sServiceHost", self.k8s_service_host.clone()),
            ("k8sServicePort", self.k8s_service_port.to_string()),
            (
                "securityContext.capabilities.ciliumAgent",
                "{CHOWN,KILL,NET_ADMIN,NET_RAW,IPC_LOCK,SYS_ADMIN,SYS_RESOURCE,DAC_OVERRIDE,FOWNER,SETGID,SETUID}"
                    .to_string(),
            ),
            (
                "securityContext.capabilities.cleanCiliumState",
                "{NET_ADMIN,SYS_ADMIN,SYS_RESOURCE}".to_string(),
            ),
            ("cgroup.autoMount.enabled", "false".to_string()),
            ("cgroup.hostRoot", "/sys/fs/cgroup".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if self.enable_hubble {
            values.insert("hubble.relay.enabled".into(), "true".into());
            values.insert("hubble.ui.enabled".into(), "true".into());
        }

        for (key, value) in &self.values {
            values.insert(key.clone(), value.clone());
        }

        values.into_iter().collect()
    }

    /// Arguments for `cilium install`.
    #[must_use]
    pub fn install_args(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--version".to_string(),
            self.version.clone(),
        ];
        for (key, value) in self.helm_values() {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }
}

/// Install Cilium with the cilium CLI.
///
/// # Errors
///
/// Returns an error if the cilium CLI fails.
pub async fn install_cilium(kubeconfig: &Path, config: &CiliumConfig, timeout: Duration) -> Result<()> {
    info!("Installing Cilium {}...", config.version);

    let mut cmd = Command::new("cilium");
    cmd.env("KUBECONFIG", kubeconfig).args(config.install_args());
    exec::run_checked(cmd, timeout).await?;

    info!("Cilium install submitted");
    Ok(())
}

/// Whether every listed Cilium agent pod reports `Ready=True`.
///
/// An empty list is not ready: the daemonset has not scheduled yet.
#[must_use]
pub fn pods_ready(pods: &[Pod]) -> bool {
    !pods.is_empty()
        && pods.iter().all(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        })
}

/// Check whether all Cilium agents are ready.
///
/// # Errors
///
/// Returns an error if the pod list cannot be fetched.
pub async fn agents_ready(client: Client) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client, "kube-system");
    let list = pods
        .list(&ListParams::default().labels(CILIUM_AGENT_SELECTOR))
        .await?;

    let ready = pods_ready(&list.items);
    debug!(agents = list.items.len(), ready, "Cilium agent readiness");
    Ok(ready)
}
