//! Per-node machine configuration rendering.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::RunConfig;
use crate::discovery::normalize_mac;
use crate::error::{BootstrapError, Result};
use crate::talos::{GenConfigRequest, MachineConfigPatch, TalosApi};

/// Render a final machine config for every Talos node.
///
/// The secrets bundle is generated only when missing. Base configs are
/// produced with the cluster-wide patch, then each node's hostname, static
/// address and NIC selection are patched in.
///
/// Returns node name → config path.
///
/// # Errors
///
/// Returns an error if a node has no MAC in `macs`, a file cannot be
/// written, or talosctl fails.
pub async fn render_node_configs(
    config: &RunConfig,
    talos: &dyn TalosApi,
    macs: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, PathBuf>> {
    let artifacts = config.artifacts();
    artifacts.ensure_dirs().await?;

    let secrets = artifacts.secrets();
    if tokio::fs::try_exists(&secrets).await? {
        info!("Reusing secrets bundle {}", secrets.display());
    } else {
        talos.gen_secrets(&secrets).await?;
    }

    let cluster_patch = artifacts.cluster_patch();
    tokio::fs::write(
        &cluster_patch,
        MachineConfigPatch::cluster(config.cluster.kube_proxy).to_yaml()?,
    )
    .await?;

    let request = GenConfigRequest::new(
        &config.cluster.name,
        config.cluster_endpoint(),
        &secrets,
        artifacts.root(),
    )
    .with_install_disk(&config.cluster.install_disk)
    .with_talos_version(&config.cluster.talos_version)
    .with_kubernetes_version(config.cluster.kubernetes_version.clone())
    .with_patch(&cluster_patch);
    let base = talos.gen_config(&request).await?;

    let mut rendered = BTreeMap::new();
    for node in config.nodes.talos_nodes() {
        let mac = macs
            .get(&node.name)
            .and_then(|m| normalize_mac(m))
            .ok_or_else(|| {
                BootstrapError::ProvisionerOutput(format!("No usable MAC for node {}", node.name))
            })?;

        let patch = artifacts.node_patch(&node.name);
        tokio::fs::write(
            &patch,
            MachineConfigPatch::node(node, &mac, config.cluster.prefix_len).to_yaml()?,
        )
        .await?;

        let output = artifacts.node_config(&node.name);
        talos
            .patch_config(base.base_for(node.role), &patch, &output)
            .await?;
        debug!(node = %node.name, path = %output.display(), "Rendered machine config");
        rendered.insert(node.name.clone(), output);
    }

    info!(nodes = rendered.len(), "Machine configs rendered");
    Ok(rendered)
}
