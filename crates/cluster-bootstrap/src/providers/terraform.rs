//! Terraform + libvirt provisioner.
//!
//! The HCL lives outside this crate. The contract is:
//! - inputs arrive through `cluster.auto.tfvars.json` written before apply
//! - an output (default `node_macs`) maps node name to MAC address

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{DestroyScope, Provisioner};
use crate::error::{BootstrapError, Result};
use crate::exec;
use crate::inventory::{Inventory, NodeRole};

/// Variables file written into the Terraform directory.
pub const TFVARS_FILE: &str = "cluster.auto.tfvars.json";

/// Terraform settings section of the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraformSettings {
    /// Directory holding the Terraform configuration.
    pub dir: PathBuf,
    /// Output exposing node name → MAC address.
    pub mac_output: String,
    /// Resource addresses removed by a compute-only teardown.
    pub compute_targets: Vec<String>,
    /// libvirt connection URI for diagnostics.
    pub libvirt_uri: String,
    /// Ceiling for `terraform apply`/`destroy`.
    pub apply_timeout_secs: u64,
}

impl Default for TerraformSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("terraform"),
            mac_output: "node_macs".to_string(),
            compute_targets: vec![
                "libvirt_domain.node".to_string(),
                "libvirt_volume.node".to_string(),
                "libvirt_cloudinit_disk.node".to_string(),
            ],
            libvirt_uri: "qemu:///system".to_string(),
            apply_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Serialize)]
struct TfVars<'a> {
    cluster_name: &'a str,
    talos_image_path: String,
    nodes: BTreeMap<&'a str, TfNode<'a>>,
}

#[derive(Debug, Serialize)]
struct TfNode<'a> {
    role: NodeRole,
    ip: IpAddr,
    gateway: IpAddr,
    nameservers: &'a [IpAddr],
    vcpus: u32,
    memory_mib: u64,
    disk_size_gib: u64,
}

/// Render the variables file for an inventory.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_tfvars(cluster_name: &str, inventory: &Inventory, image_path: &Path) -> Result<String> {
    let vars = TfVars {
        cluster_name,
        talos_image_path: image_path.display().to_string(),
        nodes: inventory
            .nodes()
            .iter()
            .map(|n| {
                (
                    n.name.as_str(),
                    TfNode {
                        role: n.role,
                        ip: n.ip,
                        gateway: n.gateway,
                        nameservers: &n.nameservers,
                        vcpus: n.vcpus,
                        memory_mib: n.memory_mib,
                        disk_size_gib: n.disk_size_gib,
                    },
                )
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&vars)?)
}

/// Parse `terraform output -json <name>` into a name → MAC map.
///
/// Accepts both the bare map and the `{"value": {...}}` envelope that
/// `terraform output -json` (without a name) produces.
///
/// # Errors
///
/// Returns an error if the output is not a string map.
pub fn parse_mac_output(raw: &str) -> Result<BTreeMap<String, String>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MacOutput {
        Wrapped { value: BTreeMap<String, String> },
        Bare(BTreeMap<String, String>),
    }

    let parsed: MacOutput = serde_json::from_str(raw.trim()).map_err(|e| {
        BootstrapError::ProvisionerOutput(format!("MAC output is not a name → MAC map: {e}"))
    })?;

    Ok(match parsed {
        MacOutput::Wrapped { value } | MacOutput::Bare(value) => value,
    })
}

/// Terraform-driven provisioner.
#[derive(Debug, Clone)]
pub struct Terraform {
    settings: TerraformSettings,
    command_timeout: Duration,
}

impl Terraform {
    /// Create a provisioner from settings.
    #[must_use]
    pub fn new(settings: TerraformSettings, command_timeout: Duration) -> Self {
        Self {
            settings,
            command_timeout,
        }
    }

    fn terraform(&self) -> Command {
        let mut cmd = Command::new("terraform");
        cmd.arg(format!("-chdir={}", self.settings.dir.display()));
        cmd
    }

    fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.apply_timeout_secs)
    }

    /// Arguments for a teardown of the given scope.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] for a compute-only teardown with no
    /// targets; an untargeted destroy would also remove DNS.
    pub fn destroy_args(&self, scope: DestroyScope) -> Result<Vec<String>> {
        let mut args = vec![
            "destroy".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        if scope == DestroyScope::ComputeOnly {
            if self.settings.compute_targets.is_empty() {
                return Err(BootstrapError::Config(
                    "terraform.compute_targets is empty; refusing an untargeted compute-only destroy"
                        .to_string(),
                ));
            }
            args.extend(
                self.settings
                    .compute_targets
                    .iter()
                    .map(|t| format!("-target={t}")),
            );
        }
        Ok(args)
    }
}

#[async_trait]
impl Provisioner for Terraform {
    async fn apply(&self, cluster_name: &str, inventory: &Inventory, image_path: &Path) -> Result<()> {
        let tfvars = self.settings.dir.join(TFVARS_FILE);
        tokio::fs::write(&tfvars, render_tfvars(cluster_name, inventory, image_path)?).await?;
        debug!(path = %tfvars.display(), "Wrote Terraform variables");

        info!("Running terraform init...");
        let mut init = self.terraform();
        init.args(["init", "-input=false"]);
        exec::run_checked(init, self.command_timeout).await?;

        info!("Running terraform apply...");
        let mut apply = self.terraform();
        apply.args(["apply", "-auto-approve", "-input=false"]);
        exec::run_checked(apply, self.apply_timeout()).await?;

        info!("✅ Infrastructure applied");
        Ok(())
    }

    async fn node_macs(&self) -> Result<BTreeMap<String, String>> {
        let mut cmd = self.terraform();
        cmd.args(["output", "-json", &self.settings.mac_output]);
        let stdout = exec::run_checked(cmd, self.command_timeout).await?;
        parse_mac_output(&stdout)
    }

    async fn destroy(&self, scope: DestroyScope) -> Result<()> {
        let args = self.destroy_args(scope)?;
        info!("Destroying {scope}...");
        let mut cmd = self.terraform();
        cmd.args(args);
        exec::run_checked(cmd, self.apply_timeout()).await?;
        info!("✅ Destroyed {scope}");
        Ok(())
    }

    async fn power_states(&self) -> Result<String> {
        let mut cmd = Command::new("virsh");
        cmd.args(["-c", &self.settings.libvirt_uri, "list", "--all"]);
        exec::run_checked(cmd, self.command_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::node;

    #[test]
    fn test_parse_bare_mac_output() {
        let macs = parse_mac_output(r#"{"cp-1":"52:54:00:AA:BB:01","wk-1":"52:54:00:aa:bb:02"}"#)
            .unwrap();
        assert_eq!(macs.len(), 2);
        assert_eq!(macs["cp-1"], "52:54:00:AA:BB:01");
    }

    #[test]
    fn test_parse_wrapped_mac_output() {
        let raw = r#"{"sensitive":false,"type":["map","string"],"value":{"cp-1":"52:54:00:aa:bb:01"}}"#;
        let macs = parse_mac_output(raw).unwrap();
        assert_eq!(macs["cp-1"], "52:54:00:aa:bb:01");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_mac_output("not json").unwrap_err();
        assert!(matches!(err, BootstrapError::ProvisionerOutput(_)));
    }

    #[test]
    fn test_render_tfvars() {
        let inventory = Inventory::new(vec![
            node("cp-1", NodeRole::ControlPlane, "10.0.0.11"),
            node("lb", NodeRole::LoadBalancer, "10.0.0.10"),
        ])
        .unwrap();

        let rendered = render_tfvars("lab", &inventory, Path::new("images/talos.iso")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value["cluster_name"], "lab");
        assert_eq!(value["talos_image_path"], "images/talos.iso");
        assert_eq!(value["nodes"]["cp-1"]["role"], "control-plane");
        assert_eq!(value["nodes"]["lb"]["ip"], "10.0.0.10");
        assert_eq!(value["nodes"]["cp-1"]["memory_mib"], 4096);
    }

    #[test]
    fn test_destroy_args_by_scope() {
        let tf = Terraform::new(TerraformSettings::default(), Duration::from_secs(60));

        let all = tf.destroy_args(DestroyScope::Everything).unwrap();
        assert!(!all.iter().any(|a| a.starts_with("-target")));

        let compute = tf.destroy_args(DestroyScope::ComputeOnly).unwrap();
        assert!(compute.contains(&"-target=libvirt_domain.node".to_string()));
        assert_eq!(compute.iter().filter(|a| a.starts_with("-target")).count(), 3);
    }

    #[test]
    fn test_compute_only_destroy_without_targets_is_refused() {
        let settings = TerraformSettings {
            compute_targets: Vec::new(),
            ..Default::default()
        };
        let tf = Terraform::new(settings, Duration::from_secs(60));

        let err = tf.destroy_args(DestroyScope::ComputeOnly).unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
        assert!(tf.destroy_args(DestroyScope::Everything).is_ok());
    }

    #[tokio::test]
    async fn test_compute_only_destroy_without_targets_runs_nothing() {
        let settings = TerraformSettings {
            dir: PathBuf::from("/nonexistent/terraform"),
            compute_targets: Vec::new(),
            ..Default::default()
        };
        let tf = Terraform::new(settings, Duration::from_secs(60));

        let err = tf.destroy(DestroyScope::ComputeOnly).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }
}
