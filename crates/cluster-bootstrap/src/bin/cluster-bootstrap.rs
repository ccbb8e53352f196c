//! cluster-bootstrap CLI - bring up a Talos cluster on libvirt VMs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use cluster_bootstrap::cleanup::{self, TerminalPrompt};
use cluster_bootstrap::exec;
use cluster_bootstrap::gitops::GitOpsEngine;
use cluster_bootstrap::providers::DestroyScope;
use cluster_bootstrap::{ui, Backends, Orchestrator, Phase, RunConfig, SkipFlags};

/// Bootstrap a Talos Kubernetes cluster on KVM/libvirt.
#[derive(Parser)]
#[command(name = "cluster-bootstrap")]
#[command(version, about = "Provision VMs and bootstrap a Talos cluster with Cilium and GitOps")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Run configuration file.
    #[arg(long, short, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Reuse the boot media already on disk.
    #[arg(long)]
    skip_image: bool,

    /// Assume VMs and DNS records already exist.
    #[arg(long)]
    skip_terraform: bool,

    /// Apply configs to static addresses instead of scanning for DHCP leases.
    #[arg(long)]
    skip_discovery: bool,

    /// Reuse machine configs already in the output directory.
    #[arg(long)]
    skip_config: bool,

    /// Assume configs were already applied.
    #[arg(long)]
    skip_apply: bool,

    /// Assume etcd is already bootstrapped.
    #[arg(long)]
    skip_bootstrap: bool,

    /// Skip Cilium and GitOps installation.
    #[arg(long)]
    skip_addons: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Do not offer to tear down infrastructure after a failure.
    #[arg(long)]
    no_cleanup: bool,

    /// Destroy cluster VMs but keep DNS records, then exit.
    #[arg(long, conflicts_with = "destroy_all")]
    destroy_vms: bool,

    /// Destroy all infrastructure including DNS records, then exit.
    #[arg(long)]
    destroy_all: bool,
}

impl Cli {
    fn skip_flags(&self) -> SkipFlags {
        SkipFlags {
            image: self.skip_image,
            terraform: self.skip_terraform,
            discovery: self.skip_discovery,
            config: self.skip_config,
            apply: self.skip_apply,
            bootstrap: self.skip_bootstrap,
            addons: self.skip_addons,
        }
    }

    fn destroy_scope(&self) -> Option<DestroyScope> {
        if self.destroy_all {
            Some(DestroyScope::Everything)
        } else if self.destroy_vms {
            Some(DestroyScope::ComputeOnly)
        } else {
            None
        }
    }
}

/// External tools each phase shells out to.
fn required_tools(config: &RunConfig) -> Vec<(&'static str, &'static [&'static str])> {
    let skip = &config.skip;
    let mut tools: Vec<(&'static str, &'static [&'static str])> = Vec::new();

    if !(skip.terraform && skip.discovery && skip.config) {
        tools.push(("terraform", &["version"]));
    }
    if !skip.discovery {
        tools.push(("arp-scan", &["--version"]));
    }
    if !(skip.discovery && skip.config && skip.apply && skip.bootstrap && skip.addons) {
        tools.push(("talosctl", &["version", "--client"]));
    }
    if !skip.addons {
        tools.push(("cilium", &["version", "--client"]));
        match config.gitops.engine {
            GitOpsEngine::Argocd => tools.push(("kubectl", &["version", "--client"])),
            GitOpsEngine::Flux => tools.push(("flux", &["--version"])),
            GitOpsEngine::None => {}
        }
    }
    tools
}

async fn preflight(config: &RunConfig) -> Result<()> {
    for (program, args) in required_tools(config) {
        exec::check_tool(program, args)
            .await
            .with_context(|| format!("{program} is required"))?;
        debug!("{program} found");
    }
    Ok(())
}

async fn destroy(config: &RunConfig, scope: DestroyScope) -> Result<()> {
    let backends = Backends::from_config(config)?;
    exec::check_tool("terraform", &["version"]).await?;
    cleanup::confirm_and_destroy(
        backends.provisioner.as_ref(),
        &config.artifacts(),
        &TerminalPrompt,
        scope,
    )
    .await?;
    Ok(())
}

async fn bootstrap(config: &RunConfig, config_path: &Path, no_cleanup: bool) -> Result<bool> {
    preflight(config).await?;
    let backends = Backends::from_config(config)?;

    ui::print_banner(&config.cluster.name);
    ui::print_kv("Nodes", &config.nodes.nodes().len().to_string());
    ui::print_kv("Endpoint", &config.cluster_endpoint());
    ui::print_kv("Output", &config.output_dir.display().to_string());

    match Orchestrator::new(config, &backends).run().await {
        Ok(summary) => {
            summary.print();
            if summary.is_degraded() {
                ui::print_warning("Cluster is up with warnings; see above");
            } else {
                ui::print_success("Cluster is up");
            }
            Ok(true)
        }
        Err(failure) => {
            error!(phase = ?failure.phase, "Bootstrap aborted: {:#}", failure.error);
            if !failure.completed.is_empty() {
                let done: Vec<String> = failure.completed.iter().map(ToString::to_string).collect();
                ui::print_info(&format!("Completed this run: {}", done.join(", ")));
            }
            if no_cleanup || failure.phase == Phase::ImageAcquisition {
                cleanup::print_resume_hint(failure.phase, config_path);
                return Ok(false);
            }

            if let Err(e) = cleanup::offer_cleanup(
                backends.provisioner.as_ref(),
                &config.artifacts(),
                &TerminalPrompt,
                failure.phase,
                config_path,
            )
            .await
            {
                ui::print_error(&format!("Cleanup failed: {e:#}"));
                cleanup::print_resume_hint(failure.phase, config_path);
            }
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match RunConfig::load(&cli.config) {
        Ok(config) => config.with_skip(cli.skip_flags()),
        Err(e) => {
            ui::print_error(&format!("{e}"));
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.destroy_scope() {
        Some(scope) => destroy(&config, scope).await.map(|()| true),
        None => bootstrap(&config, &cli.config, cli.no_cleanup).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
