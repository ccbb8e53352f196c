//! Phase orchestration.
//!
//! Runs the seven phases in order, honoring skip flags. A skipped phase is
//! assumed to have left its postconditions in place; nothing checks that.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::addons::{self, Addons, AddonsReport, KubeAddons};
use crate::apply::{self, ApplyReport, ApplyTarget};
use crate::config::RunConfig;
use crate::discovery::{self, normalize_mac, ArpScanner, NetworkScanner, ProvisionedNode};
use crate::image::{BootImage, ImageFactory};
use crate::poll::poll_until;
use crate::probe::{TcpConnectProbe, TcpProbe};
use crate::providers::{Provisioner, Terraform};
use crate::quorum::{self, QuorumReport};
use crate::render;
use crate::state::{Phase, PhaseOutcome, PhaseState};
use crate::talos::{TalosApi, TalosCtl, K8S_API_PORT};
use crate::ui;

/// External systems the phases drive.
#[derive(Clone)]
pub struct Backends {
    pub images: ImageFactory,
    pub provisioner: Arc<dyn Provisioner>,
    pub scanner: Arc<dyn NetworkScanner>,
    pub talos: Arc<dyn TalosApi>,
    pub addons: Arc<dyn Addons>,
    pub tcp: Arc<dyn TcpProbe>,
}

impl Backends {
    /// Real backends: Image Factory, terraform, arp-scan, talosctl and the
    /// Kubernetes API.
    ///
    /// # Errors
    ///
    /// Returns an error if the Image Factory URL is invalid.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let timeout = config.timing.command_timeout();
        Ok(Self {
            images: ImageFactory::new(&config.image.factory_url)?,
            provisioner: Arc::new(Terraform::new(config.terraform.clone(), timeout)),
            scanner: Arc::new(ArpScanner::new(config.scan.clone())),
            talos: Arc::new(TalosCtl::new(config.artifacts().talosconfig(), timeout)),
            addons: Arc::new(KubeAddons::new(timeout)),
            tcp: Arc::new(TcpConnectProbe::default()),
        })
    }
}

/// A phase that aborted the run.
#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: anyhow::Error,
    /// Phases that ran (not skipped) before the failure.
    pub completed: BTreeSet<Phase>,
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.phase, self.error)
    }
}

impl std::error::Error for PhaseFailure {}

/// Everything a finished run learned.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<(Phase, PhaseOutcome)>,
    pub image: Option<BootImage>,
    pub nodes: Vec<ProvisionedNode>,
    pub apply: Option<ApplyReport>,
    pub quorum: Option<QuorumReport>,
    pub addons: Option<AddonsReport>,
}

impl RunSummary {
    /// Whether any phase ended with warnings.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.phases
            .iter()
            .any(|(_, outcome)| *outcome == PhaseOutcome::Degraded)
    }

    /// Print the end-of-run report.
    pub fn print(&self) {
        ui::print_section("Summary");

        for (phase, outcome) in &self.phases {
            let line = format!("{}. {phase}", phase.step_number());
            match outcome {
                PhaseOutcome::Completed => ui::print_success(&line),
                PhaseOutcome::Degraded => ui::print_warning(&line),
                PhaseOutcome::Skipped => ui::print_skipped(&line),
            }
        }

        if let Some(image) = &self.image {
            ui::print_kv("Boot media", &image.path.display().to_string());
        }
        for node in &self.nodes {
            ui::print_kv(&node.name, &node.static_ip.to_string());
        }
        if let Some(report) = &self.apply {
            for failure in &report.failed {
                ui::print_list_item(&format!("{} ({}): {}", failure.name, failure.ip, failure.error));
            }
        }
        if let Some(quorum) = &self.quorum {
            ui::print_kv("Bootstrap node", &quorum.bootstrap_node);
            ui::print_kv(
                "Control planes ready",
                &format!("{}/{}", quorum.control_planes_ready.len(), quorum.control_planes_total),
            );
            ui::print_kv(
                "Workers ready",
                &format!("{}/{}", quorum.workers_ready.len(), quorum.workers_total),
            );
        }

        let elapsed = self.finished_at - self.started_at;
        ui::print_kv("Duration", &format!("{}m {}s", elapsed.num_minutes(), elapsed.num_seconds() % 60));
    }
}

/// Drives one bootstrap run.
pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    backends: &'a Backends,
    state: PhaseState,
    image_path: PathBuf,
    image: Option<BootImage>,
    macs: Option<BTreeMap<String, String>>,
    nodes: Vec<ProvisionedNode>,
    node_configs: BTreeMap<String, PathBuf>,
    apply: Option<ApplyReport>,
    quorum: Option<QuorumReport>,
    addons: Option<AddonsReport>,
}

impl<'a> Orchestrator<'a> {
    /// Prepare a run.
    #[must_use]
    pub fn new(config: &'a RunConfig, backends: &'a Backends) -> Self {
        Self {
            config,
            backends,
            state: PhaseState::new(),
            image_path: config.image.local_path(&config.cluster.talos_version),
            image: None,
            macs: None,
            nodes: Vec::new(),
            node_configs: BTreeMap::new(),
            apply: None,
            quorum: None,
            addons: None,
        }
    }

    /// Run every phase in order.
    ///
    /// # Errors
    ///
    /// Returns the phase that failed fatally and why.
    pub async fn run(mut self) -> std::result::Result<RunSummary, PhaseFailure> {
        let started_at = Utc::now();

        for phase in Phase::ALL {
            debug_assert!(phase.dependencies().iter().all(|d| self.state.is_satisfied(*d)));

            if self.config.skip.skips(phase) {
                ui::print_skipped(&format!(
                    "[{}/{}] {phase} (skipped by {})",
                    phase.step_number(),
                    Phase::TOTAL,
                    phase.skip_flag()
                ));
                self.state.finish(phase, PhaseOutcome::Skipped);
                self.assume(phase).await;
                continue;
            }

            ui::print_progress_step(phase.step_number(), Phase::TOTAL, phase.description());
            info!(?phase, "Starting phase");

            match self.execute(phase).await {
                Ok(outcome) => {
                    match outcome {
                        PhaseOutcome::Degraded => ui::print_warning(&format!("{phase} finished with warnings")),
                        _ => ui::print_success(&format!("{phase} complete")),
                    }
                    self.state.finish(phase, outcome);
                }
                Err(error) => return Err(self.fail(phase, error)),
            }
        }

        Ok(RunSummary {
            started_at,
            finished_at: Utc::now(),
            phases: self.state.outcomes().to_vec(),
            image: self.image,
            nodes: self.nodes,
            apply: self.apply,
            quorum: self.quorum,
            addons: self.addons,
        })
    }

    fn fail(&self, phase: Phase, error: anyhow::Error) -> PhaseFailure {
        error!(?phase, "Phase failed: {error:#}");
        ui::print_error(&format!("{phase} failed: {error:#}"));
        PhaseFailure {
            phase,
            error,
            completed: self.state.completed(),
        }
    }

    async fn execute(&mut self, phase: Phase) -> Result<PhaseOutcome> {
        match phase {
            Phase::ImageAcquisition => self.acquire_image().await,
            Phase::Provisioning => self.provision().await,
            Phase::Discovery => self.discover().await,
            Phase::ConfigGeneration => self.generate_configs().await,
            Phase::ConfigApplication => self.apply_configs().await,
            Phase::Bootstrap => self.bootstrap().await,
            Phase::Addons => self.install_addons().await,
        }
    }

    /// Fill in what a skipped phase would have produced.
    async fn assume(&mut self, phase: Phase) {
        match phase {
            Phase::Discovery => {
                let macs = match self.macs().await {
                    Ok(macs) => macs.clone(),
                    Err(e) => {
                        warn!("Continuing without MAC addresses: {e:#}");
                        BTreeMap::new()
                    }
                };
                self.nodes = self
                    .config
                    .nodes
                    .talos_nodes()
                    .map(|spec| {
                        let mac = macs
                            .get(&spec.name)
                            .and_then(|m| normalize_mac(m))
                            .unwrap_or_default();
                        ProvisionedNode::from_static(spec, mac)
                    })
                    .collect();
                info!("Using static addresses for config application");
            }
            Phase::ConfigGeneration => {
                let artifacts = self.config.artifacts();
                self.node_configs = self
                    .config
                    .nodes
                    .talos_nodes()
                    .map(|spec| (spec.name.clone(), artifacts.node_config(&spec.name)))
                    .collect();
            }
            _ => {}
        }
    }

    async fn macs(&mut self) -> Result<&BTreeMap<String, String>> {
        if self.macs.is_none() {
            let macs = self
                .backends
                .provisioner
                .node_macs()
                .await
                .context("Failed to read node MACs from the provisioner")?;
            self.macs = Some(macs);
        }
        self.macs
            .as_ref()
            .context("Node MACs unavailable")
    }

    async fn acquire_image(&mut self) -> Result<PhaseOutcome> {
        let image = self
            .backends
            .images
            .acquire(&self.config.image, &self.config.cluster.talos_version)
            .await
            .context("Failed to acquire boot media")?;

        ui::print_kv("Schematic", &image.schematic_id);
        ui::print_kv("SHA-256", &image.sha256);
        self.image_path.clone_from(&image.path);
        self.image = Some(image);
        Ok(PhaseOutcome::Completed)
    }

    async fn provision(&mut self) -> Result<PhaseOutcome> {
        self.backends
            .provisioner
            .apply(&self.config.cluster.name, &self.config.nodes, &self.image_path)
            .await
            .context("Provisioning failed")?;

        let Some(lb) = self.config.nodes.load_balancer() else {
            return Ok(PhaseOutcome::Completed);
        };

        let addr = SocketAddr::new(lb.ip, K8S_API_PORT);
        let tcp = Arc::clone(&self.backends.tcp);
        let timing = &self.config.timing;
        let outcome = poll_until("HAProxy", &timing.wait(timing.haproxy_wait), || {
            let tcp = Arc::clone(&tcp);
            async move { tcp.reachable(addr).await }
        })
        .await;

        if outcome.is_ready() {
            ui::print_success(&format!("HAProxy is listening on {addr}"));
            Ok(PhaseOutcome::Completed)
        } else {
            warn!(%addr, "HAProxy not reachable");
            ui::print_warning(&format!("HAProxy on {addr} is not reachable yet; continuing"));
            Ok(PhaseOutcome::Degraded)
        }
    }

    async fn discover(&mut self) -> Result<PhaseOutcome> {
        self.nodes = discovery::discover(
            &self.config.nodes,
            self.backends.provisioner.as_ref(),
            self.backends.scanner.as_ref(),
            self.backends.talos.as_ref(),
            &self.config.timing.discovery_poll(),
        )
        .await?;
        ui::print_success(&format!("Resolved {} nodes", self.nodes.len()));
        Ok(PhaseOutcome::Completed)
    }

    async fn generate_configs(&mut self) -> Result<PhaseOutcome> {
        let macs = self.macs().await?.clone();
        self.node_configs =
            render::render_node_configs(self.config, self.backends.talos.as_ref(), &macs)
                .await
                .context("Failed to render machine configs")?;
        Ok(PhaseOutcome::Completed)
    }

    async fn apply_configs(&mut self) -> Result<PhaseOutcome> {
        let targets: Vec<ApplyTarget> = self
            .nodes
            .iter()
            .filter_map(|node| {
                let Some(config) = self.node_configs.get(&node.name) else {
                    warn!(node = %node.name, "No machine config for node");
                    return None;
                };
                Some(ApplyTarget {
                    name: node.name.clone(),
                    ip: node.apply_address(),
                    config: config.clone(),
                })
            })
            .collect();

        let report = apply::apply_all(
            Arc::clone(&self.backends.talos),
            targets,
            &self.config.timing.apply_retry(),
        )
        .await;

        let outcome = if report.is_complete() {
            ui::print_success(&format!("Config applied to {} nodes", report.succeeded.len()));
            PhaseOutcome::Completed
        } else {
            ui::print_warning(&format!(
                "Config applied to {} nodes, failed on {}",
                report.succeeded.len(),
                report.failed.len()
            ));
            for failure in &report.failed {
                ui::print_list_item(&format!("{} ({})", failure.name, failure.ip));
            }
            PhaseOutcome::Degraded
        };
        self.apply = Some(report);
        Ok(outcome)
    }

    async fn bootstrap(&mut self) -> Result<PhaseOutcome> {
        let report = quorum::bootstrap_and_wait(
            &self.config.nodes,
            self.backends.talos.as_ref(),
            &self.config.timing,
        )
        .await?;

        let outcome = if report.is_complete() {
            PhaseOutcome::Completed
        } else {
            PhaseOutcome::Degraded
        };
        self.quorum = Some(report);
        Ok(outcome)
    }

    /// Node to fetch the kubeconfig from: the bootstrap node when known.
    fn api_node(&self) -> Option<IpAddr> {
        let bootstrap_node = self.quorum.as_ref().map(|q| q.bootstrap_node.as_str());
        self.config
            .nodes
            .control_planes()
            .find(|n| Some(n.name.as_str()) == bootstrap_node)
            .or_else(|| self.config.nodes.control_planes().next())
            .map(|n| n.ip)
    }

    async fn install_addons(&mut self) -> Result<PhaseOutcome> {
        let api_node = self
            .api_node()
            .context("Inventory has no control-plane node")?;

        let report = addons::install_addons(
            self.config,
            self.backends.talos.as_ref(),
            self.backends.addons.as_ref(),
            api_node,
        )
        .await?;

        let outcome = if report.is_degraded() {
            PhaseOutcome::Degraded
        } else {
            PhaseOutcome::Completed
        };
        self.addons = Some(report);
        Ok(outcome)
    }
}
