//! End-to-end tests for the bootstrap phase sequence.
//!
//! Every external system is replaced by an in-memory fake; the orchestrator,
//! discovery, rendering, apply fan-out and quorum logic run for real against
//! a temporary output directory.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cluster_bootstrap::addons::Addons;
use cluster_bootstrap::cilium::CiliumConfig;
use cluster_bootstrap::discovery::{NetworkScanner, ScanEntry, ScanResult};
use cluster_bootstrap::gitops::GitOpsSettings;
use cluster_bootstrap::image::ImageFactory;
use cluster_bootstrap::probe::TcpProbe;
use cluster_bootstrap::providers::{DestroyScope, Provisioner};
use cluster_bootstrap::talos::{GenConfigRequest, GeneratedConfigs, TalosApi};
use cluster_bootstrap::{
    Backends, BootstrapError, Inventory, Orchestrator, Phase, PhaseOutcome, Result, RunConfig,
    SkipFlags,
};

// =============================================================================
// Fixture
// =============================================================================

/// (name, role, static ip, MAC as the provisioner prints it, DHCP lease)
const NODES: [(&str, &str, &str, &str, &str); 5] = [
    ("cp-1", "control-plane", "10.0.0.11", "52:54:00:AA:00:01", "10.0.0.101"),
    ("cp-2", "control-plane", "10.0.0.12", "52:54:00:AA:00:02", "10.0.0.102"),
    ("cp-3", "control-plane", "10.0.0.13", "52:54:00:AA:00:03", "10.0.0.103"),
    ("wk-1", "worker", "10.0.0.21", "52:54:00:AA:00:04", "10.0.0.104"),
    ("wk-2", "worker", "10.0.0.22", "52:54:00:AA:00:05", "10.0.0.105"),
];

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn run_config(output_dir: &Path) -> RunConfig {
    let mut yaml = format!(
        "cluster:\n  name: lab\noutput_dir: {}\nnodes:\n  - name: lb\n    role: load-balancer\n    ip: 10.0.0.10\n    gateway: 10.0.0.1\n    vcpus: 1\n    memory_mib: 1024\n    disk_size_gib: 10\n",
        output_dir.display()
    );
    for (name, role, static_ip, _, _) in NODES {
        yaml.push_str(&format!(
            "  - name: {name}\n    role: {role}\n    ip: {static_ip}\n    gateway: 10.0.0.1\n    nameservers: [10.0.0.1]\n    vcpus: 2\n    memory_mib: 4096\n    disk_size_gib: 20\n"
        ));
    }

    RunConfig::from_yaml(&yaml).unwrap().with_skip(SkipFlags {
        image: true,
        ..Default::default()
    })
}

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeProvisioner {
    applies: AtomicUsize,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn apply(&self, cluster_name: &str, inventory: &Inventory, _image: &Path) -> Result<()> {
        assert_eq!(cluster_name, "lab");
        assert_eq!(inventory.nodes().len(), 6);
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn node_macs(&self) -> Result<BTreeMap<String, String>> {
        let mut macs: BTreeMap<String, String> = NODES
            .iter()
            .map(|(name, _, _, mac, _)| ((*name).to_string(), (*mac).to_string()))
            .collect();
        macs.insert("lb".to_string(), "52:54:00:AA:00:00".to_string());
        Ok(macs)
    }

    async fn destroy(&self, _scope: DestroyScope) -> Result<()> {
        Ok(())
    }

    async fn power_states(&self) -> Result<String> {
        Ok(" Id   Name   State\n 1    cp-1   running\n".to_string())
    }
}

/// Returns lower-case leases for the first `visible` nodes.
struct FakeScanner {
    visible: usize,
}

#[async_trait]
impl NetworkScanner for FakeScanner {
    async fn scan(&self) -> Result<ScanResult> {
        let entries: Vec<ScanEntry> = NODES
            .iter()
            .take(self.visible)
            .map(|(_, _, _, mac, lease)| ScanEntry {
                mac: mac.to_lowercase(),
                ip: ip(lease),
            })
            .collect();
        let raw = entries
            .iter()
            .map(|e| format!("{}\t{}", e.ip, e.mac))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ScanResult { entries, raw })
    }
}

/// Nodes answer insecure probes on their lease and, once configured,
/// authenticated probes on their static address.
#[derive(Default)]
struct FakeTalos {
    broken: BTreeSet<IpAddr>,
    configured: Mutex<BTreeSet<IpAddr>>,
    apply_calls: Mutex<Vec<IpAddr>>,
    bootstrap_calls: Mutex<Vec<IpAddr>>,
}

impl FakeTalos {
    fn failing(addresses: &[&str]) -> Self {
        Self {
            broken: addresses.iter().map(|a| ip(a)).collect(),
            ..Default::default()
        }
    }

    fn apply_calls(&self) -> Vec<IpAddr> {
        self.apply_calls.lock().unwrap().clone()
    }

    fn bootstrap_calls(&self) -> Vec<IpAddr> {
        self.bootstrap_calls.lock().unwrap().clone()
    }
}

fn static_for(address: IpAddr) -> Option<IpAddr> {
    NODES
        .iter()
        .find(|(_, _, static_ip, _, lease)| ip(lease) == address || ip(static_ip) == address)
        .map(|(_, _, static_ip, _, _)| ip(static_ip))
}

#[async_trait]
impl TalosApi for FakeTalos {
    async fn probe_insecure(&self, address: IpAddr) -> bool {
        static_for(address).is_some()
    }

    async fn probe_authenticated(&self, address: IpAddr) -> bool {
        self.configured.lock().unwrap().contains(&address)
    }

    async fn apply_config(&self, address: IpAddr, config: &Path) -> Result<()> {
        assert!(config.exists(), "config {} was not rendered", config.display());
        self.apply_calls.lock().unwrap().push(address);

        if self.broken.contains(&address) {
            return Err(BootstrapError::CommandFailed {
                program: "talosctl".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "connection reset by peer".to_string(),
            });
        }
        if let Some(static_ip) = static_for(address) {
            self.configured.lock().unwrap().insert(static_ip);
        }
        Ok(())
    }

    async fn bootstrap(&self, address: IpAddr) -> Result<()> {
        self.bootstrap_calls.lock().unwrap().push(address);
        Ok(())
    }

    async fn kubeconfig(&self, _address: IpAddr, output: &Path) -> Result<()> {
        tokio::fs::write(output, "apiVersion: v1\n").await?;
        Ok(())
    }

    async fn gen_secrets(&self, output: &Path) -> Result<()> {
        tokio::fs::write(output, "cluster: {}\n").await?;
        Ok(())
    }

    async fn gen_config(&self, request: &GenConfigRequest) -> Result<GeneratedConfigs> {
        let configs = GeneratedConfigs::in_dir(&request.output_dir);
        tokio::fs::write(&configs.controlplane, "machine: {type: controlplane}\n").await?;
        tokio::fs::write(&configs.worker, "machine: {type: worker}\n").await?;
        tokio::fs::write(&configs.talosconfig, "context: lab\n").await?;
        Ok(configs)
    }

    async fn patch_config(&self, base: &Path, patch: &Path, output: &Path) -> Result<()> {
        let merged = format!(
            "{}---\n{}",
            tokio::fs::read_to_string(base).await?,
            tokio::fs::read_to_string(patch).await?
        );
        tokio::fs::write(output, merged).await?;
        Ok(())
    }
}

#[derive(Default)]
struct FakeAddons {
    cilium_installs: AtomicUsize,
    gitops_installs: AtomicUsize,
}

#[async_trait]
impl Addons for FakeAddons {
    async fn api_ready(&self, kubeconfig: &Path) -> bool {
        kubeconfig.exists()
    }

    async fn install_cilium(&self, _kubeconfig: &Path, _config: &CiliumConfig) -> Result<()> {
        self.cilium_installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cilium_ready(&self, _kubeconfig: &Path) -> bool {
        true
    }

    async fn install_gitops(&self, _kubeconfig: &Path, _settings: &GitOpsSettings) -> Result<()> {
        self.gitops_installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysOpen;

#[async_trait]
impl TcpProbe for AlwaysOpen {
    async fn reachable(&self, _addr: SocketAddr) -> bool {
        true
    }
}

struct Harness {
    provisioner: Arc<FakeProvisioner>,
    talos: Arc<FakeTalos>,
    addons: Arc<FakeAddons>,
    backends: Backends,
}

fn harness(visible: usize, talos: FakeTalos) -> Harness {
    let provisioner = Arc::new(FakeProvisioner::default());
    let talos = Arc::new(talos);
    let addons = Arc::new(FakeAddons::default());
    let backends = Backends {
        images: ImageFactory::new("http://127.0.0.1:9").unwrap(),
        provisioner: provisioner.clone(),
        scanner: Arc::new(FakeScanner { visible }),
        talos: talos.clone(),
        addons: addons.clone(),
        tcp: Arc::new(AlwaysOpen),
    };
    Harness {
        provisioner,
        talos,
        addons,
        backends,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_run_three_control_planes_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path());
    let h = harness(5, FakeTalos::default());

    let summary = Orchestrator::new(&config, &h.backends).run().await.unwrap();

    assert_eq!(summary.nodes.len(), 5);
    let names: BTreeSet<_> = summary.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names.len(), 5, "no duplicate names");
    assert!(summary.nodes.iter().all(|n| n.mac_address == n.mac_address.to_lowercase()));

    let apply = summary.apply.as_ref().unwrap();
    assert_eq!(apply.succeeded.len(), 5);
    assert!(apply.failed.is_empty());
    let mut applied = h.talos.apply_calls();
    applied.sort();
    let mut leases: Vec<IpAddr> = NODES.iter().map(|n| ip(n.4)).collect();
    leases.sort();
    assert_eq!(applied, leases);

    assert_eq!(h.talos.bootstrap_calls(), vec![ip("10.0.0.11")]);
    let quorum = summary.quorum.as_ref().unwrap();
    assert_eq!(quorum.control_planes_ready.len(), 3);
    assert_eq!(quorum.workers_ready.len(), 2);

    assert_eq!(h.provisioner.applies.load(Ordering::SeqCst), 1);
    assert_eq!(h.addons.cilium_installs.load(Ordering::SeqCst), 1);
    assert_eq!(h.addons.gitops_installs.load(Ordering::SeqCst), 1);

    assert_eq!(summary.phases[0], (Phase::ImageAcquisition, PhaseOutcome::Skipped));
    assert!(summary.phases[1..]
        .iter()
        .all(|(_, outcome)| *outcome == PhaseOutcome::Completed));
    assert!(!summary.is_degraded());

    let secrets = config.artifacts().secrets();
    assert!(secrets.exists());
    let rendered = std::fs::read_to_string(config.artifacts().node_config("wk-2")).unwrap();
    assert!(rendered.contains("52:54:00:aa:00:05"));
    assert!(rendered.contains("10.0.0.22/24"));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_short_one_node_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path());
    let h = harness(4, FakeTalos::default());

    let failure = Orchestrator::new(&config, &h.backends).run().await.unwrap_err();

    assert_eq!(failure.phase, Phase::Discovery);
    assert_eq!(
        failure.completed.iter().copied().collect::<Vec<_>>(),
        vec![Phase::Provisioning]
    );
    assert!(matches!(
        failure.error.downcast_ref::<BootstrapError>(),
        Some(BootstrapError::DiscoveryExhausted {
            resolved: 4,
            expected: 5,
            attempts: 24
        })
    ));
    assert!(h.talos.apply_calls().is_empty());
    assert!(h.talos.bootstrap_calls().is_empty());
    assert_eq!(Phase::Discovery.resume_flags(), "--skip-image --skip-terraform");
}

#[tokio::test(start_paused = true)]
async fn test_one_node_failing_apply_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path());
    let h = harness(5, FakeTalos::failing(&["10.0.0.105"]));

    let summary = Orchestrator::new(&config, &h.backends).run().await.unwrap();

    let apply = summary.apply.as_ref().unwrap();
    assert_eq!(apply.succeeded, vec!["cp-1", "cp-2", "cp-3", "wk-1"]);
    assert_eq!(apply.failed.len(), 1);
    assert_eq!(apply.failed[0].name, "wk-2");

    let broken_attempts = h
        .talos
        .apply_calls()
        .into_iter()
        .filter(|a| *a == ip("10.0.0.105"))
        .count();
    assert_eq!(broken_attempts, 3);

    assert_eq!(h.talos.bootstrap_calls().len(), 1);
    let quorum = summary.quorum.as_ref().unwrap();
    assert_eq!(quorum.control_planes_ready.len(), 3);
    assert_eq!(quorum.workers_ready.len(), 1);

    let outcome = |phase| summary.phases.iter().find(|(p, _)| *p == phase).map(|(_, o)| *o);
    assert_eq!(outcome(Phase::ConfigApplication), Some(PhaseOutcome::Degraded));
    assert_eq!(outcome(Phase::Bootstrap), Some(PhaseOutcome::Degraded));
    assert_eq!(outcome(Phase::Addons), Some(PhaseOutcome::Completed));
    assert!(summary.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn test_skipped_discovery_applies_to_static_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path()).with_skip(SkipFlags {
        image: true,
        terraform: true,
        discovery: true,
        ..Default::default()
    });
    let h = harness(0, FakeTalos::default());

    let summary = Orchestrator::new(&config, &h.backends).run().await.unwrap();

    assert_eq!(h.provisioner.applies.load(Ordering::SeqCst), 0);
    let mut applied = h.talos.apply_calls();
    applied.sort();
    let mut statics: Vec<IpAddr> = NODES.iter().map(|n| ip(n.2)).collect();
    statics.sort();
    assert_eq!(applied, statics);
    assert!(summary.nodes.iter().all(|n| n.dhcp_ip.is_none()));
    assert_eq!(h.talos.bootstrap_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_bootstrap_reuses_rendered_configs() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path()).with_skip(SkipFlags {
        image: true,
        terraform: true,
        discovery: true,
        config: true,
        apply: true,
        ..Default::default()
    });
    let talos = FakeTalos::default();
    talos
        .configured
        .lock()
        .unwrap()
        .extend(NODES.iter().map(|n| ip(n.2)));
    let h = harness(0, talos);

    let summary = Orchestrator::new(&config, &h.backends).run().await.unwrap();

    assert!(h.talos.apply_calls().is_empty());
    assert_eq!(h.talos.bootstrap_calls(), vec![ip("10.0.0.11")]);
    assert!(summary.apply.is_none());
    assert_eq!(
        summary
            .phases
            .iter()
            .filter(|(_, o)| *o == PhaseOutcome::Skipped)
            .count(),
        5
    );
    assert!(config.artifacts().kubeconfig().exists());
}
