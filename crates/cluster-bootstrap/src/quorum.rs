//! etcd bootstrap and quorum wait.
//!
//! The bootstrap call goes to exactly one control-plane node, the first in
//! inventory order that accepts authenticated calls. Retries stay on that
//! node; issuing it against a second node risks split initialization.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Timing;
use crate::error::BootstrapError;
use crate::inventory::{Inventory, NodeSpec};
use crate::poll::{poll_until, retry_async, PollSpec};
use crate::talos::TalosApi;
use crate::ui;

/// What the bootstrap phase achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuorumReport {
    /// Node that received the bootstrap call.
    pub bootstrap_node: String,
    /// Control-plane nodes accepting authenticated calls.
    pub control_planes_ready: BTreeSet<String>,
    /// Control-plane nodes in the inventory.
    pub control_planes_total: usize,
    /// Worker nodes accepting authenticated calls.
    pub workers_ready: BTreeSet<String>,
    /// Worker nodes in the inventory.
    pub workers_total: usize,
}

impl QuorumReport {
    /// Whether every control plane and worker is reachable.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.control_planes_ready.len() == self.control_planes_total
            && self.workers_ready.len() == self.workers_total
    }
}

/// Poll `nodes` until at least `need` accept authenticated calls.
///
/// Nodes already seen ready are not probed again.
async fn wait_for_group(
    label: &str,
    talos: &dyn TalosApi,
    nodes: &[&NodeSpec],
    need: usize,
    spec: &PollSpec,
) -> BTreeSet<String> {
    let ready = Mutex::new(BTreeSet::new());
    let ready_ref = &ready;

    poll_until(label, spec, || async move {
        let pending: Vec<(&str, IpAddr)> = {
            let seen = ready_ref.lock().unwrap_or_else(PoisonError::into_inner);
            nodes
                .iter()
                .filter(|n| !seen.contains(&n.name))
                .map(|n| (n.name.as_str(), n.ip))
                .collect()
        };

        let probes = pending.into_iter().map(|(name, ip)| async move {
            (name, talos.probe_authenticated(ip).await)
        });
        let results = join_all(probes).await;

        let mut seen = ready_ref.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, ok) in results {
            if ok {
                info!(node = name, "Node accepts authenticated API calls");
                seen.insert(name.to_string());
            }
        }
        seen.len() >= need
    })
    .await;

    ready.into_inner().unwrap_or_else(PoisonError::into_inner)
}

/// Print the current readiness of every node not in `ready`.
async fn report_unready(talos: &dyn TalosApi, nodes: &[&NodeSpec], ready: &BTreeSet<String>) {
    for node in nodes.iter().filter(|n| !ready.contains(&n.name)) {
        let readiness = talos.readiness(node.ip).await;
        warn!(node = %node.name, ip = %node.ip, %readiness, "Node not ready");
        ui::print_list_item(&format!("{} ({}): {readiness}", node.name, node.ip));
    }
}

/// Bootstrap etcd on one control-plane node and wait for the rest.
///
/// # Errors
///
/// Returns [`BootstrapError::NoControlPlaneReady`] if no control plane
/// becomes reachable in time, or the last bootstrap error after every retry
/// failed. Partial quorum and unreachable workers are warnings.
pub async fn bootstrap_and_wait(
    inventory: &Inventory,
    talos: &dyn TalosApi,
    timing: &Timing,
) -> Result<QuorumReport> {
    let control_planes: Vec<&NodeSpec> = inventory.control_planes().collect();
    let workers: Vec<&NodeSpec> = inventory.workers().collect();

    let first_wait = timing.wait(timing.control_plane_wait);
    let ready = wait_for_group(
        "first control-plane node",
        talos,
        &control_planes,
        1,
        &first_wait,
    )
    .await;

    let target = control_planes
        .iter()
        .find(|n| ready.contains(&n.name))
        .ok_or(BootstrapError::NoControlPlaneReady(timing.control_plane_wait))?;

    ui::print_progress(&format!("Bootstrapping etcd on {} ({})", target.name, target.ip));
    let ip = target.ip;
    retry_async(&timing.bootstrap_retry(), "etcd bootstrap", move |_| async move {
        talos.bootstrap(ip).await.map_err(anyhow::Error::from)
    })
    .await
    .with_context(|| format!("Bootstrap of {} failed", target.name))?;
    ui::print_success(&format!("etcd bootstrapped on {}", target.name));

    let control_planes_ready = wait_for_group(
        "control-plane quorum",
        talos,
        &control_planes,
        control_planes.len(),
        &timing.wait(timing.quorum_wait),
    )
    .await;
    if control_planes_ready.len() < control_planes.len() {
        warn!(
            ready = control_planes_ready.len(),
            total = control_planes.len(),
            "Partial control-plane quorum"
        );
        ui::print_warning(&format!(
            "Only {}/{} control-plane nodes are ready; continuing with degraded quorum",
            control_planes_ready.len(),
            control_planes.len()
        ));
        report_unready(talos, &control_planes, &control_planes_ready).await;
    } else {
        ui::print_success(&format!(
            "All {} control-plane nodes ready",
            control_planes.len()
        ));
    }

    let workers_ready = if workers.is_empty() {
        BTreeSet::new()
    } else {
        wait_for_group(
            "worker nodes",
            talos,
            &workers,
            workers.len(),
            &timing.wait(timing.worker_wait),
        )
        .await
    };
    if workers_ready.len() < workers.len() {
        ui::print_warning(&format!(
            "Only {}/{} worker nodes are reachable",
            workers_ready.len(),
            workers.len()
        ));
        report_unready(talos, &workers, &workers_ready).await;
    } else if !workers.is_empty() {
        ui::print_success(&format!("All {} worker nodes reachable", workers.len()));
    }

    Ok(QuorumReport {
        bootstrap_node: target.name.clone(),
        control_planes_ready,
        control_planes_total: control_planes.len(),
        workers_ready,
        workers_total: workers.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::Result as BootstrapResult;
    use crate::inventory::tests::node;
    use crate::inventory::NodeRole;
    use crate::talos::{GenConfigRequest, GeneratedConfigs};

    struct Cluster {
        ready: BTreeSet<IpAddr>,
        bootstraps: Mutex<Vec<IpAddr>>,
        bootstrap_failures: AtomicU32,
    }

    impl Cluster {
        fn new(ready: &[&str]) -> Self {
            Self {
                ready: ready.iter().map(|ip| ip.parse().unwrap()).collect(),
                bootstraps: Mutex::new(Vec::new()),
                bootstrap_failures: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TalosApi for Cluster {
        async fn probe_insecure(&self, _: IpAddr) -> bool {
            false
        }
        async fn probe_authenticated(&self, ip: IpAddr) -> bool {
            self.ready.contains(&ip)
        }
        async fn apply_config(&self, _: IpAddr, _: &Path) -> BootstrapResult<()> {
            Ok(())
        }
        async fn bootstrap(&self, ip: IpAddr) -> BootstrapResult<()> {
            self.bootstraps.lock().unwrap().push(ip);
            if self.bootstrap_failures.load(Ordering::SeqCst) > 0 {
                self.bootstrap_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BootstrapError::CommandFailed {
                    program: "talosctl".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "etcd not ready".to_string(),
                });
            }
            Ok(())
        }
        async fn kubeconfig(&self, _: IpAddr, _: &Path) -> BootstrapResult<()> {
            Ok(())
        }
        async fn gen_secrets(&self, _: &Path) -> BootstrapResult<()> {
            Ok(())
        }
        async fn gen_config(&self, request: &GenConfigRequest) -> BootstrapResult<GeneratedConfigs> {
            Ok(GeneratedConfigs::in_dir(&request.output_dir))
        }
        async fn patch_config(&self, _: &Path, _: &Path, _: &Path) -> BootstrapResult<()> {
            Ok(())
        }
    }

    fn inventory() -> Inventory {
        Inventory::new(vec![
            node("cp-1", NodeRole::ControlPlane, "10.0.0.11"),
            node("cp-2", NodeRole::ControlPlane, "10.0.0.12"),
            node("cp-3", NodeRole::ControlPlane, "10.0.0.13"),
            node("wk-1", NodeRole::Worker, "10.0.0.21"),
        ])
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstraps_once_with_all_ready() {
        let talos = Cluster::new(&["10.0.0.11", "10.0.0.12", "10.0.0.13", "10.0.0.21"]);

        let report = bootstrap_and_wait(&inventory(), &talos, &Timing::default())
            .await
            .unwrap();

        assert_eq!(*talos.bootstraps.lock().unwrap(), vec!["10.0.0.11".parse::<IpAddr>().unwrap()]);
        assert_eq!(report.bootstrap_node, "cp-1");
        assert_eq!(report.control_planes_ready.len(), 3);
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstraps_first_ready_in_inventory_order() {
        let talos = Cluster::new(&["10.0.0.13", "10.0.0.12"]);

        let report = bootstrap_and_wait(&inventory(), &talos, &Timing::default())
            .await
            .unwrap();

        assert_eq!(report.bootstrap_node, "cp-2");
        assert_eq!(talos.bootstraps.lock().unwrap().len(), 1);
        assert_eq!(report.control_planes_ready.len(), 2);
        assert!(report.workers_ready.is_empty());
        assert!(!report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries_stay_on_one_node() {
        let talos = Cluster::new(&["10.0.0.11", "10.0.0.12", "10.0.0.13"]);
        talos.bootstrap_failures.store(2, Ordering::SeqCst);

        let report = bootstrap_and_wait(&inventory(), &talos, &Timing::default())
            .await
            .unwrap();

        let calls = talos.bootstraps.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|ip| *ip == "10.0.0.11".parse::<IpAddr>().unwrap()));
        assert_eq!(report.bootstrap_node, "cp-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_control_plane_is_fatal() {
        let talos = Cluster::new(&["10.0.0.21"]);

        let err = bootstrap_and_wait(&inventory(), &talos, &Timing::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::NoControlPlaneReady(600))
        ));
        assert!(talos.bootstraps.lock().unwrap().is_empty());
    }
}
