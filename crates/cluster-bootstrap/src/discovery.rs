//! Node discovery by MAC address correlation.
//!
//! The provisioner assigns each VM a deterministic MAC but DHCP hands out the
//! address later, so a node's current IP is found by joining the
//! provisioner's name → MAC output with a live ARP scan of the network.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{BootstrapError, Result};
use crate::exec;
use crate::inventory::{Inventory, NodeSpec};
use crate::poll::{self, PollSpec};
use crate::providers::Provisioner;
use crate::talos::TalosApi;
use crate::ui;

/// Canonical lower-case, colon-separated form of a MAC address.
///
/// Accepts colon, dash or unseparated hex in any case. Returns `None` for
/// anything that is not six octets.
#[must_use]
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let lower = hex.to_ascii_lowercase();
    let octets: Vec<&str> = (0..6).map(|i| &lower[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}

/// A node whose current address has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedNode {
    /// Inventory name.
    pub name: String,
    /// Normalized MAC address from the provisioner.
    pub mac_address: String,
    /// Address handed out by DHCP; `None` when discovery was skipped.
    pub dhcp_ip: Option<IpAddr>,
    /// Address the node converges to once configured.
    pub static_ip: IpAddr,
}

impl ProvisionedNode {
    /// Build an entry for a node that was not scanned, targeting its static
    /// address directly.
    #[must_use]
    pub fn from_static(spec: &NodeSpec, mac_address: impl Into<String>) -> Self {
        Self {
            name: spec.name.clone(),
            mac_address: mac_address.into(),
            dhcp_ip: None,
            static_ip: spec.ip,
        }
    }

    /// Address to push configuration to.
    #[must_use]
    pub fn apply_address(&self) -> IpAddr {
        self.dhcp_ip.unwrap_or(self.static_ip)
    }
}

/// One `(mac, ip)` observation from a network scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub mac: String,
    pub ip: IpAddr,
}

/// Parsed scan plus the raw tool output for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub entries: Vec<ScanEntry>,
    pub raw: String,
}

/// Passive network scan producing MAC/IP pairs.
#[async_trait]
pub trait NetworkScanner: Send + Sync {
    /// Scan the network once.
    async fn scan(&self) -> Result<ScanResult>;
}

/// Scan section of the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Interface to scan on; arp-scan picks one when unset.
    pub interface: Option<String>,
    /// Target network in CIDR form; the local network when unset.
    pub network: Option<String>,
    /// Run arp-scan through sudo.
    pub sudo: bool,
    /// Ceiling for one scan, in seconds.
    pub timeout_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interface: None,
            network: None,
            sudo: true,
            timeout_secs: 30,
        }
    }
}

/// Parse `arp-scan --plain` output.
///
/// Lines that do not start with an address followed by a MAC are ignored.
///
/// # Errors
///
/// Returns an error if the line pattern cannot be compiled.
pub fn parse_arp_scan(output: &str) -> Result<Vec<ScanEntry>> {
    let line = Regex::new(r"^\s*(\S+)\s+([0-9A-Fa-f]{2}(?:[:-][0-9A-Fa-f]{2}){5})\b")
        .map_err(|e| BootstrapError::ScanOutput(format!("Invalid regex: {e}")))?;

    Ok(output
        .lines()
        .filter_map(|l| line.captures(l))
        .filter_map(|caps| {
            let ip = caps[1].parse::<IpAddr>().ok()?;
            let mac = normalize_mac(&caps[2])?;
            Some(ScanEntry { mac, ip })
        })
        .collect())
}

/// [`NetworkScanner`] backed by arp-scan.
#[derive(Debug, Clone)]
pub struct ArpScanner {
    settings: ScanSettings,
}

impl ArpScanner {
    /// Create a scanner from settings.
    #[must_use]
    pub fn new(settings: ScanSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to arp-scan.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--plain".to_string(), "--quiet".to_string()];
        if let Some(interface) = &self.settings.interface {
            args.push(format!("--interface={interface}"));
        }
        match &self.settings.network {
            Some(network) => args.push(network.clone()),
            None => args.push("--localnet".to_string()),
        }
        args
    }

    fn command(&self) -> Command {
        if self.settings.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg("arp-scan").args(self.args());
            cmd
        } else {
            let mut cmd = Command::new("arp-scan");
            cmd.args(self.args());
            cmd
        }
    }
}

#[async_trait]
impl NetworkScanner for ArpScanner {
    async fn scan(&self) -> Result<ScanResult> {
        let raw = exec::run_checked(
            self.command(),
            Duration::from_secs(self.settings.timeout_secs),
        )
        .await?;
        let entries = parse_arp_scan(&raw)?;
        debug!(hosts = entries.len(), "ARP scan complete");
        Ok(ScanResult { entries, raw })
    }
}

/// Inner-join expected nodes with scan results on normalized MAC.
///
/// Nodes are returned in `expected` order. When a MAC is observed more than
/// once the first observation wins, so no name appears twice.
#[must_use]
pub fn correlate(
    expected: &[&NodeSpec],
    macs: &BTreeMap<String, String>,
    scan: &[ScanEntry],
) -> Vec<ProvisionedNode> {
    let mut by_mac: BTreeMap<String, IpAddr> = BTreeMap::new();
    for entry in scan {
        if let Some(mac) = normalize_mac(&entry.mac) {
            by_mac.entry(mac).or_insert(entry.ip);
        }
    }

    expected
        .iter()
        .filter_map(|spec| {
            let mac = macs.get(&spec.name).and_then(|m| normalize_mac(m))?;
            let ip = *by_mac.get(&mac)?;
            Some(ProvisionedNode {
                name: spec.name.clone(),
                mac_address: mac,
                dhcp_ip: Some(ip),
                static_ip: spec.ip,
            })
        })
        .collect()
}

/// Whether at least one resolved node answers on the maintenance API.
async fn any_alive(talos: &dyn TalosApi, nodes: &[ProvisionedNode]) -> bool {
    let probes = nodes.iter().map(|n| async move {
        let ip = n.apply_address();
        let alive = talos.probe_insecure(ip).await;
        debug!(node = %n.name, %ip, alive, "Liveness probe");
        alive
    });
    join_all(probes).await.into_iter().any(|alive| alive)
}

#[derive(Debug, Default)]
struct LastAttempt {
    resolved: Vec<ProvisionedNode>,
    raw: String,
}

/// Resolve the DHCP address of every non-load-balancer node.
///
/// Each attempt scans the network, joins on MAC and, once every node is
/// resolved, requires at least one of them to answer the insecure Talos
/// probe so stale ARP entries for powered-off hosts are not accepted.
///
/// # Errors
///
/// Returns [`BootstrapError::DiscoveryExhausted`] after dumping VM power
/// states and the last raw scan when the ceiling is reached, or an error if
/// the provisioner's MAC output cannot be read.
pub async fn discover(
    inventory: &Inventory,
    provisioner: &dyn Provisioner,
    scanner: &dyn NetworkScanner,
    talos: &dyn TalosApi,
    spec: &PollSpec,
) -> Result<Vec<ProvisionedNode>> {
    let expected: Vec<&NodeSpec> = inventory.talos_nodes().collect();
    let macs = provisioner.node_macs().await?;

    for node in &expected {
        if !macs.contains_key(&node.name) {
            warn!(node = %node.name, "Provisioner output has no MAC for node");
        }
    }

    info!(expected = expected.len(), "Discovering node addresses");

    let last = Mutex::new(LastAttempt::default());
    let (expected_ref, macs_ref, last_ref) = (&expected, &macs, &last);

    let outcome = poll::poll_until("node discovery", spec, || async move {
        let scan = match scanner.scan().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!("Network scan failed: {e}");
                return false;
            }
        };

        let resolved = correlate(expected_ref, macs_ref, &scan.entries);
        debug!(
            resolved = resolved.len(),
            expected = expected_ref.len(),
            "Correlated scan with provisioner MACs"
        );

        let complete = resolved.len() >= expected_ref.len();
        let accepted = complete && any_alive(talos, &resolved).await;
        if complete && !accepted {
            debug!("All MACs resolved but no node answered the liveness probe");
        }

        *last_ref.lock().unwrap_or_else(PoisonError::into_inner) = LastAttempt {
            resolved,
            raw: scan.raw,
        };
        accepted
    })
    .await;

    let last = last.into_inner().unwrap_or_else(PoisonError::into_inner);

    if outcome.is_ready() {
        for node in &last.resolved {
            ui::print_kv(
                &node.name,
                &format!("{} ({})", node.apply_address(), node.mac_address),
            );
        }
        return Ok(last.resolved);
    }

    let missing: Vec<&str> = expected
        .iter()
        .filter(|spec| !last.resolved.iter().any(|n| n.name == spec.name))
        .map(|spec| spec.name.as_str())
        .collect();
    if !missing.is_empty() {
        ui::print_diagnostic("Unresolved nodes", &missing.join("\n"));
    }

    match provisioner.power_states().await {
        Ok(states) => ui::print_diagnostic("VM power states", &states),
        Err(e) => ui::print_warning(&format!("Could not read VM power states: {e}")),
    }
    ui::print_diagnostic("Last network scan", &last.raw);

    Err(BootstrapError::DiscoveryExhausted {
        resolved: last.resolved.len(),
        expected: expected.len(),
        attempts: outcome.attempts(),
    })
}
