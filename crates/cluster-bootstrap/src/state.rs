//! Bootstrap phase tracking.
//!
//! Phases run strictly in order. Per-phase skip flags let an operator resume
//! a partial run; skipping a phase assumes its postconditions already hold.
//! State lives in memory for the duration of one run only.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The seven bootstrap phases, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Fetch and verify boot media.
    ImageAcquisition,
    /// Run the VM/DNS provisioner.
    Provisioning,
    /// Correlate MAC addresses to DHCP addresses.
    Discovery,
    /// Render per-node machine configuration.
    ConfigGeneration,
    /// Push configuration to every node.
    ConfigApplication,
    /// Initialize etcd and wait for quorum.
    Bootstrap,
    /// Install networking and GitOps.
    Addons,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 7] = [
        Self::ImageAcquisition,
        Self::Provisioning,
        Self::Discovery,
        Self::ConfigGeneration,
        Self::ConfigApplication,
        Self::Bootstrap,
        Self::Addons,
    ];

    /// Total number of phases.
    pub const TOTAL: u8 = 7;

    /// Get a human-readable description of the phase.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::ImageAcquisition => "Acquiring Talos boot media",
            Self::Provisioning => "Provisioning VMs and DNS",
            Self::Discovery => "Discovering node addresses",
            Self::ConfigGeneration => "Generating machine configs",
            Self::ConfigApplication => "Applying machine configs",
            Self::Bootstrap => "Bootstrapping etcd and waiting for quorum",
            Self::Addons => "Installing Cilium and GitOps",
        }
    }

    /// Get the 1-based step number for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::ImageAcquisition => 1,
            Self::Provisioning => 2,
            Self::Discovery => 3,
            Self::ConfigGeneration => 4,
            Self::ConfigApplication => 5,
            Self::Bootstrap => 6,
            Self::Addons => 7,
        }
    }

    /// The CLI flag that skips this phase.
    #[must_use]
    pub fn skip_flag(self) -> &'static str {
        match self {
            Self::ImageAcquisition => "--skip-image",
            Self::Provisioning => "--skip-terraform",
            Self::Discovery => "--skip-discovery",
            Self::ConfigGeneration => "--skip-config",
            Self::ConfigApplication => "--skip-apply",
            Self::Bootstrap => "--skip-bootstrap",
            Self::Addons => "--skip-addons",
        }
    }

    /// Phases that must hold before this one can run.
    #[must_use]
    pub fn dependencies(self) -> &'static [Phase] {
        match self {
            Self::ImageAcquisition => &[],
            Self::Provisioning => &[Self::ImageAcquisition],
            Self::Discovery | Self::ConfigGeneration => &[Self::Provisioning],
            Self::ConfigApplication => &[Self::Discovery, Self::ConfigGeneration],
            Self::Bootstrap => &[Self::ConfigApplication],
            Self::Addons => &[Self::Bootstrap],
        }
    }

    /// Command-line flags that resume a run at this phase.
    #[must_use]
    pub fn resume_flags(self) -> String {
        Self::ALL
            .iter()
            .take_while(|p| **p != self)
            .map(|p| p.skip_flag())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Per-phase skip flags from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SkipFlags {
    pub image: bool,
    pub terraform: bool,
    pub discovery: bool,
    pub config: bool,
    pub apply: bool,
    pub bootstrap: bool,
    pub addons: bool,
}

impl SkipFlags {
    /// Whether the given phase is skipped.
    #[must_use]
    pub fn skips(&self, phase: Phase) -> bool {
        match phase {
            Phase::ImageAcquisition => self.image,
            Phase::Provisioning => self.terraform,
            Phase::Discovery => self.discovery,
            Phase::ConfigGeneration => self.config,
            Phase::ConfigApplication => self.apply,
            Phase::Bootstrap => self.bootstrap,
            Phase::Addons => self.addons,
        }
    }
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Completed cleanly.
    Completed,
    /// Completed with warnings (partial failure, optional wait timed out).
    Degraded,
    /// Skipped by flag; postconditions assumed.
    Skipped,
}

/// Which phases have run in the current invocation.
#[derive(Debug, Clone, Default)]
pub struct PhaseState {
    outcomes: Vec<(Phase, PhaseOutcome)>,
}

impl PhaseState {
    /// Create an empty phase state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how a phase ended.
    pub fn finish(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.outcomes.push((phase, outcome));
    }

    /// Outcome of a phase, if it has finished.
    #[must_use]
    pub fn outcome(&self, phase: Phase) -> Option<PhaseOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, o)| *o)
    }

    /// Whether a phase's postconditions hold (completed, degraded or skipped).
    #[must_use]
    pub fn is_satisfied(&self, phase: Phase) -> bool {
        self.outcome(phase).is_some()
    }

    /// Phases that actually ran to completion (not skipped).
    #[must_use]
    pub fn completed(&self) -> BTreeSet<Phase> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o != PhaseOutcome::Skipped)
            .map(|(p, _)| *p)
            .collect()
    }

    /// All recorded outcomes in execution order.
    #[must_use]
    pub fn outcomes(&self) -> &[(Phase, PhaseOutcome)] {
        &self.outcomes
    }
}
