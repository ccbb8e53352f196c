//! Talos-on-libvirt cluster bootstrap.
//!
//! This crate drives a self-hosted Kubernetes cluster from freshly created
//! VMs to a running, multi-node Talos cluster with Cilium and a GitOps
//! controller installed. External tools do the heavy lifting; the crate owns
//! the ordering, retries, node discovery and parallel fan-out.
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_bootstrap::{Backends, Orchestrator, RunConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load("cluster.yaml".as_ref())?;
//!     let backends = Backends::from_config(&config)?;
//!
//!     let summary = Orchestrator::new(&config, &backends).run().await?;
//!     summary.print();
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addons;
pub mod apply;
pub mod artifacts;
pub mod cilium;
pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exec;
pub mod gitops;
pub mod image;
pub mod inventory;
pub mod orchestrator;
pub mod poll;
pub mod probe;
pub mod providers;
pub mod quorum;
pub mod render;
pub mod state;
pub mod talos;
pub mod ui;

pub use config::RunConfig;
pub use error::{BootstrapError, Result};
pub use inventory::{Inventory, NodeRole, NodeSpec};
pub use orchestrator::{Backends, Orchestrator, PhaseFailure, RunSummary};
pub use state::{Phase, PhaseOutcome, SkipFlags};
