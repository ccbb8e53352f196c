//! Talos Linux configuration and API access.
//!
//! This module provides typed machine-config patches, `talosctl gen config`
//! requests and the [`TalosApi`] seam used by every phase that talks to a
//! node.

mod client;
mod config;

pub use client::{NodeReadiness, TalosApi, TalosCtl, K8S_API_PORT, TALOS_API_PORT};
pub use config::{
    GenConfigRequest, GeneratedConfigs, KubeProxyMode, MachineConfigPatch, DEFAULT_TALOS_VERSION,
};
