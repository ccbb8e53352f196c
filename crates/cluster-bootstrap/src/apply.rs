//! Parallel machine config application.
//!
//! One task per node, each with its own bounded retry. A node that exhausts
//! its attempts is recorded in the report; it never cancels the others.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

use crate::poll::{retry_async, RetryConfig};
use crate::talos::TalosApi;

/// One node to configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTarget {
    pub name: String,
    pub ip: IpAddr,
    pub config: PathBuf,
}

/// A node that could not be configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub name: String,
    pub ip: IpAddr,
    pub error: String,
}

/// Outcome of the apply fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Nodes that accepted their config, sorted by name.
    pub succeeded: Vec<String>,
    /// Nodes that failed every attempt, sorted by name.
    pub failed: Vec<ApplyFailure>,
}

impl ApplyReport {
    /// Whether every node was configured.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template("   {bar:30.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

/// Push configs to every target concurrently and wait for all of them.
///
/// A successful apply reboots the node, so callers must not expect it to
/// stay reachable at the same address or trust level.
pub async fn apply_all(
    talos: Arc<dyn TalosApi>,
    targets: Vec<ApplyTarget>,
    retry: &RetryConfig,
) -> ApplyReport {
    let bar = progress_bar(targets.len());
    let mut set = JoinSet::new();
    let mut pending: HashMap<Id, ApplyTarget> = HashMap::with_capacity(targets.len());

    for target in targets {
        let talos = Arc::clone(&talos);
        let retry = retry.clone();
        let task_target = target.clone();
        let handle = set.spawn(async move {
            let target = task_target;
            let label = format!("Apply config to {}", target.name);
            retry_async(&retry, &label, |attempt| {
                let talos = Arc::clone(&talos);
                let target = target.clone();
                async move {
                    if attempt > 1 {
                        info!(node = %target.name, attempt, "Retrying config apply");
                    }
                    talos
                        .apply_config(target.ip, &target.config)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .await
        });
        pending.insert(handle.id(), target);
    }

    let mut report = ApplyReport::default();
    while let Some(joined) = set.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result.map_err(|e| format!("{e:#}"))),
            Err(e) => (e.id(), Err(format!("apply task aborted: {e}"))),
        };
        let Some(target) = pending.remove(&id) else {
            warn!(task = %id, "Apply task finished with no matching node");
            continue;
        };

        match result {
            Ok(()) => {
                bar.set_message(format!("{} ✓", target.name));
                report.succeeded.push(target.name);
            }
            Err(error) => {
                error!(node = %target.name, ip = %target.ip, "Config apply failed: {error}");
                bar.set_message(format!("{} ✗", target.name));
                report.failed.push(ApplyFailure {
                    name: target.name,
                    ip: target.ip,
                    error,
                });
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    report.succeeded.sort();
    report.failed.sort_by(|a, b| a.name.cmp(&b.name));
    report
}
