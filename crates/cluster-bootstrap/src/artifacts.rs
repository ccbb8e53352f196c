//! Layout of generated files under the output directory.
//!
//! `secrets.yaml` is long-lived: it is reused across runs and survives
//! cleanup so a retry produces configs for the same cluster identity.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::talos::GeneratedConfigs;

/// Paths of everything a run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    root: PathBuf,
}

impl Artifacts {
    /// Artifacts rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cluster secrets bundle.
    #[must_use]
    pub fn secrets(&self) -> PathBuf {
        self.root.join("secrets.yaml")
    }

    /// Base configs written by `talosctl gen config`.
    #[must_use]
    pub fn generated(&self) -> GeneratedConfigs {
        GeneratedConfigs::in_dir(&self.root)
    }

    /// Client configuration for authenticated Talos calls.
    #[must_use]
    pub fn talosconfig(&self) -> PathBuf {
        self.root.join("talosconfig")
    }

    /// Cluster kubeconfig.
    #[must_use]
    pub fn kubeconfig(&self) -> PathBuf {
        self.root.join("kubeconfig")
    }

    /// Directory of patch files.
    #[must_use]
    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    /// Cluster-wide patch.
    #[must_use]
    pub fn cluster_patch(&self) -> PathBuf {
        self.patches_dir().join("cluster.yaml")
    }

    /// Per-node patch.
    #[must_use]
    pub fn node_patch(&self, node: &str) -> PathBuf {
        self.patches_dir().join(format!("{node}.yaml"))
    }

    /// Directory of final per-node configs.
    #[must_use]
    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    /// Final config for one node.
    #[must_use]
    pub fn node_config(&self, node: &str) -> PathBuf {
        self.nodes_dir().join(format!("{node}.yaml"))
    }

    /// Create the output directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.patches_dir()).await?;
        tokio::fs::create_dir_all(self.nodes_dir()).await?;
        Ok(())
    }

    /// Delete every generated artifact except the secrets bundle.
    ///
    /// Returns the paths that were removed. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing artifact cannot be removed.
    pub async fn remove_generated(&self) -> Result<Vec<PathBuf>> {
        let generated = self.generated();
        let mut removed = Vec::new();

        for file in [
            generated.controlplane,
            generated.worker,
            generated.talosconfig,
            self.kubeconfig(),
        ] {
            if tokio::fs::try_exists(&file).await? {
                tokio::fs::remove_file(&file).await?;
                removed.push(file);
            }
        }

        for dir in [self.patches_dir(), self.nodes_dir()] {
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
                removed.push(dir);
            }
        }

        debug!(removed = removed.len(), "Removed generated artifacts");
        Ok(removed)
    }
}
