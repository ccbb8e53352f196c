//! Error types shared by the bootstrap seams.

use thiserror::Error;

/// Errors that can occur while driving the external tooling.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// An external tool could not be started.
    #[error("Failed to run {program} - is it installed? ({source})")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external tool did not finish in time.
    #[error("{program} timed out after {secs} seconds")]
    CommandTimeout { program: String, secs: u64 },

    /// An external tool exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Invalid configuration or inventory.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Discovery hit its retry ceiling without resolving every node.
    #[error("Discovery resolved {resolved} of {expected} nodes after {attempts} attempts")]
    DiscoveryExhausted {
        resolved: usize,
        expected: usize,
        attempts: u32,
    },

    /// No control-plane node accepted authenticated API calls in time.
    #[error("No control-plane node became ready within {0} seconds")]
    NoControlPlaneReady(u64),

    /// Downloaded boot media does not match the pinned checksum.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Provisioner output could not be interpreted.
    #[error("Unexpected provisioner output: {0}")]
    ProvisionerOutput(String),

    /// Network scan output could not be interpreted.
    #[error("Unexpected scan output: {0}")]
    ScanOutput(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result alias for the bootstrap seams.
pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
