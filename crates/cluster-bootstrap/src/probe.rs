//! TCP reachability probes.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Probe whether something accepts TCP connections.
#[async_trait]
pub trait TcpProbe: Send + Sync {
    /// Whether `addr` accepts a connection.
    async fn reachable(&self, addr: SocketAddr) -> bool;
}

/// Plain TCP connect with a per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectProbe {
    connect_timeout: Duration,
}

impl TcpConnectProbe {
    /// Create a probe with the given connect timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TcpProbe for TcpConnectProbe {
    async fn reachable(&self, addr: SocketAddr) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connection to {addr} failed: {e}");
                false
            }
            Err(_) => {
                debug!("Connection to {addr} timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();
        let probe = TcpConnectProbe::new(Duration::from_secs(2));
        assert!(probe.reachable(open).await);

        drop(listener);
        assert!(!probe.reachable(open).await);
    }
}
