//! TCP liveness probe for upstream ports
//!
//! A route whose upstream no longer accepts connections is considered stale.
//! The probe never fails: any error or timeout reads as "not listening".

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default probe timeout. Probes run on the startup path so this stays short.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Decides whether something is accepting connections on `host:port`
#[allow(async_fn_in_trait)]
pub trait LivenessProbe {
    async fn is_active(&self, host: &str, port: u16) -> bool;
}

/// Probe that attempts a TCP connection
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl LivenessProbe for TcpProbe {
    async fn is_active(&self, host: &str, port: u16) -> bool {
        is_active(port, host, self.timeout).await
    }
}

/// Check if something is listening on `host:port` within `timeout`
pub async fn is_active(port: u16, host: &str, timeout: Duration) -> bool {
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            debug!(%addr, "Port probe passed (TCP connect)");
            true
        }
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "Port probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(%addr, timeout_ms = timeout.as_millis() as u64, "Port probe failed (timeout)");
            false
        }
    }
}

/// Probe answering from a fixed set of live ports
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FixedProbe {
    live: std::collections::HashSet<u16>,
    probed: parking_lot::Mutex<Vec<(String, u16)>>,
}

#[cfg(test)]
impl FixedProbe {
    pub(crate) fn live(ports: &[u16]) -> Self {
        Self {
            live: ports.iter().copied().collect(),
            probed: Default::default(),
        }
    }

    pub(crate) fn probed(&self) -> Vec<(String, u16)> {
        self.probed.lock().clone()
    }
}

#[cfg(test)]
impl LivenessProbe for FixedProbe {
    async fn is_active(&self, host: &str, port: u16) -> bool {
        self.probed.lock().push((host.to_string(), port));
        self.live.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_default_timeout_is_short() {
        assert_eq!(TcpProbe::default().timeout(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_listening_port_is_active() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_active(port, "127.0.0.1", DEFAULT_PROBE_TIMEOUT).await);
        assert!(TcpProbe::default().is_active("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_inactive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_active(port, "127.0.0.1", DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_inactive() {
        assert!(!is_active(80, "nonexistent.invalid", Duration::from_millis(200)).await);
    }
}
