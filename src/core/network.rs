use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Reachability collaborator consulted before dispatch. When it reports
/// down, the engine holds dispatch until it returns instead of attempting
/// calls doomed to fail.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_online(&self) -> bool;

    fn status(&self) -> NetworkStatus {
        NetworkStatus::Checking
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
    Checking,
}

/// Collaborator stub that never holds dispatch. Useful for tests and for
/// callers that do their own reachability handling.
pub struct AlwaysOnline;

#[async_trait]
impl Reachability for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }

    fn status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }
}

/// Probes a well-known address over TCP, remembering the last verdict.
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
    last: AtomicU8, // 0 = unknown, 1 = offline, 2 = online
}

impl TcpProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            last: AtomicU8::new(0),
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new("8.8.8.8:53".parse().expect("static address"), Duration::from_secs(5))
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn is_online(&self) -> bool {
        let online = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        );
        self.last
            .store(if online { 2 } else { 1 }, Ordering::Relaxed);
        tracing::debug!(online, "network probe");
        online
    }

    fn status(&self) -> NetworkStatus {
        match self.last.load(Ordering::Relaxed) {
            2 => NetworkStatus::Online,
            1 => NetworkStatus::Offline,
            _ => NetworkStatus::Checking,
        }
    }
}
