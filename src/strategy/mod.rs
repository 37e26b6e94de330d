//! Server selection strategies.
//!
//! The relays ask a [`Strategy`] for a server whenever a TCP connection or
//! UDP session starts, and report back latency, traffic and failures so
//! adaptive strategies can steer away from bad servers. Implementations are
//! shared between tasks and must never block.

mod balancing;
mod high_availability;

pub use balancing::BalancingStrategy;
pub use high_availability::HighAvailabilityStrategy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::proxy::Address;
use crate::server::{LocalConfig, ServerDescriptor, StrategyKind};

/// Which relay is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerType {
    /// A new TCP connection
    Tcp,
    /// A new UDP session
    Udp,
}

/// Picks a server per connection and learns from traffic reports.
pub trait Strategy: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Stable identifier.
    fn id(&self) -> &str;

    /// Replace the server list, keeping learned state for servers that remain.
    fn reload_servers(&self, servers: &[ServerDescriptor]);

    /// Choose a server for a connection from `local` to `dest`.
    fn choose_server(
        &self,
        caller: CallerType,
        local: SocketAddr,
        dest: Option<&Address>,
    ) -> Option<Arc<ServerDescriptor>>;

    /// Connect latency to `server` was measured.
    fn report_latency(&self, _server: &ServerDescriptor, _latency: Duration) {}

    /// Bytes were received from `server`.
    fn report_last_read(&self, _server: &ServerDescriptor) {}

    /// Bytes were sent to `server`.
    fn report_last_write(&self, _server: &ServerDescriptor) {}

    /// Connecting to `server` failed or timed out.
    fn report_failure(&self, _server: &ServerDescriptor) {}
}

/// Always the configured server.
pub struct FixedStrategy {
    server: RwLock<Option<Arc<ServerDescriptor>>>,
    index: usize,
}

impl FixedStrategy {
    /// Use `servers[index]`.
    pub fn new(servers: &[ServerDescriptor], index: usize) -> Self {
        Self {
            server: RwLock::new(servers.get(index).cloned().map(Arc::new)),
            index,
        }
    }
}

impl Strategy for FixedStrategy {
    fn name(&self) -> &str {
        "Fixed"
    }

    fn id(&self) -> &str {
        "ss-local.strategy.fixed"
    }

    fn reload_servers(&self, servers: &[ServerDescriptor]) {
        *self.server.write() = servers.get(self.index).cloned().map(Arc::new);
    }

    fn choose_server(&self, _: CallerType, _: SocketAddr, _: Option<&Address>) -> Option<Arc<ServerDescriptor>> {
        self.server.read().clone()
    }
}

/// Build the strategy named in `config`.
pub fn from_config(config: &LocalConfig) -> Arc<dyn Strategy> {
    match config.strategy {
        StrategyKind::Fixed => Arc::new(FixedStrategy::new(&config.servers, config.index)),
        StrategyKind::Balancing => Arc::new(BalancingStrategy::new(&config.servers)),
        StrategyKind::HighAvailability => Arc::new(HighAvailabilityStrategy::new(&config.servers)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Method;

    pub(crate) fn servers(n: usize) -> Vec<ServerDescriptor> {
        (0..n)
            .map(|i| ServerDescriptor::new(format!("10.0.0.{}", i + 1), 8388, Method::Aes256Gcm, "pw"))
            .collect()
    }

    fn local() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_fixed_strategy() {
        let list = servers(3);
        let fixed = FixedStrategy::new(&list, 1);
        for _ in 0..5 {
            let s = fixed.choose_server(CallerType::Tcp, local(), None).unwrap();
            assert_eq!(s.address, "10.0.0.2");
        }

        fixed.reload_servers(&list[..1]);
        assert!(fixed.choose_server(CallerType::Udp, local(), None).is_none());
    }

    #[test]
    fn test_from_config() {
        let mut config = LocalConfig::new_single(1080, servers(1).remove(0));
        assert_eq!(from_config(&config).name(), "Fixed");

        config.strategy = StrategyKind::Balancing;
        assert_eq!(from_config(&config).name(), "Load Balance");

        config.strategy = StrategyKind::HighAvailability;
        assert_eq!(from_config(&config).name(), "High Availability");
    }
}
