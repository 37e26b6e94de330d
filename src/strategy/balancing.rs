//! Load balancing: random per TCP connection, stable per UDP client.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CallerType, Strategy};
use crate::crypto::SecureRandom;
use crate::proxy::Address;
use crate::server::ServerDescriptor;

/// Spreads connections over every configured server.
pub struct BalancingStrategy {
    servers: RwLock<Vec<Arc<ServerDescriptor>>>,
}

impl BalancingStrategy {
    /// Balance over `servers`.
    pub fn new(servers: &[ServerDescriptor]) -> Self {
        Self {
            servers: RwLock::new(servers.iter().cloned().map(Arc::new).collect()),
        }
    }
}

fn endpoint_hash(addr: &SocketAddr) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish() as usize
}

impl Strategy for BalancingStrategy {
    fn name(&self) -> &str {
        "Load Balance"
    }

    fn id(&self) -> &str {
        "ss-local.strategy.balancing"
    }

    fn reload_servers(&self, servers: &[ServerDescriptor]) {
        *self.servers.write() = servers.iter().cloned().map(Arc::new).collect();
    }

    fn choose_server(&self, caller: CallerType, local: SocketAddr, _: Option<&Address>) -> Option<Arc<ServerDescriptor>> {
        let servers = self.servers.read();
        if servers.is_empty() {
            return None;
        }
        let index = match caller {
            CallerType::Tcp => SecureRandom::index(servers.len()),
            CallerType::Udp => endpoint_hash(&local) % servers.len(),
        };
        servers.get(index).cloned()
    }
}
