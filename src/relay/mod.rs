//! SOCKS5 relays and the port forwarder.
//!
//! [`TcpRelay`], [`UdpRelay`] and [`PortForwarder`] are the listener's
//! services. The two relays share a [`RelayContext`]: server selection,
//! cached cipher contexts and the upstream path.

mod forwarder;
mod tcp;
mod udp;

pub use forwarder::PortForwarder;
pub use tcp::{HandlerState, TcpRelay};
pub use udp::UdpRelay;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::crypto::CipherContext;
use crate::error::{Error, Result};
use crate::proxy::{Address, Remote};
use crate::server::{LocalConfig, ServerDescriptor, ServerMetrics, Service};
use crate::strategy::{self, CallerType, Strategy};

/// State shared by the TCP and UDP relays.
pub struct RelayContext {
    strategy: Option<Arc<dyn Strategy>>,
    fixed: Option<Arc<ServerDescriptor>>,
    remote: Remote,
    proxy_timeout: Duration,
    ciphers: Mutex<HashMap<String, (Arc<ServerDescriptor>, CipherContext)>>,
    metrics: Arc<ServerMetrics>,
}

impl RelayContext {
    /// Build from configuration. Without a strategy the configured server is always used.
    pub fn new(config: &LocalConfig, strategy: Option<Arc<dyn Strategy>>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            strategy,
            fixed: config.current_server().cloned().map(Arc::new),
            remote: config.remote(),
            proxy_timeout: config.proxy.timeout,
            ciphers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Upstream path.
    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Forward proxy connect timeout.
    pub fn proxy_timeout(&self) -> Duration {
        self.proxy_timeout
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Pick the server for a new connection or session.
    pub fn choose_server(
        &self,
        caller: CallerType,
        local: SocketAddr,
        dest: Option<&Address>,
    ) -> Result<Arc<ServerDescriptor>> {
        let server = match &self.strategy {
            Some(strategy) => strategy.choose_server(caller, local, dest),
            None => self.fixed.clone(),
        };
        match server {
            Some(server) if !server.address.is_empty() => Ok(server),
            _ => Err(Error::config("no server available")),
        }
    }

    /// Cipher context for `server`, deriving the master key on first use.
    pub fn cipher_for(&self, server: &Arc<ServerDescriptor>) -> CipherContext {
        let mut ciphers = self.ciphers.lock();
        if let Some((cached, ctx)) = ciphers.get(&server.identifier()) {
            if **cached == **server {
                return ctx.clone();
            }
        }
        let ctx = CipherContext::new(server.method, &server.password);
        ciphers.insert(server.identifier(), (Arc::clone(server), ctx.clone()));
        ctx
    }

    /// Forward a latency measurement to the strategy.
    pub fn report_latency(&self, server: &ServerDescriptor, latency: Duration) {
        if let Some(s) = &self.strategy {
            s.report_latency(server, latency);
        }
    }

    /// Forward a read report to the strategy.
    pub fn report_last_read(&self, server: &ServerDescriptor) {
        if let Some(s) = &self.strategy {
            s.report_last_read(server);
        }
    }

    /// Forward a write report to the strategy.
    pub fn report_last_write(&self, server: &ServerDescriptor) {
        if let Some(s) = &self.strategy {
            s.report_last_write(server);
        }
    }

    /// Forward a failure report to the strategy.
    pub fn report_failure(&self, server: &ServerDescriptor) {
        if let Some(s) = &self.strategy {
            s.report_failure(server);
        }
    }
}

/// The services for `config`, in dispatch order.
pub fn services(config: &LocalConfig, metrics: Arc<ServerMetrics>) -> Result<Vec<Arc<dyn Service>>> {
    let strategy = strategy::from_config(config);
    tracing::info!("server selection: {}", strategy.name());

    let ctx = Arc::new(RelayContext::new(config, Some(strategy), Arc::clone(&metrics)));
    let mut services: Vec<Arc<dyn Service>> = vec![
        Arc::new(TcpRelay::new(Arc::clone(&ctx), config.idle_timeout)),
        Arc::new(UdpRelay::new(ctx, config.udp_cache_size)?),
    ];
    if let Some(port) = config.forward_port {
        services.push(Arc::new(PortForwarder::new(port, metrics)));
    }
    Ok(services)
}
