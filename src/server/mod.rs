//! Listener and dispatcher.
//!
//! One TCP and one UDP socket share the local port. Each accepted connection
//! and each received datagram is offered to the registered services in order
//! until one claims it:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Listener                           │
//! │  ┌──────────────────┐            ┌──────────────────┐     │
//! │  │  TCP accept loop │            │ UDP receive loop │     │
//! │  └────────┬─────────┘            └────────┬─────────┘     │
//! │           │ first packet                  │ datagram      │
//! │           ▼                               ▼               │
//! │  ┌──────────────────────────────────────────────────────┐ │
//! │  │  services, in registration order                     │ │
//! │  │  TCP relay → UDP relay → port forwarder              │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod config;
mod metrics;
mod session;

pub use config::{
    ForwardProxyConfig, LocalConfig, LocalConfigFile, ProxyConfigFile, ServerConfigFile,
    ServerDescriptor, StrategyKind, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PROXY_TIMEOUT_SECS,
    DEFAULT_SERVER_TIMEOUT_SECS, DEFAULT_UDP_CACHE_SIZE, MAX_SERVER_TIMEOUT_SECS,
    RESERVED_LOCAL_PORT,
};
pub use metrics::{ConnectionGuard, MetricsSnapshot, ServerMetrics};
pub use session::{HandlerEntry, HandlerGuard, HandlerId, HandlerRegistry, HandlerStats};

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};

/// Outcome of offering a connection to a service.
#[derive(Debug)]
pub enum Dispatch {
    /// The service took the connection
    Claimed,
    /// Not for this service; the stream goes to the next one
    Declined(TcpStream),
}

/// Something that can take over accepted connections or datagrams.
///
/// Handlers must not block: long-lived work is spawned onto its own task.
pub trait Service: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Offer a freshly accepted connection and the first bytes read from it.
    fn handle_tcp(&self, first_packet: BytesMut, stream: TcpStream) -> Dispatch {
        let _ = first_packet;
        Dispatch::Declined(stream)
    }

    /// Offer a datagram received from `peer` on the shared UDP socket.
    fn handle_udp(&self, datagram: &[u8], peer: SocketAddr, socket: &Arc<UdpSocket>) -> bool {
        let _ = (datagram, peer, socket);
        false
    }

    /// Close everything the service owns.
    fn stop(&self);
}

/// The local listening endpoint.
pub struct Listener {
    share_over_lan: bool,
    port: u16,
    services: Vec<Arc<dyn Service>>,
    metrics: Arc<ServerMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Create a listener for `port`, bound to loopback unless `share_over_lan`.
    pub fn new(port: u16, share_over_lan: bool, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            share_over_lan,
            port,
            services: Vec::new(),
            metrics,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the listener for `config` with the TCP relay, UDP relay and,
    /// when configured, the port forwarder.
    pub fn from_config(config: &LocalConfig) -> Result<Self> {
        let metrics = Arc::new(ServerMetrics::new());
        let mut listener = Self::new(config.local_port, config.share_over_lan, Arc::clone(&metrics));
        for service in crate::relay::services(config, metrics)? {
            listener.register(service);
        }
        Ok(listener)
    }

    /// Add a service. Earlier registrations get first refusal.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Bind both sockets and start the accept and receive loops.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let ip = if self.share_over_lan {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        let tcp = TcpListener::bind((ip, self.port)).await.map_err(|e| self.bind_error(e))?;
        let local_addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(local_addr).await.map_err(|e| self.bind_error(e))?;
        let udp = Arc::new(udp);

        tracing::info!("ss-local listening on {} (tcp+udp)", local_addr);

        let services: Arc<[Arc<dyn Service>]> = self.services.clone().into();
        let tcp_task = tokio::spawn(accept_loop(tcp, Arc::clone(&services), Arc::clone(&self.metrics)));
        let udp_task = tokio::spawn(receive_loop(udp, services));

        let mut tasks = self.tasks.lock();
        tasks.push(tcp_task);
        tasks.push(udp_task);
        Ok(local_addr)
    }

    /// Close both sockets, cancel connections still waiting for their first
    /// packet, and stop every service.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for service in &self.services {
            service.stop();
        }
        tracing::info!("ss-local stopped");
    }

    fn bind_error(&self, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::AddrInUse {
            Error::PortInUse(self.port)
        } else {
            Error::Network(e)
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Accepts connections and reads each first packet on its own task.
///
/// Dispatch tasks live in a `JoinSet` owned by the loop, so aborting the loop
/// also cancels connections that have not been claimed yet.
async fn accept_loop(listener: TcpListener, services: Arc<[Arc<dyn Service>]>, metrics: Arc<ServerMetrics>) {
    let mut pending = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let services = Arc::clone(&services);
                    let metrics = Arc::clone(&metrics);
                    // A silent client must not stall the accept loop.
                    pending.spawn(async move {
                        if let Err(e) = dispatch_tcp(stream, &services, &metrics).await {
                            tracing::debug!("dispatch error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            },
            Some(_) = pending.join_next(), if !pending.is_empty() => {}
        }
    }
}

async fn dispatch_tcp(mut stream: TcpStream, services: &[Arc<dyn Service>], metrics: &ServerMetrics) -> Result<()> {
    let mut first_packet = BytesMut::zeroed(crate::FIRST_PACKET_SIZE);
    let n = stream.read(&mut first_packet).await?;
    if n == 0 {
        return Ok(());
    }
    first_packet.truncate(n);

    for service in services {
        match service.handle_tcp(first_packet.clone(), stream) {
            Dispatch::Claimed => {
                tracing::trace!("connection claimed by {}", service.name());
                return Ok(());
            }
            Dispatch::Declined(s) => stream = s,
        }
    }

    metrics.increment_declined();
    tracing::debug!("no service claimed connection");
    Ok(())
}

async fn receive_loop(socket: Arc<UdpSocket>, services: Arc<[Arc<dyn Service>]>) {
    let mut buf = vec![0u8; crate::UDP_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                let datagram = &buf[..n];
                if !services.iter().any(|s| s.handle_udp(datagram, peer, &socket)) {
                    tracing::trace!("datagram from {} declined", peer);
                }
            }
            Err(e) => {
                tracing::debug!("UDP receive error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Echo;

    impl Service for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn handle_tcp(&self, first_packet: BytesMut, mut stream: TcpStream) -> Dispatch {
            if first_packet.first() != Some(&b'e') {
                return Dispatch::Declined(stream);
            }
            tokio::spawn(async move {
                let _ = stream.write_all(&first_packet).await;
            });
            Dispatch::Claimed
        }

        fn handle_udp(&self, datagram: &[u8], peer: SocketAddr, socket: &Arc<UdpSocket>) -> bool {
            let reply = datagram.to_vec();
            let socket = Arc::clone(socket);
            tokio::spawn(async move {
                let _ = socket.send_to(&reply, peer).await;
            });
            true
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_dispatch_tcp_and_udp() {
        let mut listener = Listener::new(0, false, Arc::new(ServerMetrics::new()));
        listener.register(Arc::new(Echo));
        let addr = listener.start().await.unwrap();
        assert!(addr.ip().is_loopback());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(b"dgram", addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"dgram");

        listener.stop();
    }

    #[tokio::test]
    async fn test_unclaimed_connection_closed() {
        let mut listener = Listener::new(0, false, Arc::new(ServerMetrics::new()));
        listener.register(Arc::new(Echo));
        let addr = listener.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"nope").await.unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(listener.metrics().snapshot().declined_connections, 1);
        listener.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_dispatch() {
        let mut listener = Listener::new(0, false, Arc::new(ServerMetrics::new()));
        listener.register(Arc::new(Echo));
        let addr = listener.start().await.unwrap();

        // Connected but silent: still waiting for its first packet.
        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.stop();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("pending connection should be closed by stop")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let first = Listener::new(0, false, Arc::new(ServerMetrics::new()));
        let addr = first.start().await.unwrap();

        let second = Listener::new(addr.port(), false, Arc::new(ServerMetrics::new()));
        match second.start().await {
            Err(Error::PortInUse(port)) => assert_eq!(port, addr.port()),
            other => panic!("expected PortInUse, got {:?}", other.map(|_| ())),
        }
        first.stop();
    }
}
