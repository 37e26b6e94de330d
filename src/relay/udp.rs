//! SOCKS5 UDP relay.
//!
//! One session per client endpoint, held in an LRU cache. A session owns an
//! upstream socket to its server; outbound datagrams reach it through a
//! channel, and replies are sent straight back to the client through the
//! shared listening socket. Evicting a session aborts its task, which closes
//! the upstream socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;

use super::RelayContext;
use crate::cache::LruCache;
use crate::crypto::CipherContext;
use crate::error::Result;
use crate::server::{ServerDescriptor, Service};
use crate::strategy::CallerType;
use crate::transport;
use crate::UDP_BUFFER_SIZE;

/// `RSV RSV FRAG` in front of every SOCKS5 UDP datagram.
const UDP_PREFIX: [u8; 3] = [0, 0, 0];

/// Smallest datagram worth relaying.
const MIN_DATAGRAM: usize = 4;

/// Outbound datagrams queued per session before new ones are dropped.
const SESSION_QUEUE: usize = 64;

struct UdpSession {
    tx: mpsc::Sender<Bytes>,
    task: AbortHandle,
}

impl UdpSession {
    fn close(&self) {
        self.task.abort();
    }
}

/// The SOCKS5 UDP service.
pub struct UdpRelay {
    ctx: Arc<RelayContext>,
    sessions: LruCache<SocketAddr, Arc<UdpSession>>,
}

impl UdpRelay {
    /// Create a relay holding at most `capacity` sessions.
    pub fn new(ctx: Arc<RelayContext>, capacity: usize) -> Result<Self> {
        let sessions = LruCache::new(capacity, |client: SocketAddr, session: Arc<UdpSession>| {
            tracing::trace!("UDP session for {} evicted", client);
            session.close();
        })?;
        tracing::debug!("UDP session cache holds {} clients", sessions.capacity());
        Ok(Self { ctx, sessions })
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open_session(&self, client: SocketAddr, listener: &Arc<UdpSocket>) -> Result<Arc<UdpSession>> {
        let server = self.ctx.choose_server(CallerType::Udp, client, None)?;
        let cipher = self.ctx.cipher_for(&server);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);

        let ctx = Arc::clone(&self.ctx);
        let listener = Arc::clone(listener);
        let task = tokio::spawn(async move {
            if let Err(e) = run_session(&ctx, &server, &cipher, client, &listener, rx).await {
                tracing::debug!("UDP session for {}: {}", client, e);
            }
        });

        self.ctx.metrics().increment_udp_sessions();
        tracing::debug!("UDP session for {} opened", client);
        let session = Arc::new(UdpSession {
            tx,
            task: task.abort_handle(),
        });
        self.sessions.insert(client, Arc::clone(&session));
        Ok(session)
    }
}

impl Service for UdpRelay {
    fn name(&self) -> &str {
        "udp-relay"
    }

    fn handle_udp(&self, datagram: &[u8], peer: SocketAddr, socket: &Arc<UdpSocket>) -> bool {
        if datagram.len() < MIN_DATAGRAM {
            return false;
        }
        let payload = Bytes::copy_from_slice(&datagram[UDP_PREFIX.len()..]);

        let session = match self.sessions.get(&peer) {
            Some(session) => session,
            None => match self.open_session(peer, socket) {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!("UDP from {}: {}", peer, e);
                    return true;
                }
            },
        };

        match session.tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("UDP queue for {} full, dropping", peer),
            Err(TrySendError::Closed(payload)) => {
                // The session task ended; start over.
                self.sessions.remove(&peer);
                if let Ok(session) = self.open_session(peer, socket) {
                    let _ = session.tx.try_send(payload);
                }
            }
        }
        true
    }

    fn stop(&self) {
        let stats = self.sessions.stats();
        tracing::debug!(
            "UDP sessions: {} reused, {} opened, {} evicted",
            stats.hits,
            stats.misses,
            stats.evictions
        );
        self.sessions.clear();
    }
}

async fn run_session(
    ctx: &RelayContext,
    server: &ServerDescriptor,
    cipher: &CipherContext,
    client: SocketAddr,
    listener: &UdpSocket,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<()> {
    let server_addr = transport::resolve(&server.address, server.port).await?;
    let bind: SocketAddr = if server_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(bind).await?;

    let mut recv = vec![0u8; UDP_BUFFER_SIZE];
    let mut wire = BytesMut::with_capacity(UDP_BUFFER_SIZE);
    let mut reply = BytesMut::with_capacity(UDP_BUFFER_SIZE);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(payload) = outbound else {
                    return Ok(());
                };
                wire.clear();
                if let Err(e) = cipher.encrypt_udp(&payload, &mut wire) {
                    tracing::debug!("UDP encrypt for {}: {}", client, e);
                    continue;
                }
                match upstream.send_to(&wire, server_addr).await {
                    Ok(_) => {
                        ctx.metrics().add_bytes_sent(payload.len() as u64);
                        ctx.report_last_write(server);
                    }
                    Err(e) => tracing::debug!("UDP send to {}: {}", server_addr, e),
                }
            }
            received = upstream.recv_from(&mut recv) => {
                let n = match received {
                    Ok((n, _)) => n,
                    Err(e) => {
                        tracing::debug!("UDP receive from {}: {}", server_addr, e);
                        continue;
                    }
                };
                reply.clear();
                reply.put_slice(&UDP_PREFIX);
                if let Err(e) = cipher.decrypt_udp(&recv[..n], &mut reply) {
                    if e.is_crypto() {
                        ctx.metrics().increment_crypto_errors();
                    }
                    tracing::debug!("UDP decrypt from {}: {}", server_addr, e);
                    continue;
                }
                ctx.report_last_read(server);
                ctx.metrics().add_bytes_received((reply.len() - UDP_PREFIX.len()) as u64);
                if let Err(e) = listener.send_to(&reply, client).await {
                    tracing::debug!("UDP reply to {}: {}", client, e);
                }
            }
        }
    }
}
