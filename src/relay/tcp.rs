//! SOCKS5 TCP relay.
//!
//! Each claimed connection runs one handler task:
//!
//! ```text
//! AwaitingGreeting → AwaitingRequest → AwaitingAddress → ConnectingProxy
//!        → ConnectingDestination → Piping → Closed
//!                        ↘ UdpAssociated → Closed
//! ```
//!
//! Piping runs both directions concurrently. Each direction owns its half of
//! the cipher and its own buffers; EOF on one side half-closes the other, and
//! the handler closes once both directions are done or either fails.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::RelayContext;
use crate::crypto::{Decryptor, Encryptor};
use crate::error::{Error, Result};
use crate::proxy::socks5::{
    self, Address, CMD_CONNECT, CMD_UDP_ASSOCIATE, CONNECT_SUCCESS, GREETING_ACCEPT,
    GREETING_REJECT, REQUEST_PREFIX_LEN, SOCKS5_VERSION,
};
use crate::server::{Dispatch, HandlerEntry, HandlerRegistry, ServerDescriptor, Service};
use crate::strategy::CallerType;
use crate::{BUFFER_SIZE, RECV_SIZE};

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the method-selection message
    AwaitingGreeting,
    /// Waiting for `VER CMD RSV ATYP`
    AwaitingRequest,
    /// Reading the rest of the destination address
    AwaitingAddress,
    /// UDP ASSOCIATE control connection, kept open until EOF
    UdpAssociated,
    /// Opening the forward proxy (no-op when direct)
    ConnectingProxy,
    /// Tunnelling to the relay server
    ConnectingDestination,
    /// Relaying in both directions
    Piping,
    /// Done
    Closed,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The SOCKS5 TCP service.
pub struct TcpRelay {
    ctx: Arc<RelayContext>,
    registry: Arc<HandlerRegistry>,
}

impl TcpRelay {
    /// Create a relay closing handlers idle longer than `idle_timeout`.
    pub fn new(ctx: Arc<RelayContext>, idle_timeout: Duration) -> Self {
        Self {
            ctx,
            registry: Arc::new(HandlerRegistry::new(idle_timeout)),
        }
    }

    /// Live handlers.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }
}

impl Service for TcpRelay {
    fn name(&self) -> &str {
        "tcp-relay"
    }

    fn handle_tcp(&self, first_packet: BytesMut, stream: TcpStream) -> Dispatch {
        if first_packet.len() < 2 || first_packet[0] != SOCKS5_VERSION {
            return Dispatch::Declined(stream);
        }
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return Dispatch::Declined(stream),
        };

        let swept = self.registry.maybe_sweep(Instant::now());
        if swept > 0 {
            self.ctx.metrics().add_idle_closed(swept);
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("set_nodelay failed: {}", e);
        }

        let ctx = Arc::clone(&self.ctx);
        let guard = self.registry.register(peer_addr);
        ctx.metrics().increment_tcp_sessions();

        tokio::spawn(async move {
            let _conn = ctx.metrics().track_connection();
            let handler = TcpHandler::new(Arc::clone(&ctx), &guard, stream, first_packet, peer_addr);
            let result = tokio::select! {
                r = handler.run() => r,
                _ = guard.closed() => {
                    tracing::debug!("handler {} closed while in use", guard.id());
                    Ok(())
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_disposed() || e.is_timeout() => tracing::trace!("handler {}: {}", guard.id(), e),
                Err(e) => {
                    if e.is_crypto() {
                        ctx.metrics().increment_crypto_errors();
                    }
                    tracing::debug!("handler {} ({}): {}", guard.id(), peer_addr, e);
                }
            }
            let stats = guard.stats();
            tracing::trace!(
                "handler {} -> {} after {:?}: {} bytes up, {} bytes down",
                stats.id,
                HandlerState::Closed,
                stats.created_at.elapsed(),
                stats.bytes_sent,
                stats.bytes_received
            );
        });

        Dispatch::Claimed
    }

    fn stop(&self) {
        self.registry.close_all();
    }
}

struct TcpHandler<'a> {
    ctx: Arc<RelayContext>,
    entry: &'a HandlerEntry,
    state: HandlerState,
    client: TcpStream,
    peer_addr: SocketAddr,
    /// Client bytes received but not yet consumed.
    buf: BytesMut,
}

impl<'a> TcpHandler<'a> {
    fn new(
        ctx: Arc<RelayContext>,
        entry: &'a HandlerEntry,
        client: TcpStream,
        first_packet: BytesMut,
        peer_addr: SocketAddr,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(crate::FIRST_PACKET_SIZE.max(first_packet.len()));
        buf.extend_from_slice(&first_packet);
        Self {
            ctx,
            entry,
            state: HandlerState::AwaitingGreeting,
            client,
            peer_addr,
            buf,
        }
    }

    fn transition(&mut self, next: HandlerState) {
        tracing::trace!("handler {}: {} -> {}", self.entry.id(), self.state, next);
        self.state = next;
    }

    /// Read from the client until at least `need` bytes are buffered.
    async fn fill(&mut self, need: usize) -> Result<()> {
        while self.buf.len() < need {
            let n = self.client.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::protocol(format!("client closed during {}", self.state)));
            }
            self.entry.touch();
        }
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        self.greeting().await?;

        self.transition(HandlerState::AwaitingRequest);
        self.fill(REQUEST_PREFIX_LEN).await?;
        if self.buf[0] != SOCKS5_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS5_VERSION,
                actual: self.buf[0],
            });
        }
        let command = self.buf[1];
        match command {
            CMD_CONNECT => {
                self.client.write_all(&CONNECT_SUCCESS).await?;
                let (dest, header) = self.read_address().await?;
                self.connect_and_pipe(dest, header).await
            }
            CMD_UDP_ASSOCIATE => {
                self.read_address().await?;
                self.udp_associate().await
            }
            other => Err(Error::UnsupportedCommand(other)),
        }
    }

    async fn greeting(&mut self) -> Result<()> {
        if self.buf[0] != SOCKS5_VERSION {
            self.client.write_all(&GREETING_REJECT).await?;
            return Err(Error::VersionMismatch {
                expected: SOCKS5_VERSION,
                actual: self.buf[0],
            });
        }
        self.client.write_all(&GREETING_ACCEPT).await?;

        let methods_len = 2 + self.buf[1] as usize;
        self.fill(methods_len).await?;
        self.buf.advance(methods_len);
        Ok(())
    }

    /// Parse the destination. The request's ATYP and the byte after it are
    /// already buffered and become the start of the address header.
    async fn read_address(&mut self) -> Result<(Address, BytesMut)> {
        self.transition(HandlerState::AwaitingAddress);
        self.buf.advance(REQUEST_PREFIX_LEN - 2);

        let header_len = Address::header_len_from(self.buf[0], self.buf[1])?;
        self.fill(header_len).await?;
        let (dest, consumed) = Address::parse(&self.buf)?
            .ok_or_else(|| Error::protocol("truncated address header"))?;
        let header = self.buf.split_to(consumed);
        tracing::debug!("handler {}: {} -> {}", self.entry.id(), self.peer_addr, dest);
        Ok((dest, header))
    }

    async fn udp_associate(mut self) -> Result<()> {
        let relay = self.client.local_addr()?;
        self.client.write_all(&socks5::udp_associate_reply(relay)).await?;
        self.transition(HandlerState::UdpAssociated);

        let mut scratch = [0u8; 512];
        loop {
            let n = self.client.read(&mut scratch).await?;
            if n == 0 {
                return Ok(());
            }
            self.entry.touch();
        }
    }

    async fn connect_and_pipe(mut self, dest: Address, header: BytesMut) -> Result<()> {
        let server = self
            .ctx
            .choose_server(CallerType::Tcp, self.peer_addr, Some(&dest))?;
        let cipher = self.ctx.cipher_for(&server);
        let encryptor = cipher.encryptor(header.len())?;
        let decryptor = cipher.decryptor();

        self.transition(HandlerState::ConnectingProxy);
        let proxy_timeout = self.ctx.proxy_timeout();
        let link = match tokio::time::timeout(proxy_timeout, self.ctx.remote().connect_proxy()).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.ctx.metrics().increment_connect_failures();
                return Err(e);
            }
            Err(_) => {
                tracing::info!("proxy timed out");
                self.ctx.metrics().increment_connect_timeouts();
                return Err(Error::Timeout(proxy_timeout.as_millis() as u64));
            }
        };

        self.transition(HandlerState::ConnectingDestination);
        let started = Instant::now();
        let target = Address::from_host(&server.address, server.port);
        let remote = match tokio::time::timeout(server.timeout, link.connect_dest(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.ctx.metrics().increment_connect_failures();
                self.ctx.report_failure(&server);
                return Err(e);
            }
            Err(_) => {
                tracing::info!("{} timed out", server.friendly_name());
                self.ctx.metrics().increment_connect_timeouts();
                self.ctx.report_failure(&server);
                return Err(Error::Timeout(server.timeout.as_millis() as u64));
            }
        };
        self.ctx.report_latency(&server, started.elapsed());
        if let Err(e) = remote.set_nodelay(true) {
            tracing::trace!("set_nodelay failed: {}", e);
        }

        self.transition(HandlerState::Piping);
        let early = self.buf.split();
        let (client_r, client_w) = self.client.into_split();
        let (remote_r, remote_w) = remote.into_split();

        let up = Upstream {
            ctx: &self.ctx,
            server: &server,
            entry: self.entry,
            encryptor,
            client: client_r,
            remote: remote_w,
        };
        let down = Downstream {
            ctx: &self.ctx,
            server: &server,
            entry: self.entry,
            decryptor,
            remote: remote_r,
            client: client_w,
        };
        tokio::try_join!(up.run(header, early), down.run())?;
        Ok(())
    }
}

/// Client → server: read plaintext, encrypt, send.
struct Upstream<'a> {
    ctx: &'a RelayContext,
    server: &'a ServerDescriptor,
    entry: &'a HandlerEntry,
    encryptor: Encryptor,
    client: OwnedReadHalf,
    remote: OwnedWriteHalf,
}

impl Upstream<'_> {
    async fn run(mut self, header: BytesMut, early: BytesMut) -> Result<()> {
        let mut plain = BytesMut::with_capacity(BUFFER_SIZE);
        let mut wire = BytesMut::with_capacity(BUFFER_SIZE);
        let mut recv = vec![0u8; RECV_SIZE];

        plain.extend_from_slice(&header);
        plain.extend_from_slice(&early);
        let mut eof = false;
        match self.client.try_read(&mut recv) {
            Ok(0) => eof = true,
            Ok(n) => {
                self.entry.touch();
                plain.extend_from_slice(&recv[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        self.send(&plain, header.len(), &mut wire).await?;

        while !eof {
            let n = self.client.read(&mut recv).await?;
            if n == 0 {
                break;
            }
            self.entry.touch();
            self.send(&recv[..n], 0, &mut wire).await?;
        }

        self.remote.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, plain: &[u8], header_len: usize, wire: &mut BytesMut) -> Result<()> {
        wire.clear();
        self.encryptor.encrypt(plain, wire)?;
        self.remote.write_all(wire).await?;

        let payload = plain.len() - header_len;
        self.entry.add_sent(payload);
        self.ctx.metrics().add_bytes_sent(payload as u64);
        self.ctx.report_last_write(self.server);
        Ok(())
    }
}

/// Server → client: read ciphertext, decrypt, deliver.
struct Downstream<'a> {
    ctx: &'a RelayContext,
    server: &'a ServerDescriptor,
    entry: &'a HandlerEntry,
    decryptor: Decryptor,
    remote: OwnedReadHalf,
    client: OwnedWriteHalf,
}

impl Downstream<'_> {
    async fn run(mut self) -> Result<()> {
        let mut recv = vec![0u8; RECV_SIZE];
        let mut plain = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            let n = self.remote.read(&mut recv).await?;
            if n == 0 {
                break;
            }
            self.entry.touch();
            self.ctx.report_last_read(self.server);

            self.decryptor.decrypt(&recv[..n], &mut plain)?;
            self.deliver(&mut plain).await?;
            while self.decryptor.has_buffered_chunk() {
                self.decryptor.decrypt(&[], &mut plain)?;
                self.deliver(&mut plain).await?;
            }
        }

        self.client.shutdown().await?;
        Ok(())
    }

    async fn deliver(&mut self, plain: &mut BytesMut) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        self.client.write_all(plain).await?;
        self.entry.add_received(plain.len());
        self.ctx.metrics().add_bytes_received(plain.len() as u64);
        plain.clear();
        Ok(())
    }
}
