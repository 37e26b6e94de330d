//! Connect-by-name TCP socket wrapper.
//!
//! Resolves a host name to every address of both families and tries them
//! in order. A wrapper connects at most once; close is idempotent.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};

use crate::error::{Error, Result};

/// Lifecycle of a [`WrappedSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No connect attempted yet
    Idle,
    /// Connect succeeded
    Connected,
    /// The single connect attempt failed
    Failed,
    /// Closed by the owner
    Closed,
}

/// A TCP socket that is connected by host name exactly once.
#[derive(Debug)]
pub struct WrappedSocket {
    state: SocketState,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl WrappedSocket {
    /// Create an unconnected wrapper.
    pub fn new() -> Self {
        Self {
            state: SocketState::Idle,
            stream: None,
            peer: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Address the socket ended up connected to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Resolve `host` and connect to the first address that accepts.
    ///
    /// # Errors
    ///
    /// `InvalidState` if a connect was already attempted or the wrapper is
    /// closed; otherwise the last connect error.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.begin()?;

        let addrs = match lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                self.state = SocketState::Failed;
                return Err(Error::Network(e));
            }
        };

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return self.finish(stream, addr),
                Err(e) => {
                    tracing::trace!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        self.state = SocketState::Failed;
        Err(match last_err {
            Some(e) => Error::Network(e),
            None => Error::Network(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            )),
        })
    }

    /// Connect to a resolved address.
    pub async fn connect_addr(&mut self, addr: SocketAddr) -> Result<()> {
        self.begin()?;
        match TcpStream::connect(addr).await {
            Ok(stream) => self.finish(stream, addr),
            Err(e) => {
                self.state = SocketState::Failed;
                Err(Error::Network(e))
            }
        }
    }

    fn begin(&self) -> Result<()> {
        match self.state {
            SocketState::Idle => Ok(()),
            other => Err(Error::InvalidState(format!("connect on {:?} socket", other))),
        }
    }

    fn finish(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.peer = Some(addr);
        self.state = SocketState::Connected;
        Ok(())
    }

    /// Borrow the connected stream.
    pub fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        match (self.state, self.stream.as_mut()) {
            (SocketState::Connected, Some(stream)) => Ok(stream),
            _ => Err(Error::Closed),
        }
    }

    /// Take ownership of the connected stream.
    pub fn into_stream(mut self) -> Result<TcpStream> {
        match (self.state, self.stream.take()) {
            (SocketState::Connected, Some(stream)) => Ok(stream),
            _ => Err(Error::Closed),
        }
    }

    /// Shut down and release the socket. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.state = SocketState::Closed;
    }
}

impl Default for WrappedSocket {
    fn default() -> Self {
        Self::new()
    }
}
