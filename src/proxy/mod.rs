//! Upstream connection through an optional forward proxy.
//!
//! Opening the path to the relay server takes two phases so each can run
//! under its own timeout:
//!
//! 1. [`Remote::connect_proxy`] reaches the forward proxy (no-op when direct)
//! 2. [`ProxyLink::connect_dest`] tunnels to the destination through it

mod http;
pub mod socks5;

pub use http::http_connect;
pub use socks5::{Address, Socks5Client};

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::transport::WrappedSocket;

/// Forward proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// SOCKS5, no authentication
    Socks5,
    /// HTTP CONNECT
    Http,
}

/// A forward proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardProxy {
    /// Protocol
    pub kind: ProxyKind,
    /// Proxy host name or IP literal
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// How upstream connections leave the machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Remote {
    /// Connect straight to the destination
    #[default]
    Direct,
    /// Tunnel through a forward proxy
    Proxy(ForwardProxy),
}

/// Result of the first phase: a connected proxy socket, or nothing when direct.
#[derive(Debug)]
pub enum ProxyLink {
    /// No proxy; the destination phase connects by itself
    Direct,
    /// Connected to the proxy, handshake still pending
    Proxied(ProxyKind, WrappedSocket),
}

impl Remote {
    /// Phase one: connect to the forward proxy.
    pub async fn connect_proxy(&self) -> Result<ProxyLink> {
        match self {
            Remote::Direct => Ok(ProxyLink::Direct),
            Remote::Proxy(proxy) => {
                let mut socket = WrappedSocket::new();
                socket.connect(&proxy.host, proxy.port).await?;
                tracing::trace!("connected to {} proxy {}:{}", proxy.kind, proxy.host, proxy.port);
                Ok(ProxyLink::Proxied(proxy.kind, socket))
            }
        }
    }
}

impl ProxyLink {
    /// Phase two: reach `dest`, returning the stream that now carries its bytes.
    pub async fn connect_dest(self, dest: &Address) -> Result<TcpStream> {
        match self {
            ProxyLink::Direct => {
                let mut socket = WrappedSocket::new();
                match dest {
                    Address::Socket(addr) => socket.connect_addr(*addr).await?,
                    Address::Domain(host, port) => socket.connect(host, *port).await?,
                }
                socket.into_stream()
            }
            ProxyLink::Proxied(kind, mut socket) => {
                let result = {
                    let stream = socket.stream_mut()?;
                    match kind {
                        ProxyKind::Socks5 => Socks5Client::connect(stream, dest).await,
                        ProxyKind::Http => http_connect(stream, dest).await,
                    }
                };
                match result {
                    Ok(()) => socket.into_stream(),
                    Err(e) => {
                        socket.close().await;
                        Err(e)
                    }
                }
            }
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks5 => f.write_str("socks5"),
            ProxyKind::Http => f.write_str("http"),
        }
    }
}
