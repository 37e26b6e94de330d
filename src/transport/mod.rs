//! Transport helpers.
//!
//! Currently a single wrapper: a TCP socket connected by host name over
//! both address families, connected at most once and closed idempotently.

mod socket;

pub use socket::{SocketState, WrappedSocket};

/// Resolve `host:port` to its first address, IPv4 or IPv6.
pub async fn resolve(host: &str, port: u16) -> crate::Result<std::net::SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| crate::Error::config(format!("cannot resolve {}", host)))
}
