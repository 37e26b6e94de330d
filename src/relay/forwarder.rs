//! Port forwarder to the local HTTP-proxy helper.
//!
//! Lowest-priority service: whatever the relays decline (typically plain
//! HTTP proxy requests) is spliced to `127.0.0.1:<port>`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::server::{Dispatch, ServerMetrics, Service};

/// Forwards unclaimed connections to a fixed local port.
pub struct PortForwarder {
    target: SocketAddr,
    metrics: Arc<ServerMetrics>,
}

impl PortForwarder {
    /// Forward to `127.0.0.1:port`.
    pub fn new(port: u16, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            metrics,
        }
    }
}

impl Service for PortForwarder {
    fn name(&self) -> &str {
        "port-forwarder"
    }

    fn handle_tcp(&self, first_packet: BytesMut, stream: TcpStream) -> Dispatch {
        let target = self.target;
        let metrics = Arc::clone(&self.metrics);
        metrics.increment_forwarded();

        tokio::spawn(async move {
            let _conn = metrics.track_connection();
            if let Err(e) = forward(stream, first_packet, target).await {
                tracing::debug!("forward to {}: {}", target, e);
            }
        });
        Dispatch::Claimed
    }

    fn stop(&self) {}
}

async fn forward(mut client: TcpStream, first_packet: BytesMut, target: SocketAddr) -> Result<()> {
    let mut remote = TcpStream::connect(target).await?;
    remote.set_nodelay(true)?;
    remote.write_all(&first_packet).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut remote).await?;
    tracing::trace!("forwarded {} up, {} down via {}", up, down, target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forwards_first_packet_and_reply() {
        let helper = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = helper.local_addr().unwrap().port();
        let forwarder = PortForwarder::new(port, Arc::new(ServerMetrics::new()));

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (accepted, _) = front.accept().await.unwrap();

        let first = BytesMut::from(&b"GET http://example.com/ HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(forwarder.handle_tcp(first, accepted), Dispatch::Claimed));

        let (mut upstream, _) = helper.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = upstream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"GET http://example.com/"));

        upstream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(upstream);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 204 No Content\r\n\r\n");
    }
}
