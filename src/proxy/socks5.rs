//! SOCKS5 wire helpers (RFC 1928) and the forward-proxy client.
//!
//! The relay speaks the server side of SOCKS5 to local applications; this
//! module holds the pieces shared by both sides: constants, the address
//! encoding (which doubles as the Shadowsocks address header), fixed reply
//! frames, and a minimal no-auth CONNECT client.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + N bytes name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

/// Succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Greeting accepted, no authentication
pub const GREETING_ACCEPT: [u8; 2] = [SOCKS5_VERSION, AUTH_METHOD_NONE];

/// Greeting rejected (SOCKS4-style "request rejected")
pub const GREETING_REJECT: [u8; 2] = [0, 91];

/// CONNECT succeeded, bound address 0.0.0.0:0
pub const CONNECT_SUCCESS: [u8; 10] = [SOCKS5_VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Fixed request prefix read before the address: VER CMD RSV ATYP and one more byte
pub const REQUEST_PREFIX_LEN: usize = 5;

/// A SOCKS5 destination: IP endpoint or domain name plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 or IPv6 endpoint
    Socket(SocketAddr),
    /// Unresolved host name
    Domain(String, u16),
}

impl Address {
    /// Total header length (ATYP + address + port) implied by the first two header bytes.
    ///
    /// `second` is the first address byte, which for domains is the name length.
    pub fn header_len_from(atyp: u8, second: u8) -> Result<usize> {
        match atyp {
            ATYP_IPV4 => Ok(1 + 4 + 2),
            ATYP_DOMAIN => Ok(1 + 1 + second as usize + 2),
            ATYP_IPV6 => Ok(1 + 16 + 2),
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Parse an address header at the start of `buf`.
    ///
    /// Returns the address and the number of header bytes consumed, or
    /// `None` when `buf` does not yet hold the whole header.
    pub fn parse(buf: &[u8]) -> Result<Option<(Address, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = Self::header_len_from(buf[0], buf[1])?;
        if buf.len() < len {
            return Ok(None);
        }

        let port = u16::from_be_bytes([buf[len - 2], buf[len - 1]]);
        let addr = match buf[0] {
            ATYP_IPV4 => {
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                Address::Socket(SocketAddr::new(IpAddr::V4(ip), port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                Address::Socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => {
                let name = String::from_utf8_lossy(&buf[2..len - 2]);
                Address::Domain(name.into_owned(), port)
            }
        };
        Ok(Some((addr, len)))
    }

    /// Encoded header length.
    pub fn header_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Append the encoded header to `out`.
    pub fn write_to(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.put_u8(ATYP_IPV4);
                out.put_slice(&addr.ip().octets());
                out.put_u16(addr.port());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.put_u8(ATYP_IPV6);
                out.put_slice(&addr.ip().octets());
                out.put_u16(addr.port());
            }
            Address::Domain(name, port) => {
                if name.len() > u8::MAX as usize {
                    return Err(Error::protocol(format!("domain name too long: {}", name.len())));
                }
                out.put_u8(ATYP_DOMAIN);
                out.put_u8(name.len() as u8);
                out.put_slice(name.as_bytes());
                out.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part as a string suitable for name resolution.
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(name, _) => name.clone(),
        }
    }

    /// Build from a host string: IP literals become socket addresses.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Reply to UDP ASSOCIATE naming `relay` as the UDP relay endpoint.
pub fn udp_associate_reply(relay: SocketAddr) -> BytesMut {
    let mut reply = BytesMut::with_capacity(22);
    reply.put_slice(&[SOCKS5_VERSION, REPLY_SUCCEEDED, 0]);
    // Socket addresses always encode.
    let _ = Address::Socket(relay).write_to(&mut reply);
    reply
}

/// Minimal SOCKS5 client used to traverse a forward proxy.
///
/// No authentication, CONNECT only.
pub struct Socks5Client;

impl Socks5Client {
    /// Run the client handshake on an already connected proxy stream.
    ///
    /// On error the stream is left to the caller to close.
    pub async fn connect<S>(stream: &mut S, dest: &Address) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]).await?;

        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method != GREETING_ACCEPT {
            return Err(Error::proxy(format!(
                "proxy refused no-auth greeting: {:02x?}",
                method
            )));
        }

        let mut request = BytesMut::with_capacity(3 + dest.header_len());
        request.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0]);
        dest.write_to(&mut request)?;
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION || reply[1] != REPLY_SUCCEEDED {
            return Err(Error::proxy(format!(
                "CONNECT to {} failed with status {:#04x}",
                dest, reply[1]
            )));
        }

        let bound_len = match reply[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            other => {
                return Err(Error::proxy(format!(
                    "unsupported bound address type {:#04x}",
                    other
                )))
            }
        };
        let mut bound = [0u8; 18];
        stream.read_exact(&mut bound[..bound_len]).await?;

        tracing::debug!("SOCKS5 proxy connected to {}", dest);
        Ok(())
    }
}
