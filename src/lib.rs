//! # ss-local
//!
//! A Shadowsocks local relay. Client applications speak SOCKS5 to it; it
//! re-frames their traffic under a shared-secret cipher and forwards it to a
//! remote relay server, optionally through a forward proxy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Listener / Dispatcher (one TCP + one UDP socket)       │
//! ├───────────────────┬───────────────────┬─────────────────┤
//! │  TCP relay        │  UDP relay        │  Port forwarder │
//! │  (SOCKS5 + pipe)  │  (LRU sessions)   │                 │
//! ├───────────────────┴───────────────────┴─────────────────┤
//! │  Strategy (server selection, latency/failure reports)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Cipher engine (AEAD chunks, stream keystream, KDF)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Forward proxy client (direct / SOCKS5 / HTTP CONNECT)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire format to the server
//!
//! - TCP: `[salt/IV][encrypted address header][encrypted payload ...]`
//! - UDP: `[salt/IV][encrypted address header + payload]`

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod crypto;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod strategy;
pub mod transport;

pub use error::{Error, Result};

/// Bytes requested per socket read in the pipe
pub const RECV_SIZE: usize = 2048;

/// Per-direction buffer: one receive plus one maximum AEAD chunk plus a salt
pub const BUFFER_SIZE: usize = RECV_SIZE + crypto::MAX_CHUNK_SIZE + crypto::MAX_SALT_SIZE;

/// Bytes read from a freshly accepted socket before dispatch
pub const FIRST_PACKET_SIZE: usize = 4096;

/// Scratch buffer for UDP datagrams
pub const UDP_BUFFER_SIZE: usize = 65536;

/// Default local listening port
pub const DEFAULT_LOCAL_PORT: u16 = 1080;

/// Default remote server port
pub const DEFAULT_SERVER_PORT: u16 = 8388;
