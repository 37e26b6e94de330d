//! Per-server cipher context and per-connection encrypt/decrypt halves.

use std::fmt;

use bytes::BytesMut;
use zeroize::Zeroizing;

use crate::crypto::aead::{self, AeadDecryptor, AeadEncryptor};
use crate::crypto::kdf::evp_bytes_to_key;
use crate::crypto::stream::{self, StreamDecryptor, StreamEncryptor};
use crate::crypto::{CipherKind, Method};
use crate::error::Result;

/// Method plus master key, derived once per server.
///
/// The master key is zeroized on drop.
#[derive(Clone)]
pub struct CipherContext {
    method: Method,
    key: Zeroizing<Vec<u8>>,
}

impl CipherContext {
    /// Derive the master key for `method` from `password`.
    pub fn new(method: Method, password: &str) -> Self {
        Self {
            method,
            key: evp_bytes_to_key(password.as_bytes(), method.key_len()),
        }
    }

    /// Cipher method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Encrypt half of a new TCP session.
    ///
    /// For AEAD methods the first `addr_header_len` plaintext bytes become their own chunk.
    pub fn encryptor(&self, addr_header_len: usize) -> Result<Encryptor> {
        Ok(match self.method.kind() {
            CipherKind::Aead => Encryptor::Aead(AeadEncryptor::new(self.method, &self.key, addr_header_len)?),
            CipherKind::Stream => Encryptor::Stream(StreamEncryptor::new(self.method, &self.key)?),
        })
    }

    /// Decrypt half of a new TCP session.
    pub fn decryptor(&self) -> Decryptor {
        match self.method.kind() {
            CipherKind::Aead => Decryptor::Aead(AeadDecryptor::new(self.method, &self.key, crate::BUFFER_SIZE)),
            CipherKind::Stream => Decryptor::Stream(StreamDecryptor::new(self.method, &self.key)),
        }
    }

    /// Encrypt a self-contained UDP payload with a fresh salt/IV.
    pub fn encrypt_udp(&self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        match self.method.kind() {
            CipherKind::Aead => aead::encrypt_packet(self.method, &self.key, payload, out),
            CipherKind::Stream => stream::encrypt_packet(self.method, &self.key, payload, out),
        }
    }

    /// Decrypt a UDP packet that starts with its own salt/IV.
    pub fn decrypt_udp(&self, packet: &[u8], out: &mut BytesMut) -> Result<()> {
        match self.method.kind() {
            CipherKind::Aead => aead::decrypt_packet(self.method, &self.key, packet, out),
            CipherKind::Stream => stream::decrypt_packet(self.method, &self.key, packet, out),
        }
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Client-to-server direction of one TCP session.
pub enum Encryptor {
    /// Chunked AEAD framing
    Aead(AeadEncryptor),
    /// Raw keystream
    Stream(StreamEncryptor),
}

impl Encryptor {
    /// Encrypt `plaintext`, appending wire bytes (salt/IV first on the first call) to `out`.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Encryptor::Aead(e) => e.encrypt(plaintext, out),
            Encryptor::Stream(e) => e.encrypt(plaintext, out),
        }
    }
}

/// Server-to-client direction of one TCP session.
pub enum Decryptor {
    /// Chunked AEAD framing
    Aead(AeadDecryptor),
    /// Raw keystream
    Stream(StreamDecryptor),
}

impl Decryptor {
    /// Decrypt `input`, appending plaintext to `out`. May produce nothing
    /// until a full salt/IV or chunk has arrived.
    pub fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Decryptor::Aead(d) => d.decrypt(input, out),
            Decryptor::Stream(d) => d.decrypt(input, out),
        }
    }

    /// Complete chunks are still buffered because the last call hit its output limit.
    pub fn has_buffered_chunk(&self) -> bool {
        match self {
            Decryptor::Aead(d) => d.has_buffered_chunk(),
            Decryptor::Stream(_) => false,
        }
    }
}
