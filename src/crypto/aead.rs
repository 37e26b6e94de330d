//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Wraps AES-GCM and ChaCha20-Poly1305 behind one type and implements the
//! chunked TCP framing:
//!
//! ```text
//! [salt] [seal(len_be16)] [seal(payload)] [seal(len_be16)] [seal(payload)] ...
//! ```
//!
//! Every seal/open consumes one nonce; nonces start at zero and are
//! incremented little-endian across their full width.

use aes_gcm::aead::consts::U12;
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::crypto::kdf::session_subkey;
use crate::crypto::{
    Method, SecureRandom, CHUNK_LEN_BYTES, CHUNK_LEN_MASK, MAX_SALT_SIZE, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};

/// AES-192-GCM with the standard 96-bit nonce.
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Stop decrypting once the output is this close to the limit.
const OUTPUT_HEADROOM: usize = 100;

/// A nonce (number used once) for AEAD operations.
///
/// Counter semantics over the whole 12 bytes, least significant byte first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// All-zero nonce, the starting point of every session.
    pub fn zero() -> Self {
        Self([0u8; NONCE_SIZE])
    }

    /// Create a nonce from raw bytes.
    #[cfg(test)]
    fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Increment with carry, little-endian.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

enum AeadInner {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// AEAD cipher keyed with a session subkey.
pub struct Aead {
    inner: AeadInner,
}

impl Aead {
    /// Create a new AEAD instance for `method` with the given key.
    pub fn new(method: Method, key: &[u8]) -> Result<Self> {
        if key.len() != method.key_len() {
            return Err(Error::Buffer {
                expected: method.key_len(),
                actual: key.len(),
            });
        }
        let inner = match method {
            Method::Aes128Gcm => AeadInner::Aes128Gcm(Aes128Gcm::new(GenericArray::from_slice(key))),
            Method::Aes192Gcm => AeadInner::Aes192Gcm(Aes192Gcm::new(GenericArray::from_slice(key))),
            Method::Aes256Gcm => AeadInner::Aes256Gcm(Aes256Gcm::new(GenericArray::from_slice(key))),
            Method::ChaCha20IetfPoly1305 => {
                AeadInner::ChaCha20Poly1305(ChaCha20Poly1305::new(GenericArray::from_slice(key)))
            }
            other => return Err(Error::UnsupportedMethod(other.name().to_string())),
        };
        Ok(Self { inner })
    }

    /// Seal `plaintext` and append `ciphertext || tag` to `out`.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        let start = out.len();
        out.extend_from_slice(plaintext);
        let nonce = GenericArray::from_slice(nonce.as_bytes());
        let buffer = &mut out[start..];

        let tag = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.encrypt_in_place_detached(nonce, b"", buffer),
            AeadInner::Aes192Gcm(c) => c.encrypt_in_place_detached(nonce, b"", buffer),
            AeadInner::Aes256Gcm(c) => c.encrypt_in_place_detached(nonce, b"", buffer),
            AeadInner::ChaCha20Poly1305(c) => c.encrypt_in_place_detached(nonce, b"", buffer),
        };

        match tag {
            Ok(tag) => {
                out.extend_from_slice(&tag);
                Ok(())
            }
            Err(_) => {
                out.truncate(start);
                Err(Error::crypto("encryption failed"))
            }
        }
    }

    /// Open `ciphertext || tag` and append the plaintext to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, tampered data, reused nonce).
    pub fn open(&self, nonce: &Nonce, sealed: &[u8], out: &mut BytesMut) -> Result<()> {
        if sealed.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: sealed.len(),
            });
        }

        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let start = out.len();
        out.extend_from_slice(ciphertext);
        let nonce = GenericArray::from_slice(nonce.as_bytes());
        let tag = GenericArray::from_slice(tag);
        let buffer = &mut out[start..];

        let result = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.decrypt_in_place_detached(nonce, b"", buffer, tag),
            AeadInner::Aes192Gcm(c) => c.decrypt_in_place_detached(nonce, b"", buffer, tag),
            AeadInner::Aes256Gcm(c) => c.decrypt_in_place_detached(nonce, b"", buffer, tag),
            AeadInner::ChaCha20Poly1305(c) => c.decrypt_in_place_detached(nonce, b"", buffer, tag),
        };

        result.map_err(|_| {
            out.truncate(start);
            Error::crypto("decryption/authentication failed")
        })
    }
}

/// Encrypt side of an AEAD TCP session.
pub struct AeadEncryptor {
    aead: Aead,
    nonce: Nonce,
    salt: [u8; MAX_SALT_SIZE],
    salt_len: usize,
    salt_sent: bool,
    /// Address-header bytes still to be collected before the first chunk is sealed.
    header_remaining: usize,
    header: Vec<u8>,
}

impl AeadEncryptor {
    /// Start a session with a fresh random salt.
    ///
    /// The first `addr_header_len` plaintext bytes are sealed as a chunk of their own.
    pub fn new(method: Method, master_key: &[u8], addr_header_len: usize) -> Result<Self> {
        let mut salt = [0u8; MAX_SALT_SIZE];
        let salt_len = method.salt_len();
        SecureRandom::fill(&mut salt[..salt_len]);
        Self::with_salt(method, master_key, &salt[..salt_len], addr_header_len)
    }

    pub(crate) fn with_salt(
        method: Method,
        master_key: &[u8],
        salt_bytes: &[u8],
        addr_header_len: usize,
    ) -> Result<Self> {
        let subkey = session_subkey(master_key, salt_bytes)?;
        let mut salt = [0u8; MAX_SALT_SIZE];
        salt[..salt_bytes.len()].copy_from_slice(salt_bytes);

        Ok(Self {
            aead: Aead::new(method, &subkey)?,
            nonce: Nonce::zero(),
            salt,
            salt_len: salt_bytes.len(),
            salt_sent: false,
            header_remaining: addr_header_len,
            header: Vec::with_capacity(addr_header_len),
        })
    }

    /// The salt sent at the head of the stream.
    pub fn salt(&self) -> &[u8] {
        &self.salt[..self.salt_len]
    }

    /// Current nonce (the one the next seal will use).
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Encrypt `plaintext`, appending wire bytes to `out`.
    pub fn encrypt(&mut self, mut plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        if !self.salt_sent {
            out.extend_from_slice(&self.salt[..self.salt_len]);
            self.salt_sent = true;
        }

        if self.header_remaining > 0 {
            let take = self.header_remaining.min(plaintext.len());
            self.header.extend_from_slice(&plaintext[..take]);
            self.header_remaining -= take;
            plaintext = &plaintext[take..];

            if self.header_remaining > 0 {
                return Ok(());
            }
            let header = std::mem::take(&mut self.header);
            self.seal_chunk(&header, out)?;
        }

        for chunk in plaintext.chunks(CHUNK_LEN_MASK) {
            self.seal_chunk(chunk, out)?;
        }
        Ok(())
    }

    fn seal_chunk(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<()> {
        let len = (chunk.len() as u16).to_be_bytes();
        self.aead.seal(&self.nonce, &len, out)?;
        self.nonce.increment();
        self.aead.seal(&self.nonce, chunk, out)?;
        self.nonce.increment();
        Ok(())
    }
}

/// Decrypt side of an AEAD TCP session.
///
/// Accepts arbitrary fragments; incomplete chunks stay buffered.
pub struct AeadDecryptor {
    method: Method,
    master_key: Zeroizing<Vec<u8>>,
    aead: Option<Aead>,
    nonce: Nonce,
    buffer: BytesMut,
    /// Chunk length already opened (its nonce consumed) while the payload is incomplete.
    pending_len: Option<usize>,
    output_limit: usize,
    output_full: bool,
}

impl AeadDecryptor {
    /// Create a decryptor that stops producing output near `output_limit` bytes per call.
    pub fn new(method: Method, master_key: &[u8], output_limit: usize) -> Self {
        Self {
            method,
            master_key: Zeroizing::new(master_key.to_vec()),
            aead: None,
            nonce: Nonce::zero(),
            buffer: BytesMut::with_capacity(crate::BUFFER_SIZE),
            pending_len: None,
            output_limit,
            output_full: false,
        }
    }

    /// True when the previous call stopped early on a full output buffer and
    /// complete chunks may still be buffered. Drive [`decrypt`](Self::decrypt)
    /// again with empty input to drain them.
    pub fn has_buffered_chunk(&self) -> bool {
        self.output_full
    }

    /// Bytes received but not yet decrypted.
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decrypt `input`, appending plaintext to `out`.
    pub fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        self.buffer.extend_from_slice(input);
        self.output_full = false;

        if self.aead.is_none() {
            let salt_len = self.method.salt_len();
            if self.buffer.len() < salt_len {
                return Ok(());
            }
            let salt = self.buffer.split_to(salt_len);
            let subkey = session_subkey(&self.master_key, &salt)?;
            self.aead = Some(Aead::new(self.method, &subkey)?);
            tracing::trace!("received salt {}", hex::encode(&salt));
        }

        let aead = match &self.aead {
            Some(aead) => aead,
            None => return Ok(()),
        };
        let produced_start = out.len();

        loop {
            let chunk_len = match self.pending_len {
                Some(len) => len,
                None => {
                    if self.buffer.len() < CHUNK_LEN_BYTES + TAG_SIZE {
                        return Ok(());
                    }
                    let mut len_bytes = BytesMut::with_capacity(CHUNK_LEN_BYTES);
                    aead.open(&self.nonce, &self.buffer[..CHUNK_LEN_BYTES + TAG_SIZE], &mut len_bytes)?;
                    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                    if len > CHUNK_LEN_MASK {
                        return Err(Error::crypto(format!("invalid chunk length {}", len)));
                    }
                    self.buffer.advance(CHUNK_LEN_BYTES + TAG_SIZE);
                    self.nonce.increment();
                    self.pending_len = Some(len);
                    len
                }
            };

            if self.buffer.len() < chunk_len + TAG_SIZE {
                return Ok(());
            }

            let sealed = self.buffer.split_to(chunk_len + TAG_SIZE);
            aead.open(&self.nonce, &sealed, out)?;
            self.nonce.increment();
            self.pending_len = None;

            if out.len() - produced_start + OUTPUT_HEADROOM > self.output_limit {
                self.output_full = !self.buffer.is_empty();
                return Ok(());
            }
            if self.buffer.is_empty() {
                return Ok(());
            }
        }
    }
}

/// Seal one self-contained UDP packet: `[salt][seal(payload)]`, nonce zero.
pub fn encrypt_packet(method: Method, master_key: &[u8], payload: &[u8], out: &mut BytesMut) -> Result<()> {
    let salt_len = method.salt_len();
    let mut salt = [0u8; MAX_SALT_SIZE];
    SecureRandom::fill(&mut salt[..salt_len]);

    let subkey = session_subkey(master_key, &salt[..salt_len])?;
    let aead = Aead::new(method, &subkey)?;

    out.reserve(salt_len + payload.len() + TAG_SIZE);
    out.put_slice(&salt[..salt_len]);
    aead.seal(&Nonce::zero(), payload, out)
}

/// Open one UDP packet produced by [`encrypt_packet`].
pub fn decrypt_packet(method: Method, master_key: &[u8], packet: &[u8], out: &mut BytesMut) -> Result<()> {
    let salt_len = method.salt_len();
    if packet.len() < salt_len + TAG_SIZE {
        return Err(Error::crypto(format!("UDP packet too short: {} bytes", packet.len())));
    }

    let (salt, sealed) = packet.split_at(salt_len);
    let subkey = session_subkey(master_key, salt)?;
    let aead = Aead::new(method, &subkey)?;
    aead.open(&Nonce::zero(), sealed, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::evp_bytes_to_key;

    const AEAD_METHODS: [Method; 4] = [
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::ChaCha20IetfPoly1305,
    ];

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn decrypt_all(dec: &mut AeadDecryptor, mut input: &[u8], step: usize) -> Vec<u8> {
        let mut plain = Vec::new();
        loop {
            let take = step.min(input.len());
            let mut out = BytesMut::new();
            dec.decrypt(&input[..take], &mut out).unwrap();
            plain.extend_from_slice(&out);
            input = &input[take..];

            while dec.has_buffered_chunk() {
                let mut out = BytesMut::new();
                dec.decrypt(&[], &mut out).unwrap();
                plain.extend_from_slice(&out);
            }
            if input.is_empty() {
                break;
            }
        }
        plain
    }

    #[test]
    fn test_nonce_increment() {
        let mut nonce = Nonce::zero();
        nonce.increment();
        assert_eq!(nonce.as_bytes()[0], 1);

        let mut nonce = Nonce::from_bytes([0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        nonce.increment();
        assert_eq!(nonce.as_bytes()[..3], [0, 0, 1]);

        // Full-width wrap
        let mut nonce = Nonce::from_bytes([0xff; NONCE_SIZE]);
        nonce.increment();
        assert_eq!(nonce, Nonce::zero());
    }

    #[test]
    fn test_seal_open() {
        let key = [0x42u8; 32];
        let aead = Aead::new(Method::ChaCha20IetfPoly1305, &key).unwrap();
        let nonce = Nonce::zero();

        let mut sealed = BytesMut::new();
        aead.seal(&nonce, b"Hello, World!", &mut sealed).unwrap();
        assert_eq!(sealed.len(), 13 + TAG_SIZE);

        let mut opened = BytesMut::new();
        aead.open(&nonce, &sealed, &mut opened).unwrap();
        assert_eq!(&opened[..], b"Hello, World!");
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        assert!(Aead::new(Method::Aes128Gcm, &[0u8; 32]).is_err());
        assert!(Aead::new(Method::Salsa20, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let key = evp_bytes_to_key(b"test", 32);
        let mut enc = AeadEncryptor::new(Method::Aes256Gcm, &key, 0).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(b"secret data", &mut wire).unwrap();

        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut dec = AeadDecryptor::new(Method::Aes256Gcm, &key, crate::BUFFER_SIZE);
        let mut out = BytesMut::new();
        let err = dec.decrypt(&wire, &mut out).unwrap_err();
        assert!(err.is_crypto());
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let method = Method::ChaCha20IetfPoly1305;
        let key = evp_bytes_to_key(b"test", 32);
        let salt = [7u8; 32];

        // Hand-build a chunk declaring 0x4000 bytes.
        let subkey = session_subkey(&key, &salt).unwrap();
        let aead = Aead::new(method, &subkey).unwrap();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&salt);
        aead.seal(&Nonce::zero(), &0x4000u16.to_be_bytes(), &mut wire).unwrap();

        let mut dec = AeadDecryptor::new(method, &key, crate::BUFFER_SIZE);
        let mut out = BytesMut::new();
        assert!(dec.decrypt(&wire, &mut out).is_err());
    }

    #[test]
    fn test_round_trip_sizes() {
        for method in AEAD_METHODS {
            let key = evp_bytes_to_key(b"round trip", method.key_len());
            for size in [0usize, 1, 16383, 16384, 200_000] {
                let data = payload(size);
                let mut enc = AeadEncryptor::new(method, &key, 0).unwrap();
                let mut wire = BytesMut::new();
                enc.encrypt(&data, &mut wire).unwrap();

                let mut dec = AeadDecryptor::new(method, &key, crate::BUFFER_SIZE);
                let plain = decrypt_all(&mut dec, &wire, wire.len());
                assert_eq!(plain, data, "{} / {}", method, size);
            }
        }
    }

    #[test]
    fn test_split_points() {
        let method = Method::Aes128Gcm;
        let key = evp_bytes_to_key(b"split", method.key_len());
        let data = payload(40_000);

        let mut enc = AeadEncryptor::new(method, &key, 7).unwrap();
        let mut wire = BytesMut::new();
        // Address header arrives in two pieces, payload in uneven pieces.
        enc.encrypt(&data[..3], &mut wire).unwrap();
        enc.encrypt(&data[3..9000], &mut wire).unwrap();
        enc.encrypt(&data[9000..], &mut wire).unwrap();

        for step in [1usize, 5, 17, 2048, 16_411] {
            let mut dec = AeadDecryptor::new(method, &key, crate::BUFFER_SIZE);
            let plain = decrypt_all(&mut dec, &wire, step);
            assert_eq!(plain, data, "step {}", step);
        }
    }

    #[test]
    fn test_address_header_is_own_chunk() {
        let method = Method::ChaCha20IetfPoly1305;
        let key = evp_bytes_to_key(b"hdr", 32);
        let header = [1u8, 127, 0, 0, 1, 0x1f, 0x90];

        let mut enc = AeadEncryptor::new(method, &key, header.len()).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(&[&header[..], b"GET /"].concat(), &mut wire).unwrap();

        // salt + (len chunk + header chunk) + (len chunk + payload chunk)
        let expected = 32 + (2 + 16) + (7 + 16) + (2 + 16) + (5 + 16);
        assert_eq!(wire.len(), expected);

        // Four seals consumed four nonces.
        assert_eq!(enc.nonce().as_bytes()[0], 4);
    }

    #[test]
    fn test_nonces_strictly_increase() {
        let key = evp_bytes_to_key(b"nonce", 32);
        let mut enc = AeadEncryptor::new(Method::Aes256Gcm, &key, 0).unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut wire = BytesMut::new();

        for _ in 0..50 {
            let before = *enc.nonce();
            enc.encrypt(b"x", &mut wire).unwrap();
            let after = *enc.nonce();
            assert!(seen.insert(before));
            assert_ne!(before, after);
            // Two seals per chunk.
            let counter = |n: &Nonce| u128::from_le_bytes({
                let mut b = [0u8; 16];
                b[..NONCE_SIZE].copy_from_slice(n.as_bytes());
                b
            });
            assert_eq!(counter(&after), counter(&before) + 2);
        }
    }

    #[test]
    fn test_output_limit_leaves_remainder_buffered() {
        let method = Method::Aes256Gcm;
        let key = evp_bytes_to_key(b"limit", 32);
        let data = payload(100_000);

        let mut enc = AeadEncryptor::new(method, &key, 0).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(&data, &mut wire).unwrap();

        let mut dec = AeadDecryptor::new(method, &key, crate::BUFFER_SIZE);
        let mut out = BytesMut::new();
        dec.decrypt(&wire, &mut out).unwrap();
        assert!(out.len() < data.len());
        assert!(dec.has_buffered_chunk());
        assert!(dec.buffered() > 0);

        let mut all = out.to_vec();
        while dec.has_buffered_chunk() {
            let mut out = BytesMut::new();
            dec.decrypt(&[], &mut out).unwrap();
            all.extend_from_slice(&out);
        }
        assert_eq!(all, data);
    }

    #[test]
    fn test_udp_packet() {
        for method in AEAD_METHODS {
            let key = evp_bytes_to_key(b"udp", method.key_len());
            let mut packet = BytesMut::new();
            encrypt_packet(method, &key, b"\x01\x08\x08\x08\x08\x00\x35query", &mut packet).unwrap();
            assert_eq!(packet.len(), method.salt_len() + 12 + TAG_SIZE);

            let mut plain = BytesMut::new();
            decrypt_packet(method, &key, &packet, &mut plain).unwrap();
            assert_eq!(&plain[..], b"\x01\x08\x08\x08\x08\x00\x35query");

            let mut plain = BytesMut::new();
            assert!(decrypt_packet(method, &key, &packet[..method.salt_len()], &mut plain).is_err());
        }
    }
}
