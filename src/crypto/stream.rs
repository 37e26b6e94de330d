//! Raw stream ciphers.
//!
//! A random IV is sent in clear, then the payload runs through the cipher
//! with no framing. The underlying cipher keeps its block counter and the
//! offset inside the current block, so calls may split anywhere.
//!
//! Salsa20, ChaCha20 and AES-CTR are pure keystream XOR. AES-CFB feeds the
//! ciphertext back into the block cipher, so encrypt and decrypt halves are
//! distinct.

use aes::{Aes128, Aes192, Aes256};
use bytes::{BufMut, BytesMut};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, ChaCha20Legacy};
use ctr::Ctr128BE;
use salsa20::Salsa20;

use crate::crypto::{Method, SecureRandom, MAX_SALT_SIZE};
use crate::error::{Error, Result};

/// Which way a [`Keystream`] runs data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, ciphertext out
    Encrypt,
    /// Ciphertext in, plaintext out
    Decrypt,
}

enum StreamInner {
    Salsa20(Salsa20),
    ChaCha20Legacy(ChaCha20Legacy),
    ChaCha20Ietf(ChaCha20),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbDec(BufDecryptor<Aes256>),
}

/// A cipher positioned at the start of a session.
pub struct Keystream {
    inner: StreamInner,
}

impl Keystream {
    /// Initialise the cipher for `method` from key and IV, running in `direction`.
    pub fn new(method: Method, key: &[u8], iv: &[u8], direction: Direction) -> Result<Self> {
        let invalid = |_| Error::crypto(format!("bad key/IV length for {}", method));
        let decrypt = direction == Direction::Decrypt;
        let inner = match method {
            Method::Salsa20 => StreamInner::Salsa20(Salsa20::new_from_slices(key, iv).map_err(invalid)?),
            Method::ChaCha20 => {
                StreamInner::ChaCha20Legacy(ChaCha20Legacy::new_from_slices(key, iv).map_err(invalid)?)
            }
            Method::ChaCha20Ietf => StreamInner::ChaCha20Ietf(ChaCha20::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes128Ctr => StreamInner::Aes128Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes192Ctr => StreamInner::Aes192Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes256Ctr => StreamInner::Aes256Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes128Cfb if decrypt => {
                StreamInner::Aes128CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Method::Aes192Cfb if decrypt => {
                StreamInner::Aes192CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Method::Aes256Cfb if decrypt => {
                StreamInner::Aes256CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Method::Aes128Cfb => StreamInner::Aes128CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes192Cfb => StreamInner::Aes192CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?),
            Method::Aes256Cfb => StreamInner::Aes256CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(invalid)?),
            other => return Err(Error::UnsupportedMethod(other.name().to_string())),
        };
        Ok(Self { inner })
    }

    /// Run `data` through the cipher in place, advancing the position.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            StreamInner::Salsa20(c) => c.apply_keystream(data),
            StreamInner::ChaCha20Legacy(c) => c.apply_keystream(data),
            StreamInner::ChaCha20Ietf(c) => c.apply_keystream(data),
            StreamInner::Aes128Ctr(c) => c.apply_keystream(data),
            StreamInner::Aes192Ctr(c) => c.apply_keystream(data),
            StreamInner::Aes256Ctr(c) => c.apply_keystream(data),
            StreamInner::Aes128CfbEnc(c) => c.encrypt(data),
            StreamInner::Aes192CfbEnc(c) => c.encrypt(data),
            StreamInner::Aes256CfbEnc(c) => c.encrypt(data),
            StreamInner::Aes128CfbDec(c) => c.decrypt(data),
            StreamInner::Aes192CfbDec(c) => c.decrypt(data),
            StreamInner::Aes256CfbDec(c) => c.decrypt(data),
        }
    }
}

/// Encrypt side of a stream-cipher TCP session.
pub struct StreamEncryptor {
    keystream: Keystream,
    iv: [u8; MAX_SALT_SIZE],
    iv_len: usize,
    iv_sent: bool,
}

impl StreamEncryptor {
    /// Start a session with a fresh random IV.
    pub fn new(method: Method, key: &[u8]) -> Result<Self> {
        let iv_len = method.salt_len();
        let mut iv = [0u8; MAX_SALT_SIZE];
        SecureRandom::fill(&mut iv[..iv_len]);

        Ok(Self {
            keystream: Keystream::new(method, key, &iv[..iv_len], Direction::Encrypt)?,
            iv,
            iv_len,
            iv_sent: false,
        })
    }

    /// Encrypt `plaintext`, appending wire bytes to `out`.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        if !self.iv_sent {
            out.put_slice(&self.iv[..self.iv_len]);
            self.iv_sent = true;
        }
        let start = out.len();
        out.put_slice(plaintext);
        self.keystream.apply(&mut out[start..]);
        Ok(())
    }
}

/// Decrypt side of a stream-cipher TCP session.
pub struct StreamDecryptor {
    method: Method,
    key: zeroize::Zeroizing<Vec<u8>>,
    keystream: Option<Keystream>,
    /// IV bytes collected so far.
    iv: Vec<u8>,
}

impl StreamDecryptor {
    /// Create a decryptor waiting for the peer's IV.
    pub fn new(method: Method, key: &[u8]) -> Self {
        Self {
            method,
            key: zeroize::Zeroizing::new(key.to_vec()),
            keystream: None,
            iv: Vec::with_capacity(method.salt_len()),
        }
    }

    /// Decrypt `input`, appending plaintext to `out`.
    pub fn decrypt(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        if self.keystream.is_none() {
            let need = self.method.salt_len() - self.iv.len();
            let take = need.min(input.len());
            self.iv.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.iv.len() < self.method.salt_len() {
                return Ok(());
            }
            self.keystream = Some(Keystream::new(self.method, &self.key, &self.iv, Direction::Decrypt)?);
        }

        if let Some(keystream) = self.keystream.as_mut() {
            let start = out.len();
            out.put_slice(input);
            keystream.apply(&mut out[start..]);
        }
        Ok(())
    }
}

/// Encrypt one UDP packet: `[iv][payload ^ keystream]`.
pub fn encrypt_packet(method: Method, key: &[u8], payload: &[u8], out: &mut BytesMut) -> Result<()> {
    let mut enc = StreamEncryptor::new(method, key)?;
    out.reserve(method.salt_len() + payload.len());
    enc.encrypt(payload, out)
}

/// Decrypt one UDP packet produced by [`encrypt_packet`].
pub fn decrypt_packet(method: Method, key: &[u8], packet: &[u8], out: &mut BytesMut) -> Result<()> {
    let iv_len = method.salt_len();
    if packet.len() < iv_len {
        return Err(Error::crypto(format!("UDP packet too short: {} bytes", packet.len())));
    }
    let (iv, body) = packet.split_at(iv_len);
    let mut keystream = Keystream::new(method, key, iv, Direction::Decrypt)?;
    let start = out.len();
    out.put_slice(body);
    keystream.apply(&mut out[start..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM_METHODS: [Method; 9] = [
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::Aes128Ctr,
        Method::Aes192Ctr,
        Method::Aes256Ctr,
        Method::Salsa20,
        Method::ChaCha20,
        Method::ChaCha20Ietf,
    ];

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn encrypt_all(method: Method, key: &[u8], data: &[u8]) -> BytesMut {
        let mut enc = StreamEncryptor::new(method, key).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(data, &mut wire).unwrap();
        wire
    }

    #[test]
    fn test_round_trip_with_splits() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();

        for method in STREAM_METHODS {
            let key = vec![0x11u8; method.key_len()];
            let mut enc = StreamEncryptor::new(method, &key).unwrap();
            let mut wire = BytesMut::new();
            // Splits that straddle 64-byte block boundaries.
            enc.encrypt(&data[..1], &mut wire).unwrap();
            enc.encrypt(&data[1..65], &mut wire).unwrap();
            enc.encrypt(&data[65..16384], &mut wire).unwrap();
            enc.encrypt(&data[16384..], &mut wire).unwrap();
            assert_eq!(wire.len(), method.salt_len() + data.len());

            let mut dec = StreamDecryptor::new(method, &key);
            let mut plain = BytesMut::new();
            for piece in wire.chunks(3) {
                dec.decrypt(piece, &mut plain).unwrap();
            }
            assert_eq!(&plain[..], &data[..], "{}", method);
        }
    }

    #[test]
    fn test_round_trip_sizes() {
        for method in STREAM_METHODS {
            let key = vec![0x5Au8; method.key_len()];
            for len in [0usize, 1, 16383, 16384] {
                let data = payload(len);
                let wire = encrypt_all(method, &key, &data);
                assert_eq!(wire.len(), method.salt_len() + len);

                let mut dec = StreamDecryptor::new(method, &key);
                let mut plain = BytesMut::new();
                dec.decrypt(&wire, &mut plain).unwrap();
                assert_eq!(&plain[..], &data[..], "{} len {}", method, len);
            }
        }
    }

    #[test]
    fn test_one_byte_fragments() {
        for method in STREAM_METHODS {
            let key = vec![0x6Bu8; method.key_len()];
            let data = payload(16384);
            let wire = encrypt_all(method, &key, &data);

            let mut dec = StreamDecryptor::new(method, &key);
            let mut plain = BytesMut::new();
            for byte in wire.chunks(1) {
                dec.decrypt(byte, &mut plain).unwrap();
            }
            assert_eq!(&plain[..], &data[..], "{}", method);
        }
    }

    #[test]
    fn test_aes_known_answers() {
        // SP 800-38A, F.3.13 (CFB128-AES128) and F.5.1 (CTR-AES128), first block.
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let mut block = plain.clone();
        Keystream::new(Method::Aes128Cfb, &key, &iv, Direction::Encrypt)
            .unwrap()
            .apply(&mut block);
        assert_eq!(hex::encode(&block), "3b3fd92eb72dad20333449f8e83cfb4a");
        Keystream::new(Method::Aes128Cfb, &key, &iv, Direction::Decrypt)
            .unwrap()
            .apply(&mut block);
        assert_eq!(block, plain);

        let counter = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let mut block = plain.clone();
        Keystream::new(Method::Aes128Ctr, &key, &counter, Direction::Encrypt)
            .unwrap()
            .apply(&mut block);
        assert_eq!(hex::encode(&block), "874d6191b620e3261bef6864990db6ce");
    }

    #[test]
    fn test_cfb_halves_differ() {
        // Feeding ciphertext back means a second encrypt does not undo the first.
        let key = [0x77u8; 32];
        let iv = [0x01u8; 16];
        let mut data = payload(64);
        Keystream::new(Method::Aes256Cfb, &key, &iv, Direction::Encrypt)
            .unwrap()
            .apply(&mut data);
        Keystream::new(Method::Aes256Cfb, &key, &iv, Direction::Encrypt)
            .unwrap()
            .apply(&mut data);
        assert_ne!(data, payload(64));
    }

    #[test]
    fn test_empty_payload() {
        let key = [0x22u8; 32];
        let mut enc = StreamEncryptor::new(Method::ChaCha20Ietf, &key).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(&[], &mut wire).unwrap();
        assert_eq!(wire.len(), 12);

        let mut dec = StreamDecryptor::new(Method::ChaCha20Ietf, &key);
        let mut plain = BytesMut::new();
        dec.decrypt(&wire, &mut plain).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_known_keystream_is_xor() {
        // Encrypting zeros yields the raw keystream; encrypting it again restores zeros.
        let key = [0x33u8; 32];
        let iv = [0x44u8; 8];
        let mut ks = Keystream::new(Method::Salsa20, &key, &iv, Direction::Encrypt).unwrap();
        let mut block = [0u8; 100];
        ks.apply(&mut block);
        assert!(block.iter().any(|&b| b != 0));

        let mut ks = Keystream::new(Method::Salsa20, &key, &iv, Direction::Encrypt).unwrap();
        ks.apply(&mut block);
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_udp_packet() {
        let key = [0x55u8; 32];
        for method in STREAM_METHODS {
            let key = &key[..method.key_len()];
            let mut packet = BytesMut::new();
            encrypt_packet(method, key, b"datagram", &mut packet).unwrap();
            assert_eq!(packet.len(), method.salt_len() + 8);

            let mut plain = BytesMut::new();
            decrypt_packet(method, key, &packet, &mut plain).unwrap();
            assert_eq!(&plain[..], b"datagram");
        }
        let mut plain = BytesMut::new();
        assert!(decrypt_packet(Method::Salsa20, &key, &[0u8; 4], &mut plain).is_err());
    }
}
