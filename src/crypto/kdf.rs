//! Key Derivation Functions.
//!
//! Master keys come from the password through OpenSSL's `EVP_BytesToKey`
//! (MD5, one round, no salt). AEAD session subkeys are expanded from the
//! master key and the per-session salt with HKDF-SHA1.

use hkdf::Hkdf as HkdfImpl;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::crypto::SUBKEY_INFO;
use crate::error::{Error, Result};

/// HKDF key derivation using SHA-1.
pub struct Hkdf {
    prk: HkdfImpl<Sha1>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt (the per-session salt on the wire)
    /// * `ikm` - Input keying material (the master key)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand the PRK to produce output keying material.
    pub fn expand(&self, info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
        let mut okm = Zeroizing::new(vec![0u8; len]);
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }
}

/// Derive the per-session AEAD subkey from the master key and the session salt.
pub fn session_subkey(master_key: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    Hkdf::new(Some(salt), master_key).expand(SUBKEY_INFO, master_key.len())
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration.
///
/// `D_i = MD5(D_{i-1} || password)`, concatenated until `key_len` bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len + 16));
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}
