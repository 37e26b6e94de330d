//! Cipher method table.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Framing family of a cipher method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// Raw keystream XOR after a cleartext IV
    Stream,
    /// Length-prefixed sealed chunks after a cleartext salt
    Aead,
}

/// A supported cipher method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    /// `aes-128-cfb`
    Aes128Cfb,
    /// `aes-192-cfb`
    Aes192Cfb,
    /// `aes-256-cfb`
    #[default]
    Aes256Cfb,
    /// `aes-128-ctr`
    Aes128Ctr,
    /// `aes-192-ctr`
    Aes192Ctr,
    /// `aes-256-ctr`
    Aes256Ctr,
    /// `salsa20`
    Salsa20,
    /// `chacha20` (original 8-byte nonce variant)
    ChaCha20,
    /// `chacha20-ietf`
    ChaCha20Ietf,
    /// `aes-128-gcm`
    Aes128Gcm,
    /// `aes-192-gcm`
    Aes192Gcm,
    /// `aes-256-gcm`
    Aes256Gcm,
    /// `chacha20-ietf-poly1305`
    ChaCha20IetfPoly1305,
}

impl Method {
    /// Every supported method, stream ciphers first.
    pub const ALL: [Method; 13] = [
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::Aes128Ctr,
        Method::Aes192Ctr,
        Method::Aes256Ctr,
        Method::Salsa20,
        Method::ChaCha20,
        Method::ChaCha20Ietf,
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::ChaCha20IetfPoly1305,
    ];

    /// Canonical lower-case name as used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::Salsa20 => "salsa20",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Framing family.
    pub fn kind(&self) -> CipherKind {
        match self {
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm | Method::ChaCha20IetfPoly1305 => {
                CipherKind::Aead
            }
            _ => CipherKind::Stream,
        }
    }

    /// Whether this method uses AEAD chunk framing.
    pub fn is_aead(&self) -> bool {
        self.kind() == CipherKind::Aead
    }

    /// Master key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Method::Aes128Cfb | Method::Aes128Ctr | Method::Aes128Gcm => 16,
            Method::Aes192Cfb | Method::Aes192Ctr | Method::Aes192Gcm => 24,
            _ => 32,
        }
    }

    /// Length of the cleartext prefix: the salt for AEAD methods, the IV for stream methods.
    pub fn salt_len(&self) -> usize {
        match self {
            Method::Salsa20 | Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
            Method::Aes128Cfb
            | Method::Aes192Cfb
            | Method::Aes256Cfb
            | Method::Aes128Ctr
            | Method::Aes192Ctr
            | Method::Aes256Ctr
            | Method::Aes128Gcm => 16,
            Method::Aes192Gcm => 24,
            Method::Aes256Gcm | Method::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Authentication tag length (zero for stream methods).
    pub fn tag_len(&self) -> usize {
        if self.is_aead() {
            super::TAG_SIZE
        } else {
            0
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    /// Case-insensitive lookup; an empty name selects the default method.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Ok(Method::default());
        }
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.name() == name)
            .ok_or(Error::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("aes-256-gcm".parse::<Method>().unwrap(), Method::Aes256Gcm);
        assert_eq!("AES-128-GCM".parse::<Method>().unwrap(), Method::Aes128Gcm);
        assert_eq!("".parse::<Method>().unwrap(), Method::Aes256Cfb);
        assert_eq!("Aes-192-CTR".parse::<Method>().unwrap(), Method::Aes192Ctr);
        assert_eq!("salsa20".parse::<Method>().unwrap(), Method::Salsa20);

        let err = "rc4-md5".parse::<Method>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(ref m) if m == "rc4-md5"));
    }

    #[test]
    fn test_method_table() {
        for method in Method::ALL {
            assert_eq!(method.name().parse::<Method>().unwrap(), method);
        }

        assert_eq!(Method::Aes128Gcm.key_len(), 16);
        assert_eq!(Method::Aes128Gcm.salt_len(), 16);
        assert_eq!(Method::ChaCha20IetfPoly1305.salt_len(), 32);
        assert_eq!(Method::ChaCha20Ietf.salt_len(), 12);
        assert_eq!(Method::Salsa20.salt_len(), 8);
        assert_eq!(Method::Salsa20.tag_len(), 0);
        assert_eq!(Method::Aes256Gcm.tag_len(), 16);
        assert!(!Method::ChaCha20.is_aead());
        assert_eq!(Method::Aes192Gcm.key_len(), 24);
        assert_eq!(Method::Aes192Gcm.salt_len(), 24);
        assert!(Method::Aes192Gcm.is_aead());
        assert_eq!(Method::Aes256Cfb.key_len(), 32);
        assert_eq!(Method::Aes192Cfb.key_len(), 24);
        assert_eq!(Method::Aes128Ctr.salt_len(), 16);
        assert_eq!(Method::Aes256Ctr.kind(), CipherKind::Stream);
    }
}
