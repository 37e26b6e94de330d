//! Cryptographic layer of the relay.
//!
//! This module provides:
//! - The supported cipher methods and their key/salt sizes
//! - `EVP_BytesToKey` master keys and HKDF-SHA1 session subkeys
//! - AEAD chunk framing (AES-GCM, ChaCha20-Poly1305)
//! - Raw stream-cipher framing (AES-CFB, AES-CTR, Salsa20, ChaCha20)
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

pub mod aead;
mod engine;
mod kdf;
mod method;
mod random;
pub mod stream;

pub use aead::{Aead, AeadDecryptor, AeadEncryptor, Nonce};
pub use engine::{CipherContext, Decryptor, Encryptor};
pub use kdf::{evp_bytes_to_key, session_subkey, Hkdf};
pub use method::{CipherKind, Method};
pub use random::SecureRandom;

/// Size of AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Largest salt / IV of any supported method
pub const MAX_SALT_SIZE: usize = 32;

/// Bytes in the encoded chunk length
pub const CHUNK_LEN_BYTES: usize = 2;

/// Largest payload carried by one AEAD chunk
pub const CHUNK_LEN_MASK: usize = 0x3FFF;

/// Framing bytes added per AEAD chunk: two tags and the length
pub const CHUNK_OVERHEAD: usize = 2 * TAG_SIZE + CHUNK_LEN_BYTES;

/// Largest AEAD chunk on the wire
pub const MAX_CHUNK_SIZE: usize = CHUNK_LEN_MASK + CHUNK_OVERHEAD;

/// HKDF info string for session subkeys
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";
