//! Secure random number generation.
//!
//! Salts and IVs come from the operating system's entropy source.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Pick an index in `0..len`. Returns 0 for an empty range.
    pub fn index(len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        (Self::u64() % len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        assert!(!buf1.iter().all(|&b| b == 0));
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_index() {
        assert_eq!(SecureRandom::index(0), 0);
        assert_eq!(SecureRandom::index(1), 0);

        let mut seen: HashSet<usize> = HashSet::new();
        for _ in 0..200 {
            let i = SecureRandom::index(4);
            assert!(i < 4);
            seen.insert(i);
        }
        assert!(seen.len() > 1);
    }
}
