//! Entropy source abstraction.
//!
//! Token values must carry at least [`crate::MIN_TOKEN_ENTROPY_BITS`] bits
//! of cryptographically secure randomness. The source is injectable so
//! tests can pin token values.

use rand::RngCore;

/// Cryptographically secure byte source.
pub trait RandomSource: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);
}

/// Operating-system entropy via [`rand::rngs::OsRng`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_random_fills_buffers() {
        let source = SystemRandom;
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        source.fill_bytes(&mut a);
        source.fill_bytes(&mut b);
        // 256 bits colliding would mean a broken OS RNG.
        assert_ne!(a, b);
    }
}
