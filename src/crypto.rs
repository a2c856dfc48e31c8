//! Low-level cryptographic primitives.
//!
//! This module is the only place in the crate that imports `ring` for
//! hashing and randomness. The keyed hash used by PBKDF2 and every random
//! value the crate generates (salts, raw keys) come from here.
//!
//! Primitive choices:
//! - **PRF**: HMAC-SHA1 (20-byte digest), as required by the on-disk
//!   passphrase format. SHA-1's collision weakness does not affect HMAC.
//! - **Randomness**: `ring::rand::SystemRandom`.

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::KeyError;

/// Size of a wrapping key in bytes (256 bits).
pub const WRAPPING_KEY_LEN: usize = 32;

/// Output size of the PBKDF2 PRF in bytes.
pub const SHA1_DIGEST_LEN: usize = 20;

/// HMAC-SHA1 keyed with a passphrase.
///
/// The key schedule is computed once so that each PBKDF2 iteration costs a
/// single MAC.
pub(crate) struct HmacSha1 {
    key: hmac::Key,
}

impl HmacSha1 {
    pub(crate) fn new(key: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key),
        }
    }

    /// MAC `data` into `out`.
    pub(crate) fn mac_into(&self, data: &[u8], out: &mut [u8; SHA1_DIGEST_LEN]) {
        let tag = hmac::sign(&self.key, data);
        out.copy_from_slice(tag.as_ref());
    }
}

/// Generate a fresh PBKDF2 salt.
pub fn generate_salt() -> Result<u64, KeyError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; 8];
    rng.fill(&mut buf)
        .map_err(|_| KeyError::Crypto("failed to generate salt"))?;
    Ok(u64::from_le_bytes(buf))
}

/// Generate 32 random bytes suitable as raw key material.
pub fn generate_raw_key() -> Result<[u8; WRAPPING_KEY_LEN], KeyError> {
    let rng = SystemRandom::new();
    let mut key = [0u8; WRAPPING_KEY_LEN];
    rng.fill(&mut key)
        .map_err(|_| KeyError::Crypto("randomness source failed"))?;
    Ok(key)
}
