//! Wrapping key derivation.
//!
//! Turns validated key material into the 32-byte wrapping key handed to
//! the key store:
//!
//! ```text
//! raw        -> first 32 bytes, verbatim
//! hex        -> 64 hex digits decoded to 32 bytes
//! passphrase -> PBKDF2-HMAC-SHA1(passphrase, salt_le64, iterations, 32)
//! ```
//!
//! Every intermediate buffer lives in a zeroising container and is wiped
//! when the call returns, on success and on error alike.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{HmacSha1, SHA1_DIGEST_LEN, WRAPPING_KEY_LEN};
use crate::error::KeyError;
use crate::props::KeyFormat;

/// A wrapping key.
///
/// - Not `Clone`. Owned by the single operation that derived it.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    bytes: [u8; WRAPPING_KEY_LEN],
}

impl WrappingKey {
    /// Construct a wrapping key from raw bytes.
    pub fn from_bytes(bytes: [u8; WRAPPING_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Borrow the key bytes for submission to a key store.
    pub fn as_bytes(&self) -> &[u8; WRAPPING_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(<redacted>)")
    }
}

/// PBKDF2 (RFC 8018) with HMAC-SHA1 as the PRF.
///
/// Fills `out` entirely; the last block is truncated when `out.len()` is
/// not a multiple of the digest size.
pub fn pbkdf2_hmac_sha1(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u64,
    out: &mut [u8],
) -> Result<(), KeyError> {
    if iterations == 0 {
        return Err(KeyError::InputValidation("pbkdf2 iteration count must be non-zero".into()));
    }

    let prf = HmacSha1::new(passphrase);

    let mut first_input = Zeroizing::new(Vec::with_capacity(salt.len() + 4));
    let mut u = Zeroizing::new([0u8; SHA1_DIGEST_LEN]);
    let mut next = Zeroizing::new([0u8; SHA1_DIGEST_LEN]);
    let mut block = Zeroizing::new([0u8; SHA1_DIGEST_LEN]);

    for (index, chunk) in out.chunks_mut(SHA1_DIGEST_LEN).enumerate() {
        // Block indices are 1-based.
        let block_index = u32::try_from(index + 1)
            .map_err(|_| KeyError::InputValidation("pbkdf2 output too long".into()))?;

        first_input.clear();
        first_input.extend_from_slice(salt);
        first_input.extend_from_slice(&block_index.to_be_bytes());

        prf.mac_into(&first_input, &mut u);
        block.copy_from_slice(&u[..]);

        for _ in 1..iterations {
            prf.mac_into(&u[..], &mut next);
            u.copy_from_slice(&next[..]);
            for (acc, byte) in block.iter_mut().zip(u.iter()) {
                *acc ^= byte;
            }
        }

        chunk.copy_from_slice(&block[..chunk.len()]);
    }

    Ok(())
}

/// Derive the wrapping key for `material` in the given format.
///
/// `salt` and `iterations` are only consulted for passphrases. The salt is
/// fed to PBKDF2 as its little-endian byte encoding.
pub fn derive_wrapping_key(
    format: KeyFormat,
    material: &[u8],
    salt: u64,
    iterations: u64,
) -> Result<WrappingKey, KeyError> {
    let mut key = WrappingKey::from_bytes([0u8; WRAPPING_KEY_LEN]);

    match format {
        KeyFormat::Raw => {
            let raw = material.get(..WRAPPING_KEY_LEN).ok_or_else(|| {
                KeyError::InputValidation(format!(
                    "raw key too short (expected {WRAPPING_KEY_LEN})"
                ))
            })?;
            key.bytes.copy_from_slice(raw);
        }
        KeyFormat::Hex => {
            if material.len() != WRAPPING_KEY_LEN * 2 {
                return Err(KeyError::InputValidation(format!(
                    "hex key must be {} characters",
                    WRAPPING_KEY_LEN * 2
                )));
            }
            hex::decode_to_slice(material, &mut key.bytes)
                .map_err(|_| KeyError::InputValidation("invalid hex key provided".into()))?;
        }
        KeyFormat::Passphrase => {
            let salt_bytes = salt.to_le_bytes();
            pbkdf2_hmac_sha1(material, &salt_bytes, iterations, &mut key.bytes)?;
        }
        KeyFormat::None => {
            return Err(KeyError::PolicyViolation("no keyformat to derive a key from".into()));
        }
    }

    Ok(key)
}
