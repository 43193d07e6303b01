//! HKDF-SHA256 key derivation.
//!
//! Used to combine hybrid KEM shared secrets into a single key-exchange
//! secret, and to derive per-direction session keys from it. Replaces the
//! keyed-BLAKE3 derivation of an earlier generation of this codebase;
//! HKDF-SHA256 is the interoperable, widely reviewed choice.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Derive `L` bytes of output key material via HKDF-SHA256.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] if `okm.len()` exceeds HKDF's
/// maximum output (255 * 32 bytes) — unreachable for this crate's callers.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, okm).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 255 * 32,
        actual: okm.len(),
    })
}

/// Derive a fixed 32-byte key via HKDF-SHA256.
///
/// # Errors
///
/// See [`hkdf_sha256`].
pub fn hkdf_sha256_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_sha256(ikm, salt, info, &mut out)?;
    Ok(out)
}

/// Compute `HMAC-SHA256(key, message)`, used as the handshake RESPONSE
/// proof: `HMAC-SHA256(shared_secret, proof_nonce)`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] if `key` is empty (HMAC
/// accepts any non-empty key length; this crate's callers always pass a
/// 32-byte shared secret).
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })?;
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Constant-time verification of an `HMAC-SHA256` proof.
#[must_use]
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], expected: &[u8; 32]) -> bool {
    match hmac_sha256(key, message) {
        Ok(actual) => crate::constant_time::verify_32(&actual, expected),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_identical_inputs() {
        let ikm = b"input key material";
        let salt = b"a salt";
        let info = b"context info";
        let a = hkdf_sha256_32(ikm, salt, info).unwrap();
        let b = hkdf_sha256_32(ikm, salt, info).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_salts_give_distinct_output() {
        let ikm = b"input key material";
        let info = b"context info";
        let a = hkdf_sha256_32(ikm, b"salt-a", info).unwrap();
        let b = hkdf_sha256_32(ikm, b"salt-b", info).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_info_gives_distinct_output() {
        let ikm = b"input key material";
        let salt = b"a salt";
        let a = hkdf_sha256_32(ikm, salt, b"info-a").unwrap();
        let b = hkdf_sha256_32(ikm, salt, b"info-b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn variable_length_output() {
        let mut out = [0u8; 64];
        hkdf_sha256(b"ikm", b"salt", b"info", &mut out).unwrap();
        assert_ne!(out, [0u8; 64]);
    }

    #[test]
    fn hmac_round_trips_through_verify() {
        let key = [0x11u8; 32];
        let nonce = [0x22u8; 24];
        let proof = hmac_sha256(&key, &nonce).unwrap();
        assert!(hmac_sha256_verify(&key, &nonce, &proof));
    }

    #[test]
    fn hmac_verify_rejects_wrong_key() {
        let nonce = [0x22u8; 24];
        let proof = hmac_sha256(&[0x11u8; 32], &nonce).unwrap();
        assert!(!hmac_sha256_verify(&[0x33u8; 32], &nonce, &proof));
    }
}
