//! Per-direction frame AEAD (C3).
//!
//! Wraps a single plaintext frame under a per-direction 32-byte key with a
//! monotonic counter nonce. Pure functions: the monotonic counter itself,
//! and the decision of which generation's key to try, live in
//! `shadowmesh-core::session`.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::CryptoError;

/// Frame AEAD key size.
pub const KEY_SIZE: usize = 32;
/// AEAD authentication tag size.
pub const TAG_SIZE: usize = 16;
/// Maximum plaintext inner frame size.
pub const MAX_INNER_FRAME: usize = 1500;
/// Maximum wire payload size (`counter` prefix + ciphertext + tag).
pub const MAX_WIRE_PAYLOAD: usize = 8 + MAX_INNER_FRAME + TAG_SIZE;

/// Build the 12-byte nonce: `counter_be64(8) || session_id[0..4](4)`.
fn build_nonce(counter: u64, session_id_prefix: [u8; 4]) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce[8..].copy_from_slice(&session_id_prefix);
    *Nonce::from_slice(&nonce)
}

/// Encrypt a single frame, producing the wire payload
/// `counter_be64(8) || ciphertext || tag(16)`.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] on AEAD failure (practically
/// unreachable for a well-formed key) or [`CryptoError::InvalidKeyLength`]
/// if `plaintext_frame` exceeds [`MAX_INNER_FRAME`].
pub fn encrypt(
    plaintext_frame: &[u8],
    key: &[u8; KEY_SIZE],
    counter: u64,
    session_id_prefix: [u8; 4],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if plaintext_frame.len() > MAX_INNER_FRAME {
        return Err(CryptoError::InvalidKeyLength {
            expected: MAX_INNER_FRAME,
            actual: plaintext_frame.len(),
        });
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = build_nonce(counter, session_id_prefix);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext_frame,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut wire_payload = Vec::with_capacity(8 + ciphertext.len());
    wire_payload.extend_from_slice(&counter.to_be_bytes());
    wire_payload.extend_from_slice(&ciphertext);
    Ok(wire_payload)
}

/// Decrypt a wire payload produced by [`encrypt`], returning the counter
/// it carried and the recovered plaintext frame.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] on a too-short payload or AEAD
/// authentication failure (tampering, wrong key, or wrong generation).
pub fn decrypt(
    wire_payload: &[u8],
    key: &[u8; KEY_SIZE],
    session_id_prefix: [u8; 4],
    aad: &[u8],
) -> Result<(u64, Vec<u8>), CryptoError> {
    if wire_payload.len() < 8 + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let mut counter_bytes = [0u8; 8];
    counter_bytes.copy_from_slice(&wire_payload[..8]);
    let counter = u64::from_be_bytes(counter_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = build_nonce(counter, session_id_prefix);
    let plaintext = cipher
        .decrypt(
            &nonce,
            Payload {
                msg: &wire_payload[8..],
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok((counter, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        [0x42u8; KEY_SIZE]
    }

    #[test]
    fn round_trip_preserves_frame_and_counter() {
        let frame = vec![0xABu8; 128];
        let aad = [1, 0x10, 0, 0, 0, 0, 0, 128];
        let wire = encrypt(&frame, &key(), 7, [9, 9, 9, 9], &aad).unwrap();
        let (counter, plaintext) = decrypt(&wire, &key(), [9, 9, 9, 9], &aad).unwrap();
        assert_eq!(counter, 7);
        assert_eq!(plaintext, frame);
    }

    #[test]
    fn wrong_key_fails() {
        let frame = vec![0x01u8; 64];
        let aad = [0u8; 8];
        let wire = encrypt(&frame, &key(), 1, [0; 4], &aad).unwrap();
        let other_key = [0x99u8; KEY_SIZE];
        assert!(decrypt(&wire, &other_key, [0; 4], &aad).is_err());
    }

    #[test]
    fn tampered_aad_fails() {
        let frame = vec![0x01u8; 64];
        let aad = [0u8; 8];
        let wire = encrypt(&frame, &key(), 1, [0; 4], &aad).unwrap();
        let tampered_aad = [1u8; 8];
        assert!(decrypt(&wire, &key(), [0; 4], &tampered_aad).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let frame = vec![0x01u8; 64];
        let aad = [0u8; 8];
        let mut wire = encrypt(&frame, &key(), 1, [0; 4], &aad).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(decrypt(&wire, &key(), [0; 4], &aad).is_err());
    }

    #[test]
    fn distinct_session_prefixes_give_distinct_ciphertext() {
        let frame = vec![0x01u8; 64];
        let aad = [0u8; 8];
        let wire_a = encrypt(&frame, &key(), 1, [1, 1, 1, 1], &aad).unwrap();
        let wire_b = encrypt(&frame, &key(), 1, [2, 2, 2, 2], &aad).unwrap();
        assert_ne!(wire_a, wire_b);
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = vec![0u8; MAX_INNER_FRAME + 1];
        assert!(encrypt(&frame, &key(), 1, [0; 4], &[]).is_err());
    }

    #[test]
    fn max_size_frame_round_trips() {
        let frame = vec![0x7Eu8; MAX_INNER_FRAME];
        let aad = [0u8; 8];
        let wire = encrypt(&frame, &key(), 1, [0; 4], &aad).unwrap();
        assert!(wire.len() <= MAX_WIRE_PAYLOAD);
        let (_, plaintext) = decrypt(&wire, &key(), [0; 4], &aad).unwrap();
        assert_eq!(plaintext, frame);
    }
}
