//! Per-direction session key derivation (§3).
//!
//! Derives `tx_key`/`rx_key` from the hybrid shared secret via HKDF-SHA256
//! with distinct salts, role-inverted so both endpoints agree on which key
//! encrypts which direction without exchanging anything further.

use crate::{hybrid::HybridSharedSecret, kdf, CryptoError};

const TX_SALT: &[u8] = b"ShadowMesh-v1-TX";
const RX_SALT: &[u8] = b"ShadowMesh-v1-RX";

/// Derived directional session keys.
pub struct SessionKeyPair {
    /// Key used to encrypt frames sent by this endpoint.
    pub tx_key: [u8; 32],
    /// Key used to decrypt frames received by this endpoint.
    pub rx_key: [u8; 32],
}

/// Derive `tx_key`/`rx_key` for one endpoint.
///
/// `info = session_id || initiator_peer_id || responder_peer_id` is fixed
/// for both endpoints. `is_initiator` selects the salt mapping: the
/// initiator's TX key must equal the responder's RX key, and vice versa.
///
/// # Errors
///
/// Propagates [`CryptoError`] from the underlying HKDF expansion.
pub fn derive_session_keys(
    shared_secret: &HybridSharedSecret,
    session_id: &[u8; 16],
    initiator_peer_id: &[u8; 32],
    responder_peer_id: &[u8; 32],
    is_initiator: bool,
) -> Result<SessionKeyPair, CryptoError> {
    let mut info = Vec::with_capacity(16 + 32 + 32);
    info.extend_from_slice(session_id);
    info.extend_from_slice(initiator_peer_id);
    info.extend_from_slice(responder_peer_id);

    let (tx_salt, rx_salt) = if is_initiator {
        (TX_SALT, RX_SALT)
    } else {
        (RX_SALT, TX_SALT)
    };

    let tx_key = kdf::hkdf_sha256_32(shared_secret.as_bytes(), tx_salt, &info)?;
    let rx_key = kdf::hkdf_sha256_32(shared_secret.as_bytes(), rx_salt, &info)?;
    Ok(SessionKeyPair { tx_key, rx_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid;
    use rand_core::OsRng;

    fn shared_secret() -> HybridSharedSecret {
        let alice = hybrid::generate_hybrid_keypair(&mut OsRng, 0);
        let (_, ss) = alice.kem_public_key().encapsulate(&mut OsRng).unwrap();
        ss
    }

    #[test]
    fn initiator_tx_equals_responder_rx() {
        let ss = shared_secret();
        let session_id = [1u8; 16];
        let init_id = [0xAAu8; 32];
        let resp_id = [0xBBu8; 32];

        let initiator = derive_session_keys(&ss, &session_id, &init_id, &resp_id, true).unwrap();
        let responder = derive_session_keys(&ss, &session_id, &init_id, &resp_id, false).unwrap();

        assert_eq!(initiator.tx_key, responder.rx_key);
        assert_eq!(initiator.rx_key, responder.tx_key);
    }

    #[test]
    fn tx_and_rx_keys_differ() {
        let ss = shared_secret();
        let keys = derive_session_keys(&ss, &[2u8; 16], &[1u8; 32], &[2u8; 32], true).unwrap();
        assert_ne!(keys.tx_key, keys.rx_key);
    }

    #[test]
    fn deterministic_given_same_inputs() {
        let ss = shared_secret();
        let session_id = [3u8; 16];
        let init_id = [1u8; 32];
        let resp_id = [2u8; 32];
        let a = derive_session_keys(&ss, &session_id, &init_id, &resp_id, true).unwrap();
        let b = derive_session_keys(&ss, &session_id, &init_id, &resp_id, true).unwrap();
        assert_eq!(a.tx_key, b.tx_key);
        assert_eq!(a.rx_key, b.rx_key);
    }
}
