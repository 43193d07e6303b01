//! Property-based tests for the ShadowMesh wire codec and crypto primitives.
//!
//! These complement the module-level unit tests in `frame.rs`/`aead.rs`/
//! `session_keys.rs`, which already cover fixed literal round trips; the
//! properties here widen the input space instead of repeating it, and fuzz
//! the codec against arbitrary bytes it was never handed on purpose.

use proptest::prelude::*;

use shadowmesh_core::frame::{CloseReason, WireMessage};
use shadowmesh_crypto::aead;
use shadowmesh_crypto::hybrid::generate_hybrid_keypair;
use shadowmesh_crypto::session_keys::derive_session_keys;

proptest! {
    /// Decoding never panics, regardless of what garbage lands on the wire.
    /// Either it returns a structurally valid message or a `FrameError` —
    /// there is no third outcome.
    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = WireMessage::decode(&bytes);
    }

    #[test]
    fn response_round_trips_for_arbitrary_fields(
        session_id in prop::array::uniform16(any::<u8>()),
        proof in prop::array::uniform32(any::<u8>()),
        capabilities in any::<u32>(),
    ) {
        let msg = WireMessage::Response { session_id, proof, capabilities };
        let bytes = msg.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Response { session_id: s, proof: p, capabilities: c } => {
                prop_assert_eq!(s, session_id);
                prop_assert_eq!(p, proof);
                prop_assert_eq!(c, capabilities);
            }
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }
    }

    #[test]
    fn established_round_trips_for_arbitrary_fields(
        session_id in prop::array::uniform16(any::<u8>()),
        capabilities in any::<u32>(),
        heartbeat_interval_s in any::<u32>(),
        mtu in any::<u16>(),
        rekey_interval_s in any::<u32>(),
    ) {
        let msg = WireMessage::Established {
            session_id,
            capabilities,
            heartbeat_interval_s,
            mtu,
            rekey_interval_s,
        };
        let bytes = msg.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Established {
                session_id: s,
                capabilities: c,
                heartbeat_interval_s: h,
                mtu: m,
                rekey_interval_s: r,
            } => {
                prop_assert_eq!(s, session_id);
                prop_assert_eq!(c, capabilities);
                prop_assert_eq!(h, heartbeat_interval_s);
                prop_assert_eq!(m, mtu);
                prop_assert_eq!(r, rekey_interval_s);
            }
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }
    }

    #[test]
    fn error_and_close_round_trip_arbitrary_ascii_text(
        code in any::<u16>(),
        text in "[ -~]{0,64}",
    ) {
        let err = WireMessage::Error { code, message: text.clone() };
        match WireMessage::decode(&err.encode()).unwrap() {
            WireMessage::Error { code: c, message: m } => {
                prop_assert_eq!(c, code);
                prop_assert_eq!(m, text.clone());
            }
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }

        let close = WireMessage::Close { reason_code: code, reason: text.clone() };
        match WireMessage::decode(&close.encode()).unwrap() {
            WireMessage::Close { reason_code: r, reason } => {
                prop_assert_eq!(r, code);
                prop_assert_eq!(reason, text);
            }
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }
    }

    #[test]
    fn data_frame_payload_survives_arbitrary_bytes(
        payload in prop::collection::vec(any::<u8>(), 0..=aead::MAX_WIRE_PAYLOAD),
    ) {
        let msg = WireMessage::DataFrame { payload: payload.clone() };
        match WireMessage::decode(&msg.encode()).unwrap() {
            WireMessage::DataFrame { payload: p } => prop_assert_eq!(p, payload),
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }
    }

    #[test]
    fn aead_round_trips_for_arbitrary_key_counter_and_payload(
        key in prop::array::uniform32(any::<u8>()),
        counter in any::<u64>(),
        session_id_prefix in prop::array::uniform4(any::<u8>()),
        payload in prop::collection::vec(any::<u8>(), 0..=aead::MAX_INNER_FRAME),
        aad in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let wire = aead::encrypt(&payload, &key, counter, session_id_prefix, &aad).unwrap();
        let (decoded_counter, plaintext) = aead::decrypt(&wire, &key, session_id_prefix, &aad).unwrap();
        prop_assert_eq!(decoded_counter, counter);
        prop_assert_eq!(plaintext, payload);
    }

    #[test]
    fn aead_decrypt_fails_under_a_different_key(
        key in prop::array::uniform32(any::<u8>()),
        other_key in prop::array::uniform32(any::<u8>()),
        payload in prop::collection::vec(any::<u8>(), 1..256),
    ) {
        prop_assume!(key != other_key);
        let aad = [0u8; shadowmesh_core::frame::HEADER_SIZE];
        let wire = aead::encrypt(&payload, &key, 1, [0; 4], &aad).unwrap();
        prop_assert!(aead::decrypt(&wire, &other_key, [0; 4], &aad).is_err());
    }

    #[test]
    fn aead_decrypt_fails_under_tampered_aad(
        key in prop::array::uniform32(any::<u8>()),
        payload in prop::collection::vec(any::<u8>(), 1..256),
        aad_byte in any::<u8>(),
    ) {
        let aad = [aad_byte; shadowmesh_core::frame::HEADER_SIZE];
        let wire = aead::encrypt(&payload, &key, 1, [0; 4], &aad).unwrap();
        let tampered_aad = [aad_byte.wrapping_add(1); shadowmesh_core::frame::HEADER_SIZE];
        prop_assert!(aead::decrypt(&wire, &key, [0; 4], &tampered_aad).is_err());
    }

    #[test]
    fn session_key_derivation_is_deterministic_and_role_symmetric(
        session_id in prop::array::uniform16(any::<u8>()),
        initiator_peer_id in prop::array::uniform32(any::<u8>()),
        responder_peer_id in prop::array::uniform32(any::<u8>()),
    ) {
        let mut rng = rand_core::OsRng;
        let responder_identity = generate_hybrid_keypair(&mut rng, 0);
        let (_, shared_secret) = responder_identity.kem_public_key().encapsulate(&mut rng).unwrap();

        let initiator_keys =
            derive_session_keys(&shared_secret, &session_id, &initiator_peer_id, &responder_peer_id, true).unwrap();
        let responder_keys =
            derive_session_keys(&shared_secret, &session_id, &initiator_peer_id, &responder_peer_id, false).unwrap();
        let initiator_keys_again =
            derive_session_keys(&shared_secret, &session_id, &initiator_peer_id, &responder_peer_id, true).unwrap();

        prop_assert_eq!(initiator_keys.tx_key, responder_keys.rx_key);
        prop_assert_eq!(initiator_keys.rx_key, responder_keys.tx_key);
        prop_assert_eq!(initiator_keys.tx_key, initiator_keys_again.tx_key);
        prop_assert_eq!(initiator_keys.rx_key, initiator_keys_again.rx_key);
    }

    #[test]
    fn close_reason_round_trips_through_its_u16_discriminant(
        reason_index in 0u8..4,
    ) {
        let reason = match reason_index {
            0 => CloseReason::Normal,
            1 => CloseReason::IdleTimeout,
            2 => CloseReason::AdministrativeShutdown,
            _ => CloseReason::ProtocolViolation,
        };
        let msg = WireMessage::Close { reason_code: reason as u16, reason: "x".to_string() };
        match WireMessage::decode(&msg.encode()).unwrap() {
            WireMessage::Close { reason_code, .. } => prop_assert_eq!(reason_code, reason as u16),
            other => prop_assert!(false, "unexpected variant after decode: {:?}", other),
        }
    }
}
