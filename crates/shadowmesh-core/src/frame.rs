//! Wire codec (C4): common header plus typed payloads, bit-exact per §6.
//!
//! The codec performs only structural parsing and size validation; semantic
//! checks (signature verification, replay, handshake state) live in
//! [`crate::handshake`], [`crate::session`], and [`crate::pipeline`].

use shadowmesh_crypto::hybrid::{
    HybridCiphertext, HybridSignature, HYBRID_KEM_CIPHERTEXT_SIZE, HYBRID_KEM_PUBLIC_KEY_SIZE,
    HYBRID_SIGNATURE_SIZE,
};

use crate::error::FrameError;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
/// Common header size in bytes.
pub const HEADER_SIZE: usize = 8;
/// `flags` bit 0 on a HELLO message: this handshake is a rekey, not initial.
pub const FLAG_REKEY: u16 = 0x0001;

const PEER_ID_SIZE: usize = 32;
const SESSION_ID_SIZE: usize = 16;
const PROOF_NONCE_SIZE: usize = 24;
const PROOF_SIZE: usize = 32;
const CAPABILITIES_SIZE: usize = 4;
const TIMESTAMP_SIZE: usize = 8;

/// HELLO payload size: `peer_id || hybrid_kem_pub || hybrid_sig || timestamp`.
pub const HELLO_PAYLOAD_SIZE: usize =
    PEER_ID_SIZE + HYBRID_KEM_PUBLIC_KEY_SIZE + HYBRID_SIGNATURE_SIZE + TIMESTAMP_SIZE;
/// CHALLENGE payload size: `peer_id || session_id || hybrid_ct || proof_nonce || hybrid_sig || timestamp`.
pub const CHALLENGE_PAYLOAD_SIZE: usize = PEER_ID_SIZE
    + SESSION_ID_SIZE
    + HYBRID_KEM_CIPHERTEXT_SIZE
    + PROOF_NONCE_SIZE
    + HYBRID_SIGNATURE_SIZE
    + TIMESTAMP_SIZE;
/// RESPONSE payload size: `session_id || proof || capabilities`.
pub const RESPONSE_PAYLOAD_SIZE: usize = SESSION_ID_SIZE + PROOF_SIZE + CAPABILITIES_SIZE;
/// ESTABLISHED payload size: `session_id || capabilities || heartbeat_interval_s || mtu || rekey_interval_s`.
pub const ESTABLISHED_PAYLOAD_SIZE: usize = SESSION_ID_SIZE + CAPABILITIES_SIZE + 4 + 2 + 4;

/// Message type byte values (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initiator -> Responder: opening handshake message.
    Hello = 0x01,
    /// Responder -> Initiator: KEM ciphertext and proof challenge.
    Challenge = 0x02,
    /// Initiator -> Responder: HMAC proof of shared-secret possession.
    Response = 0x03,
    /// Responder -> Initiator: negotiated session parameters.
    Established = 0x04,
    /// Liveness probe.
    Heartbeat = 0x05,
    /// Liveness probe reply.
    HeartbeatAck = 0x06,
    /// Structured error report.
    Error = 0x0E,
    /// Graceful teardown notice.
    Close = 0x0F,
    /// Encrypted tunnel payload.
    DataFrame = 0x10,
}

impl MessageType {
    fn from_byte(b: u8) -> Result<Self, FrameError> {
        match b {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Challenge),
            0x03 => Ok(Self::Response),
            0x04 => Ok(Self::Established),
            0x05 => Ok(Self::Heartbeat),
            0x06 => Ok(Self::HeartbeatAck),
            0x0E => Ok(Self::Error),
            0x0F => Ok(Self::Close),
            0x10 => Ok(Self::DataFrame),
            other => Err(FrameError::InvalidMessageType(other)),
        }
    }
}

/// Common 8-byte header, parsed and validated but not yet matched to a
/// payload.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Wire protocol version.
    pub version: u8,
    /// Message type.
    pub message_type: MessageType,
    /// Flags bitfield (bit 0: rekey, for HELLO).
    pub flags: u16,
    /// Declared payload length in bytes.
    pub length: u32,
}

impl Header {
    fn encode(self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
    }

    /// Parse the 8-byte common header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] if `buf` is shorter than
    /// [`HEADER_SIZE`], [`FrameError::InvalidProtocolVersion`] on an
    /// unrecognized version, or [`FrameError::InvalidMessageType`] on an
    /// unrecognized type byte.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::InvalidProtocolVersion(version));
        }
        let message_type = MessageType::from_byte(buf[1])?;
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            version,
            message_type,
            flags,
            length,
        })
    }

    /// The 8 header bytes, used as AEAD associated data for DATA_FRAME.
    #[must_use]
    pub fn as_aad_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.message_type as u8;
        out[2..4].copy_from_slice(&self.flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// A fully decoded wire message: header plus typed payload.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// HELLO payload fields.
    Hello {
        /// Whether flags bit 0 (rekey) was set.
        rekey: bool,
        /// Initiator's `PeerId` bytes.
        peer_id: [u8; 32],
        /// Initiator's hybrid KEM public key bundle, encoded.
        hybrid_kem_public: Box<[u8; HYBRID_KEM_PUBLIC_KEY_SIZE]>,
        /// Hybrid signature over `peer_id || hybrid_kem_public || timestamp_ns`.
        signature: HybridSignature,
        /// Handshake timestamp, nanoseconds since Unix epoch.
        timestamp_ns: u64,
    },
    /// CHALLENGE payload fields.
    Challenge {
        /// Responder's `PeerId` bytes.
        peer_id: [u8; 32],
        /// Fresh session identifier chosen by the responder.
        session_id: [u8; 16],
        /// Hybrid KEM ciphertext for the initiator's public key.
        ciphertext: HybridCiphertext,
        /// 24-byte proof nonce the initiator must HMAC in RESPONSE.
        proof_nonce: [u8; 24],
        /// Hybrid signature over `peer_id || session_id || ciphertext || proof_nonce || timestamp_ns`.
        signature: HybridSignature,
        /// Handshake timestamp, nanoseconds since Unix epoch.
        timestamp_ns: u64,
    },
    /// RESPONSE payload fields.
    Response {
        /// Echoed `session_id` from CHALLENGE.
        session_id: [u8; 16],
        /// `HMAC-SHA256(shared_secret, proof_nonce)`.
        proof: [u8; 32],
        /// Client capability bitfield.
        capabilities: u32,
    },
    /// ESTABLISHED payload fields.
    Established {
        /// Session identifier (confirmation echo).
        session_id: [u8; 16],
        /// Server capability bitfield.
        capabilities: u32,
        /// Negotiated heartbeat interval, seconds.
        heartbeat_interval_s: u32,
        /// Negotiated frame-payload MTU.
        mtu: u16,
        /// Negotiated rekey interval, seconds.
        rekey_interval_s: u32,
    },
    /// Liveness probe (empty payload).
    Heartbeat,
    /// Liveness probe reply (empty payload).
    HeartbeatAck,
    /// Encrypted tunnel payload: `counter || ciphertext_and_tag`.
    DataFrame {
        /// Raw AEAD wire payload as produced by `shadowmesh_crypto::aead::encrypt`.
        payload: Vec<u8>,
    },
    /// Structured error report.
    Error {
        /// Error code (§6).
        code: u16,
        /// Human-readable UTF-8 message.
        message: String,
    },
    /// Graceful teardown notice.
    Close {
        /// Reason code (§6).
        reason_code: u16,
        /// Human-readable UTF-8 reason.
        reason: String,
    },
}

/// Error code values for the ERROR message (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Header `version` byte not recognized.
    InvalidProtocolVersion = 0x0001,
    /// Header `type` byte not recognized, or invalid post-handshake.
    InvalidMessageType = 0x0002,
    /// Hybrid signature verification failed.
    InvalidSignature = 0x0003,
    /// Handshake exceeded its 30 s wall-clock budget.
    HandshakeTimeout = 0x0004,
    /// AEAD authentication failed on a DATA_FRAME.
    DecryptionFailure = 0x0005,
    /// Frame counter was not greater than `rx_last_counter`.
    ReplayDetected = 0x0006,
    /// Peer requested a capability we do not support.
    UnsupportedFeature = 0x0007,
    /// Source address exceeded the HELLO rate limit.
    RateLimitExceeded = 0x0008,
    /// Unclassified internal failure.
    InternalError = 0x00FF,
}

/// Reason code values for the CLOSE message (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Ordinary application-requested shutdown.
    Normal = 0x0000,
    /// Heartbeat ACKs missing three times in a row.
    IdleTimeout = 0x0001,
    /// Operator- or caller-initiated shutdown.
    AdministrativeShutdown = 0x0002,
    /// Peer violated the protocol (unexpected message, bad parse).
    ProtocolViolation = 0x0003,
}

impl WireMessage {
    /// Encode this message to its full wire form (header + payload).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (message_type, flags, payload) = self.encode_payload();
        let header = Header {
            version: PROTOCOL_VERSION,
            message_type,
            flags,
            length: payload.len() as u32,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        header.encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    fn encode_payload(&self) -> (MessageType, u16, Vec<u8>) {
        match self {
            Self::Hello {
                rekey,
                peer_id,
                hybrid_kem_public,
                signature,
                timestamp_ns,
            } => {
                let mut payload = Vec::with_capacity(HELLO_PAYLOAD_SIZE);
                payload.extend_from_slice(peer_id);
                payload.extend_from_slice(hybrid_kem_public.as_ref());
                payload.extend_from_slice(signature.to_bytes().as_ref());
                payload.extend_from_slice(&timestamp_ns.to_be_bytes());
                let flags = if *rekey { FLAG_REKEY } else { 0 };
                (MessageType::Hello, flags, payload)
            }
            Self::Challenge {
                peer_id,
                session_id,
                ciphertext,
                proof_nonce,
                signature,
                timestamp_ns,
            } => {
                let mut payload = Vec::with_capacity(CHALLENGE_PAYLOAD_SIZE);
                payload.extend_from_slice(peer_id);
                payload.extend_from_slice(session_id);
                payload.extend_from_slice(ciphertext.to_bytes().as_ref());
                payload.extend_from_slice(proof_nonce);
                payload.extend_from_slice(signature.to_bytes().as_ref());
                payload.extend_from_slice(&timestamp_ns.to_be_bytes());
                (MessageType::Challenge, 0, payload)
            }
            Self::Response {
                session_id,
                proof,
                capabilities,
            } => {
                let mut payload = Vec::with_capacity(RESPONSE_PAYLOAD_SIZE);
                payload.extend_from_slice(session_id);
                payload.extend_from_slice(proof);
                payload.extend_from_slice(&capabilities.to_be_bytes());
                (MessageType::Response, 0, payload)
            }
            Self::Established {
                session_id,
                capabilities,
                heartbeat_interval_s,
                mtu,
                rekey_interval_s,
            } => {
                let mut payload = Vec::with_capacity(ESTABLISHED_PAYLOAD_SIZE);
                payload.extend_from_slice(session_id);
                payload.extend_from_slice(&capabilities.to_be_bytes());
                payload.extend_from_slice(&heartbeat_interval_s.to_be_bytes());
                payload.extend_from_slice(&mtu.to_be_bytes());
                payload.extend_from_slice(&rekey_interval_s.to_be_bytes());
                (MessageType::Established, 0, payload)
            }
            Self::Heartbeat => (MessageType::Heartbeat, 0, Vec::new()),
            Self::HeartbeatAck => (MessageType::HeartbeatAck, 0, Vec::new()),
            Self::DataFrame { payload } => (MessageType::DataFrame, 0, payload.clone()),
            Self::Error { code, message } => {
                let mut payload = Vec::with_capacity(2 + message.len());
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(message.as_bytes());
                (MessageType::Error, 0, payload)
            }
            Self::Close { reason_code, reason } => {
                let mut payload = Vec::with_capacity(2 + reason.len());
                payload.extend_from_slice(&reason_code.to_be_bytes());
                payload.extend_from_slice(reason.as_bytes());
                (MessageType::Close, 0, payload)
            }
        }
    }

    /// Decode a full wire message (header + payload) from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] on any structural problem: short buffer,
    /// unknown version/type, declared length exceeding the buffer, or a
    /// payload size mismatched to its message type's fixed layout.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = Header::decode(buf)?;
        let payload = &buf[HEADER_SIZE..];
        if (header.length as usize) > payload.len() {
            return Err(FrameError::MalformedMessage {
                length: header.length,
                remaining: payload.len(),
            });
        }
        let payload = &payload[..header.length as usize];
        Self::decode_payload(header, payload)
    }

    fn decode_payload(header: Header, payload: &[u8]) -> Result<Self, FrameError> {
        let expect_size = |expected: usize| -> Result<(), FrameError> {
            if payload.len() != expected {
                return Err(FrameError::MalformedPayload {
                    message_type: header.message_type as u8,
                    expected,
                    actual: payload.len(),
                });
            }
            Ok(())
        };

        match header.message_type {
            MessageType::Hello => {
                expect_size(HELLO_PAYLOAD_SIZE)?;
                let mut cursor = payload;
                let peer_id = take_array::<32>(&mut cursor);
                let hybrid_kem_public =
                    Box::new(take_array::<HYBRID_KEM_PUBLIC_KEY_SIZE>(&mut cursor));
                let sig_bytes = take_array::<HYBRID_SIGNATURE_SIZE>(&mut cursor);
                let timestamp_ns = u64::from_be_bytes(take_array::<8>(&mut cursor));
                Ok(Self::Hello {
                    rekey: header.flags & FLAG_REKEY != 0,
                    peer_id,
                    hybrid_kem_public,
                    signature: HybridSignature::from_bytes(&sig_bytes),
                    timestamp_ns,
                })
            }
            MessageType::Challenge => {
                expect_size(CHALLENGE_PAYLOAD_SIZE)?;
                let mut cursor = payload;
                let peer_id = take_array::<32>(&mut cursor);
                let session_id = take_array::<16>(&mut cursor);
                let ct_bytes = take_array::<HYBRID_KEM_CIPHERTEXT_SIZE>(&mut cursor);
                let proof_nonce = take_array::<24>(&mut cursor);
                let sig_bytes = take_array::<HYBRID_SIGNATURE_SIZE>(&mut cursor);
                let timestamp_ns = u64::from_be_bytes(take_array::<8>(&mut cursor));
                Ok(Self::Challenge {
                    peer_id,
                    session_id,
                    ciphertext: HybridCiphertext::from_bytes(&ct_bytes),
                    proof_nonce,
                    signature: HybridSignature::from_bytes(&sig_bytes),
                    timestamp_ns,
                })
            }
            MessageType::Response => {
                expect_size(RESPONSE_PAYLOAD_SIZE)?;
                let mut cursor = payload;
                let session_id = take_array::<16>(&mut cursor);
                let proof = take_array::<32>(&mut cursor);
                let capabilities = u32::from_be_bytes(take_array::<4>(&mut cursor));
                Ok(Self::Response {
                    session_id,
                    proof,
                    capabilities,
                })
            }
            MessageType::Established => {
                expect_size(ESTABLISHED_PAYLOAD_SIZE)?;
                let mut cursor = payload;
                let session_id = take_array::<16>(&mut cursor);
                let capabilities = u32::from_be_bytes(take_array::<4>(&mut cursor));
                let heartbeat_interval_s = u32::from_be_bytes(take_array::<4>(&mut cursor));
                let mtu = u16::from_be_bytes(take_array::<2>(&mut cursor));
                let rekey_interval_s = u32::from_be_bytes(take_array::<4>(&mut cursor));
                Ok(Self::Established {
                    session_id,
                    capabilities,
                    heartbeat_interval_s,
                    mtu,
                    rekey_interval_s,
                })
            }
            MessageType::Heartbeat => {
                expect_size(0)?;
                Ok(Self::Heartbeat)
            }
            MessageType::HeartbeatAck => {
                expect_size(0)?;
                Ok(Self::HeartbeatAck)
            }
            MessageType::DataFrame => Ok(Self::DataFrame {
                payload: payload.to_vec(),
            }),
            MessageType::Error => {
                if payload.len() < 2 {
                    return Err(FrameError::MalformedPayload {
                        message_type: header.message_type as u8,
                        expected: 2,
                        actual: payload.len(),
                    });
                }
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let message = String::from_utf8_lossy(&payload[2..]).into_owned();
                Ok(Self::Error { code, message })
            }
            MessageType::Close => {
                if payload.len() < 2 {
                    return Err(FrameError::MalformedPayload {
                        message_type: header.message_type as u8,
                        expected: 2,
                        actual: payload.len(),
                    });
                }
                let reason_code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                Ok(Self::Close {
                    reason_code,
                    reason,
                })
            }
        }
    }
}

/// Pull a fixed-size array off the front of `cursor`, advancing it.
///
/// # Panics
///
/// Panics if `cursor` has fewer than `N` bytes remaining. Callers only
/// invoke this after `expect_size` has already validated total payload
/// length, so this is an internal invariant, not a reachable user input.
fn take_array<const N: usize>(cursor: &mut &[u8]) -> [u8; N] {
    let (head, tail) = cursor.split_at(N);
    *cursor = tail;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use shadowmesh_crypto::hybrid::generate_hybrid_keypair;

    #[test]
    fn heartbeat_round_trips() {
        let msg = WireMessage::Heartbeat;
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert!(matches!(decoded, WireMessage::Heartbeat));
    }

    #[test]
    fn response_round_trips() {
        let msg = WireMessage::Response {
            session_id: [7u8; 16],
            proof: [9u8; 32],
            capabilities: 0b101,
        };
        let bytes = msg.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Response {
                session_id,
                proof,
                capabilities,
            } => {
                assert_eq!(session_id, [7u8; 16]);
                assert_eq!(proof, [9u8; 32]);
                assert_eq!(capabilities, 0b101);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn established_round_trips() {
        let msg = WireMessage::Established {
            session_id: [1u8; 16],
            capabilities: 2,
            heartbeat_interval_s: 20,
            mtu: 1500,
            rekey_interval_s: 3600,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + ESTABLISHED_PAYLOAD_SIZE);
        let decoded = WireMessage::decode(&bytes).unwrap();
        match decoded {
            WireMessage::Established { mtu, .. } => assert_eq!(mtu, 1500),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn hello_round_trips_with_real_hybrid_material() {
        let kp = generate_hybrid_keypair(&mut OsRng, 0);
        let kem_pub = kp.kem_public_key().to_bytes();
        let sig = kp.sign(b"signed payload");
        let msg = WireMessage::Hello {
            rekey: true,
            peer_id: *kp.peer_id().as_bytes(),
            hybrid_kem_public: kem_pub,
            signature: sig,
            timestamp_ns: 123_456_789,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + HELLO_PAYLOAD_SIZE);
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Hello {
                rekey, timestamp_ns, ..
            } => {
                assert!(rekey);
                assert_eq!(timestamp_ns, 123_456_789);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_and_close_carry_utf8_text() {
        let err = WireMessage::Error {
            code: ErrorCode::InvalidSignature as u16,
            message: "bad signature".to_string(),
        };
        let bytes = err.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::InvalidSignature as u16);
                assert_eq!(message, "bad signature");
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        let close = WireMessage::Close {
            reason_code: CloseReason::IdleTimeout as u16,
            reason: "no heartbeat ack".to_string(),
        };
        let bytes = close.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Close {
                reason_code,
                reason,
            } => {
                assert_eq!(reason_code, CloseReason::IdleTimeout as u16);
                assert_eq!(reason, "no heartbeat ack");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = WireMessage::Heartbeat.encode();
        bytes[0] = 7;
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(FrameError::InvalidProtocolVersion(7))
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = WireMessage::Heartbeat.encode();
        bytes[1] = 0x7F;
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(FrameError::InvalidMessageType(0x7F))
        ));
    }

    #[test]
    fn length_exceeding_buffer_rejected() {
        let mut bytes = WireMessage::Heartbeat.encode();
        bytes[4..8].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(FrameError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn too_short_buffer_rejected() {
        let bytes = [0u8; 4];
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn data_frame_preserves_opaque_payload() {
        let payload = vec![1, 2, 3, 4, 5];
        let msg = WireMessage::DataFrame {
            payload: payload.clone(),
        };
        let bytes = msg.encode();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::DataFrame { payload: decoded } => assert_eq!(decoded, payload),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
