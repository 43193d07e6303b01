//! Hybrid authenticated key exchange state machine (C6).
//!
//! Four messages, two roles:
//!
//! ```text
//! Initiator                          Responder
//!    |-------------- HELLO --------------->|
//!    |<------------ CHALLENGE -------------|
//!    |-------------- RESPONSE ------------>|
//!    |<----------- ESTABLISHED ------------|
//! ```
//!
//! Both HELLO and CHALLENGE carry a hybrid signature over their own fields;
//! RESPONSE carries an HMAC proof that the initiator actually decapsulated
//! the CHALLENGE ciphertext. A session is only installed once ESTABLISHED
//! has been sent (responder) or received (initiator).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand_core::{CryptoRng, RngCore};
use tracing::{debug, warn};

use shadowmesh_crypto::hybrid::{
    self, HybridCiphertext, HybridKeypair, HybridSignature, HybridVerifyKey, PeerId,
};
use shadowmesh_crypto::kdf;
use shadowmesh_crypto::random;
use shadowmesh_crypto::session_keys::{self, SessionKeyPair};

use crate::error::HandshakeError;
use crate::frame::WireMessage;

/// Maximum tolerated clock skew between HELLO/CHALLENGE timestamp and local
/// clock (§4.4).
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(300);
/// Wall-clock budget for a handshake to reach `Established` (§4.4).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum HELLOs accepted per source address per rolling minute (§4.4).
pub const HELLO_RATE_LIMIT_PER_MINUTE: u32 = 10;

/// Which side of the handshake this state machine is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends HELLO first, verifies CHALLENGE, sends RESPONSE.
    Initiator,
    /// Receives HELLO, sends CHALLENGE, verifies RESPONSE, sends ESTABLISHED.
    Responder,
}

/// Handshake progress, named per the message last sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No message exchanged yet.
    Idle,
    /// Initiator has sent HELLO, awaiting CHALLENGE.
    HelloSent,
    /// Responder has sent CHALLENGE, awaiting RESPONSE.
    ChallengeSent,
    /// Initiator has sent RESPONSE, awaiting ESTABLISHED.
    ResponseSent,
    /// Both sides agree on session keys.
    Established,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::HelloSent => "HelloSent",
            Self::ChallengeSent => "ChallengeSent",
            Self::ResponseSent => "ResponseSent",
            Self::Established => "Established",
        }
    }
}

/// Outcome of installing the session once a handshake completes.
pub struct EstablishedSession {
    /// Negotiated session identifier.
    pub session_id: [u8; 16],
    /// Peer's `PeerId`.
    pub peer_id: PeerId,
    /// Derived per-direction keys.
    pub keys: SessionKeyPair,
    /// Whether this endpoint was the initiator.
    pub is_initiator: bool,
    /// Capability bitfield negotiated with the peer.
    pub capabilities: u32,
    /// Heartbeat interval, seconds (responder's choice, echoed in ESTABLISHED).
    pub heartbeat_interval_s: u32,
    /// Frame-payload MTU (responder's choice, echoed in ESTABLISHED).
    pub mtu: u16,
    /// Rekey interval, seconds (responder's choice, echoed in ESTABLISHED).
    pub rekey_interval_s: u32,
}

/// Capability bit: this endpoint can relay frames for other peers.
pub const CAP_MULTI_HOP: u32 = 1 << 0;
/// Capability bit: this endpoint applies transport-level obfuscation.
pub const CAP_OBFUSCATION: u32 = 1 << 1;
/// Capability bit: this endpoint tunnels IPv6 traffic.
pub const CAP_IPV6: u32 = 1 << 2;

/// Drives one side of the handshake state machine.
///
/// `drive` consumes an inbound [`WireMessage`] (or `None` to produce the
/// first outgoing message) and returns the next outgoing message, if any,
/// plus the session once `ESTABLISHED` is reached.
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    local_identity: Arc<HybridKeypair>,
    peer_verify_key: Option<HybridVerifyKey>,
    rekey: bool,
    capabilities: u32,
    heartbeat_interval_s: u32,
    mtu: u16,
    rekey_interval_s: u32,
    started_at: std::time::Instant,

    // Initiator-side state carried between HELLO and RESPONSE.
    shared_secret: Option<shadowmesh_crypto::hybrid::HybridSharedSecret>,
    session_id: Option<[u8; 16]>,

    // Responder-side state carried between HELLO receipt and RESPONSE verification.
    proof_nonce: Option<[u8; 24]>,
    initiator_peer_id: Option<PeerId>,
}

impl Handshake {
    /// Begin a new handshake. `peer_verify_key` must be known in advance
    /// (ShadowMesh authenticates to a configured peer, not to anyone who
    /// shows up — there is no trust-on-first-use in this design).
    #[must_use]
    pub fn new(
        role: HandshakeRole,
        local_identity: Arc<HybridKeypair>,
        peer_verify_key: HybridVerifyKey,
        rekey: bool,
        capabilities: u32,
        heartbeat_interval_s: u32,
        mtu: u16,
        rekey_interval_s: u32,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            local_identity,
            peer_verify_key: Some(peer_verify_key),
            rekey,
            capabilities,
            heartbeat_interval_s,
            mtu,
            rekey_interval_s,
            started_at: std::time::Instant::now(),
            shared_secret: None,
            session_id: None,
            proof_nonce: None,
            initiator_peer_id: None,
        }
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Which side of the handshake this instance is driving.
    #[must_use]
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Whether this handshake has exceeded [`HANDSHAKE_TIMEOUT`].
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.started_at.elapsed() >= HANDSHAKE_TIMEOUT
    }

    /// Produce the initial outgoing message. Only valid for the initiator,
    /// in state `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::UnexpectedMessage`] if called by the
    /// responder or outside `Idle`.
    pub fn initiate<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<WireMessage, HandshakeError> {
        if self.role != HandshakeRole::Initiator || self.state != HandshakeState::Idle {
            return Err(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
            });
        }
        let kem_public = self.local_identity.kem_public_key();
        let kem_public_bytes = kem_public.to_bytes();
        let timestamp_ns = now_unix_ns();

        let mut signed = Vec::with_capacity(32 + kem_public_bytes.len() + 8);
        signed.extend_from_slice(self.local_identity.peer_id().as_bytes());
        signed.extend_from_slice(kem_public_bytes.as_ref());
        signed.extend_from_slice(&timestamp_ns.to_be_bytes());
        let signature = self.local_identity.sign(&signed);

        self.state = HandshakeState::HelloSent;

        Ok(WireMessage::Hello {
            rekey: self.rekey,
            peer_id: *self.local_identity.peer_id().as_bytes(),
            hybrid_kem_public: kem_public_bytes,
            signature,
            timestamp_ns,
        })
    }

    /// Feed an inbound message into the state machine, producing the next
    /// outbound message (if any) and, once the handshake reaches
    /// `ESTABLISHED`, the installed session parameters.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] if the message is not valid in the
    /// current state, fails signature/proof verification, or the embedded
    /// timestamp is outside [`CLOCK_SKEW_TOLERANCE`].
    pub fn drive<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        inbound: WireMessage,
    ) -> Result<(Option<WireMessage>, Option<EstablishedSession>), HandshakeError> {
        if self.timed_out() {
            return Err(HandshakeError::HandshakeTimeout);
        }
        match (self.role, self.state) {
            (HandshakeRole::Responder, HandshakeState::Idle) if matches!(inbound, WireMessage::Hello { .. }) => {
                self.handle_hello(rng, inbound_as_hello(inbound))
            }
            (HandshakeRole::Initiator, HandshakeState::HelloSent)
                if matches!(inbound, WireMessage::Challenge { .. }) =>
            {
                self.handle_challenge(inbound_as_challenge(inbound))
            }
            (HandshakeRole::Responder, HandshakeState::ChallengeSent)
                if matches!(inbound, WireMessage::Response { .. }) =>
            {
                self.handle_response(inbound_as_response(inbound))
            }
            (HandshakeRole::Initiator, HandshakeState::ResponseSent)
                if matches!(inbound, WireMessage::Established { .. }) =>
            {
                self.handle_established(inbound_as_established(inbound))
            }
            _ => Err(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
            }),
        }
    }

    fn handle_hello<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        hello: HelloFields,
    ) -> Result<(Option<WireMessage>, Option<EstablishedSession>), HandshakeError> {
        check_clock_skew(hello.timestamp_ns)?;

        let peer_verify_key = self
            .peer_verify_key
            .as_ref()
            .ok_or(HandshakeError::InvalidSignature)?;

        let mut signed = Vec::with_capacity(32 + hello.hybrid_kem_public.len() + 8);
        signed.extend_from_slice(&hello.peer_id);
        signed.extend_from_slice(hello.hybrid_kem_public.as_ref());
        signed.extend_from_slice(&hello.timestamp_ns.to_be_bytes());
        if !peer_verify_key.verify(&signed, &hello.signature) {
            warn!("handshake: HELLO signature verification failed");
            return Err(HandshakeError::InvalidSignature);
        }

        let kem_public = shadowmesh_crypto::hybrid::HybridKemPublicKey::from_bytes(
            &hello.hybrid_kem_public,
        )
        .map_err(|_| HandshakeError::InvalidSignature)?;
        let (ciphertext, shared_secret) = kem_public
            .encapsulate(rng)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let session_id = random::random_16().map_err(|_| HandshakeError::InvalidSignature)?;
        let proof_nonce = random::random_24().map_err(|_| HandshakeError::InvalidSignature)?;
        let timestamp_ns = now_unix_ns();
        let responder_peer_id = self.local_identity.peer_id();

        let mut signed_challenge = Vec::new();
        signed_challenge.extend_from_slice(responder_peer_id.as_bytes());
        signed_challenge.extend_from_slice(&session_id);
        signed_challenge.extend_from_slice(ciphertext.to_bytes().as_ref());
        signed_challenge.extend_from_slice(&proof_nonce);
        signed_challenge.extend_from_slice(&timestamp_ns.to_be_bytes());
        let signature = self.local_identity.sign(&signed_challenge);

        self.shared_secret = Some(shared_secret);
        self.session_id = Some(session_id);
        self.proof_nonce = Some(proof_nonce);
        self.initiator_peer_id = Some(PeerId::from_bytes(hello.peer_id));
        self.state = HandshakeState::ChallengeSent;

        debug!("handshake: responder emitting CHALLENGE");
        Ok((
            Some(WireMessage::Challenge {
                peer_id: *responder_peer_id.as_bytes(),
                session_id,
                ciphertext,
                proof_nonce,
                signature,
                timestamp_ns,
            }),
            None,
        ))
    }

    fn handle_challenge(
        &mut self,
        challenge: ChallengeFields,
    ) -> Result<(Option<WireMessage>, Option<EstablishedSession>), HandshakeError> {
        check_clock_skew(challenge.timestamp_ns)?;

        let peer_verify_key = self
            .peer_verify_key
            .as_ref()
            .ok_or(HandshakeError::InvalidSignature)?;

        let mut signed = Vec::new();
        signed.extend_from_slice(&challenge.peer_id);
        signed.extend_from_slice(&challenge.session_id);
        signed.extend_from_slice(challenge.ciphertext.to_bytes().as_ref());
        signed.extend_from_slice(&challenge.proof_nonce);
        signed.extend_from_slice(&challenge.timestamp_ns.to_be_bytes());
        if !peer_verify_key.verify(&signed, &challenge.signature) {
            warn!("handshake: CHALLENGE signature verification failed");
            return Err(HandshakeError::InvalidSignature);
        }

        let shared_secret = self
            .local_identity
            .decapsulate(&challenge.ciphertext)
            .map_err(|_| HandshakeError::InvalidProof)?;
        let proof = kdf::hmac_sha256(shared_secret.as_bytes(), &challenge.proof_nonce)
            .map_err(|_| HandshakeError::InvalidProof)?;

        self.shared_secret = Some(shared_secret);
        self.session_id = Some(challenge.session_id);
        self.state = HandshakeState::ResponseSent;

        debug!("handshake: initiator emitting RESPONSE");
        Ok((
            Some(WireMessage::Response {
                session_id: challenge.session_id,
                proof,
                capabilities: self.capabilities,
            }),
            None,
        ))
    }

    fn handle_response(
        &mut self,
        response: ResponseFields,
    ) -> Result<(Option<WireMessage>, Option<EstablishedSession>), HandshakeError> {
        let shared_secret = self
            .shared_secret
            .as_ref()
            .ok_or(HandshakeError::InvalidProof)?;
        let proof_nonce = self.proof_nonce.ok_or(HandshakeError::InvalidProof)?;
        let session_id = self.session_id.ok_or(HandshakeError::InvalidProof)?;
        if response.session_id != session_id {
            return Err(HandshakeError::InvalidProof);
        }
        if !kdf::hmac_sha256_verify(shared_secret.as_bytes(), &proof_nonce, &response.proof) {
            warn!("handshake: RESPONSE proof verification failed");
            return Err(HandshakeError::InvalidProof);
        }

        let initiator_peer_id = self
            .initiator_peer_id
            .ok_or(HandshakeError::InvalidProof)?;
        let responder_peer_id = self.local_identity.peer_id();
        let keys = session_keys::derive_session_keys(
            shared_secret,
            &session_id,
            initiator_peer_id.as_bytes(),
            responder_peer_id.as_bytes(),
            false,
        )
        .map_err(|_| HandshakeError::InvalidProof)?;

        self.state = HandshakeState::Established;
        let negotiated_capabilities = self.capabilities & response.capabilities;

        debug!("handshake: responder emitting ESTABLISHED");
        Ok((
            Some(WireMessage::Established {
                session_id,
                capabilities: negotiated_capabilities,
                heartbeat_interval_s: self.heartbeat_interval_s,
                mtu: self.mtu,
                rekey_interval_s: self.rekey_interval_s,
            }),
            Some(EstablishedSession {
                session_id,
                peer_id: initiator_peer_id,
                keys,
                is_initiator: false,
                capabilities: negotiated_capabilities,
                heartbeat_interval_s: self.heartbeat_interval_s,
                mtu: self.mtu,
                rekey_interval_s: self.rekey_interval_s,
            }),
        ))
    }

    fn handle_established(
        &mut self,
        established: EstablishedFields,
    ) -> Result<(Option<WireMessage>, Option<EstablishedSession>), HandshakeError> {
        let shared_secret = self
            .shared_secret
            .as_ref()
            .ok_or(HandshakeError::InvalidProof)?;
        let session_id = self.session_id.ok_or(HandshakeError::InvalidProof)?;
        if established.session_id != session_id {
            return Err(HandshakeError::InvalidProof);
        }

        let peer_verify_key = self
            .peer_verify_key
            .as_ref()
            .ok_or(HandshakeError::InvalidProof)?;
        let responder_peer_id = peer_verify_key.peer_id();
        let initiator_peer_id = self.local_identity.peer_id();
        let keys = session_keys::derive_session_keys(
            shared_secret,
            &session_id,
            initiator_peer_id.as_bytes(),
            responder_peer_id.as_bytes(),
            true,
        )
        .map_err(|_| HandshakeError::InvalidProof)?;

        self.state = HandshakeState::Established;
        debug!("handshake: initiator reached ESTABLISHED");
        Ok((
            None,
            Some(EstablishedSession {
                session_id,
                peer_id: responder_peer_id,
                keys,
                is_initiator: true,
                capabilities: established.capabilities,
                heartbeat_interval_s: established.heartbeat_interval_s,
                mtu: established.mtu,
                rekey_interval_s: established.rekey_interval_s,
            }),
        ))
    }
}

fn check_clock_skew(timestamp_ns: u64) -> Result<(), HandshakeError> {
    let now_ns = now_unix_ns();
    let delta_ns = now_ns.abs_diff(timestamp_ns);
    if Duration::from_nanos(delta_ns) > CLOCK_SKEW_TOLERANCE {
        return Err(HandshakeError::ClockSkew);
    }
    Ok(())
}

fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct HelloFields {
    peer_id: [u8; 32],
    hybrid_kem_public: Box<[u8; hybrid::HYBRID_KEM_PUBLIC_KEY_SIZE]>,
    signature: HybridSignature,
    timestamp_ns: u64,
}

struct ChallengeFields {
    peer_id: [u8; 32],
    session_id: [u8; 16],
    ciphertext: HybridCiphertext,
    proof_nonce: [u8; 24],
    signature: HybridSignature,
    timestamp_ns: u64,
}

struct ResponseFields {
    session_id: [u8; 16],
    proof: [u8; 32],
    capabilities: u32,
}

struct EstablishedFields {
    session_id: [u8; 16],
    capabilities: u32,
    heartbeat_interval_s: u32,
    mtu: u16,
    rekey_interval_s: u32,
}

fn inbound_as_hello(msg: WireMessage) -> HelloFields {
    match msg {
        WireMessage::Hello {
            peer_id,
            hybrid_kem_public,
            signature,
            timestamp_ns,
            ..
        } => HelloFields {
            peer_id,
            hybrid_kem_public,
            signature,
            timestamp_ns,
        },
        _ => unreachable!("caller already matched on WireMessage::Hello"),
    }
}

fn inbound_as_challenge(msg: WireMessage) -> ChallengeFields {
    match msg {
        WireMessage::Challenge {
            peer_id,
            session_id,
            ciphertext,
            proof_nonce,
            signature,
            timestamp_ns,
        } => ChallengeFields {
            peer_id,
            session_id,
            ciphertext,
            proof_nonce,
            signature,
            timestamp_ns,
        },
        _ => unreachable!("caller already matched on WireMessage::Challenge"),
    }
}

fn inbound_as_response(msg: WireMessage) -> ResponseFields {
    match msg {
        WireMessage::Response {
            session_id,
            proof,
            capabilities,
        } => ResponseFields {
            session_id,
            proof,
            capabilities,
        },
        _ => unreachable!("caller already matched on WireMessage::Response"),
    }
}

fn inbound_as_established(msg: WireMessage) -> EstablishedFields {
    match msg {
        WireMessage::Established {
            session_id,
            capabilities,
            heartbeat_interval_s,
            mtu,
            rekey_interval_s,
        } => EstablishedFields {
            session_id,
            capabilities,
            heartbeat_interval_s,
            mtu,
            rekey_interval_s,
        },
        _ => unreachable!("caller already matched on WireMessage::Established"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use shadowmesh_crypto::hybrid::generate_hybrid_keypair;

    fn build_pair(rekey: bool) -> (Handshake, Handshake) {
        let initiator_identity = generate_hybrid_keypair(&mut OsRng, 0);
        let responder_identity = generate_hybrid_keypair(&mut OsRng, 0);
        let initiator_verify_key = initiator_identity.verify_key();
        let responder_verify_key = responder_identity.verify_key();

        let initiator = Handshake::new(
            HandshakeRole::Initiator,
            Arc::new(initiator_identity),
            responder_verify_key,
            rekey,
            CAP_OBFUSCATION,
            20,
            1500,
            3600,
        );
        let responder = Handshake::new(
            HandshakeRole::Responder,
            Arc::new(responder_identity),
            initiator_verify_key,
            false,
            CAP_OBFUSCATION | CAP_MULTI_HOP,
            20,
            1500,
            3600,
        );
        (initiator, responder)
    }

    #[test]
    fn full_handshake_installs_matching_session_on_both_sides() {
        let (mut initiator, mut responder) = build_pair(false);
        let mut rng = OsRng;

        let hello = initiator.initiate(&mut rng).unwrap();
        let (challenge, none) = responder.drive(&mut rng, hello).unwrap();
        assert!(none.is_none());
        let challenge = challenge.unwrap();

        let (response, none) = initiator.drive(&mut rng, challenge).unwrap();
        assert!(none.is_none());
        let response = response.unwrap();

        let (established, responder_session) = responder.drive(&mut rng, response).unwrap();
        let established = established.unwrap();
        let responder_session = responder_session.unwrap();

        let (none, initiator_session) = initiator.drive(&mut rng, established).unwrap();
        assert!(none.is_none());
        let initiator_session = initiator_session.unwrap();

        assert_eq!(initiator.state(), HandshakeState::Established);
        assert_eq!(responder.state(), HandshakeState::Established);
        assert_eq!(initiator_session.session_id, responder_session.session_id);
        assert_eq!(initiator_session.keys.tx_key, responder_session.keys.rx_key);
        assert_eq!(initiator_session.keys.rx_key, responder_session.keys.tx_key);
        assert_eq!(initiator_session.capabilities, CAP_OBFUSCATION);
    }

    #[test]
    fn tampered_hello_signature_rejected() {
        let (mut initiator, mut responder) = build_pair(false);
        let mut rng = OsRng;
        let mut hello = initiator.initiate(&mut rng).unwrap();
        if let WireMessage::Hello { peer_id, .. } = &mut hello {
            peer_id[0] ^= 0xFF;
        }
        let err = responder.drive(&mut rng, hello).unwrap_err();
        assert_eq!(err, HandshakeError::InvalidSignature);
    }

    #[test]
    fn unexpected_message_for_state_rejected() {
        let (mut initiator, _responder) = build_pair(false);
        let mut rng = OsRng;
        let bogus = WireMessage::Heartbeat;
        let err = initiator.drive(&mut rng, bogus).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::UnexpectedMessage { state: "Idle" }
        );
    }

    #[test]
    fn rekey_flag_round_trips_through_hello() {
        let (mut initiator, mut responder) = build_pair(true);
        let mut rng = OsRng;
        let hello = initiator.initiate(&mut rng).unwrap();
        assert!(matches!(hello, WireMessage::Hello { rekey: true, .. }));
        responder.drive(&mut rng, hello).unwrap();
    }
}
