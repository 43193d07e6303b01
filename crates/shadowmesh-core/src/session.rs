//! Session object (C7): installed key material and per-direction counters
//! for one established tunnel.
//!
//! A `Session` is produced once the handshake state machine (C6) reaches
//! `Established`, and is consumed by the tunnel pipeline (C8) for every
//! DATA_FRAME sent or received. It owns nothing about transport or wire
//! framing — only the cryptographic state needed to encrypt outbound frames
//! and reject replayed or stale inbound ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use shadowmesh_crypto::hybrid::PeerId;
use shadowmesh_crypto::session_keys::SessionKeyPair;

use crate::error::SessionError;

/// Counter value at which a time-independent rekey becomes mandatory (§4.7).
pub const REKEY_COUNTER_THRESHOLD: u64 = 1 << 48;
/// Grace window during which frames encrypted under the previous generation
/// of keys are still accepted after a rekey (§4.7).
pub const REKEY_GRACE_WINDOW: Duration = Duration::from_secs(30);
/// Default negotiated frame-payload MTU.
pub const DEFAULT_MTU: u16 = 1500;

/// One generation of directional keys plus the 4-byte nonce prefix derived
/// from the session id they were bound to.
#[derive(Clone)]
struct KeyGeneration {
    tx_key: [u8; 32],
    rx_key: [u8; 32],
    session_id_prefix: [u8; 4],
    installed_at: Instant,
}

/// The mutable part of session state: the session id and key generations.
/// Held behind a `RwLock` rather than requiring `&mut Session`, since the
/// lifecycle controller's rekey timer shares one `Arc<Session>` with the
/// pipeline workers (C8) and must be able to rotate keys without pausing
/// them.
struct KeyState {
    session_id: [u8; 16],
    current: KeyGeneration,
    previous: Option<KeyGeneration>,
}

/// Established session state: keys, counters, and rotation bookkeeping.
///
/// `tx_counter` and `rx_last_counter` are atomics so the outbound and
/// inbound pipeline workers (C8), which run as independent tasks, can each
/// touch their own counter without a session-wide lock. Key material itself
/// lives behind a `RwLock` so a rekey (§4.9) can swap it in without either
/// worker ever blocking for longer than one key lookup.
pub struct Session {
    peer_id: PeerId,
    is_initiator: bool,
    keys: RwLock<KeyState>,
    tx_counter: AtomicU64,
    rx_last_counter: AtomicU64,
    /// Negotiated frame-payload MTU.
    pub mtu: u16,
    /// Negotiated heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Negotiated rekey interval (time-triggered rotation).
    pub rekey_interval: Duration,
}

/// Outcome of validating an inbound frame's counter against session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Counter accepted against the current key generation.
    Accept,
    /// Counter accepted, but only decryptable under the previous
    /// generation's `rx_key` (grace window after a rekey).
    AcceptPreviousGeneration,
}

impl Session {
    /// Install a freshly derived session from a completed handshake.
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        session_id: [u8; 16],
        is_initiator: bool,
        keys: SessionKeyPair,
        heartbeat_interval: Duration,
        rekey_interval: Duration,
    ) -> Self {
        let mut session_id_prefix = [0u8; 4];
        session_id_prefix.copy_from_slice(&session_id[..4]);
        Self {
            peer_id,
            is_initiator,
            keys: RwLock::new(KeyState {
                session_id,
                current: KeyGeneration {
                    tx_key: keys.tx_key,
                    rx_key: keys.rx_key,
                    session_id_prefix,
                    installed_at: Instant::now(),
                },
                previous: None,
            }),
            tx_counter: AtomicU64::new(1),
            rx_last_counter: AtomicU64::new(0),
            mtu: DEFAULT_MTU,
            heartbeat_interval,
            rekey_interval,
        }
    }

    /// This session's peer.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Current session identifier.
    #[must_use]
    pub fn session_id(&self) -> [u8; 16] {
        self.keys.read().expect("session key lock poisoned").session_id
    }

    /// Whether this endpoint was the handshake initiator.
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Current generation's outbound encryption key and nonce prefix.
    #[must_use]
    pub fn tx_key(&self) -> ([u8; 32], [u8; 4]) {
        let keys = self.keys.read().expect("session key lock poisoned");
        (keys.current.tx_key, keys.current.session_id_prefix)
    }

    /// Allocate the next outbound frame counter. Starts at 1; 0 is reserved
    /// so a zeroed buffer can never be mistaken for a valid frame.
    pub fn next_tx_counter(&self) -> u64 {
        self.tx_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether the current generation has crossed the counter threshold
    /// that mandates a rekey regardless of elapsed time.
    #[must_use]
    pub fn counter_rekey_due(&self) -> bool {
        self.tx_counter.load(Ordering::SeqCst) >= REKEY_COUNTER_THRESHOLD
    }

    /// Whether the current generation has been installed longer than
    /// `rekey_interval`.
    #[must_use]
    pub fn time_rekey_due(&self) -> bool {
        let keys = self.keys.read().expect("session key lock poisoned");
        keys.current.installed_at.elapsed() >= self.rekey_interval
    }

    /// Validate and record an inbound frame counter against the session's
    /// anti-replay state, choosing which key generation decrypts it.
    ///
    /// A counter is accepted once per session: a counter less than or equal
    /// to `rx_last_counter` is always a replay, even across a rekey (the
    /// counter space does not reset on rotation in this design).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Replay`] if `counter` does not exceed the
    /// highest counter previously accepted.
    pub fn check_and_update_rx(&self, counter: u64) -> Result<RxOutcome, SessionError> {
        let last = self.rx_last_counter.load(Ordering::SeqCst);
        if counter <= last {
            return Err(SessionError::Replay {
                counter,
                last_seen: last,
            });
        }
        self.rx_last_counter.store(counter, Ordering::SeqCst);

        let keys = self.keys.read().expect("session key lock poisoned");
        if keys
            .previous
            .as_ref()
            .is_some_and(|prev| prev.installed_at.elapsed() < REKEY_GRACE_WINDOW)
        {
            Ok(RxOutcome::AcceptPreviousGeneration)
        } else {
            Ok(RxOutcome::Accept)
        }
    }

    /// Decryption key/prefix pairs to try for an inbound frame, current
    /// generation first, previous generation second (only while its grace
    /// window has not elapsed).
    #[must_use]
    pub fn rx_key_candidates(&self) -> Vec<([u8; 32], [u8; 4])> {
        let keys = self.keys.read().expect("session key lock poisoned");
        let mut candidates = vec![(keys.current.rx_key, keys.current.session_id_prefix)];
        if let Some(prev) = &keys.previous {
            if prev.installed_at.elapsed() < REKEY_GRACE_WINDOW {
                candidates.push((prev.rx_key, prev.session_id_prefix));
            }
        }
        candidates
    }

    /// Install a newly negotiated key generation after a rekey handshake,
    /// demoting the current generation to `previous` for the grace window.
    ///
    /// Takes `&self`: rekeys happen while the pipeline workers (C8) hold
    /// their own clone of this session's `Arc`, so rotation cannot require
    /// exclusive ownership.
    ///
    /// Returns the demoted generation's `installed_at` timestamp, which the
    /// caller must hand back to [`Session::zeroize_previous_generation`]
    /// once `REKEY_GRACE_WINDOW` has elapsed, so the old key material
    /// doesn't linger in memory after it stops being accepted.
    pub fn rotate_keys(&self, new_session_id: [u8; 16], new_keys: SessionKeyPair) -> Instant {
        let mut session_id_prefix = [0u8; 4];
        session_id_prefix.copy_from_slice(&new_session_id[..4]);
        let new_generation = KeyGeneration {
            tx_key: new_keys.tx_key,
            rx_key: new_keys.rx_key,
            session_id_prefix,
            installed_at: Instant::now(),
        };
        let mut keys = self.keys.write().expect("session key lock poisoned");
        let demoted = std::mem::replace(&mut keys.current, new_generation);
        let demoted_at = demoted.installed_at;
        keys.previous = Some(demoted);
        keys.session_id = new_session_id;
        demoted_at
    }

    /// Zero the demoted key generation once its grace window has elapsed.
    ///
    /// `demoted_at` identifies which generation to wipe by its
    /// `installed_at` timestamp, so a second rekey that lands before this
    /// runs (replacing `previous` again) is left untouched rather than
    /// wiped out from under the grace window that actually owns it.
    pub fn zeroize_previous_generation(&self, demoted_at: Instant) {
        use zeroize::Zeroize;
        let mut keys = self.keys.write().expect("session key lock poisoned");
        if keys.previous.as_ref().is_some_and(|prev| prev.installed_at == demoted_at) {
            if let Some(mut prev) = keys.previous.take() {
                prev.tx_key.zeroize();
                prev.rx_key.zeroize();
            }
        }
    }

    /// Zero all key material in place. Called by the lifecycle controller
    /// (C9) as the last step of an orderly shutdown (§4.9); a session is
    /// never used again afterward.
    pub fn zeroize_keys(&self) {
        use zeroize::Zeroize;
        let mut keys = self.keys.write().expect("session key lock poisoned");
        keys.current.tx_key.zeroize();
        keys.current.rx_key.zeroize();
        if let Some(prev) = &mut keys.previous {
            prev.tx_key.zeroize();
            prev.rx_key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use shadowmesh_crypto::hybrid::generate_hybrid_keypair;
    use shadowmesh_crypto::session_keys::derive_session_keys;

    fn sample_keys(seed: u8) -> SessionKeyPair {
        let responder = generate_hybrid_keypair(&mut OsRng, 0);
        let (_, secret) = responder.kem_public_key().encapsulate(&mut OsRng).unwrap();
        derive_session_keys(&secret, &[seed; 16], &[1u8; 32], &[2u8; 32], true).unwrap()
    }

    fn sample_session() -> Session {
        let peer_id = generate_hybrid_keypair(&mut OsRng, 0).peer_id();
        Session::new(
            peer_id,
            [0xAB; 16],
            true,
            sample_keys(1),
            Duration::from_secs(20),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn tx_counter_starts_at_one_and_increments() {
        let session = sample_session();
        assert_eq!(session.next_tx_counter(), 1);
        assert_eq!(session.next_tx_counter(), 2);
        assert_eq!(session.next_tx_counter(), 3);
    }

    #[test]
    fn rx_rejects_non_increasing_counters() {
        let session = sample_session();
        assert_eq!(session.check_and_update_rx(5).unwrap(), RxOutcome::Accept);
        assert_eq!(session.check_and_update_rx(5), Err(SessionError::Replay { counter: 5, last_seen: 5 }));
        assert_eq!(session.check_and_update_rx(3), Err(SessionError::Replay { counter: 3, last_seen: 5 }));
    }

    #[test]
    fn rx_accepts_strictly_increasing_counters() {
        let session = sample_session();
        assert_eq!(session.check_and_update_rx(1).unwrap(), RxOutcome::Accept);
        assert_eq!(session.check_and_update_rx(100).unwrap(), RxOutcome::Accept);
    }

    #[test]
    fn rotate_keys_keeps_previous_generation_candidate() {
        let mut session = sample_session();
        session.check_and_update_rx(1).unwrap();
        session.rotate_keys([0xCD; 16], sample_keys(2));
        assert_eq!(session.rx_key_candidates().len(), 2);
        assert_eq!(session.session_id(), [0xCD; 16]);
    }

    #[test]
    fn counter_rekey_due_past_threshold() {
        let session = sample_session();
        assert!(!session.counter_rekey_due());
        session
            .tx_counter
            .store(REKEY_COUNTER_THRESHOLD, Ordering::SeqCst);
        assert!(session.counter_rekey_due());
    }
}
