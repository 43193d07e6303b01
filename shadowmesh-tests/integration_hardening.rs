//! Hardening scenarios for the pieces of the stack an attacker (or a noisy
//! network) actually gets to touch: the pre-handshake HELLO rate limiter,
//! the inbound worker's decrypt-error-rate circuit, malformed wire
//! messages, oversized declared lengths, and HELLO clock skew.

#[path = "support.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio_util::sync::CancellationToken;

use shadowmesh_core::error::{HandshakeError, PipelineError};
use shadowmesh_core::frame::{MessageType, WireMessage};
use shadowmesh_core::handshake::{Handshake, HandshakeRole, HELLO_RATE_LIMIT_PER_MINUTE};
use shadowmesh_core::pipeline::{run_inbound_worker, HelloRateLimiter, PipelineMetrics};
use shadowmesh_core::session::Session;
use shadowmesh_crypto::hybrid::generate_hybrid_keypair;
use shadowmesh_crypto::session_keys::SessionKeyPair;
use shadowmesh_transport::Transport;

use support::ChannelTransport;

fn sample_session() -> Session {
    let keys = SessionKeyPair {
        tx_key: [7u8; 32],
        rx_key: [9u8; 32],
    };
    let mut rng = OsRng;
    let peer_identity = generate_hybrid_keypair(&mut rng, 0);
    Session::new(
        peer_identity.peer_id(),
        [1u8; 16],
        true,
        keys,
        Duration::from_secs(20),
        Duration::from_secs(3600),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn hello_rate_limiter_rejects_concurrent_bursts_from_one_source() {
    let limiter = Arc::new(HelloRateLimiter::new());
    let mut tasks = Vec::new();
    for _ in 0..(HELLO_RATE_LIMIT_PER_MINUTE as usize * 4) {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move { limiter.check_and_record("10.0.0.1") }));
    }

    let mut accepted = 0u32;
    for task in tasks {
        if task.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, HELLO_RATE_LIMIT_PER_MINUTE);
}

#[tokio::test(flavor = "multi_thread")]
async fn hello_rate_limiter_tracks_many_sources_independently_under_concurrency() {
    let limiter = Arc::new(HelloRateLimiter::new());
    let mut tasks = Vec::new();
    for source in 0..50u32 {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            let addr = format!("192.168.0.{source}");
            limiter.check_and_record(&addr)
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap(), "a lone HELLO from a fresh source must always pass");
    }
}

#[tokio::test]
async fn decrypt_error_rate_above_threshold_shuts_down_inbound_worker() {
    let nic = Arc::new(support::MemoryNic::new());
    let (local_transport, remote_transport) = ChannelTransport::pair();
    let session = Arc::new(sample_session());
    let cancel = CancellationToken::new();
    let metrics = Arc::new(PipelineMetrics::default());
    let (control_tx, _control_rx) = tokio::sync::mpsc::unbounded_channel();

    let worker = tokio::spawn(run_inbound_worker(
        Arc::clone(&nic),
        local_transport,
        Arc::clone(&session),
        cancel.clone(),
        Arc::clone(&metrics),
        control_tx,
    ));

    // Flood the worker with DATA_FRAMEs that cannot possibly decrypt under
    // this session's keys, well past the threshold within one second. The
    // worker is expected to bail out partway through, so later sends may
    // find the channel already closed.
    for _ in 0..40u32 {
        let bogus = WireMessage::DataFrame {
            payload: vec![0u8; 64],
        }
        .encode();
        let _ = remote_transport.send(bogus).await;
    }

    let outcome = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("inbound worker should exit once the threshold is crossed")
        .unwrap();
    assert_eq!(outcome, Err(PipelineError::DecryptionErrorRateExceeded));
    assert!(metrics.snapshot().rx_decrypt_errors > 0);
}

#[tokio::test]
async fn malformed_wire_message_is_dropped_without_crashing_the_worker() {
    let nic = Arc::new(support::MemoryNic::new());
    let (local_transport, remote_transport) = ChannelTransport::pair();
    let session = Arc::new(sample_session());
    let cancel = CancellationToken::new();
    let metrics = Arc::new(PipelineMetrics::default());
    let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel();

    let worker = tokio::spawn(run_inbound_worker(
        Arc::clone(&nic),
        local_transport,
        Arc::clone(&session),
        cancel.clone(),
        Arc::clone(&metrics),
        control_tx,
    ));

    // A common header that declares a payload longer than the buffer
    // actually holds: structurally invalid, must be dropped rather than
    // panicking (B2).
    let mut garbage = vec![
        shadowmesh_core::frame::PROTOCOL_VERSION,
        MessageType::Heartbeat as u8,
    ];
    garbage.extend_from_slice(&0u16.to_be_bytes()); // flags
    garbage.extend_from_slice(&9999u32.to_be_bytes()); // declared length
    garbage.extend_from_slice(&[0u8; 4]); // far short of the declared length
    remote_transport.send(garbage).await.unwrap();

    // The worker must still be alive and able to process a well-formed
    // message afterwards.
    remote_transport
        .send(WireMessage::Heartbeat.encode())
        .await
        .unwrap();
    let ack = remote_transport.recv().await.unwrap();
    assert!(matches!(WireMessage::decode(&ack).unwrap(), WireMessage::HeartbeatAck));

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert!(control_rx.try_recv().is_err(), "a malformed frame must never reach the controller");
}

#[tokio::test]
async fn hello_with_skewed_timestamp_is_rejected_without_installing_a_session() {
    let mut rng = OsRng;
    let initiator_identity = Arc::new(generate_hybrid_keypair(&mut rng, 0));
    let responder_identity = Arc::new(generate_hybrid_keypair(&mut rng, 0));
    let responder_verify_key = responder_identity.verify_key();
    let initiator_verify_key = initiator_identity.verify_key();

    let mut initiator = Handshake::new(
        HandshakeRole::Initiator,
        initiator_identity,
        responder_verify_key,
        false,
        0,
        20,
        1500,
        3600,
    );
    let mut responder = Handshake::new(
        HandshakeRole::Responder,
        responder_identity,
        initiator_verify_key,
        false,
        0,
        20,
        1500,
        3600,
    );

    let hello = initiator.initiate(&mut rng).unwrap();
    let mut wire_bytes = hello.encode();
    // Overwrite the trailing 8-byte timestamp with a value far outside the
    // clock-skew tolerance, without touching anything that precedes it.
    let len = wire_bytes.len();
    wire_bytes[len - 8..].copy_from_slice(&0u64.to_be_bytes());

    let skewed_hello = WireMessage::decode(&wire_bytes).unwrap();
    let err = responder.drive(&mut rng, skewed_hello).unwrap_err();
    assert_eq!(err, HandshakeError::ClockSkew);
}
