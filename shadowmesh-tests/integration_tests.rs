//! End-to-end tunnel scenarios, run entirely in-process against the
//! in-memory `Transport`/`NicPort` test doubles in `support.rs`.
//!
//! Each test plays out one of the reference scenarios a real deployment
//! would be validated against: the handshake deriving matching keys on both
//! ends, a frame crossing the tunnel unmodified, a replayed wire message
//! being rejected, a tampered signature being rejected before any session
//! is installed, a time-triggered rekey installing a new generation without
//! losing traffic, and a graceful close tearing down both ends cleanly.

#[path = "support.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;

use shadowmesh_core::error::HandshakeError;
use shadowmesh_core::frame::{CloseReason, WireMessage};
use shadowmesh_core::handshake::{Handshake, HandshakeRole};
use shadowmesh_core::node::{Tunnel, TunnelEvent};
use shadowmesh_crypto::hybrid::generate_hybrid_keypair;
use shadowmesh_nic::NicPort;
use shadowmesh_transport::Transport;

use support::{peer_configs, sample_icmp_echo_frame, ChannelTransport, MemoryNic, TapTransport};

#[tokio::test]
async fn happy_path_handshake_derives_matching_session_on_both_sides() {
    let (initiator_transport, responder_transport) = ChannelTransport::pair();
    let (initiator_config, responder_config) = peer_configs(20, 3600);
    let initiator_nic = Arc::new(MemoryNic::new());
    let responder_nic = Arc::new(MemoryNic::new());

    let responder_handle = tokio::spawn(Tunnel::establish(
        responder_config,
        Arc::clone(&responder_nic) as Arc<dyn NicPort>,
        responder_transport as Arc<dyn Transport>,
    ));
    let initiator_tunnel = Tunnel::establish(
        initiator_config,
        Arc::clone(&initiator_nic) as Arc<dyn NicPort>,
        initiator_transport as Arc<dyn Transport>,
    )
    .await
    .expect("initiator handshake should establish");
    let responder_tunnel = responder_handle
        .await
        .expect("responder task should not panic")
        .expect("responder handshake should establish");

    let initiator_stats = initiator_tunnel.session_stats();
    let responder_stats = responder_tunnel.session_stats();
    assert_eq!(initiator_stats.session_id, responder_stats.session_id);
    assert!(initiator_stats.is_initiator);
    assert!(!responder_stats.is_initiator);
    assert_eq!(initiator_stats.mtu, responder_stats.mtu);

    initiator_tunnel.shutdown(CloseReason::Normal).await.unwrap();
    responder_tunnel.shutdown(CloseReason::Normal).await.unwrap();
}

#[tokio::test]
async fn encrypted_frame_is_delivered_unmodified_to_the_peer_nic() {
    let (initiator_transport, responder_transport) = ChannelTransport::pair();
    let (initiator_config, responder_config) = peer_configs(20, 3600);
    let initiator_nic = Arc::new(MemoryNic::new());
    let responder_nic = Arc::new(MemoryNic::new());

    let responder_handle = tokio::spawn(Tunnel::establish(
        responder_config,
        Arc::clone(&responder_nic) as Arc<dyn NicPort>,
        responder_transport as Arc<dyn Transport>,
    ));
    let initiator_tunnel = Tunnel::establish(
        initiator_config,
        Arc::clone(&initiator_nic) as Arc<dyn NicPort>,
        initiator_transport as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    let responder_tunnel = responder_handle.await.unwrap().unwrap();

    let frame = sample_icmp_echo_frame();
    initiator_nic.inject(frame.clone());

    let delivered = tokio::time::timeout(Duration::from_secs(5), responder_nic.delivered())
        .await
        .expect("frame should arrive within the timeout")
        .expect("NIC channel should not close");
    assert_eq!(delivered, frame);
    assert_eq!(initiator_tunnel.pipeline_stats().tx_frames, 1);
    assert_eq!(responder_tunnel.pipeline_stats().rx_frames, 1);

    initiator_tunnel.shutdown(CloseReason::Normal).await.unwrap();
    responder_tunnel.shutdown(CloseReason::Normal).await.unwrap();
}

#[tokio::test]
async fn replayed_data_frame_is_dropped_and_counted_without_reaching_the_nic() {
    let (initiator_transport, responder_transport) = ChannelTransport::pair();
    let (tap_transport, mut tap_rx) = TapTransport::new(initiator_transport);
    let (initiator_config, responder_config) = peer_configs(20, 3600);
    let initiator_nic = Arc::new(MemoryNic::new());
    let responder_nic = Arc::new(MemoryNic::new());

    let responder_handle = tokio::spawn(Tunnel::establish(
        responder_config,
        Arc::clone(&responder_nic) as Arc<dyn NicPort>,
        responder_transport as Arc<dyn Transport>,
    ));
    let initiator_tunnel = Tunnel::establish(
        initiator_config,
        Arc::clone(&initiator_nic) as Arc<dyn NicPort>,
        tap_transport.clone() as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    let responder_tunnel = responder_handle.await.unwrap().unwrap();

    let frame = sample_icmp_echo_frame();
    initiator_nic.inject(frame.clone());
    let delivered = tokio::time::timeout(Duration::from_secs(5), responder_nic.delivered())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, frame);

    let mut data_frame_bytes = None;
    while let Ok(bytes) = tap_rx.try_recv() {
        if matches!(WireMessage::decode(&bytes), Ok(WireMessage::DataFrame { .. })) {
            data_frame_bytes = Some(bytes);
        }
    }
    let data_frame_bytes = data_frame_bytes.expect("a DATA_FRAME should have crossed the tap");

    // Resend the exact wire bytes a second time, exactly as a replaying
    // attacker (or a duplicated path) would.
    tap_transport.send(data_frame_bytes).await.unwrap();

    let second_delivery =
        tokio::time::timeout(Duration::from_millis(500), responder_nic.delivered()).await;
    assert!(
        second_delivery.is_err(),
        "a replayed frame must never reach the peer NIC a second time"
    );
    assert_eq!(responder_tunnel.pipeline_stats().rx_replays, 1);
    assert_eq!(responder_tunnel.pipeline_stats().rx_frames, 1);

    initiator_tunnel.shutdown(CloseReason::Normal).await.unwrap();
    responder_tunnel.shutdown(CloseReason::Normal).await.unwrap();
}

#[tokio::test]
async fn tampered_hello_wire_bytes_are_rejected_before_any_session_exists() {
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
    // Flip the last byte of the signature, just ahead of the trailing
    // 8-byte timestamp, leaving the message's structure intact.
    let tamper_index = wire_bytes.len() - 9;
    wire_bytes[tamper_index] ^= 0xFF;

    let tampered_hello =
        WireMessage::decode(&wire_bytes).expect("bit flip must not break wire structure");
    let err = responder.drive(&mut rng, tampered_hello).unwrap_err();
    assert_eq!(err, HandshakeError::InvalidSignature);
}

#[tokio::test]
async fn time_triggered_rekey_installs_a_new_generation_without_dropping_frames() {
    let (initiator_transport, responder_transport) = ChannelTransport::pair();
    // A 1-second rekey interval stands in for "sustained load eventually
    // crosses the rekey threshold" without needing to move 2^48 frames or
    // wait out a realistic rekey_interval_s.
    let (initiator_config, responder_config) = peer_configs(20, 1);
    let initiator_nic = Arc::new(MemoryNic::new());
    let responder_nic = Arc::new(MemoryNic::new());

    let responder_handle = tokio::spawn(Tunnel::establish(
        responder_config,
        Arc::clone(&responder_nic) as Arc<dyn NicPort>,
        responder_transport as Arc<dyn Transport>,
    ));
    let initiator_tunnel = Tunnel::establish(
        initiator_config,
        Arc::clone(&initiator_nic) as Arc<dyn NicPort>,
        initiator_transport as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    let responder_tunnel = responder_handle.await.unwrap().unwrap();

    let mut initiator_events = initiator_tunnel.subscribe();
    let original_session_id = initiator_tunnel.session_stats().session_id;

    // Keep frames flowing across the rekey window.
    for i in 0..5u8 {
        let mut frame = sample_icmp_echo_frame();
        frame[97] = i;
        initiator_nic.inject(frame.clone());
        let delivered = tokio::time::timeout(Duration::from_secs(5), responder_nic.delivered())
            .await
            .expect("frame should arrive before or shortly after the rekey completes")
            .unwrap();
        assert_eq!(delivered, frame);
    }

    let rekeyed_session_id = loop {
        match tokio::time::timeout(Duration::from_secs(10), initiator_events.recv())
            .await
            .expect("a rekey should complete within the poll window")
            .unwrap()
        {
            TunnelEvent::RekeyCompleted { session_id } => break session_id,
            TunnelEvent::RekeyFailed => panic!("rekey attempt failed"),
            _ => continue,
        }
    };
    assert_ne!(rekeyed_session_id, original_session_id);
    assert_eq!(initiator_tunnel.session_stats().session_id, rekeyed_session_id);

    // Traffic continues to flow under the new generation.
    let frame = sample_icmp_echo_frame();
    initiator_nic.inject(frame.clone());
    let delivered = tokio::time::timeout(Duration::from_secs(5), responder_nic.delivered())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, frame);
    assert_eq!(responder_tunnel.pipeline_stats().rx_replays, 0);

    initiator_tunnel.shutdown(CloseReason::Normal).await.unwrap();
    responder_tunnel.shutdown(CloseReason::Normal).await.unwrap();
}

#[tokio::test]
async fn graceful_close_tears_down_both_ends_without_decryption_errors() {
    let (initiator_transport, responder_transport) = ChannelTransport::pair();
    let (initiator_config, responder_config) = peer_configs(20, 3600);
    let initiator_nic = Arc::new(MemoryNic::new());
    let responder_nic = Arc::new(MemoryNic::new());

    let responder_handle = tokio::spawn(Tunnel::establish(
        responder_config,
        Arc::clone(&responder_nic) as Arc<dyn NicPort>,
        responder_transport as Arc<dyn Transport>,
    ));
    let initiator_tunnel = Tunnel::establish(
        initiator_config,
        Arc::clone(&initiator_nic) as Arc<dyn NicPort>,
        initiator_transport as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    let responder_tunnel = responder_handle.await.unwrap().unwrap();

    let mut responder_events = responder_tunnel.subscribe();

    initiator_tunnel
        .shutdown(CloseReason::AdministrativeShutdown)
        .await
        .expect("initiator shutdown should succeed");

    let peer_closed_reason_code = loop {
        match tokio::time::timeout(Duration::from_secs(5), responder_events.recv())
            .await
            .expect("responder should observe the peer CLOSE")
            .unwrap()
        {
            TunnelEvent::PeerClosed { reason_code, .. } => break reason_code,
            _ => continue,
        }
    };
    assert_eq!(peer_closed_reason_code, CloseReason::AdministrativeShutdown as u16);
    assert_eq!(responder_tunnel.pipeline_stats().rx_decrypt_errors, 0);

    responder_tunnel
        .shutdown(CloseReason::Normal)
        .await
        .expect("responder shutdown should succeed");

    assert!(initiator_nic.is_closed());
    assert!(responder_nic.is_closed());
}
