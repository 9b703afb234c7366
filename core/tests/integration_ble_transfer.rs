//! BLE transfer over the loopback radio
//!
//! Two engines on one simulated radio, with packet loss injected through the
//! radio filter. Timers run on paused tokio time.
//!
//! Run with: cargo test --test integration_ble_transfer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use txrelay_core::clock::ManualClock;
use txrelay_core::codec::{Chunk, ChunkCodec, SessionId};
use txrelay_core::config::RelayConfig;
use txrelay_core::crypto::{generate_ephemeral_key_pair, AeadChunkCipher, StaticKeyPair};
use txrelay_core::error::{ConnectionError, RelayError};
use txrelay_core::transport::ble::{
    BleDriver, ConnectionManager, DeviceId, DeviceRegistry, Frame, FrameTransferEngine,
    InboundOutcome, LinkPhase, LoopbackDriver, LoopbackRadio, SessionSecurity,
    HANDSHAKE_ACK_INDEX, RELAY_CHARACTERISTIC_UUID, RELAY_SERVICE_UUID,
};

struct Node {
    engine: Arc<FrameTransferEngine>,
    outcomes: mpsc::UnboundedReceiver<InboundOutcome>,
    _pump: JoinHandle<()>,
}

fn node(
    driver: Arc<dyn BleDriver>,
    identity: Option<StaticKeyPair>,
    clock: Arc<ManualClock>,
    config: &RelayConfig,
) -> Node {
    let connections = Arc::new(ConnectionManager::new(
        driver.clone(),
        DeviceRegistry::new(),
        clock.clone(),
        config.clone(),
    ));
    let engine = Arc::new(FrameTransferEngine::new(
        driver,
        connections,
        Arc::new(AeadChunkCipher),
        identity,
        clock,
        config.clone(),
    ));
    let (tx, outcomes) = mpsc::unbounded_channel();
    let pump = engine.spawn_inbound_pump(tx);
    Node {
        engine,
        outcomes,
        _pump: pump,
    }
}

struct Setup {
    radio: LoopbackRadio,
    wallet_driver: Arc<LoopbackDriver>,
    wallet: Node,
    merchant: Node,
    merchant_identity: StaticKeyPair,
}

async fn setup(config: RelayConfig) -> Setup {
    let radio = LoopbackRadio::new();
    let clock = Arc::new(ManualClock::new(0));
    let wallet_driver = Arc::new(radio.attach("wallet", "Wallet"));
    let merchant_driver = Arc::new(radio.attach("merchant", "Corner Shop"));
    merchant_driver
        .start_advertising(RELAY_SERVICE_UUID, RELAY_CHARACTERISTIC_UUID)
        .await
        .expect("advertise");

    let merchant_identity = StaticKeyPair::generate();
    let wallet = node(wallet_driver.clone(), None, clock.clone(), &config);
    let merchant = node(
        merchant_driver,
        Some(merchant_identity.clone()),
        clock,
        &config,
    );

    Setup {
        radio,
        wallet_driver,
        wallet,
        merchant,
        merchant_identity,
    }
}

async fn connect(setup: &Setup) -> usize {
    setup
        .wallet
        .engine
        .connections()
        .connect_to_device(&"merchant".into(), Duration::from_secs(2))
        .await
        .expect("connect")
}

fn signed_tx(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_retransmits_only_dropped_frames() {
    let mut s = setup(RelayConfig::default()).await;
    assert_eq!(connect(&s).await, 512);

    // Every tenth ACK on the link is lost
    let mut acks_seen: u32 = 0;
    s.radio.set_filter(move |_, _, bytes| match Frame::decode(bytes) {
        Ok(Frame::Ack { .. }) => {
            acks_seen += 1;
            acks_seen % 10 != 0
        }
        _ => true,
    });

    let data = signed_tx(3_000);
    let report = s
        .wallet
        .engine
        .send_payload(&"merchant".into(), &data, None)
        .await
        .expect("send");

    // 3000 bytes at 256 per frame: 12 frames. Each lost ACK costs exactly one retry.
    assert_eq!(report.frames_sent, 12);
    assert_eq!(s.radio.dropped_packets(), 1);
    assert_eq!(u64::from(report.retransmissions), s.radio.dropped_packets());
    assert!(report.peer_confirmed);

    match s.merchant.outcomes.recv().await.expect("outcome") {
        InboundOutcome::Delivered {
            session_id,
            payload,
            ..
        } => {
            assert_eq!(session_id, report.session_id);
            assert_eq!(payload, data);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(s.merchant.outcomes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_lost_handshake_ack_is_recovered() {
    let mut s = setup(RelayConfig::default()).await;
    connect(&s).await;

    let mut lost = false;
    s.radio.set_filter(move |_, _, bytes| match Frame::decode(bytes) {
        Ok(Frame::Ack { index, .. }) if index == HANDSHAKE_ACK_INDEX && !lost => {
            lost = true;
            false
        }
        _ => true,
    });

    let ephemeral = generate_ephemeral_key_pair();
    let local_public = ephemeral.public_key_raw();
    let shared_key = ephemeral
        .derive_shared_key(&s.merchant_identity.public_key_raw())
        .expect("derive");

    let data = signed_tx(700);
    let report = s
        .wallet
        .engine
        .send_payload(
            &"merchant".into(),
            &data,
            Some(SessionSecurity {
                shared_key,
                local_public,
            }),
        )
        .await
        .expect("send");
    assert_eq!(report.retransmissions, 1);

    match s.merchant.outcomes.recv().await.expect("outcome") {
        InboundOutcome::Delivered { payload, .. } => assert_eq!(payload, data),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_gives_up_after_max_attempts() {
    let s = setup(RelayConfig::default()).await;
    let merchant = DeviceId::from("merchant");
    s.radio.fail_next_connects(&merchant, 10);

    let result = s
        .wallet
        .engine
        .connections()
        .connect_to_device(&merchant, Duration::from_secs(2))
        .await;

    match result {
        Err(ConnectionError::Exhausted {
            device_id,
            attempts,
            ..
        }) => {
            assert_eq!(device_id, merchant);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(s.radio.connect_attempts(&merchant), 3);
    assert_eq!(
        s.wallet.engine.connections().phase(&merchant),
        LinkPhase::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_blocks_new_sends() {
    let s = setup(RelayConfig::default()).await;
    connect(&s).await;
    let merchant = DeviceId::from("merchant");

    s.radio.drop_link(&"wallet".into(), &merchant);
    for _ in 0..50 {
        if s.wallet.engine.connections().phase(&merchant) == LinkPhase::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(
        s.wallet.engine.connections().phase(&merchant),
        LinkPhase::Idle
    );

    let result = s
        .wallet
        .engine
        .send_payload(&merchant, b"after link loss", None)
        .await;
    assert_eq!(
        result,
        Err(RelayError::Connection(ConnectionError::NotConnected(
            merchant
        )))
    );
}

/// Frames written straight to the merchant, bypassing the sending engine
async fn write_frame(driver: &LoopbackDriver, frame: Frame) {
    let bytes = frame.encode().expect("encode");
    driver
        .write_with_response(
            &"merchant".into(),
            RELAY_SERVICE_UUID,
            RELAY_CHARACTERISTIC_UUID,
            &bytes,
        )
        .await
        .expect("write");
}

/// An opened encrypted session: handshake written, chunks built but not sent
async fn open_encrypted_session(s: &Setup, payload: &[u8]) -> (SessionId, Vec<Chunk>) {
    let ephemeral = generate_ephemeral_key_pair();
    let sender_public = ephemeral.public_key_raw();
    let key = ephemeral
        .derive_shared_key(&s.merchant_identity.public_key_raw())
        .expect("derive");

    let session_id = SessionId::new_random();
    let chunks = ChunkCodec::new(8, Arc::new(AeadChunkCipher))
        .build_chunks(session_id, payload, Some(&key))
        .expect("chunks");
    write_frame(
        &s.wallet_driver,
        Frame::Handshake {
            session_id,
            total: chunks.len() as u32,
            sender_public,
        },
    )
    .await;
    (session_id, chunks)
}

#[tokio::test]
async fn test_plaintext_chunk_spliced_into_encrypted_session_fails() {
    let mut s = setup(RelayConfig::default()).await;
    connect(&s).await;

    let (session_id, chunks) = open_encrypted_session(&s, b"pay alice 10 USDC!").await;
    assert_eq!(chunks.len(), 3);
    write_frame(&s.wallet_driver, Frame::Data(chunks[0].clone())).await;
    // Flag cleared and checksum recomputed, as a tampering relay would
    let spliced = Chunk::new(session_id, 1, 3, false, b"EVILEVIL".to_vec());
    write_frame(&s.wallet_driver, Frame::Data(spliced)).await;

    match s.merchant.outcomes.recv().await.expect("outcome") {
        InboundOutcome::Failed {
            session_id: failed,
            reason,
            ..
        } => {
            assert_eq!(failed, session_id);
            assert!(reason.contains("not encrypted"), "{}", reason);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(s.merchant.engine.active_sessions(), 0);
}

#[tokio::test]
async fn test_forged_ciphertext_fails_authentication() {
    let mut s = setup(RelayConfig::default()).await;
    connect(&s).await;

    let (session_id, mut chunks) = open_encrypted_session(&s, b"pay alice 10 USDC!").await;
    let mut forged = chunks[2].payload().to_vec();
    forged[3] ^= 0x80;
    chunks[2] = Chunk::new(session_id, 2, 3, true, forged);
    for chunk in chunks {
        write_frame(&s.wallet_driver, Frame::Data(chunk)).await;
    }

    match s.merchant.outcomes.recv().await.expect("outcome") {
        InboundOutcome::Failed { reason, .. } => {
            assert!(reason.contains("authentication"), "{}", reason)
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(s.merchant.outcomes.try_recv().is_err());
}

#[tokio::test]
async fn test_frames_from_other_device_do_not_touch_session() {
    let mut s = setup(RelayConfig::default()).await;
    connect(&s).await;
    let mallory = s.radio.attach("mallory", "Mallory");
    mallory.connect(&"merchant".into()).await.expect("connect");

    let payload = b"pay alice 10 USDC!";
    let (session_id, chunks) = open_encrypted_session(&s, payload).await;
    write_frame(&mallory, Frame::Data(Chunk::new(session_id, 0, 3, false, b"EVIL".to_vec()))).await;
    write_frame(&mallory, Frame::Cancel { session_id }).await;

    for chunk in chunks {
        write_frame(&s.wallet_driver, Frame::Data(chunk)).await;
    }
    match s.merchant.outcomes.recv().await.expect("outcome") {
        InboundOutcome::Delivered {
            session_id: delivered,
            device_id,
            payload: received,
        } => {
            assert_eq!(delivered, session_id);
            assert_eq!(device_id, DeviceId::from("wallet"));
            assert_eq!(received, payload.to_vec());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
