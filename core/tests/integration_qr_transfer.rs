//! QR page transfer: wallet renders pages, merchant scans them in any order
//!
//! Run with: cargo test --test integration_qr_transfer

use txrelay_core::codec::{Chunk, SessionId};
use txrelay_core::crypto::{generate_ephemeral_key_pair, StaticKeyPair};
use txrelay_core::relay::{EnvelopeMetadata, TransactionEnvelope};
use txrelay_core::transport::qr::{
    build_qr_pages, decode_page, encode_page, parse_qr_pages, QrError, QrScanCollector,
};
use txrelay_core::{CryptoError, RelayError};

#[test]
fn test_two_pages_scanned_backwards() {
    let payload: Vec<u8> = (0..50u8).collect();
    let session_id = SessionId::new_random();

    let pages = build_qr_pages(session_id, &payload, None, 32).expect("pages");
    assert_eq!(pages.len(), 2);

    let mut collector = QrScanCollector::new();
    let first = collector.push(&pages[1]).expect("scan page 1");
    assert_eq!((first.received, first.total), (1, 2));
    assert!(!collector.is_ready());

    let second = collector.push(&pages[0]).expect("scan page 0");
    assert!(second.is_complete());
    assert_eq!(collector.session_id(), Some(session_id));
    assert_eq!(collector.finish(None).expect("reassemble"), payload);
}

#[test]
fn test_encrypted_envelope_over_qr() {
    // Merchant publishes its static key; wallet derives with a fresh ephemeral
    let merchant = StaticKeyPair::generate();
    let ephemeral = generate_ephemeral_key_pair();
    let wallet_public = ephemeral.public_key_raw();
    let wallet_key = ephemeral
        .derive_shared_key(&merchant.public_key_raw())
        .expect("wallet derive");
    let merchant_key = merchant
        .derive_shared_key(&wallet_public)
        .expect("merchant derive");

    let envelope = TransactionEnvelope::new(vec![0x02; 400]).with_metadata(EnvelopeMetadata {
        amount: Some("12.50 USDC".to_string()),
        recipient: Some("corner-shop".to_string()),
        memo: Some("table 4".to_string()),
    });
    let bytes = envelope.to_bytes().expect("encode");

    let mut pages =
        build_qr_pages(SessionId::new_random(), &bytes, Some(&wallet_key), 180).expect("pages");
    assert!(pages.len() >= 3);

    // Camera picks pages up out of order, with one rescan
    pages.rotate_left(1);
    pages.push(pages[0].clone());

    let mut collector = QrScanCollector::new();
    for page in &pages {
        collector.push(page).expect("scan");
    }
    let received = collector.finish(Some(&merchant_key)).expect("reassemble");
    assert_eq!(TransactionEnvelope::from_bytes(&received).expect("decode"), envelope);

    assert_eq!(parse_qr_pages(&pages, Some(&merchant_key)).expect("parse"), bytes);
}

#[test]
fn test_foreign_page_does_not_poison_scan() {
    let ours = build_qr_pages(SessionId::new_random(), &[1u8; 90], None, 32).expect("pages");
    let theirs = build_qr_pages(SessionId::new_random(), &[2u8; 90], None, 32).expect("pages");

    let mut collector = QrScanCollector::new();
    collector.push(&ours[0]).expect("scan");
    assert!(matches!(
        collector.push(&theirs[0]),
        Err(QrError::SessionMismatch { .. })
    ));
    assert!(collector.push("not a relay page").is_err());

    for page in &ours[1..] {
        collector.push(page).expect("scan");
    }
    assert_eq!(collector.finish(None).expect("reassemble"), vec![1u8; 90]);
}

#[test]
fn test_incomplete_scan_reports_progress() {
    let pages = build_qr_pages(SessionId::new_random(), &[7u8; 100], None, 32).expect("pages");
    assert_eq!(pages.len(), 4);

    let mut collector = QrScanCollector::new();
    collector.push(&pages[2]).expect("scan");
    collector.push(&pages[0]).expect("scan");

    assert_eq!(
        collector.finish(None),
        Err(RelayError::Qr(QrError::Incomplete {
            received: 2,
            total: 4
        }))
    );
}

#[test]
fn test_page_with_cleared_encryption_flag_rejected() {
    let merchant = StaticKeyPair::generate();
    let ephemeral = generate_ephemeral_key_pair();
    let wallet_public = ephemeral.public_key_raw();
    let wallet_key = ephemeral
        .derive_shared_key(&merchant.public_key_raw())
        .expect("wallet derive");
    let merchant_key = merchant
        .derive_shared_key(&wallet_public)
        .expect("merchant derive");

    let session_id = SessionId::new_random();
    let mut pages =
        build_qr_pages(session_id, &[3u8; 90], Some(&wallet_key), 32).expect("pages");
    assert_eq!(pages.len(), 3);

    // Swap page 1 for a plaintext page with a valid checksum
    let original = decode_page(&pages[1]).expect("decode");
    let forged = Chunk::new(session_id, 1, original.total(), false, b"EVIL".to_vec());
    pages[1] = encode_page(&forged);

    assert_eq!(
        parse_qr_pages(&pages, Some(&merchant_key)),
        Err(RelayError::Crypto(CryptoError::Authentication { index: 1 }))
    );

    let mut collector = QrScanCollector::new();
    for page in &pages {
        collector.push(page).expect("scan");
    }
    assert_eq!(
        collector.finish(Some(&merchant_key)),
        Err(RelayError::Crypto(CryptoError::Authentication { index: 1 }))
    );
}
