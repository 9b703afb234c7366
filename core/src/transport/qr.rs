// QR transfer adapter
//
// One chunk per QR code, as a single line of text:
//
//   VQR:1:<session-hex>:<index>:<total>:<flags>:<checksum-hex>:<payload-base64url>
//
// flags bit 0 = encrypted. Pages can be scanned in any order and rescans are
// harmless; reassembly goes through the same codec as BLE.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::codec::{Chunk, ChunkCodec, SessionId};
use crate::crypto::{default_cipher, SharedKey};
use crate::error::RelayError;

pub const QR_TAG: &str = "VQR";
pub const QR_VERSION: u32 = 1;

const FLAG_ENCRYPTED: u8 = 0x01;
const FIELD_COUNT: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QrError {
    #[error("Malformed QR page: {0}")]
    MalformedPage(String),
    #[error("Unsupported QR page version {0}")]
    UnsupportedVersion(u32),
    #[error("Page belongs to session {found}, collecting {expected}")]
    SessionMismatch {
        expected: SessionId,
        found: SessionId,
    },
    #[error("Page {index} conflicts with an earlier scan")]
    ConflictingPage { index: u32 },
    #[error("Scan incomplete: {received}/{total} pages")]
    Incomplete { received: u32, total: u32 },
}

/// Render one chunk as page text
pub fn encode_page(chunk: &Chunk) -> String {
    let flags = if chunk.is_encrypted() { FLAG_ENCRYPTED } else { 0 };
    format!(
        "{}:{}:{}:{}:{}:{}:{:08x}:{}",
        QR_TAG,
        QR_VERSION,
        chunk.session_id(),
        chunk.index(),
        chunk.total(),
        flags,
        chunk.checksum(),
        URL_SAFE_NO_PAD.encode(chunk.payload())
    )
}

/// Parse one page. The checksum is carried through unverified; the codec checks it.
pub fn decode_page(page: &str) -> Result<Chunk, QrError> {
    let fields: Vec<&str> = page.trim().splitn(FIELD_COUNT, ':').collect();
    if fields.len() != FIELD_COUNT {
        return Err(QrError::MalformedPage(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        )));
    }
    if fields[0] != QR_TAG {
        return Err(QrError::MalformedPage(format!("unknown tag {:?}", fields[0])));
    }

    let version: u32 = parse_field(fields[1], "version")?;
    if version != QR_VERSION {
        return Err(QrError::UnsupportedVersion(version));
    }
    let session_id = SessionId::parse(fields[2])
        .ok_or_else(|| QrError::MalformedPage(format!("bad session id {:?}", fields[2])))?;
    let index: u32 = parse_field(fields[3], "index")?;
    let total: u32 = parse_field(fields[4], "total")?;
    let flags: u8 = parse_field(fields[5], "flags")?;
    let checksum = u32::from_str_radix(fields[6], 16)
        .map_err(|_| QrError::MalformedPage(format!("bad checksum {:?}", fields[6])))?;
    let payload = URL_SAFE_NO_PAD
        .decode(fields[7])
        .map_err(|e| QrError::MalformedPage(format!("bad payload encoding: {}", e)))?;

    if total == 0 || index >= total {
        return Err(QrError::MalformedPage(format!(
            "index {} outside total {}",
            index, total
        )));
    }

    Ok(Chunk::from_parts(
        session_id,
        index,
        total,
        flags & FLAG_ENCRYPTED != 0,
        payload,
        checksum,
    ))
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, QrError> {
    value
        .parse()
        .map_err(|_| QrError::MalformedPage(format!("bad {} {:?}", name, value)))
}

/// Split `payload` into QR pages of `page_size` plaintext bytes each
pub fn build_qr_pages(
    session_id: SessionId,
    payload: &[u8],
    key: Option<&SharedKey>,
    page_size: usize,
) -> Result<Vec<String>, RelayError> {
    let codec = ChunkCodec::new(page_size, default_cipher());
    let chunks = codec.build_chunks(session_id, payload, key)?;
    Ok(chunks.iter().map(encode_page).collect())
}

/// Reassemble a payload from scanned pages in any order
pub fn parse_qr_pages<S: AsRef<str>>(
    pages: &[S],
    key: Option<&SharedKey>,
) -> Result<Vec<u8>, RelayError> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(pages.len());
    for page in pages {
        let chunk = decode_page(page.as_ref())?;
        if !chunks.contains(&chunk) {
            chunks.push(chunk);
        }
    }
    ChunkCodec::new(1, default_cipher()).parse_chunks(&chunks, key)
}

/// Scan progress after feeding a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrScanProgress {
    pub received: u32,
    pub total: u32,
    /// False for a rescan of a page already held
    pub new_page: bool,
}

impl QrScanProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.received == self.total
    }
}

/// Collects pages from a camera feed for one session
#[derive(Debug, Default)]
pub struct QrScanCollector {
    session_id: Option<SessionId>,
    total: u32,
    pages: BTreeMap<u32, Chunk>,
}

impl QrScanCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Feed one scanned string. The first page fixes the session.
    pub fn push(&mut self, page: &str) -> Result<QrScanProgress, QrError> {
        let chunk = decode_page(page)?;

        match self.session_id {
            Some(expected) if expected != chunk.session_id() => {
                return Err(QrError::SessionMismatch {
                    expected,
                    found: chunk.session_id(),
                })
            }
            Some(_) if chunk.total() != self.total => {
                return Err(QrError::MalformedPage(format!(
                    "page declares total {}, expected {}",
                    chunk.total(),
                    self.total
                )))
            }
            Some(_) => {}
            None => {
                self.session_id = Some(chunk.session_id());
                self.total = chunk.total();
            }
        }

        let new_page = match self.pages.get(&chunk.index()) {
            Some(existing) if *existing == chunk => false,
            Some(_) => return Err(QrError::ConflictingPage { index: chunk.index() }),
            None => {
                self.pages.insert(chunk.index(), chunk);
                true
            }
        };

        Ok(QrScanProgress {
            received: self.pages.len() as u32,
            total: self.total,
            new_page,
        })
    }

    pub fn progress(&self) -> QrScanProgress {
        QrScanProgress {
            received: self.pages.len() as u32,
            total: self.total,
            new_page: false,
        }
    }

    /// Every declared page has been scanned
    pub fn is_ready(&self) -> bool {
        self.progress().is_complete()
    }

    /// Reassemble once ready
    pub fn finish(&self, key: Option<&SharedKey>) -> Result<Vec<u8>, RelayError> {
        if !self.is_ready() {
            return Err(QrError::Incomplete {
                received: self.pages.len() as u32,
                total: self.total,
            }
            .into());
        }
        let chunks: Vec<Chunk> = self.pages.values().cloned().collect();
        ChunkCodec::new(1, default_cipher()).parse_chunks(&chunks, key)
    }

    pub fn reset(&mut self) {
        self.session_id = None;
        self.total = 0;
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, TransferError};

    fn sample() -> Vec<u8> {
        (0..50u8).collect()
    }

    #[test]
    fn test_page_format() {
        let session_id = SessionId::new_random();
        let pages = build_qr_pages(session_id, b"hi", None, 32).unwrap();
        assert_eq!(pages.len(), 1);

        let prefix = format!("VQR:1:{}:0:1:0:", session_id);
        assert!(pages[0].starts_with(&prefix), "{}", pages[0]);
        assert!(pages[0].ends_with(":aGk"));
    }

    #[test]
    fn test_pages_any_order_with_rescans() {
        let session_id = SessionId::new_random();
        let mut pages = build_qr_pages(session_id, &sample(), None, 16).unwrap();
        assert_eq!(pages.len(), 4);
        pages.reverse();
        pages.push(pages[1].clone());

        assert_eq!(parse_qr_pages(&pages, None).unwrap(), sample());
    }

    #[cfg(not(feature = "insecure-dev-crypto"))]
    #[test]
    fn test_encrypted_pages_need_key() {
        let key = SharedKey::from_bytes([9u8; 32]);
        let session_id = SessionId::new_random();
        let pages = build_qr_pages(session_id, &sample(), Some(&key), 32).unwrap();

        assert!(pages.iter().all(|p| p.split(':').nth(5) == Some("1")));
        assert_eq!(parse_qr_pages(&pages, Some(&key)).unwrap(), sample());
        assert_eq!(
            parse_qr_pages(&pages, None),
            Err(RelayError::Crypto(CryptoError::MissingKey { index: 0 }))
        );
    }

    #[test]
    fn test_missing_page_reported() {
        let session_id = SessionId::new_random();
        let pages = build_qr_pages(session_id, &sample(), None, 16).unwrap();
        let partial = vec![pages[0].clone(), pages[3].clone()];

        assert_eq!(
            parse_qr_pages(&partial, None),
            Err(RelayError::Transfer(TransferError::Incomplete {
                session_id,
                missing: vec![1, 2]
            }))
        );
    }

    #[test]
    fn test_malformed_pages_rejected() {
        for page in [
            "",
            "QRV:1:00:0:1:0:00000000:",
            "VQR:1:not-a-session:0:1:0:00000000:",
            "VQR:2:00000000000000000000000000000000:0:1:0:00000000:",
        ] {
            assert!(decode_page(page).is_err(), "{:?} accepted", page);
        }
        assert_eq!(
            decode_page("VQR:2:00000000000000000000000000000000:0:1:0:00000000:"),
            Err(QrError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_corrupted_checksum_detected() {
        let session_id = SessionId::new_random();
        let pages = build_qr_pages(session_id, b"abc", None, 32).unwrap();
        let mut fields: Vec<&str> = pages[0].split(':').collect();
        fields[6] = "deadbeef";
        let tampered = fields.join(":");

        assert_eq!(
            parse_qr_pages(&[tampered], None),
            Err(RelayError::Transfer(TransferError::ChecksumMismatch {
                session_id,
                index: 0
            }))
        );
    }

    #[test]
    fn test_collector_ready_at_declared_total() {
        let session_id = SessionId::new_random();
        let pages = build_qr_pages(session_id, &sample(), None, 32).unwrap();
        let mut collector = QrScanCollector::new();

        let first = collector.push(&pages[1]).unwrap();
        assert_eq!((first.received, first.total, first.new_page), (1, 2, true));
        assert!(!collector.is_ready());
        assert!(matches!(
            collector.finish(None),
            Err(RelayError::Qr(QrError::Incomplete { .. }))
        ));

        assert!(!collector.push(&pages[1]).unwrap().new_page);
        assert!(collector.push(&pages[0]).unwrap().is_complete());
        assert_eq!(collector.finish(None).unwrap(), sample());
    }

    #[test]
    fn test_collector_rejects_other_session() {
        let mut collector = QrScanCollector::new();
        let ours = build_qr_pages(SessionId::new_random(), &sample(), None, 32).unwrap();
        let theirs = build_qr_pages(SessionId::new_random(), &sample(), None, 32).unwrap();

        collector.push(&ours[0]).unwrap();
        assert!(matches!(
            collector.push(&theirs[1]),
            Err(QrError::SessionMismatch { .. })
        ));

        collector.reset();
        assert!(collector.push(&theirs[1]).is_ok());
    }
}
