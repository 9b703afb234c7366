/// BLE wire frames: one frame per characteristic write or notification
///
/// Format:
/// [1 byte]  frame type
/// [N bytes] body (type specific, integers LE)
/// [4 bytes] CRC32 over type + body
///
/// Bodies:
/// Handshake: session(16) total(4) sender_public(32)
/// Data:      flags(1) session(16) index(4) total(4) checksum(4) len(2) payload
/// Ack:       session(16) index(4)
/// Receipt:   session(16) digest(32)
/// Cancel:    session(16)

use crc32fast::Hasher;
use thiserror::Error;

use crate::codec::{Chunk, SessionId};
use crate::crypto::PUBLIC_KEY_LEN;

/// Bytes a data frame adds around its chunk payload
pub const DATA_FRAME_OVERHEAD: usize = 1 + 1 + 16 + 4 + 4 + 4 + 2 + 4;

/// Ack index used to confirm the handshake frame
pub const HANDSHAKE_ACK_INDEX: u32 = u32::MAX;

const CRC_LEN: usize = 4;
const FLAG_ENCRYPTED: u8 = 0x01;

/// Errors decoding or encoding wire frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {need}, got {got}")]
    BufferTooShort { need: usize, got: usize },
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("Unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("Trailing bytes after frame body: {0}")]
    TrailingBytes(usize),
    #[error("Chunk payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
}

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0x01,
    Data = 0x02,
    Ack = 0x03,
    Receipt = 0x04,
    Cancel = 0x05,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(FrameType::Handshake),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Ack),
            0x04 => Ok(FrameType::Receipt),
            0x05 => Ok(FrameType::Cancel),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Everything that travels over the relay characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens an encrypted session: carries the sender's ephemeral public key
    Handshake {
        session_id: SessionId,
        total: u32,
        sender_public: [u8; PUBLIC_KEY_LEN],
    },
    Data(Chunk),
    Ack { session_id: SessionId, index: u32 },
    /// Receiver confirmation: Blake3 digest of the reassembled payload
    Receipt {
        session_id: SessionId,
        digest: [u8; 32],
    },
    Cancel { session_id: SessionId },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Handshake { .. } => FrameType::Handshake,
            Frame::Data(_) => FrameType::Data,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Receipt { .. } => FrameType::Receipt,
            Frame::Cancel { .. } => FrameType::Cancel,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            Frame::Handshake { session_id, .. }
            | Frame::Ack { session_id, .. }
            | Frame::Receipt { session_id, .. }
            | Frame::Cancel { session_id } => *session_id,
            Frame::Data(chunk) => chunk.session_id(),
        }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.frame_type() as u8);

        match self {
            Frame::Handshake {
                session_id,
                total,
                sender_public,
            } => {
                buf.extend_from_slice(session_id.as_bytes());
                buf.extend_from_slice(&total.to_le_bytes());
                buf.extend_from_slice(sender_public);
            }
            Frame::Data(chunk) => {
                let len = u16::try_from(chunk.payload().len())
                    .map_err(|_| WireError::PayloadTooLarge(chunk.payload().len()))?;
                let flags = if chunk.is_encrypted() { FLAG_ENCRYPTED } else { 0 };
                buf.push(flags);
                buf.extend_from_slice(chunk.session_id().as_bytes());
                buf.extend_from_slice(&chunk.index().to_le_bytes());
                buf.extend_from_slice(&chunk.total().to_le_bytes());
                buf.extend_from_slice(&chunk.checksum().to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(chunk.payload());
            }
            Frame::Ack { session_id, index } => {
                buf.extend_from_slice(session_id.as_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
            }
            Frame::Receipt { session_id, digest } => {
                buf.extend_from_slice(session_id.as_bytes());
                buf.extend_from_slice(digest);
            }
            Frame::Cancel { session_id } => {
                buf.extend_from_slice(session_id.as_bytes());
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(buf)
    }

    /// Deserialize from bytes, verifying the trailing CRC first
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 1 + CRC_LEN {
            return Err(WireError::BufferTooShort {
                need: 1 + CRC_LEN,
                got: data.len(),
            });
        }

        let crc_offset = data.len() - CRC_LEN;
        let received_crc = u32::from_le_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        let mut hasher = Hasher::new();
        hasher.update(&data[..crc_offset]);
        if hasher.finalize() != received_crc {
            return Err(WireError::CrcMismatch);
        }

        let frame_type = FrameType::from_u8(data[0])?;
        let mut reader = Reader::new(&data[1..crc_offset]);

        let frame = match frame_type {
            FrameType::Handshake => Frame::Handshake {
                session_id: reader.session_id()?,
                total: reader.u32()?,
                sender_public: reader.array::<PUBLIC_KEY_LEN>()?,
            },
            FrameType::Data => {
                let flags = reader.u8()?;
                let session_id = reader.session_id()?;
                let index = reader.u32()?;
                let total = reader.u32()?;
                let checksum = reader.u32()?;
                let len = reader.u16()? as usize;
                let payload = reader.take(len)?.to_vec();
                Frame::Data(Chunk::from_parts(
                    session_id,
                    index,
                    total,
                    flags & FLAG_ENCRYPTED != 0,
                    payload,
                    checksum,
                ))
            }
            FrameType::Ack => Frame::Ack {
                session_id: reader.session_id()?,
                index: reader.u32()?,
            },
            FrameType::Receipt => Frame::Receipt {
                session_id: reader.session_id()?,
                digest: reader.array::<32>()?,
            },
            FrameType::Cancel => Frame::Cancel {
                session_id: reader.session_id()?,
            },
        };

        reader.finish()?;
        Ok(frame)
    }
}

/// Cursor over a frame body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::BufferTooShort {
                need: end,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn session_id(&mut self) -> Result<SessionId, WireError> {
        Ok(SessionId::from_bytes(self.array::<16>()?))
    }

    fn finish(self) -> Result<(), WireError> {
        let rest = self.buf.len() - self.pos;
        if rest != 0 {
            return Err(WireError::TrailingBytes(rest));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame() -> Frame {
        Frame::Data(Chunk::new(
            SessionId::new_random(),
            3,
            12,
            true,
            b"ciphertext bytes".to_vec(),
        ))
    }

    #[test]
    fn test_data_frame_overhead() {
        let frame = data_frame();
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), DATA_FRAME_OVERHEAD + b"ciphertext bytes".len());
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_control_frames_decode() {
        let session_id = SessionId::new_random();
        let frames = vec![
            Frame::Handshake {
                session_id,
                total: 9,
                sender_public: [5u8; 32],
            },
            Frame::Ack {
                session_id,
                index: HANDSHAKE_ACK_INDEX,
            },
            Frame::Receipt {
                session_id,
                digest: [1u8; 32],
            },
            Frame::Cancel { session_id },
        ];

        for frame in frames {
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded.session_id(), session_id);
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_encrypted_flag_preserved() {
        let bytes = data_frame().encode().unwrap();
        match Frame::decode(&bytes).unwrap() {
            Frame::Data(chunk) => assert!(chunk.is_encrypted()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut bytes = data_frame().encode().unwrap();
        bytes[10] ^= 0x40;
        assert_eq!(Frame::decode(&bytes), Err(WireError::CrcMismatch));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = vec![0x7F, 1, 2, 3];
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(Frame::decode(&buf), Err(WireError::UnknownFrameType(0x7F)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut buf = vec![FrameType::Ack as u8, 0, 0, 0];
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Frame::decode(&buf),
            Err(WireError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let session_id = SessionId::new_random();
        let mut buf = vec![FrameType::Cancel as u8];
        buf.extend_from_slice(session_id.as_bytes());
        buf.push(0xAA);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(Frame::decode(&buf), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_short_buffer() {
        assert!(matches!(
            Frame::decode(&[0x01, 0x02]),
            Err(WireError::BufferTooShort { .. })
        ));
    }
}
