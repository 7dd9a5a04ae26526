//! Framing: opcode + txId + length-prefixed cargo + CRC16 trailer.
//!
//! Raw message layout: `opcode(1) | txId(1) | cargoLen(1) | cargo | crc16(2)`.
//! The CRC covers everything before it.

use crate::chunk;
use crate::integrity;

/// Protocol hard limit on cargo size (one length byte).
pub const MAX_CARGO_LEN: usize = u8::MAX as usize;

const MESSAGE_HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

/// Smallest valid raw message: header + empty cargo + CRC.
pub const MIN_MESSAGE_LEN: usize = MESSAGE_HEADER_LEN + CRC_LEN;

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: u8,
    pub tx_id: u8,
    pub cargo: Vec<u8>,
}

/// Build the raw (unchunked) message bytes.
pub fn encode_message(opcode: u8, tx_id: u8, cargo: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if cargo.len() > MAX_CARGO_LEN {
        return Err(FrameEncodeError::CargoTooLarge(cargo.len()));
    }
    let mut out = Vec::with_capacity(MIN_MESSAGE_LEN + cargo.len());
    out.push(opcode);
    out.push(tx_id);
    out.push(cargo.len() as u8);
    out.extend_from_slice(cargo);
    let trailer = integrity::crc16_trailer(&out);
    out.extend_from_slice(&trailer);
    Ok(out)
}

/// Encode a message and slice it into link-sized chunks, ready to write in order.
pub fn encode(
    opcode: u8,
    tx_id: u8,
    cargo: &[u8],
    chunk_size: usize,
) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    let raw = encode_message(opcode, tx_id, cargo)?;
    chunk::split_into_chunks(tx_id, &raw, chunk_size)
}

/// Error encoding a message (cargo or chunk limits).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cargo of {0} bytes exceeds the 255-byte limit")]
    CargoTooLarge(usize),
    #[error("chunk size {0} is below the minimum of {min}", min = chunk::MIN_CHUNK_SIZE)]
    ChunkSizeTooSmall(usize),
    #[error("message needs {0} chunks; the countdown nibble allows {max}", max = chunk::MAX_CHUNKS)]
    TooManyChunks(usize),
}

/// Decode a fully reassembled message. Corruption is all-or-nothing: any length or CRC
/// disagreement rejects the whole message.
pub fn decode_message(raw: &[u8]) -> Result<Message, FrameDecodeError> {
    if raw.len() < MIN_MESSAGE_LEN {
        return Err(FrameDecodeError::TooShort(raw.len()));
    }
    let cargo_len = raw[2] as usize;
    let expected = MIN_MESSAGE_LEN + cargo_len;
    if raw.len() != expected {
        return Err(FrameDecodeError::LengthMismatch {
            claimed: cargo_len,
            actual: raw.len().saturating_sub(MIN_MESSAGE_LEN),
        });
    }
    let body_end = MESSAGE_HEADER_LEN + cargo_len;
    let trailer = [raw[body_end], raw[body_end + 1]];
    if !integrity::verify_crc16(&raw[..body_end], trailer) {
        return Err(FrameDecodeError::CrcMismatch);
    }
    Ok(Message {
        opcode: raw[0],
        tx_id: raw[1],
        cargo: raw[MESSAGE_HEADER_LEN..body_end].to_vec(),
    })
}

/// Lenient-free parse: the message, or `None` if it is malformed in any way.
pub fn parse_header(raw: &[u8]) -> Option<Message> {
    decode_message(raw).ok()
}

/// Why a reassembled message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("message of {0} bytes is shorter than header and CRC")]
    TooShort(usize),
    #[error("cargo length byte claims {claimed} bytes, message carries {actual}")]
    LengthMismatch { claimed: usize, actual: usize },
    #[error("CRC16 mismatch")]
    CrcMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{PacketAssembler, PushResult, MIN_CHUNK_SIZE};

    fn reassemble(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut assembler = PacketAssembler::new();
        for (i, c) in chunks.iter().enumerate() {
            match assembler.push(c).unwrap() {
                PushResult::Complete(raw) => {
                    assert_eq!(i, chunks.len() - 1);
                    return raw;
                }
                PushResult::InProgress => {}
            }
        }
        panic!("message never completed");
    }

    #[test]
    fn roundtrip_single_and_many_chunks() {
        let cargo: Vec<u8> = (0..=254u8).collect();
        for (len, chunk_size) in [(0usize, 20usize), (5, 20), (15, 20), (40, 8), (255, 20), (255, 40), (255, 300)] {
            let cargo = &cargo[..len];
            let chunks = encode(0x6c, 0x2a, cargo, chunk_size).unwrap();
            let msg = parse_header(&reassemble(&chunks)).unwrap();
            assert_eq!(msg.opcode, 0x6c);
            assert_eq!(msg.tx_id, 0x2a);
            assert_eq!(msg.cargo, cargo);
        }
    }

    #[test]
    fn oversized_cargo_rejected_for_every_chunk_size() {
        let cargo = vec![0u8; 256];
        for chunk_size in [MIN_CHUNK_SIZE, 20, 40, 512] {
            assert_eq!(
                encode(1, 1, &cargo, chunk_size),
                Err(FrameEncodeError::CargoTooLarge(256))
            );
        }
    }

    #[test]
    fn layout_matches_wire_format() {
        let raw = encode_message(0x10, 7, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&raw[..5], &[0x10, 7, 2, 0xAA, 0xBB]);
        assert_eq!(&raw[5..], &integrity::crc16_trailer(&raw[..5]));
    }

    #[test]
    fn corrupt_crc_rejected() {
        let raw = encode_message(0x24, 3, b"cargo").unwrap();
        let n = raw.len();
        for idx in [n - 2, n - 1] {
            let mut bad = raw.clone();
            bad[idx] ^= 0x01;
            assert_eq!(decode_message(&bad), Err(FrameDecodeError::CrcMismatch));
            assert!(parse_header(&bad).is_none());
        }
    }

    #[test]
    fn overstated_length_rejected() {
        let mut raw = encode_message(0x24, 3, b"cargo").unwrap();
        raw[2] = 9;
        assert!(matches!(
            decode_message(&raw),
            Err(FrameDecodeError::LengthMismatch { claimed: 9, actual: 5 })
        ));
        assert!(parse_header(&raw).is_none());
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(decode_message(&[1, 2, 0, 9]), Err(FrameDecodeError::TooShort(4)));
        assert!(parse_header(&[]).is_none());
    }
}
