//! Chunking: split a raw message into link-sized packets, reassemble on receive.
//!
//! Chunk layout: `header(1) | txId(1) | message bytes`. The header's high nibble counts
//! the packets still to come, so the last chunk of every message carries 0.

use crate::wire::FrameEncodeError;

/// Header byte plus txId byte.
pub const CHUNK_HEADER_LEN: usize = 2;

/// A chunk must carry at least one message byte.
pub const MIN_CHUNK_SIZE: usize = CHUNK_HEADER_LEN + 1;

/// The countdown is one nibble.
pub const MAX_CHUNKS: usize = 16;

/// Chunk size for a default (23-byte) ATT MTU.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Split `raw` into chunks of at most `chunk_size` bytes, header included.
pub fn split_into_chunks(
    tx_id: u8,
    raw: &[u8],
    chunk_size: usize,
) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(FrameEncodeError::ChunkSizeTooSmall(chunk_size));
    }
    let per_chunk = chunk_size - CHUNK_HEADER_LEN;
    let count = raw.len().div_ceil(per_chunk).max(1);
    if count > MAX_CHUNKS {
        return Err(FrameEncodeError::TooManyChunks(count));
    }
    if raw.is_empty() {
        return Ok(vec![vec![0, tx_id]]);
    }
    Ok(raw
        .chunks(per_chunk)
        .enumerate()
        .map(|(i, part)| {
            let remaining = (count - 1 - i) as u8;
            let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + part.len());
            out.push(remaining << 4);
            out.push(tx_id);
            out.extend_from_slice(part);
            out
        })
        .collect())
}

/// Countdown carried by a chunk header.
pub fn packets_remaining(chunk: &[u8]) -> Option<u8> {
    chunk.first().map(|h| h >> 4)
}

/// Result of feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum PushResult {
    /// More chunks expected.
    InProgress,
    /// Countdown reached zero; the raw message is ready for `wire::decode_message`.
    Complete(Vec<u8>),
}

/// Reassembles one message at a time from chunks fed in arrival order.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    tx_id: Option<u8>,
    expected_remaining: u8,
    buffer: Vec<u8>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. A chunk that does not continue the partial message (different txId
    /// or a countdown that is not exactly one less) discards the partial message and
    /// starts over from this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<PushResult, AssembleError> {
        if chunk.len() < CHUNK_HEADER_LEN {
            self.reset();
            return Err(AssembleError::TooShort(chunk.len()));
        }
        let remaining = chunk[0] >> 4;
        let tx_id = chunk[1];
        if let Some(current) = self.tx_id {
            if current != tx_id || remaining != self.expected_remaining {
                tracing::warn!(
                    expected_tx_id = current,
                    tx_id,
                    expected_remaining = self.expected_remaining,
                    remaining,
                    dropped = self.buffer.len(),
                    "chunk does not continue partial message; discarding it"
                );
                self.reset();
            }
        }
        self.tx_id = Some(tx_id);
        self.buffer.extend_from_slice(&chunk[CHUNK_HEADER_LEN..]);
        if remaining == 0 {
            let raw = std::mem::take(&mut self.buffer);
            self.reset();
            Ok(PushResult::Complete(raw))
        } else {
            self.expected_remaining = remaining - 1;
            Ok(PushResult::InProgress)
        }
    }

    pub fn is_idle(&self) -> bool {
        self.tx_id.is_none()
    }

    pub fn reset(&mut self) {
        self.tx_id = None;
        self.expected_remaining = 0;
        self.buffer.clear();
    }
}

/// Chunk unusable for reassembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssembleError {
    #[error("chunk of {0} bytes is shorter than its header")]
    TooShort(usize),
}
