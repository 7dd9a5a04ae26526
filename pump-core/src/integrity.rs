//! Integrity: CRC16 message trailer, bond-loss signal tracking.

use crc::{Crc, CRC_16_IBM_3740};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF). Must match the pump bit-for-bit.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Default number of occurrences of any one bond signal before the bond is considered lost.
pub const DEFAULT_BOND_LOSS_THRESHOLD: u32 = 3;

/// CRC16 over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Trailer bytes for `bytes` (big-endian, as the pump sends them).
pub fn crc16_trailer(bytes: &[u8]) -> [u8; 2] {
    crc16(bytes).to_be_bytes()
}

/// Verify `bytes` against a received trailer.
pub fn verify_crc16(bytes: &[u8], trailer: [u8; 2]) -> bool {
    crc16_trailer(bytes) == trailer
}

/// Symptom of a lost link-layer bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondSignal {
    /// Link dropped shortly after it came up.
    RapidDisconnect,
    /// Link came up but the pump never answered a request.
    ZeroResponseConnection,
    /// Link-layer encryption or authentication was refused.
    EncryptionFailure,
}

/// Tracks bond-loss signals. Each signal has its own counter; any counter reaching
/// the threshold means the pairing must be redone by the user.
#[derive(Debug, Clone)]
pub struct BondLossTracker {
    rapid_disconnects: u32,
    zero_response_connections: u32,
    encryption_failures: u32,
    threshold: u32,
}

impl BondLossTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            rapid_disconnects: 0,
            zero_response_connections: 0,
            encryption_failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one occurrence. Returns true if the bond is now considered lost.
    pub fn record(&mut self, signal: BondSignal) -> bool {
        *self.counter_mut(signal) += 1;
        self.is_bond_lost()
    }

    /// Reset one counter after evidence that the symptom went away.
    pub fn clear(&mut self, signal: BondSignal) {
        *self.counter_mut(signal) = 0;
    }

    pub fn reset(&mut self) {
        self.rapid_disconnects = 0;
        self.zero_response_connections = 0;
        self.encryption_failures = 0;
    }

    pub fn count(&self, signal: BondSignal) -> u32 {
        match signal {
            BondSignal::RapidDisconnect => self.rapid_disconnects,
            BondSignal::ZeroResponseConnection => self.zero_response_connections,
            BondSignal::EncryptionFailure => self.encryption_failures,
        }
    }

    pub fn is_bond_lost(&self) -> bool {
        self.rapid_disconnects >= self.threshold
            || self.zero_response_connections >= self.threshold
            || self.encryption_failures >= self.threshold
    }

    fn counter_mut(&mut self, signal: BondSignal) -> &mut u32 {
        match signal {
            BondSignal::RapidDisconnect => &mut self.rapid_disconnects,
            BondSignal::ZeroResponseConnection => &mut self.zero_response_connections,
            BondSignal::EncryptionFailure => &mut self.encryption_failures,
        }
    }
}

impl Default for BondLossTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BOND_LOSS_THRESHOLD)
    }
}
