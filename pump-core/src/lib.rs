//! Insulin pump BLE protocol reference implementation.
//! Host-driven: no I/O; the host writes the chunks we produce and feeds back what the pump
//! notifies. Framing, both authentication handshakes, status/history decoding and the
//! scheduling arithmetic of the connection lifecycle live here.

pub mod auth;
pub mod chunk;
pub mod decoder;
pub mod ecjpake;
pub mod history;
pub mod integrity;
pub mod jpake;
pub mod legacy_auth;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod wire;

#[cfg(any(test, feature = "peripheral-sim"))]
pub mod peripheral;

pub use auth::{AuthError, AuthMessage, AuthMode, Authenticator, PairingCode};
pub use chunk::{AssembleError, PacketAssembler, PushResult, DEFAULT_CHUNK_SIZE};
pub use decoder::DecodeError;
pub use history::{HistoryEvent, HistoryLogRecord};
pub use integrity::{BondLossTracker, BondSignal};
pub use protocol::Channel;
pub use scheduler::{HistoryBatch, HistoryRange};
pub use state::ConnectionState;
pub use wire::{decode_message, encode, parse_header, FrameDecodeError, FrameEncodeError, Message};
