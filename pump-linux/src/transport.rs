//! Transport seam: the byte-oriented write/notify primitive the link runs on.
//!
//! The connection manager only ever writes chunks to a channel and consumes the events a
//! transport pushes back, so the real BLE stack and the test pump are interchangeable.

use std::future::Future;

use pump_core::Channel;
use tokio::sync::mpsc;

/// Pushed by a transport for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One notified chunk.
    Notification { channel: Channel, data: Vec<u8> },
    /// The link dropped. Nothing follows on this sender.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("pump {0} not found")]
    NotFound(String),
    /// Link-layer encryption or pairing failed; feeds bond-loss detection.
    #[error("link encryption failed: {0}")]
    Encryption(String),
    #[error("transport not connected")]
    NotConnected,
    #[error("characteristic for {0:?} not found")]
    MissingCharacteristic(Channel),
    #[error("{0}")]
    Ble(String),
}

pub trait Transport: Send + Sync + 'static {
    /// Locate the pump (the scanning phase).
    fn find(&self, address: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Connect, discover and subscribe. Notifications and link loss for this connection are
    /// delivered on `events`.
    fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Acknowledged write of one chunk.
    fn write(&self, channel: Channel, chunk: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}
