//! Caller-facing link errors.

use pump_core::{AuthError, DecodeError, FrameDecodeError, FrameEncodeError};

use crate::transport::TransportError;

/// Everything a pump operation can fail with. Nothing panics or throws across the driver
/// boundary; callers branch on the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("pump not connected")]
    NotConnected,
    #[error("timed out waiting for the pump")]
    Timeout,
    #[error("cancelled by disconnect")]
    Cancelled,
    #[error("link lost while waiting for a response")]
    LinkLost,
    #[error("bond lost: re-pair the pump")]
    BondLost,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("framing: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("corrupt response: {0}")]
    Corrupt(#[from] FrameDecodeError),
    #[error("authentication: {0}")]
    Auth(#[from] AuthError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("pump rejected the request (status {status})")]
    Rejected { status: u8 },
}

impl LinkError {
    /// Timeouts are the one failure worth retrying as-is.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout)
    }

    /// Failures after which no further request on this connection can succeed.
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            LinkError::NotConnected | LinkError::Cancelled | LinkError::LinkLost | LinkError::BondLost
        )
    }
}
