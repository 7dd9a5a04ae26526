//! Shared authentication types: pairing codes, outbound requests, errors.

use zeroize::Zeroizing;

use crate::ecjpake::EcJpakeError;
use crate::jpake::JpakeAuthenticator;
use crate::legacy_auth::LegacyAuthenticator;

/// Legacy pairing codes are 16 alphanumerics.
pub const LEGACY_PAIRING_CODE_LEN: usize = 16;

/// JPAKE pairing codes are 6 digits.
pub const JPAKE_PAIRING_CODE_LEN: usize = 6;

/// Which handshake a pump speaks. Mutually exclusive per pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Legacy,
    Jpake,
}

/// Normalized pairing code as shown on the pump screen. Wiped on drop.
#[derive(Clone)]
pub struct PairingCode {
    code: Zeroizing<String>,
    mode: AuthMode,
}

impl PairingCode {
    /// Strip whitespace and dashes, then pick the handshake from the shape of the code.
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let code: Zeroizing<String> = Zeroizing::new(
            input
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect(),
        );
        let mode = if code.len() == JPAKE_PAIRING_CODE_LEN && code.chars().all(|c| c.is_ascii_digit()) {
            AuthMode::Jpake
        } else if code.len() == LEGACY_PAIRING_CODE_LEN && code.chars().all(|c| c.is_ascii_alphanumeric()) {
            AuthMode::Legacy
        } else {
            return Err(AuthError::InvalidPairingCode);
        };
        Ok(Self { code, mode })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.code.as_bytes()
    }
}

impl std::fmt::Debug for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCode")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// One authorization-channel message: what an authenticator writes, or what a pump answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    pub opcode: u8,
    pub cargo: Vec<u8>,
}

/// Authentication failure. `WrongState` lets callers tell a sequencing bug from a
/// rejected pairing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("pairing code must be 6 digits (JPAKE) or 16 alphanumerics (legacy)")]
    InvalidPairingCode,
    #[error("operation requires state {expected}, authenticator is {actual}")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{message} cargo: expected {expected} bytes, got {actual}")]
    MalformedCargo {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unexpected opcode {0} on the authorization channel")]
    UnexpectedOpcode(u8),
    #[error("pump rejected the pairing")]
    Rejected,
    #[error("key confirmation failed: pump HMAC mismatch")]
    ConfirmationMismatch,
    #[error("confirmation key derivation failed")]
    KeyDerivation,
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] EcJpakeError),
}

impl AuthError {
    /// True when the pump (or its proofs) refused us; such failures need re-pairing,
    /// never an automatic retry.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::Rejected
                | AuthError::ConfirmationMismatch
                | AuthError::KeyExchange(EcJpakeError::ProofRejected)
                | AuthError::InvalidPairingCode
        )
    }
}

/// The handshake chosen by the pairing code. One instance per connection attempt.
pub enum Authenticator {
    Legacy(LegacyAuthenticator),
    Jpake(JpakeAuthenticator),
}

impl Authenticator {
    pub fn new(app_instance_id: u16, pairing_code: PairingCode) -> Result<Self, AuthError> {
        match pairing_code.mode() {
            AuthMode::Legacy => Ok(Authenticator::Legacy(LegacyAuthenticator::new(
                app_instance_id,
                pairing_code,
            )?)),
            AuthMode::Jpake => Ok(Authenticator::Jpake(JpakeAuthenticator::new(
                app_instance_id,
                pairing_code,
            )?)),
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Authenticator::Legacy(_) => AuthMode::Legacy,
            Authenticator::Jpake(_) => AuthMode::Jpake,
        }
    }

    /// First message of the handshake.
    pub fn start(&mut self) -> Result<AuthMessage, AuthError> {
        match self {
            Authenticator::Legacy(a) => a.build_central_challenge_request(),
            Authenticator::Jpake(a) => a.build_jpake_1a(),
        }
    }

    /// Feed one pump response. `Some` is the next message to write; `None` means the
    /// handshake finished successfully.
    pub fn process(&mut self, opcode: u8, cargo: &[u8]) -> Result<Option<AuthMessage>, AuthError> {
        match self {
            Authenticator::Legacy(a) => a.process(opcode, cargo),
            Authenticator::Jpake(a) => a.process(opcode, cargo),
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Authenticator::Legacy(a) => a.is_authenticated(),
            Authenticator::Jpake(a) => a.is_complete(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Authenticator::Legacy(a) => a.reset(),
            Authenticator::Jpake(a) => a.reset(),
        }
    }
}

/// Little-endian app-instance id prefix shared by every auth cargo.
pub(crate) fn app_id_bytes(app_instance_id: u16) -> [u8; 2] {
    app_instance_id.to_le_bytes()
}

/// Reject cargo shorter than `expected`.
pub(crate) fn require_len(message: &'static str, cargo: &[u8], expected: usize) -> Result<(), AuthError> {
    if cargo.len() < expected {
        return Err(AuthError::MalformedCargo {
            message,
            expected,
            actual: cargo.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_digits_select_jpake() {
        let code = PairingCode::parse(" 123-456 ").unwrap();
        assert_eq!(code.mode(), AuthMode::Jpake);
        assert_eq!(code.as_bytes(), b"123456");
    }

    #[test]
    fn sixteen_alphanumerics_select_legacy() {
        let code = PairingCode::parse("abcd-efgh-ijkl-mnop").unwrap();
        assert_eq!(code.mode(), AuthMode::Legacy);
        assert_eq!(code.as_bytes(), b"abcdefghijklmnop");
    }

    #[test]
    fn other_shapes_rejected() {
        for bad in ["", "12345", "12345a", "abcdefghijklmno", "abcdefghijklmno!"] {
            assert_eq!(
                PairingCode::parse(bad).unwrap_err(),
                AuthError::InvalidPairingCode,
                "{bad:?}"
            );
        }
    }

    #[test]
    fn authenticator_follows_code_shape() {
        let legacy = Authenticator::new(1, PairingCode::parse("abcdefghijklmnop").unwrap()).unwrap();
        assert_eq!(legacy.mode(), AuthMode::Legacy);
        let jpake = Authenticator::new(1, PairingCode::parse("123456").unwrap()).unwrap();
        assert_eq!(jpake.mode(), AuthMode::Jpake);
        assert!(!jpake.is_complete());
    }

    #[test]
    fn debug_hides_code() {
        let code = PairingCode::parse("123456").unwrap();
        assert!(!format!("{code:?}").contains("123456"));
    }

    #[test]
    fn rejection_classification() {
        assert!(AuthError::Rejected.is_rejection());
        assert!(AuthError::KeyExchange(EcJpakeError::ProofRejected).is_rejection());
        assert!(AuthError::ConfirmationMismatch.is_rejection());
        assert!(!AuthError::UnexpectedOpcode(99).is_rejection());
        assert!(!AuthError::WrongState {
            expected: "IDLE",
            actual: "FAILED"
        }
        .is_rejection());
        assert!(!AuthError::MalformedCargo {
            message: "x",
            expected: 3,
            actual: 1
        }
        .is_rejection());
    }
}
