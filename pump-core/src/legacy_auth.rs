//! Legacy challenge-response authentication with a 16-character pairing code.
//!
//! Linear and one-shot: `IDLE -> CHALLENGE_SENT -> RESPONSE_SENT -> AUTHENTICATED | FAILED`.
//! Retries belong to the connection manager, which builds a fresh authenticator.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use zeroize::{Zeroize, Zeroizing};

use crate::auth::{app_id_bytes, require_len, AuthError, AuthMode, AuthMessage, PairingCode};
use crate::protocol::auth as opcodes;

type HmacSha1 = Hmac<Sha1>;

/// Random challenge the central sends first.
pub const CENTRAL_CHALLENGE_LEN: usize = 8;

/// `appId(2) | pump HMAC of our challenge(20) | hmacKey(8)`.
pub const CHALLENGE_RESPONSE_LEN: usize = 30;

/// `appId(2) | success(1)`.
pub const PUMP_CHALLENGE_RESPONSE_LEN: usize = 3;

const HMAC_KEY_AT: usize = 22;
const HMAC_KEY_LEN: usize = 8;
const SUCCESS_AT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyAuthState {
    Idle,
    ChallengeSent,
    ResponseSent,
    Authenticated,
    Failed,
}

impl LegacyAuthState {
    pub fn name(self) -> &'static str {
        match self {
            LegacyAuthState::Idle => "IDLE",
            LegacyAuthState::ChallengeSent => "CHALLENGE_SENT",
            LegacyAuthState::ResponseSent => "RESPONSE_SENT",
            LegacyAuthState::Authenticated => "AUTHENTICATED",
            LegacyAuthState::Failed => "FAILED",
        }
    }
}

pub struct LegacyAuthenticator {
    state: LegacyAuthState,
    app_instance_id: u16,
    pairing_code: PairingCode,
    challenge: Zeroizing<[u8; CENTRAL_CHALLENGE_LEN]>,
}

impl LegacyAuthenticator {
    pub fn new(app_instance_id: u16, pairing_code: PairingCode) -> Result<Self, AuthError> {
        if pairing_code.mode() != AuthMode::Legacy {
            return Err(AuthError::InvalidPairingCode);
        }
        Ok(Self {
            state: LegacyAuthState::Idle,
            app_instance_id,
            pairing_code,
            challenge: Zeroizing::new([0u8; CENTRAL_CHALLENGE_LEN]),
        })
    }

    pub fn state(&self) -> LegacyAuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == LegacyAuthState::Authenticated
    }

    /// Step 1: `appId | challenge(8)`.
    pub fn build_central_challenge_request(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(LegacyAuthState::Idle)?;
        OsRng.fill_bytes(&mut self.challenge[..]);
        let mut cargo = Vec::with_capacity(2 + CENTRAL_CHALLENGE_LEN);
        cargo.extend_from_slice(&app_id_bytes(self.app_instance_id));
        cargo.extend_from_slice(&self.challenge[..]);
        self.set_state(LegacyAuthState::ChallengeSent);
        Ok(AuthMessage {
            opcode: opcodes::CENTRAL_CHALLENGE_REQUEST,
            cargo,
        })
    }

    /// Step 2: answer the pump's challenge with `HMAC-SHA1(pairing code, hmacKey)`.
    /// Called out of order it is refused without touching state.
    pub fn process_challenge_response(&mut self, cargo: &[u8]) -> Result<AuthMessage, AuthError> {
        self.expect(LegacyAuthState::ChallengeSent)?;
        if let Err(e) = require_len("central challenge response", cargo, CHALLENGE_RESPONSE_LEN) {
            self.set_state(LegacyAuthState::Failed);
            return Err(e);
        }
        // TODO: bytes 2..22 (the pump's HMAC over our challenge) are not verified; needs a
        // product decision on the pump-side key before it can be enforced.
        let hmac_key = &cargo[HMAC_KEY_AT..HMAC_KEY_AT + HMAC_KEY_LEN];
        let digest = pairing_digest(&self.pairing_code, hmac_key)?;
        let mut out = Vec::with_capacity(2 + digest.len());
        out.extend_from_slice(&app_id_bytes(self.app_instance_id));
        out.extend_from_slice(&digest[..]);
        self.set_state(LegacyAuthState::ResponseSent);
        Ok(AuthMessage {
            opcode: opcodes::PUMP_CHALLENGE_REQUEST,
            cargo: out,
        })
    }

    /// Step 3: byte 2 of the pump's answer is the verdict (1 = authenticated).
    pub fn process_pump_challenge_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        if let Err(e) = self.expect(LegacyAuthState::ResponseSent) {
            self.set_state(LegacyAuthState::Failed);
            return Err(e);
        }
        if let Err(e) = require_len("pump challenge response", cargo, PUMP_CHALLENGE_RESPONSE_LEN) {
            self.set_state(LegacyAuthState::Failed);
            return Err(e);
        }
        if cargo[SUCCESS_AT] == 1 {
            self.set_state(LegacyAuthState::Authenticated);
            Ok(())
        } else {
            self.set_state(LegacyAuthState::Failed);
            Err(AuthError::Rejected)
        }
    }

    /// Route a pump response to the step its opcode belongs to.
    pub fn process(&mut self, opcode: u8, cargo: &[u8]) -> Result<Option<AuthMessage>, AuthError> {
        match opcode {
            opcodes::CENTRAL_CHALLENGE_RESPONSE => self.process_challenge_response(cargo).map(Some),
            opcodes::PUMP_CHALLENGE_RESPONSE => self.process_pump_challenge_response(cargo).map(|()| None),
            other => {
                self.set_state(LegacyAuthState::Failed);
                Err(AuthError::UnexpectedOpcode(other))
            }
        }
    }

    /// Wipe the challenge and return to `IDLE`.
    pub fn reset(&mut self) {
        self.challenge.zeroize();
        self.state = LegacyAuthState::Idle;
    }

    fn expect(&self, expected: LegacyAuthState) -> Result<(), AuthError> {
        if self.state != expected {
            return Err(AuthError::WrongState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn set_state(&mut self, next: LegacyAuthState) {
        tracing::debug!(from = self.state.name(), to = next.name(), "legacy auth");
        self.state = next;
    }
}

/// `HMAC-SHA1(key = pairing code ASCII, data = hmacKey)`; the pump computes the same.
pub fn pairing_digest(pairing_code: &PairingCode, hmac_key: &[u8]) -> Result<Zeroizing<[u8; 20]>, AuthError> {
    let mut mac =
        HmacSha1::new_from_slice(pairing_code.as_bytes()).map_err(|_| AuthError::InvalidPairingCode)?;
    mac.update(hmac_key);
    let mut out = Zeroizing::new([0u8; 20]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
