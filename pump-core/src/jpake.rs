//! JPAKE authentication: five request/response exchanges over the authorization channel
//! using a 6-digit pairing code as the EC-JPAKE password, followed by HKDF-based key
//! confirmation in both directions.
//!
//! ```text
//! 1a   appId | client round one[..165]     ->  appId | server round one[..165]
//! 1b   appId | client round one[165..]     ->  appId | server round one[165..]
//! 2    appId | client round two (165)      ->  appId | 03 00 17 | server round two (165)
//! key  appId                               ->  appId | nonce(8) | reserved(8)
//! conf appId | nonce(8) | 0(8) | hmac(32)  ->  appId | nonce(8) | reserved(8) | hmac(32)
//! ```
//!
//! Every response is checked against the exact step expected; anything else is terminal.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::auth::{app_id_bytes, require_len, AuthError, AuthMessage, AuthMode, PairingCode};
use crate::ecjpake::{EcJpake, EcJpakeError, Role, CURVE_PARAMS, KEY_BLOCK_LEN, ROUND_ONE_LEN};
use crate::protocol::auth as opcodes;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const APP_ID_LEN: usize = 2;
pub const NONCE_LEN: usize = 8;
pub(crate) const RESERVED_LEN: usize = 8;
pub const HMAC_LEN: usize = 32;

/// `appId | key block`.
pub const ROUND_ONE_HALF_CARGO_LEN: usize = APP_ID_LEN + KEY_BLOCK_LEN;

/// `appId | curve params | key block`.
pub const ROUND_TWO_RESPONSE_LEN: usize = APP_ID_LEN + CURVE_PARAMS.len() + KEY_BLOCK_LEN;

/// `appId | nonce | reserved`.
pub const SESSION_KEY_RESPONSE_LEN: usize = APP_ID_LEN + NONCE_LEN + RESERVED_LEN;

/// `appId | nonce | reserved | hmac`.
pub const KEY_CONFIRMATION_LEN: usize = APP_ID_LEN + NONCE_LEN + RESERVED_LEN + HMAC_LEN;

const HMAC_AT: usize = APP_ID_LEN + NONCE_LEN + RESERVED_LEN;

/// Linear handshake progress. Each response moves a `*Sent` step to its `*Received`
/// step; building the next request moves on from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpakeStep {
    Idle,
    Round1aSent,
    Round1aReceived,
    Round1bSent,
    Round1bReceived,
    Round2Sent,
    Round2Received,
    /// Session-key request out.
    Confirm3Sent,
    Confirm3Received,
    /// Key confirmation out.
    Confirm4Sent,
    Complete,
    Failed,
}

impl JpakeStep {
    pub fn name(self) -> &'static str {
        match self {
            JpakeStep::Idle => "IDLE",
            JpakeStep::Round1aSent => "ROUND_1A_SENT",
            JpakeStep::Round1aReceived => "ROUND_1A_RECEIVED",
            JpakeStep::Round1bSent => "ROUND_1B_SENT",
            JpakeStep::Round1bReceived => "ROUND_1B_RECEIVED",
            JpakeStep::Round2Sent => "ROUND_2_SENT",
            JpakeStep::Round2Received => "ROUND_2_RECEIVED",
            JpakeStep::Confirm3Sent => "CONFIRM_3_SENT",
            JpakeStep::Confirm3Received => "CONFIRM_3_RECEIVED",
            JpakeStep::Confirm4Sent => "CONFIRM_4_SENT",
            JpakeStep::Complete => "COMPLETE",
            JpakeStep::Failed => "FAILED",
        }
    }
}

/// Client side of the JPAKE handshake. One instance per connection attempt; all retained
/// secret material is wiped on `reset` and on drop.
pub struct JpakeAuthenticator {
    step: JpakeStep,
    app_instance_id: u16,
    pairing_code: PairingCode,
    exchange: Option<EcJpake>,
    client_round_one: Zeroizing<Vec<u8>>,
    server_round_one: Zeroizing<Vec<u8>>,
    derived_secret: Zeroizing<[u8; 32]>,
    server_nonce: Zeroizing<[u8; NONCE_LEN]>,
    client_nonce: Zeroizing<[u8; NONCE_LEN]>,
    confirmation_key: Zeroizing<[u8; 32]>,
}

impl JpakeAuthenticator {
    pub fn new(app_instance_id: u16, pairing_code: PairingCode) -> Result<Self, AuthError> {
        if pairing_code.mode() != AuthMode::Jpake {
            return Err(AuthError::InvalidPairingCode);
        }
        Ok(Self {
            step: JpakeStep::Idle,
            app_instance_id,
            pairing_code,
            exchange: None,
            client_round_one: Zeroizing::new(Vec::new()),
            server_round_one: Zeroizing::new(Vec::new()),
            derived_secret: Zeroizing::new([0u8; 32]),
            server_nonce: Zeroizing::new([0u8; NONCE_LEN]),
            client_nonce: Zeroizing::new([0u8; NONCE_LEN]),
            confirmation_key: Zeroizing::new([0u8; 32]),
        })
    }

    pub fn step(&self) -> JpakeStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == JpakeStep::Complete
    }

    /// Shared secret, only once key confirmation succeeded.
    pub fn derived_secret(&self) -> Option<&[u8; 32]> {
        self.is_complete().then_some(&*self.derived_secret)
    }

    /// Generate round one and send its first half.
    pub fn build_jpake_1a(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(JpakeStep::Idle)?;
        let exchange = match EcJpake::new(Role::Client, self.pairing_code.as_bytes()) {
            Ok(e) => e,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.client_round_one = Zeroizing::new(exchange.write_round_one());
        self.exchange = Some(exchange);
        let cargo = self.with_app_id(&self.client_round_one[..KEY_BLOCK_LEN]);
        self.advance(JpakeStep::Round1aSent);
        Ok(AuthMessage {
            opcode: opcodes::JPAKE_1A_REQUEST,
            cargo,
        })
    }

    /// Keep the server's first half of round one.
    pub fn process_jpake_1a_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        self.check(JpakeStep::Round1aSent, "jpake 1a response", cargo, ROUND_ONE_HALF_CARGO_LEN)?;
        // Room for both halves: the second append must not reallocate.
        let mut server_round_one = Vec::with_capacity(ROUND_ONE_LEN);
        server_round_one.extend_from_slice(&cargo[APP_ID_LEN..ROUND_ONE_HALF_CARGO_LEN]);
        self.server_round_one = Zeroizing::new(server_round_one);
        self.advance(JpakeStep::Round1aReceived);
        Ok(())
    }

    /// Send the second half of our round one.
    pub fn build_jpake_1b(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(JpakeStep::Round1aReceived)?;
        let cargo = self.with_app_id(&self.client_round_one[KEY_BLOCK_LEN..ROUND_ONE_LEN]);
        self.advance(JpakeStep::Round1bSent);
        Ok(AuthMessage {
            opcode: opcodes::JPAKE_1B_REQUEST,
            cargo,
        })
    }

    /// Verify the server's complete round one. A bad proof is terminal.
    pub fn process_jpake_1b_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        self.check(JpakeStep::Round1bSent, "jpake 1b response", cargo, ROUND_ONE_HALF_CARGO_LEN)?;
        self.server_round_one
            .extend_from_slice(&cargo[APP_ID_LEN..ROUND_ONE_HALF_CARGO_LEN]);
        let verified = match self.exchange.as_mut() {
            Some(ex) => ex.read_round_one(&self.server_round_one),
            None => Err(EcJpakeError::MissingRound),
        };
        if let Err(e) = verified {
            return Err(self.fail(e.into()));
        }
        self.advance(JpakeStep::Round1bReceived);
        Ok(())
    }

    pub fn build_jpake_2(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(JpakeStep::Round1bReceived)?;
        let round_two = match self.exchange.as_mut() {
            Some(ex) => ex.write_round_two(),
            None => Err(EcJpakeError::MissingRound),
        };
        let round_two = match round_two {
            Ok(r) => Zeroizing::new(r),
            Err(e) => return Err(self.fail(e.into())),
        };
        let cargo = self.with_app_id(&round_two);
        self.advance(JpakeStep::Round2Sent);
        Ok(AuthMessage {
            opcode: opcodes::JPAKE_2_REQUEST,
            cargo,
        })
    }

    /// Verify the server's round two and derive the shared secret.
    pub fn process_jpake_2_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        self.check(JpakeStep::Round2Sent, "jpake 2 response", cargo, ROUND_TWO_RESPONSE_LEN)?;
        let secret = match self.exchange.as_mut() {
            Some(ex) => ex
                .read_round_two(&cargo[APP_ID_LEN..ROUND_TWO_RESPONSE_LEN])
                .and_then(|()| ex.derive_secret()),
            None => Err(EcJpakeError::MissingRound),
        };
        match secret {
            Ok(s) => self.derived_secret = s,
            Err(e) => return Err(self.fail(e.into())),
        }
        // Ephemeral scalars are no longer needed.
        self.exchange = None;
        self.advance(JpakeStep::Round2Received);
        Ok(())
    }

    /// Ask for the session nonce. Carries only the app id.
    pub fn build_session_key_request(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(JpakeStep::Round2Received)?;
        let cargo = app_id_bytes(self.app_instance_id).to_vec();
        self.advance(JpakeStep::Confirm3Sent);
        Ok(AuthMessage {
            opcode: opcodes::JPAKE_SESSION_KEY_REQUEST,
            cargo,
        })
    }

    /// Derive the confirmation key from the server nonce.
    pub fn process_session_key_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        self.check(JpakeStep::Confirm3Sent, "session key response", cargo, SESSION_KEY_RESPONSE_LEN)?;
        self.server_nonce
            .copy_from_slice(&cargo[APP_ID_LEN..APP_ID_LEN + NONCE_LEN]);
        match confirmation_key(&self.server_nonce[..], &self.derived_secret[..]) {
            Ok(k) => self.confirmation_key = k,
            Err(e) => return Err(self.fail(e)),
        }
        self.advance(JpakeStep::Confirm3Received);
        Ok(())
    }

    /// Prove we hold the confirmation key.
    pub fn build_key_confirmation(&mut self) -> Result<AuthMessage, AuthError> {
        self.expect(JpakeStep::Confirm3Received)?;
        OsRng.fill_bytes(&mut self.client_nonce[..]);
        let hmac = match confirmation_hmac(&self.confirmation_key[..], &self.client_nonce[..]) {
            Ok(h) => h,
            Err(e) => return Err(self.fail(e)),
        };
        let mut out = Vec::with_capacity(KEY_CONFIRMATION_LEN);
        out.extend_from_slice(&app_id_bytes(self.app_instance_id));
        out.extend_from_slice(&self.client_nonce[..]);
        out.extend_from_slice(&[0u8; RESERVED_LEN]);
        out.extend_from_slice(&hmac[..]);
        self.advance(JpakeStep::Confirm4Sent);
        Ok(AuthMessage {
            opcode: opcodes::JPAKE_KEY_CONFIRMATION_REQUEST,
            cargo: out,
        })
    }

    /// Recompute the server's HMAC over its returned nonce. Only a match completes the handshake.
    pub fn process_key_confirmation_response(&mut self, cargo: &[u8]) -> Result<(), AuthError> {
        self.check(
            JpakeStep::Confirm4Sent,
            "key confirmation response",
            cargo,
            KEY_CONFIRMATION_LEN,
        )?;
        let nonce = &cargo[APP_ID_LEN..APP_ID_LEN + NONCE_LEN];
        let mut mac = match HmacSha256::new_from_slice(&self.confirmation_key[..]) {
            Ok(m) => m,
            Err(_) => return Err(self.fail(AuthError::KeyDerivation)),
        };
        mac.update(nonce);
        if mac.verify_slice(&cargo[HMAC_AT..KEY_CONFIRMATION_LEN]).is_err() {
            tracing::warn!("jpake key confirmation mismatch");
            return Err(self.fail(AuthError::ConfirmationMismatch));
        }
        self.advance(JpakeStep::Complete);
        Ok(())
    }

    /// Route a pump response to the step its opcode belongs to and build the next request.
    pub fn process(&mut self, opcode: u8, cargo: &[u8]) -> Result<Option<AuthMessage>, AuthError> {
        match opcode {
            opcodes::JPAKE_1A_RESPONSE => {
                self.process_jpake_1a_response(cargo)?;
                self.build_jpake_1b().map(Some)
            }
            opcodes::JPAKE_1B_RESPONSE => {
                self.process_jpake_1b_response(cargo)?;
                self.build_jpake_2().map(Some)
            }
            opcodes::JPAKE_2_RESPONSE => {
                self.process_jpake_2_response(cargo)?;
                self.build_session_key_request().map(Some)
            }
            opcodes::JPAKE_SESSION_KEY_RESPONSE => {
                self.process_session_key_response(cargo)?;
                self.build_key_confirmation().map(Some)
            }
            opcodes::JPAKE_KEY_CONFIRMATION_RESPONSE => {
                self.process_key_confirmation_response(cargo).map(|()| None)
            }
            other => Err(self.fail(AuthError::UnexpectedOpcode(other))),
        }
    }

    /// Overwrite every retained buffer and return to `IDLE`.
    pub fn reset(&mut self) {
        self.exchange = None;
        self.client_round_one.zeroize();
        self.server_round_one.zeroize();
        self.derived_secret.zeroize();
        self.server_nonce.zeroize();
        self.client_nonce.zeroize();
        self.confirmation_key.zeroize();
        self.step = JpakeStep::Idle;
    }

    fn expect(&self, expected: JpakeStep) -> Result<(), AuthError> {
        if self.step != expected {
            return Err(AuthError::WrongState {
                expected: expected.name(),
                actual: self.step.name(),
            });
        }
        Ok(())
    }

    /// Step and length check for an inbound response; either failure is terminal.
    fn check(
        &mut self,
        expected: JpakeStep,
        message: &'static str,
        cargo: &[u8],
        len: usize,
    ) -> Result<(), AuthError> {
        if let Err(e) = self
            .expect(expected)
            .and_then(|()| require_len(message, cargo, len))
        {
            return Err(self.fail(e));
        }
        Ok(())
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        tracing::debug!(step = self.step.name(), error = %err, "jpake failed");
        self.exchange = None;
        self.step = JpakeStep::Failed;
        err
    }

    fn advance(&mut self, next: JpakeStep) {
        tracing::debug!(from = self.step.name(), to = next.name(), "jpake");
        self.step = next;
    }

    fn with_app_id(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(APP_ID_LEN + body.len());
        out.extend_from_slice(&app_id_bytes(self.app_instance_id));
        out.extend_from_slice(body);
        out
    }
}

/// `HKDF-SHA256(salt = server nonce, ikm = derived secret, info = "")`, 32 bytes.
pub fn confirmation_key(server_nonce: &[u8], secret: &[u8]) -> Result<Zeroizing<[u8; 32]>, AuthError> {
    let hk = Hkdf::<Sha256>::new(Some(server_nonce), secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&[], &mut okm[..])
        .map_err(|_| AuthError::KeyDerivation)?;
    Ok(okm)
}

/// `HMAC-SHA256(key = confirmation key, message = nonce)`.
pub fn confirmation_hmac(key: &[u8], nonce: &[u8]) -> Result<[u8; HMAC_LEN], AuthError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::KeyDerivation)?;
    mac.update(nonce);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
