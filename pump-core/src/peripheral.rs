//! Pump-side authorization responders for tests and host simulation.
//!
//! Each responder answers one authorization request at a time with the exact response a
//! pump sends, using the same primitives as the client so both ends stay bit-compatible.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::auth::{require_len, AuthError, AuthMessage, AuthMode, PairingCode};
use crate::ecjpake::{EcJpake, EcJpakeError, Role, KEY_BLOCK_LEN, ROUND_ONE_LEN};
use crate::jpake::{
    confirmation_hmac, confirmation_key, APP_ID_LEN, HMAC_LEN, KEY_CONFIRMATION_LEN, NONCE_LEN,
    RESERVED_LEN, ROUND_ONE_HALF_CARGO_LEN,
};
use crate::legacy_auth::pairing_digest;
use crate::protocol::auth as opcodes;
use crate::protocol::response_opcode;

fn reply(request: &AuthMessage, parts: &[&[u8]]) -> AuthMessage {
    let mut cargo = request.cargo[..APP_ID_LEN].to_vec();
    for p in parts {
        cargo.extend_from_slice(p);
    }
    AuthMessage {
        opcode: response_opcode(request.opcode),
        cargo,
    }
}

/// Pump end of the legacy challenge-response.
pub struct LegacyPump {
    pairing_code: PairingCode,
    hmac_key: Zeroizing<[u8; 8]>,
}

impl LegacyPump {
    pub fn new(pairing_code: PairingCode) -> Result<Self, AuthError> {
        if pairing_code.mode() != AuthMode::Legacy {
            return Err(AuthError::InvalidPairingCode);
        }
        Ok(Self {
            pairing_code,
            hmac_key: Zeroizing::new([0u8; 8]),
        })
    }

    pub fn respond(&mut self, request: &AuthMessage) -> Result<AuthMessage, AuthError> {
        match request.opcode {
            opcodes::CENTRAL_CHALLENGE_REQUEST => {
                require_len("central challenge request", &request.cargo, 10)?;
                let mut mac = Hmac::<Sha1>::new_from_slice(self.pairing_code.as_bytes())
                    .map_err(|_| AuthError::InvalidPairingCode)?;
                mac.update(&request.cargo[2..10]);
                let challenge_hmac = mac.finalize().into_bytes();
                OsRng.fill_bytes(&mut self.hmac_key[..]);
                Ok(reply(request, &[&challenge_hmac[..], &self.hmac_key[..]]))
            }
            opcodes::PUMP_CHALLENGE_REQUEST => {
                require_len("pump challenge request", &request.cargo, 22)?;
                let expected = pairing_digest(&self.pairing_code, &self.hmac_key[..])?;
                let ok = request.cargo[2..22] == expected[..];
                Ok(reply(request, &[&[u8::from(ok)][..]]))
            }
            other => Err(AuthError::UnexpectedOpcode(other)),
        }
    }
}

/// Pump end of the JPAKE handshake (EC-JPAKE server role plus key confirmation).
pub struct JpakePump {
    exchange: EcJpake,
    round_one: Zeroizing<Vec<u8>>,
    client_round_one: Zeroizing<Vec<u8>>,
    derived_secret: Option<Zeroizing<[u8; 32]>>,
    confirmation_key: Option<Zeroizing<[u8; 32]>>,
    complete: bool,
}

impl JpakePump {
    pub fn new(pairing_code: PairingCode) -> Result<Self, AuthError> {
        if pairing_code.mode() != AuthMode::Jpake {
            return Err(AuthError::InvalidPairingCode);
        }
        let exchange = EcJpake::new(Role::Server, pairing_code.as_bytes())?;
        Ok(Self {
            round_one: Zeroizing::new(exchange.write_round_one()),
            exchange,
            client_round_one: Zeroizing::new(Vec::with_capacity(ROUND_ONE_LEN)),
            derived_secret: None,
            confirmation_key: None,
            complete: false,
        })
    }

    /// Secret the pump derived, once the client's key confirmation verified.
    pub fn derived_secret(&self) -> Option<&[u8; 32]> {
        if !self.complete {
            return None;
        }
        self.derived_secret.as_deref()
    }

    pub fn respond(&mut self, request: &AuthMessage) -> Result<AuthMessage, AuthError> {
        let cargo = &request.cargo[..];
        match request.opcode {
            opcodes::JPAKE_1A_REQUEST => {
                require_len("jpake 1a request", cargo, ROUND_ONE_HALF_CARGO_LEN)?;
                self.client_round_one
                    .extend_from_slice(&cargo[APP_ID_LEN..ROUND_ONE_HALF_CARGO_LEN]);
                Ok(reply(request, &[&self.round_one[..KEY_BLOCK_LEN]]))
            }
            opcodes::JPAKE_1B_REQUEST => {
                require_len("jpake 1b request", cargo, ROUND_ONE_HALF_CARGO_LEN)?;
                self.client_round_one
                    .extend_from_slice(&cargo[APP_ID_LEN..ROUND_ONE_HALF_CARGO_LEN]);
                self.exchange.read_round_one(&self.client_round_one)?;
                Ok(reply(request, &[&self.round_one[KEY_BLOCK_LEN..]]))
            }
            opcodes::JPAKE_2_REQUEST => {
                require_len("jpake 2 request", cargo, APP_ID_LEN + KEY_BLOCK_LEN)?;
                self.exchange
                    .read_round_two(&cargo[APP_ID_LEN..APP_ID_LEN + KEY_BLOCK_LEN])?;
                let round_two = self.exchange.write_round_two()?;
                self.derived_secret = Some(self.exchange.derive_secret()?);
                Ok(reply(request, &[&round_two[..]]))
            }
            opcodes::JPAKE_SESSION_KEY_REQUEST => {
                require_len("session key request", cargo, APP_ID_LEN)?;
                let secret = self
                    .derived_secret
                    .as_ref()
                    .ok_or(AuthError::KeyExchange(EcJpakeError::MissingRound))?;
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                self.confirmation_key = Some(confirmation_key(&nonce, &secret[..])?);
                Ok(reply(request, &[&nonce[..], &[0u8; RESERVED_LEN][..]]))
            }
            opcodes::JPAKE_KEY_CONFIRMATION_REQUEST => {
                require_len("key confirmation request", cargo, KEY_CONFIRMATION_LEN)?;
                let key = self
                    .confirmation_key
                    .as_ref()
                    .ok_or(AuthError::KeyExchange(EcJpakeError::MissingRound))?;
                let client_nonce = &cargo[APP_ID_LEN..APP_ID_LEN + NONCE_LEN];
                let hmac_at = KEY_CONFIRMATION_LEN - HMAC_LEN;
                let expected = confirmation_hmac(&key[..], client_nonce)?;
                if cargo[hmac_at..KEY_CONFIRMATION_LEN] != expected {
                    return Err(AuthError::ConfirmationMismatch);
                }
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let hmac = confirmation_hmac(&key[..], &nonce)?;
                self.complete = true;
                Ok(reply(request, &[&nonce[..], &[0u8; RESERVED_LEN][..], &hmac[..]]))
            }
            other => Err(AuthError::UnexpectedOpcode(other)),
        }
    }
}

/// Whichever pump responder the pairing code calls for.
pub enum PumpResponder {
    Legacy(LegacyPump),
    Jpake(JpakePump),
}

impl PumpResponder {
    pub fn for_code(pairing_code: PairingCode) -> Result<Self, AuthError> {
        match pairing_code.mode() {
            AuthMode::Legacy => Ok(PumpResponder::Legacy(LegacyPump::new(pairing_code)?)),
            AuthMode::Jpake => Ok(PumpResponder::Jpake(JpakePump::new(pairing_code)?)),
        }
    }

    pub fn respond(&mut self, request: &AuthMessage) -> Result<AuthMessage, AuthError> {
        match self {
            PumpResponder::Legacy(p) => p.respond(request),
            PumpResponder::Jpake(p) => p.respond(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;

    fn handshake(client_code: &str, pump_code: &str) -> Result<(), AuthError> {
        let mut client = Authenticator::new(0x0102, PairingCode::parse(client_code)?)?;
        let mut pump = PumpResponder::for_code(PairingCode::parse(pump_code)?)?;
        let mut request = client.start()?;
        loop {
            let response = pump.respond(&request)?;
            assert_eq!(&response.cargo[..2], &[0x02, 0x01]);
            match client.process(response.opcode, &response.cargo)? {
                Some(next) => request = next,
                None => return Ok(()),
            }
        }
    }

    #[test]
    fn legacy_pump_accepts_matching_code() {
        handshake("abcdefghijklmnop", "abcdefghijklmnop").unwrap();
    }

    #[test]
    fn legacy_pump_rejects_wrong_code() {
        assert_eq!(
            handshake("abcdefghijklmnop", "ponmlkjihgfedcba"),
            Err(AuthError::Rejected)
        );
    }

    #[test]
    fn jpake_pump_handshake() {
        handshake("000042", "000042").unwrap();
        assert!(handshake("000042", "000043").is_err());
    }

    #[test]
    fn unknown_opcode_refused() {
        let mut pump = PumpResponder::for_code(PairingCode::parse("123456").unwrap()).unwrap();
        let request = AuthMessage {
            opcode: 99,
            cargo: vec![0, 0],
        };
        assert_eq!(pump.respond(&request), Err(AuthError::UnexpectedOpcode(99)));
    }
}
