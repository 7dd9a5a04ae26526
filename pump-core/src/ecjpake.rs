//! EC-JPAKE over P-256: round-one and round-two key material, Schnorr proofs of
//! knowledge, and the shared secret both sides derive from the pairing code.
//!
//! Encodings follow the TLS ECJPAKE layout the pump expects: points are
//! `len(1) | uncompressed point(65)`, proofs are `point V | len(1) | r(32)`.

use p256::elliptic_curve::group::{Curve, Group};
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NonZeroScalar, ProjectivePoint, Scalar, U256};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Uncompressed SEC1 point.
pub const POINT_LEN: usize = 65;
const TLS_POINT_LEN: usize = 1 + POINT_LEN;
const SCALAR_LEN: usize = 32;

/// Schnorr proof: commitment point plus response scalar.
pub const ZKP_LEN: usize = TLS_POINT_LEN + 1 + SCALAR_LEN;

/// Public key followed by its proof.
pub const KEY_BLOCK_LEN: usize = TLS_POINT_LEN + ZKP_LEN;

/// Round one carries two key blocks.
pub const ROUND_ONE_LEN: usize = 2 * KEY_BLOCK_LEN;

/// TLS ECParameters for secp256r1 (named_curve, 0x0017). Prefixes the server's round two.
pub const CURVE_PARAMS: [u8; 3] = [0x03, 0x00, 0x17];

/// Which side of the exchange this instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn id(self) -> &'static [u8] {
        match self {
            Role::Client => b"client",
            Role::Server => b"server",
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Length of the round-two message this role writes.
    pub fn round_two_len(self) -> usize {
        match self {
            Role::Client => KEY_BLOCK_LEN,
            Role::Server => CURVE_PARAMS.len() + KEY_BLOCK_LEN,
        }
    }
}

/// One side of an EC-JPAKE exchange. Secret scalars are wiped on drop.
pub struct EcJpake {
    role: Role,
    password: Scalar,
    x1: Scalar,
    x2: Scalar,
    x1_pub: ProjectivePoint,
    x2_pub: ProjectivePoint,
    peer_x1: Option<ProjectivePoint>,
    peer_x2: Option<ProjectivePoint>,
    peer_round_two: Option<ProjectivePoint>,
}

impl EcJpake {
    /// Fresh ephemeral keys for one handshake attempt.
    pub fn new(role: Role, password: &[u8]) -> Result<Self, EcJpakeError> {
        let password = password_scalar(password)?;
        let x1 = *NonZeroScalar::random(&mut OsRng);
        let x2 = *NonZeroScalar::random(&mut OsRng);
        Ok(Self {
            role,
            password,
            x1,
            x2,
            x1_pub: ProjectivePoint::GENERATOR * x1,
            x2_pub: ProjectivePoint::GENERATOR * x2,
            peer_x1: None,
            peer_x2: None,
            peer_round_two: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Both ephemeral public keys with their proofs (330 bytes).
    pub fn write_round_one(&self) -> Vec<u8> {
        let g = ProjectivePoint::GENERATOR;
        let id = self.role.id();
        let mut out = Vec::with_capacity(ROUND_ONE_LEN);
        write_key_block(&mut out, &g, &self.x1, &self.x1_pub, id);
        write_key_block(&mut out, &g, &self.x2, &self.x2_pub, id);
        out
    }

    /// Verify and store the peer's round one.
    pub fn read_round_one(&mut self, bytes: &[u8]) -> Result<(), EcJpakeError> {
        if bytes.len() != ROUND_ONE_LEN {
            return Err(EcJpakeError::Length {
                expected: ROUND_ONE_LEN,
                actual: bytes.len(),
            });
        }
        let g = ProjectivePoint::GENERATOR;
        let peer_id = self.role.peer().id();
        let x3 = read_key_block(&bytes[..KEY_BLOCK_LEN], &g, peer_id)?;
        let x4 = read_key_block(&bytes[KEY_BLOCK_LEN..], &g, peer_id)?;
        self.peer_x1 = Some(x3);
        self.peer_x2 = Some(x4);
        Ok(())
    }

    /// Password-bound key with proof. The server prefixes the curve parameters.
    pub fn write_round_two(&self) -> Result<Vec<u8>, EcJpakeError> {
        let (x3, x4) = self.peer_keys()?;
        let generator = self.x1_pub + x3 + x4;
        let mut xm = self.x2 * self.password;
        let xm_pub = generator * xm;
        let mut out = Vec::with_capacity(self.role.round_two_len());
        if self.role == Role::Server {
            out.extend_from_slice(&CURVE_PARAMS);
        }
        write_key_block(&mut out, &generator, &xm, &xm_pub, self.role.id());
        xm.zeroize();
        Ok(out)
    }

    /// Verify and store the peer's round two.
    pub fn read_round_two(&mut self, bytes: &[u8]) -> Result<(), EcJpakeError> {
        let (x3, _) = self.peer_keys()?;
        let expected = self.role.peer().round_two_len();
        if bytes.len() != expected {
            return Err(EcJpakeError::Length {
                expected,
                actual: bytes.len(),
            });
        }
        let block = match self.role.peer() {
            Role::Server => {
                if bytes[..CURVE_PARAMS.len()] != CURVE_PARAMS {
                    return Err(EcJpakeError::UnsupportedCurve);
                }
                &bytes[CURVE_PARAMS.len()..]
            }
            Role::Client => bytes,
        };
        let generator = x3 + self.x1_pub + self.x2_pub;
        let xp = read_key_block(block, &generator, self.role.peer().id())?;
        self.peer_round_two = Some(xp);
        Ok(())
    }

    /// SHA-256 of the x-coordinate of the shared point. Identical on both sides only if
    /// both used the same password.
    pub fn derive_secret(&self) -> Result<Zeroizing<[u8; 32]>, EcJpakeError> {
        let (_, x4) = self.peer_keys()?;
        let xp = self.peer_round_two.ok_or(EcJpakeError::MissingRound)?;
        let mut xm = self.x2 * self.password;
        let shared = (xp - x4 * xm) * self.x2;
        xm.zeroize();
        if bool::from(shared.is_identity()) {
            return Err(EcJpakeError::InvalidPoint);
        }
        let encoded = shared.to_affine().to_encoded_point(false);
        let x = encoded.x().ok_or(EcJpakeError::InvalidPoint)?;
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&Sha256::digest(x));
        Ok(out)
    }

    fn peer_keys(&self) -> Result<(ProjectivePoint, ProjectivePoint), EcJpakeError> {
        match (self.peer_x1, self.peer_x2) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(EcJpakeError::MissingRound),
        }
    }
}

impl Drop for EcJpake {
    fn drop(&mut self) {
        self.password.zeroize();
        self.x1.zeroize();
        self.x2.zeroize();
    }
}

/// Pairing code bytes read as a big-endian integer mod n.
fn password_scalar(password: &[u8]) -> Result<Scalar, EcJpakeError> {
    if password.is_empty() || password.len() > SCALAR_LEN {
        return Err(EcJpakeError::InvalidPassword);
    }
    let mut padded = Zeroizing::new([0u8; SCALAR_LEN]);
    padded[SCALAR_LEN - password.len()..].copy_from_slice(password);
    let scalar = <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(&padded[..]));
    if bool::from(scalar.is_zero()) {
        return Err(EcJpakeError::InvalidPassword);
    }
    Ok(scalar)
}

fn encode_point(point: &ProjectivePoint) -> [u8; POINT_LEN] {
    let encoded = point.to_affine().to_encoded_point(false);
    let mut out = [0u8; POINT_LEN];
    let bytes = encoded.as_bytes();
    if bytes.len() == POINT_LEN {
        out.copy_from_slice(bytes);
    }
    out
}

fn write_point(out: &mut Vec<u8>, point: &ProjectivePoint) {
    out.push(POINT_LEN as u8);
    out.extend_from_slice(&encode_point(point));
}

fn read_point(tls: &[u8]) -> Result<ProjectivePoint, EcJpakeError> {
    if tls.len() != TLS_POINT_LEN || tls[0] as usize != POINT_LEN {
        return Err(EcJpakeError::InvalidPoint);
    }
    let encoded = EncodedPoint::from_bytes(&tls[1..]).map_err(|_| EcJpakeError::InvalidPoint)?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or(EcJpakeError::InvalidPoint)?;
    let point = ProjectivePoint::from(affine);
    if bool::from(point.is_identity()) {
        return Err(EcJpakeError::InvalidPoint);
    }
    Ok(point)
}

/// Fiat-Shamir challenge: SHA-256 over length-prefixed G, V, X and the prover's identity.
fn challenge(generator: &ProjectivePoint, v: &ProjectivePoint, x: &ProjectivePoint, id: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    for point in [generator, v, x] {
        hasher.update((POINT_LEN as u32).to_be_bytes());
        hasher.update(encode_point(point));
    }
    hasher.update((id.len() as u32).to_be_bytes());
    hasher.update(id);
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

fn write_key_block(
    out: &mut Vec<u8>,
    generator: &ProjectivePoint,
    secret: &Scalar,
    public: &ProjectivePoint,
    id: &[u8],
) {
    let mut v = *NonZeroScalar::random(&mut OsRng);
    let v_pub = *generator * v;
    let h = challenge(generator, &v_pub, public, id);
    let r = v - *secret * h;
    v.zeroize();
    write_point(out, public);
    write_point(out, &v_pub);
    out.push(SCALAR_LEN as u8);
    out.extend_from_slice(&r.to_repr());
}

/// Parse a key block and check its proof against `generator`.
fn read_key_block(
    bytes: &[u8],
    generator: &ProjectivePoint,
    id: &[u8],
) -> Result<ProjectivePoint, EcJpakeError> {
    if bytes.len() != KEY_BLOCK_LEN {
        return Err(EcJpakeError::Length {
            expected: KEY_BLOCK_LEN,
            actual: bytes.len(),
        });
    }
    let public = read_point(&bytes[..TLS_POINT_LEN])?;
    let v = read_point(&bytes[TLS_POINT_LEN..2 * TLS_POINT_LEN])?;
    let r_at = 2 * TLS_POINT_LEN;
    if bytes[r_at] as usize != SCALAR_LEN {
        return Err(EcJpakeError::InvalidScalar);
    }
    let r_bytes = FieldBytes::from_slice(&bytes[r_at + 1..]);
    let r = Option::<Scalar>::from(Scalar::from_repr(*r_bytes)).ok_or(EcJpakeError::InvalidScalar)?;
    let h = challenge(generator, &v, &public, id);
    if *generator * r + public * h != v {
        return Err(EcJpakeError::ProofRejected);
    }
    Ok(public)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcJpakeError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid or identity curve point")]
    InvalidPoint,
    #[error("invalid proof scalar")]
    InvalidScalar,
    #[error("zero-knowledge proof rejected")]
    ProofRejected,
    #[error("peer round-two uses an unsupported curve")]
    UnsupportedCurve,
    #[error("previous round missing")]
    MissingRound,
    #[error("pairing code unusable as a password")]
    InvalidPassword,
}
