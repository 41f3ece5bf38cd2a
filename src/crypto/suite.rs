//! Cipher suites and ephemeral key agreement.
//!
//! Every suite pairs an ephemeral key exchange with the same record
//! protection: AES-256-CBC for confidentiality and HMAC-SHA256 over the
//! ciphertext for integrity. Suites travel on the wire as their `u8`
//! enumerant.

use std::fmt;

use p256::ecdh::EphemeralSecret as P256Secret;
use p256::{EncodedPoint, PublicKey as P256Public};
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret as X25519Secret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use super::CryptoError;

/// A negotiable combination of key exchange, cipher and MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CryptoSuite {
    /// X25519 key agreement, Ed25519 authentication.
    X25519Ed25519Aes256CbcHmacSha256 = 1,
    /// ECDHE on NIST P-256, Ed25519 authentication.
    EcdheP256Ed25519Aes256CbcHmacSha256 = 2,
}

impl CryptoSuite {
    /// All suites this build understands, strongest preference first.
    pub const ALL: [CryptoSuite; 2] = [
        CryptoSuite::X25519Ed25519Aes256CbcHmacSha256,
        CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256,
    ];

    /// Wire identifier.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Standard name of the suite.
    pub fn name(self) -> &'static str {
        match self {
            Self::X25519Ed25519Aes256CbcHmacSha256 => "X25519_ED25519_WITH_AES256_CBC_HMAC_SHA256",
            Self::EcdheP256Ed25519Aes256CbcHmacSha256 => {
                "ECDHE_P256_ED25519_WITH_AES256_CBC_HMAC_SHA256"
            }
        }
    }

    /// Pick the first suite in `preference` that the peer also offered.
    pub fn negotiate(preference: &[CryptoSuite], offered: &[CryptoSuite]) -> Option<CryptoSuite> {
        preference
            .iter()
            .copied()
            .find(|suite| offered.contains(suite))
    }
}

impl TryFrom<u8> for CryptoSuite {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::X25519Ed25519Aes256CbcHmacSha256),
            2 => Ok(Self::EcdheP256Ed25519Aes256CbcHmacSha256),
            other => Err(CryptoError::UnknownSuite(other)),
        }
    }
}

impl From<CryptoSuite> for u8 {
    fn from(suite: CryptoSuite) -> u8 {
        suite.id()
    }
}

impl fmt::Display for CryptoSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Secret half of an ephemeral key exchange, consumed by [`agree`](Self::agree).
pub enum EphemeralKeyExchange {
    X25519 {
        secret: X25519Secret,
        public: X25519Public,
    },
    P256 {
        secret: P256Secret,
        public: P256Public,
    },
}

impl EphemeralKeyExchange {
    /// Generate a fresh ephemeral key pair for `suite`.
    pub fn generate(suite: CryptoSuite) -> Self {
        match suite {
            CryptoSuite::X25519Ed25519Aes256CbcHmacSha256 => {
                let secret = X25519Secret::random_from_rng(rand::rngs::OsRng);
                let public = X25519Public::from(&secret);
                Self::X25519 { secret, public }
            }
            CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256 => {
                let secret = P256Secret::random(&mut rand::rngs::OsRng);
                let public = P256Public::from(&secret);
                Self::P256 { secret, public }
            }
        }
    }

    /// The suite this key pair belongs to.
    pub fn suite(&self) -> CryptoSuite {
        match self {
            Self::X25519 { .. } => CryptoSuite::X25519Ed25519Aes256CbcHmacSha256,
            Self::P256 { .. } => CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256,
        }
    }

    /// Encoded public key to send to the peer.
    ///
    /// X25519 keys are 32 raw bytes, P-256 keys are uncompressed SEC1 points.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::X25519 { public, .. } => public.as_bytes().to_vec(),
            Self::P256 { public, .. } => EncodedPoint::from(*public).as_bytes().to_vec(),
        }
    }

    /// Combine with the peer's public key into the shared secret.
    pub fn agree(self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            Self::X25519 { secret, .. } => {
                let bytes: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&X25519Public::from(bytes));
                if !shared.was_contributory() {
                    return Err(CryptoError::NonContributory);
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            Self::P256 { secret, .. } => {
                let peer = P256Public::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    }
}

impl fmt::Debug for EphemeralKeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyExchange")
            .field("suite", &self.suite())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: CryptoSuite = CryptoSuite::X25519Ed25519Aes256CbcHmacSha256;
    const B: CryptoSuite = CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256;

    #[test]
    fn test_negotiate_uses_responder_preference() {
        assert_eq!(CryptoSuite::negotiate(&[B, A], &[A, B]), Some(B));
        assert_eq!(CryptoSuite::negotiate(&[A, B], &[B]), Some(B));
        assert_eq!(CryptoSuite::negotiate(&[A], &[B]), None);
        assert_eq!(CryptoSuite::negotiate(&[A], &[]), None);
    }

    #[test]
    fn test_wire_identifiers() {
        assert_eq!(A.id(), 1);
        assert_eq!(B.id(), 2);
        assert_eq!(CryptoSuite::try_from(2).unwrap(), B);
        assert!(matches!(
            CryptoSuite::try_from(7),
            Err(CryptoError::UnknownSuite(7))
        ));
    }

    #[test]
    fn test_unknown_suite_rejected_by_serde() {
        assert!(bincode::deserialize::<CryptoSuite>(&[9]).is_err());
        assert_eq!(bincode::serialize(&B).unwrap(), vec![2]);
    }

    #[test]
    fn test_both_suites_agree() {
        for suite in CryptoSuite::ALL {
            let alice = EphemeralKeyExchange::generate(suite);
            let bob = EphemeralKeyExchange::generate(suite);
            let alice_public = alice.public_key_bytes();
            let bob_public = bob.public_key_bytes();

            let s1 = alice.agree(&bob_public).unwrap();
            let s2 = bob.agree(&alice_public).unwrap();
            assert_eq!(*s1, *s2);
            assert_eq!(s1.len(), 32);
        }
    }

    #[test]
    fn test_x25519_low_order_point_rejected() {
        let kx = EphemeralKeyExchange::generate(A);
        assert!(matches!(
            kx.agree(&[0u8; 32]),
            Err(CryptoError::NonContributory)
        ));
    }

    #[test]
    fn test_malformed_public_key() {
        let kx = EphemeralKeyExchange::generate(B);
        assert!(matches!(
            kx.agree(&[4u8; 10]),
            Err(CryptoError::InvalidPublicKey)
        ));

        let kx = EphemeralKeyExchange::generate(A);
        assert!(matches!(
            kx.agree(&[1u8; 31]),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
