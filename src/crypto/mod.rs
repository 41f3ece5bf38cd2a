//! Cryptographic building blocks for peerlink.
//!
//! This module provides:
//! - Long-term Ed25519 signing keys
//! - Certificates, trusted roots and revocation checks
//! - Cipher suites with X25519 / P-256 ephemeral key agreement
//! - AES-256-CBC + HMAC-SHA256 record protection

pub mod certificate;
pub mod record_cipher;
pub mod signing;
pub mod suite;

pub use certificate::{
    normalize_email, unix_now, Certificate, CertificateError, CertificateFlags,
    CertificateProfile, Identity, NoRevocationCheck, RevocationCheck, RevocationList, TrustStore,
};
pub use record_cipher::{RecordDecryptor, RecordEncryptor, TrafficKeys, BLOCK_SIZE, MAC_SIZE};
pub use signing::{
    decode_signing_key_pem, encode_signing_key_pem, verify_signature, SigningError,
    SigningKeyPair,
};
pub use suite::{CryptoSuite, EphemeralKeyExchange};

use thiserror::Error;

/// Errors raised by the low-level primitives.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unknown cipher suite: {0}")]
    UnknownSuite(u8),

    #[error("Invalid ephemeral public key")]
    InvalidPublicKey,

    #[error("Key agreement produced a non-contributory secret")]
    NonContributory,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Buffer of {0} bytes is not block aligned")]
    Misaligned(usize),

    #[error("Record authentication failed")]
    IntegrityFailure,
}
