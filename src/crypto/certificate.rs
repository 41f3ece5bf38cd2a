//! Certificates, trusted roots and revocation.
//!
//! A certificate binds a profile (name, email, capability flags) to an
//! Ed25519 verifying key and is signed by an issuing authority. Trust is a
//! single level deep: a peer certificate is accepted when it was issued by
//! one of the self-signed roots in the local [`TrustStore`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::signing::{
    decode_pem, encode_pem, verify_signature, verifying_key_from_bytes, SigningError,
    SigningKeyPair,
};

/// Current certificate format version.
pub const CERTIFICATE_VERSION: u8 = 1;

/// PEM label for certificates.
const CERTIFICATE_LABEL: &str = "PEERLINK CERTIFICATE";

/// Errors raised while issuing, parsing or validating certificates.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate issuer is not trusted")]
    UntrustedIssuer,

    #[error("Issuer is not allowed to sign certificates")]
    NotCertificateAuthority,

    #[error("Certificate is not valid for key exchange")]
    KeyExchangeNotAllowed,

    #[error("Certificate is expired or not yet valid")]
    OutsideValidity,

    #[error("Unsupported certificate version: {0}")]
    UnsupportedVersion(u8),

    #[error("Certificate signature is invalid")]
    InvalidSignature,

    #[error("Certificate has been revoked")]
    Revoked,

    #[error("Certificate does not match the private key")]
    KeyMismatch,

    #[error("Revocation check failed: {0}")]
    RevocationCheckFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Key error: {0}")]
    Signing(#[from] SigningError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Capability flags carried in a certificate profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CertificateFlags(u8);

impl CertificateFlags {
    /// No capabilities.
    pub const NONE: Self = Self(0);
    /// The key may be used to authenticate channel key exchanges.
    pub const KEY_EXCHANGE: Self = Self(0x01);
    /// The key may sign other certificates.
    pub const SIGN_CA: Self = Self(0x02);

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CertificateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Identity details a certificate is issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateProfile {
    /// Display name.
    pub name: String,
    /// Email address, the identity key for virtual peers.
    pub email: String,
    /// Capability flags.
    pub flags: CertificateFlags,
}

impl CertificateProfile {
    /// Profile of an end user allowed to run key exchanges.
    pub fn user(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            flags: CertificateFlags::KEY_EXCHANGE,
        }
    }

    /// Profile of a signing authority.
    pub fn authority(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            flags: CertificateFlags::SIGN_CA,
        }
    }
}

/// An issued certificate. Immutable once signed; compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    version: u8,
    serial: [u8; 16],
    issued_to: CertificateProfile,
    public_key: [u8; 32],
    issuer_serial: [u8; 16],
    not_before: u64,
    not_after: u64,
    revocation_url: Option<String>,
    signature: Vec<u8>,
}

/// The signed portion of a certificate.
#[derive(Serialize)]
struct TbsCertificate<'a> {
    version: u8,
    serial: &'a [u8; 16],
    issued_to: &'a CertificateProfile,
    public_key: &'a [u8; 32],
    issuer_serial: &'a [u8; 16],
    not_before: u64,
    not_after: u64,
    revocation_url: &'a Option<String>,
}

impl Certificate {
    /// Issues a self-signed root certificate.
    pub fn issue_root(
        profile: CertificateProfile,
        keys: &SigningKeyPair,
        validity: Duration,
    ) -> Result<Self, CertificateError> {
        let serial = random_serial();
        let not_before = unix_now();
        let mut certificate = Self {
            version: CERTIFICATE_VERSION,
            serial,
            issued_to: profile,
            public_key: keys.verifying_key().to_bytes(),
            issuer_serial: serial,
            not_before,
            not_after: not_before.saturating_add(validity.as_secs()),
            revocation_url: None,
            signature: Vec::new(),
        };
        certificate.signature = keys.sign(&certificate.tbs_bytes()?);
        Ok(certificate)
    }

    /// Issues a certificate for `public_key`, signed by `issuer`.
    pub fn issue(
        profile: CertificateProfile,
        public_key: &VerifyingKey,
        issuer: &Certificate,
        issuer_keys: &SigningKeyPair,
        validity: Duration,
        revocation_url: Option<String>,
    ) -> Result<Self, CertificateError> {
        if !issuer.issued_to.flags.contains(CertificateFlags::SIGN_CA) {
            return Err(CertificateError::NotCertificateAuthority);
        }
        if issuer.public_key != issuer_keys.verifying_key().to_bytes() {
            return Err(CertificateError::KeyMismatch);
        }

        let not_before = unix_now();
        let mut certificate = Self {
            version: CERTIFICATE_VERSION,
            serial: random_serial(),
            issued_to: profile,
            public_key: public_key.to_bytes(),
            issuer_serial: issuer.serial,
            not_before,
            not_after: not_before.saturating_add(validity.as_secs()),
            revocation_url,
            signature: Vec::new(),
        };
        certificate.signature = issuer_keys.sign(&certificate.tbs_bytes()?);
        Ok(certificate)
    }

    fn tbs_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        let tbs = TbsCertificate {
            version: self.version,
            serial: &self.serial,
            issued_to: &self.issued_to,
            public_key: &self.public_key,
            issuer_serial: &self.issuer_serial,
            not_before: self.not_before,
            not_after: self.not_after,
            revocation_url: &self.revocation_url,
        };
        bincode::serialize(&tbs).map_err(|e| CertificateError::SerializationFailed(e.to_string()))
    }

    /// Unique serial number.
    pub fn serial(&self) -> &[u8; 16] {
        &self.serial
    }

    /// Serial of the issuing certificate (equal to [`serial`](Self::serial) for roots).
    pub fn issuer_serial(&self) -> &[u8; 16] {
        &self.issuer_serial
    }

    /// The profile this certificate was issued to.
    pub fn profile(&self) -> &CertificateProfile {
        &self.issued_to
    }

    /// Email address of the subject.
    pub fn email(&self) -> &str {
        &self.issued_to.email
    }

    /// Lower-cased, trimmed email address used for identity comparisons.
    pub fn normalized_email(&self) -> String {
        normalize_email(&self.issued_to.email)
    }

    /// Where revocation status can be queried, if anywhere.
    pub fn revocation_url(&self) -> Option<&str> {
        self.revocation_url.as_deref()
    }

    /// Validity window as unix seconds `(not_before, not_after)`.
    pub fn validity(&self) -> (u64, u64) {
        (self.not_before, self.not_after)
    }

    /// The subject's verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CertificateError> {
        Ok(verifying_key_from_bytes(&self.public_key)?)
    }

    /// Whether the certificate signs itself.
    pub fn is_self_signed(&self) -> bool {
        self.serial == self.issuer_serial
    }

    /// Whether `now` (unix seconds) lies inside the validity window.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Verifies the issuer signature using `issuer`'s key.
    pub fn verify_signature(&self, issuer: &Certificate) -> Result<(), CertificateError> {
        if self.version != CERTIFICATE_VERSION {
            return Err(CertificateError::UnsupportedVersion(self.version));
        }
        if self.issuer_serial != issuer.serial {
            return Err(CertificateError::UntrustedIssuer);
        }
        let key = issuer.verifying_key()?;
        verify_signature(&self.tbs_bytes()?, &self.signature, &key)
            .map_err(|_| CertificateError::InvalidSignature)
    }

    /// SHA-256 over the encoded certificate.
    pub fn fingerprint(&self) -> Result<[u8; 32], CertificateError> {
        Ok(Sha256::digest(self.to_bytes()?).into())
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        bincode::serialize(self).map_err(|e| CertificateError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertificateError> {
        bincode::deserialize(bytes).map_err(|e| CertificateError::SerializationFailed(e.to_string()))
    }

    /// Encode as a PEM block.
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        Ok(encode_pem(CERTIFICATE_LABEL, &self.to_bytes()?))
    }

    /// Decode from a PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        Self::from_bytes(&decode_pem(pem, CERTIFICATE_LABEL)?)
    }

    /// Write the certificate to a PEM file.
    pub fn save(&self, path: &Path) -> Result<(), CertificateError> {
        fs::write(path, self.to_pem()?)?;
        Ok(())
    }

    /// Read a certificate from a PEM file.
    pub fn load(path: &Path) -> Result<Self, CertificateError> {
        Self::from_pem(&fs::read_to_string(path)?)
    }
}

/// The set of root certificates this node trusts.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Vec<Certificate>,
}

impl TrustStore {
    /// Create a store from a list of roots.
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self { roots }
    }

    /// Add a trusted root.
    pub fn add_root(&mut self, root: Certificate) {
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
    }

    /// Trusted roots.
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// Validate `certificate` as a peer certificate at time `now`.
    pub fn verify(&self, certificate: &Certificate, now: u64) -> Result<(), CertificateError> {
        let issuer = self
            .roots
            .iter()
            .find(|root| root.serial == certificate.issuer_serial)
            .ok_or(CertificateError::UntrustedIssuer)?;

        if !issuer.issued_to.flags.contains(CertificateFlags::SIGN_CA) {
            return Err(CertificateError::NotCertificateAuthority);
        }
        if !issuer.is_self_signed() {
            return Err(CertificateError::UntrustedIssuer);
        }
        issuer.verify_signature(issuer)?;
        certificate.verify_signature(issuer)?;

        if !issuer.is_valid_at(now) || !certificate.is_valid_at(now) {
            return Err(CertificateError::OutsideValidity);
        }
        if !certificate
            .issued_to
            .flags
            .contains(CertificateFlags::KEY_EXCHANGE)
        {
            return Err(CertificateError::KeyExchangeNotAllowed);
        }
        Ok(())
    }
}

/// The local node's certificate together with its private key.
#[derive(Debug, Clone)]
pub struct Identity {
    certificate: Certificate,
    keys: SigningKeyPair,
}

impl Identity {
    /// Pair a certificate with its signing key.
    pub fn new(certificate: Certificate, keys: SigningKeyPair) -> Result<Self, CertificateError> {
        if certificate.public_key != keys.verifying_key().to_bytes() {
            return Err(CertificateError::KeyMismatch);
        }
        Ok(Self { certificate, keys })
    }

    /// Pair without the key check, for impersonation tests.
    #[cfg(test)]
    pub(crate) fn new_unchecked(certificate: Certificate, keys: SigningKeyPair) -> Self {
        Self { certificate, keys }
    }

    /// Local certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Local signing keys.
    pub fn keys(&self) -> &SigningKeyPair {
        &self.keys
    }

    /// Sign with the local key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keys.sign(message)
    }
}

/// Out-of-band revocation status lookup.
///
/// Checks run after a channel is already established; a positive answer
/// tears the channel down.
#[async_trait]
pub trait RevocationCheck: Send + Sync {
    /// Returns `true` when `certificate` has been revoked.
    async fn is_revoked(&self, certificate: &Certificate) -> Result<bool, CertificateError>;
}

/// A revocation check that never reports revocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRevocationCheck;

#[async_trait]
impl RevocationCheck for NoRevocationCheck {
    async fn is_revoked(&self, _certificate: &Certificate) -> Result<bool, CertificateError> {
        Ok(false)
    }
}

/// In-memory list of revoked serial numbers.
#[derive(Debug, Default)]
pub struct RevocationList {
    revoked: RwLock<HashSet<[u8; 16]>>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a serial as revoked.
    pub fn revoke(&self, serial: [u8; 16]) {
        self.revoked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(serial);
    }

    pub fn contains(&self, serial: &[u8; 16]) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(serial)
    }
}

#[async_trait]
impl RevocationCheck for RevocationList {
    async fn is_revoked(&self, certificate: &Certificate) -> Result<bool, CertificateError> {
        Ok(self.contains(certificate.serial()))
    }
}

/// Lower-case and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Current time in unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_serial() -> [u8; 16] {
    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    serial
}
