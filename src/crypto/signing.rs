//! Long-term Ed25519 signing keys.
//!
//! Every node owns one signing key pair. Its verifying key is what a
//! certificate vouches for, and its signing key authenticates the ephemeral
//! key exchange of every handshake the node takes part in.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// PEM label for private signing keys.
const SIGNING_KEY_LABEL: &str = "PEERLINK SIGNING KEY";

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur during signing operations.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid PEM format: {0}")]
    InvalidPemFormat(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid signature format")]
    InvalidSignature,

    #[error("Invalid verifying key")]
    InvalidVerifyingKey,
}

/// An Ed25519 key pair for signing and verifying handshake data.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    /// Generates a new random signing key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Returns the verifying (public) key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Returns the signing (private) key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Signs a message and returns the signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Saves the private key as PEM.
    ///
    /// The public half is derived again on load, so only one file is written.
    pub fn save(&self, path: &Path) -> Result<(), SigningError> {
        fs::write(path, encode_signing_key_pem(&self.signing_key))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Loads a key pair from a PEM private key file.
    pub fn load(path: &Path) -> Result<Self, SigningError> {
        let content = fs::read_to_string(path)?;
        let signing_key = decode_signing_key_pem(&content)?;
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("verifying_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verifies a signature against a message using the given verifying key.
pub fn verify_signature(
    message: &[u8],
    signature_bytes: &[u8],
    verifying_key: &VerifyingKey,
) -> Result<(), SigningError> {
    let sig_array: [u8; SIGNATURE_SIZE] = signature_bytes
        .try_into()
        .map_err(|_| SigningError::InvalidSignature)?;

    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| SigningError::VerificationFailed)
}

/// Parses a verifying key from its 32 raw bytes.
pub fn verifying_key_from_bytes(bytes: &[u8; 32]) -> Result<VerifyingKey, SigningError> {
    VerifyingKey::from_bytes(bytes).map_err(|_| SigningError::InvalidVerifyingKey)
}

/// Encodes a signing (private) key to PEM format.
pub fn encode_signing_key_pem(key: &SigningKey) -> String {
    encode_pem(SIGNING_KEY_LABEL, &key.to_bytes())
}

/// Decodes a signing (private) key from PEM format.
pub fn decode_signing_key_pem(pem: &str) -> Result<SigningKey, SigningError> {
    let bytes = decode_pem(pem, SIGNING_KEY_LABEL)?;
    let key_bytes = key_array(&bytes)?;
    Ok(SigningKey::from_bytes(&key_bytes))
}

fn key_array(bytes: &[u8]) -> Result<[u8; 32], SigningError> {
    bytes.try_into().map_err(|_| SigningError::InvalidKeyLength {
        expected: 32,
        got: bytes.len(),
    })
}

/// Wraps bytes in a PEM block with the given label.
pub fn encode_pem(label: &str, bytes: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        BASE64.encode(bytes)
    )
}

/// Extracts and decodes the base64 body of a PEM block with the given label.
pub fn decode_pem(pem: &str, label: &str) -> Result<Vec<u8>, SigningError> {
    let header = format!("-----BEGIN {label}-----");
    let footer = format!("-----END {label}-----");

    let start = pem
        .find(&header)
        .ok_or_else(|| SigningError::InvalidPemFormat("Missing header".to_string()))?
        + header.len();

    let end = pem
        .find(&footer)
        .ok_or_else(|| SigningError::InvalidPemFormat("Missing footer".to_string()))?;

    if start >= end {
        return Err(SigningError::InvalidPemFormat(
            "Header must come before footer".to_string(),
        ));
    }

    let body: String = pem[start..end].split_whitespace().collect();
    Ok(BASE64.decode(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sign_and_verify() {
        let kp = SigningKeyPair::generate();
        let message = b"ephemeral key bytes";

        let signature = kp.sign(message);
        assert!(verify_signature(message, &signature, kp.verifying_key()).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let kp = SigningKeyPair::generate();
        let signature = kp.sign(b"original");

        let result = verify_signature(b"tampered", &signature, kp.verifying_key());
        assert!(matches!(result, Err(SigningError::VerificationFailed)));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let kp1 = SigningKeyPair::generate();
        let kp2 = SigningKeyPair::generate();
        let signature = kp1.sign(b"Hello");

        assert!(verify_signature(b"Hello", &signature, kp2.verifying_key()).is_err());
    }

    #[test]
    fn test_invalid_signature_length() {
        let kp = SigningKeyPair::generate();
        let result = verify_signature(b"Hello", &[0u8; 32], kp.verifying_key());
        assert!(matches!(result, Err(SigningError::InvalidSignature)));
    }

    #[test]
    fn test_pem_roundtrip() {
        let kp = SigningKeyPair::generate();

        let secret = decode_signing_key_pem(&encode_signing_key_pem(kp.signing_key())).unwrap();

        assert_eq!(kp.signing_key().to_bytes(), secret.to_bytes());
        assert_eq!(&secret.verifying_key(), kp.verifying_key());
    }

    #[test]
    fn test_pem_label_mismatch() {
        let kp = SigningKeyPair::generate();
        let pem = encode_pem("PEERLINK CERTIFICATE", kp.verifying_key().as_bytes());

        assert!(matches!(
            decode_signing_key_pem(&pem),
            Err(SigningError::InvalidPemFormat(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");

        let kp = SigningKeyPair::generate();
        kp.save(&path).unwrap();
        let loaded = SigningKeyPair::load(&path).unwrap();

        assert_eq!(kp.signing_key().to_bytes(), loaded.signing_key().to_bytes());
        assert_eq!(kp.verifying_key(), loaded.verifying_key());
    }
}
