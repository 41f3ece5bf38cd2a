//! Channel error types.

use thiserror::Error;

use crate::crypto::{CertificateError, CryptoError};

/// Coarse classification of a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake message, version, suite or authentication problem.
    Protocol,
    /// A record failed authentication.
    Integrity,
    /// The renegotiation rendezvous broke down.
    Renegotiation,
    /// The underlying byte stream failed or was closed.
    Transport,
    /// Caller error or local shutdown.
    Local,
}

/// Errors that can occur while establishing or using a secure channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No protocol version in common with the peer.
    #[error("Unsupported protocol version: peer offered {offered}")]
    UnsupportedVersion {
        /// Highest version offered by the initiator.
        offered: u8,
    },

    /// A hello disagrees with the version negotiated in step 1.
    #[error("Version mismatch: negotiated {agreed}, hello carries {hello}")]
    VersionMismatch {
        /// Version from the version exchange.
        agreed: u8,
        /// Version repeated in the hello.
        hello: u8,
    },

    /// No cipher suite in common with the peer.
    #[error("No common cipher suite")]
    NoCommonSuite,

    /// A handshake message arrived out of order or could not be parsed.
    #[error("Malformed handshake: {0}")]
    Malformed(String),

    /// The peer aborted the handshake with an alert.
    #[error("Peer aborted the handshake: {0}")]
    PeerAlert(String),

    /// Key exchange signature did not verify against the peer certificate.
    #[error("Key exchange signature verification failed")]
    SignatureInvalid,

    /// Peer certificate is not trusted, expired or revoked.
    #[error("Untrusted peer certificate: {0}")]
    Certificate(#[from] CertificateError),

    /// The peer presented a different certificate during renegotiation.
    #[error("Peer certificate changed during renegotiation")]
    CertificateChanged,

    /// Primitive failure (bad key share, unknown suite).
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    /// A record failed MAC verification or was truncated.
    #[error("Record integrity check failed")]
    IntegrityFailure,

    /// The renegotiation rendezvous failed.
    #[error("Renegotiation desynchronized: {0}")]
    RenegotiationDesync(String),

    /// A handshake step exceeded its time budget.
    #[error("Handshake step timed out: {0}")]
    Timeout(&'static str),

    /// The channel has been closed.
    #[error("Channel closed")]
    Closed,

    /// Frame larger than the sanity limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Invalid configuration.
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for ChannelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::IntegrityFailure => ChannelError::IntegrityFailure,
            other => ChannelError::Crypto(other),
        }
    }
}

impl ChannelError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::UnsupportedVersion { .. }
            | ChannelError::VersionMismatch { .. }
            | ChannelError::NoCommonSuite
            | ChannelError::Malformed(_)
            | ChannelError::PeerAlert(_)
            | ChannelError::SignatureInvalid
            | ChannelError::Certificate(_)
            | ChannelError::CertificateChanged
            | ChannelError::Crypto(_)
            | ChannelError::FrameTooLarge { .. } => ErrorKind::Protocol,
            ChannelError::IntegrityFailure => ErrorKind::Integrity,
            ChannelError::RenegotiationDesync(_) => ErrorKind::Renegotiation,
            ChannelError::Timeout(_) | ChannelError::Transport(_) | ChannelError::Io(_) => {
                ErrorKind::Transport
            }
            ChannelError::Closed | ChannelError::InvalidConfig(_) => ErrorKind::Local,
        }
    }

    /// Whether the failure must be surfaced as a security event instead of
    /// being handled as an ordinary disconnect.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::Integrity | ErrorKind::Renegotiation
        )
    }

    /// Whether the failure came from the transport and a reconnect may help.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failure_from_crypto() {
        let err: ChannelError = CryptoError::IntegrityFailure.into();
        assert!(matches!(err, ChannelError::IntegrityFailure));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.is_security_relevant());
    }

    #[test]
    fn test_classification() {
        let io = ChannelError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(io.is_transport());
        assert!(!io.is_security_relevant());

        assert!(ChannelError::NoCommonSuite.is_security_relevant());
        assert!(ChannelError::RenegotiationDesync("ack while idle".into()).is_security_relevant());
        assert!(!ChannelError::Closed.is_security_relevant());
        assert!(!ChannelError::Closed.is_transport());
    }
}
