//! Virtual peer error types.

use thiserror::Error;

use crate::channel::ChannelError;

/// Errors raised by a virtual peer.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The channel authenticated a different identity.
    #[error("Certificate email {presented} does not match peer {expected}")]
    EmailMismatch {
        /// Email of the virtual peer.
        expected: String,
        /// Email in the presented certificate.
        presented: String,
    },

    /// A second, different certificate was presented while channels are open.
    #[error("Conflicting certificate for {email} while channels are open")]
    CertificateConflict {
        /// Email of the virtual peer.
        email: String,
    },

    /// Message exceeds the configured limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Message size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// No channel is open.
    #[error("Peer is offline")]
    Offline,

    /// The peer was disconnected for good.
    #[error("Peer has been disposed")]
    Disposed,

    /// Reconnect could not produce a transport.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Invalid configuration.
    #[error("Invalid peer configuration: {0}")]
    InvalidConfig(String),

    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl PeerError {
    /// Whether the failure must be surfaced as a security event.
    pub fn is_security_relevant(&self) -> bool {
        match self {
            PeerError::EmailMismatch { .. } | PeerError::CertificateConflict { .. } => true,
            PeerError::Channel(e) => e.is_security_relevant(),
            _ => false,
        }
    }
}
