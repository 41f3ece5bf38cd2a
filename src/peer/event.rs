//! Notifications raised by virtual peers.

use crate::crypto::Certificate;

/// State change or message of one virtual peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The first channel opened.
    Online,

    /// The last channel closed. `graceful` is false after errors.
    Offline { graceful: bool },

    /// A complete application message arrived.
    MessageReceived(Vec<u8>),

    /// The peer came back with a certificate other than the one known.
    CertificateChanged {
        previous: Box<Certificate>,
        current: Box<Certificate>,
    },

    /// The remote certificate was found revoked; all channels were closed.
    InvalidCertificate { reason: String },

    /// A channel failed authentication or integrity checks.
    SecurityFailure(String),

    /// A reconnect attempt is about to start.
    Reconnecting { attempt: u32 },
}

impl PeerEvent {
    /// Whether the event reports a security problem.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            PeerEvent::InvalidCertificate { .. } | PeerEvent::SecurityFailure(_)
        )
    }
}
