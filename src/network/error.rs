//! Network membership error types.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::network::NetworkId;
use crate::peer::PeerError;

/// Errors raised by network membership and the registry.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// No joined network has this id.
    #[error("Unknown network {0}")]
    UnknownNetwork(NetworkId),

    /// The network is joined already.
    #[error("Network {0} already joined")]
    AlreadyJoined(NetworkId),

    /// No joined network matches the requested channel name.
    #[error("No network matches the requested channel")]
    UnknownChannel,

    /// The acceptor refused the join request.
    #[error("Join request rejected by the remote node")]
    JoinRejected,

    /// Certificate email is not the private network's counterpart.
    #[error("Unauthorized peer {presented} (expected {expected})")]
    Unauthorized {
        /// Bound counterpart email.
        expected: String,
        /// Email of the connecting peer.
        presented: String,
    },

    /// The remote presented our own identity.
    #[error("Refusing a channel to ourselves")]
    SelfConnection,

    /// Malformed preamble message.
    #[error("Malformed preamble: {0}")]
    Malformed(String),

    /// Identifier could not be parsed.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// The registry is shutting down.
    #[error("Registry shut down")]
    Shutdown,

    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Virtual peer failure.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl NetworkError {
    /// Whether the failure must be surfaced as a security event.
    pub fn is_security_relevant(&self) -> bool {
        match self {
            NetworkError::Unauthorized { .. } => true,
            NetworkError::Channel(e) => e.is_security_relevant(),
            NetworkError::Peer(e) => e.is_security_relevant(),
            _ => false,
        }
    }
}
