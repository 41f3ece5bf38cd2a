//! Plaintext preamble that routes a connection to a network.
//!
//! 1. Acceptor sends `Hello` with its peer id
//! 2. Initiator answers `JoinRequest` with its peer id and the channel name
//! 3. Acceptor replies `JoinResponse`
//!
//! Only the channel name identifies the network; the network id itself
//! never crosses the wire.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::transport::{read_length_prefixed, write_length_prefixed};
use crate::channel::ChannelError;
use crate::network::{ChannelName, NetworkError, PeerId};

/// Preamble messages, sent as length-prefixed bincode frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preamble {
    Hello {
        peer_id: PeerId,
    },
    JoinRequest {
        peer_id: PeerId,
        channel_name: ChannelName,
    },
    JoinResponse {
        accepted: bool,
    },
}

impl Preamble {
    fn name(&self) -> &'static str {
        match self {
            Preamble::Hello { .. } => "Hello",
            Preamble::JoinRequest { .. } => "JoinRequest",
            Preamble::JoinResponse { .. } => "JoinResponse",
        }
    }

    /// Error for a message that arrived out of turn.
    pub fn unexpected(&self, expected: &str) -> NetworkError {
        NetworkError::Malformed(format!("expected {}, got {}", expected, self.name()))
    }
}

pub async fn send_preamble<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    message: &Preamble,
) -> Result<(), NetworkError> {
    let bytes =
        bincode::serialize(message).map_err(|e| NetworkError::Malformed(e.to_string()))?;
    write_length_prefixed(writer, &bytes).await?;
    Ok(())
}

pub async fn receive_preamble<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Preamble, NetworkError> {
    let bytes = read_length_prefixed(reader).await?;
    bincode::deserialize(&bytes).map_err(|e| NetworkError::Malformed(e.to_string()))
}

/// Bound one preamble step by `limit`.
pub async fn timed<T, F>(limit: Duration, step: &'static str, fut: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| NetworkError::Channel(ChannelError::Timeout(step)))?
}
