//! Handshake messages.
//!
//! ## Flow
//!
//! 1. Initiator sends `VersionOffer`, responder answers `VersionSelect`
//! 2. Initiator sends `ClientHello` (nonce, offered version, suites, record
//!    size), responder answers `ServerHello` (nonce, selected version, suite,
//!    record size).
//!    Both hellos are signed in step 3, which pins the step 1 outcome.
//! 3. Responder sends its signed `KeyExchange`, initiator answers with its own
//! 4. Both derive the master key and switch to encrypted records
//! 5. Certificates are exchanged inside encrypted records
//! 6. Both verify the certificate and the step 3 signature
//!
//! Steps 1-3 travel as length-prefixed bincode frames.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::error::ChannelError;
use crate::channel::transport::{read_length_prefixed, write_length_prefixed};
use crate::crypto::{Certificate, CryptoSuite};

/// Signature label for the responder's key exchange.
const LABEL_RESPONDER_KX: &[u8] = b"PEERLINK-KX-RESPONDER";

/// Signature label for the initiator's key exchange.
const LABEL_INITIATOR_KX: &[u8] = b"PEERLINK-KX-INITIATOR";

/// Length of hello nonces.
pub const NONCE_SIZE: usize = 32;

/// Reasons carried by an [`HandshakeMessage::Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertCode {
    /// No protocol version in common.
    ProtocolVersion,
    /// No cipher suite in common.
    NoCommonSuite,
    /// Message out of order or unparsable.
    UnexpectedMessage,
}

impl AlertCode {
    /// The error an alert is reported as on the receiving side.
    pub fn into_error(self, offered_version: u8) -> ChannelError {
        match self {
            AlertCode::ProtocolVersion => ChannelError::UnsupportedVersion {
                offered: offered_version,
            },
            AlertCode::NoCommonSuite => ChannelError::NoCommonSuite,
            AlertCode::UnexpectedMessage => {
                ChannelError::PeerAlert("unexpected message".to_string())
            }
        }
    }
}

/// Initiator hello: fresh nonce and offered suites in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub nonce: [u8; NONCE_SIZE],
    /// Version sent in the `VersionOffer`.
    pub offered_version: u8,
    /// Raw suite identifiers; unknown values are skipped by the responder.
    pub suites: Vec<u8>,
    /// Largest record body the initiator sends.
    pub record_size: u16,
}

impl ClientHello {
    pub fn new(
        nonce: [u8; NONCE_SIZE],
        offered_version: u8,
        suites: &[CryptoSuite],
        record_size: u16,
    ) -> Self {
        Self {
            nonce,
            offered_version,
            suites: suites.iter().map(|s| s.id()).collect(),
            record_size,
        }
    }

    /// Offered suites this build understands.
    pub fn known_suites(&self) -> Vec<CryptoSuite> {
        self.suites
            .iter()
            .filter_map(|id| CryptoSuite::try_from(*id).ok())
            .collect()
    }

    /// Encoded form, as hashed into the master key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        encode(self)
    }
}

/// Responder hello: fresh nonce and the selected suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub nonce: [u8; NONCE_SIZE],
    /// Version sent in the `VersionSelect`.
    pub version: u8,
    pub suite: u8,
    /// Largest record body the responder sends.
    pub record_size: u16,
}

impl ServerHello {
    pub fn new(nonce: [u8; NONCE_SIZE], version: u8, suite: CryptoSuite, record_size: u16) -> Self {
        Self {
            nonce,
            version,
            suite: suite.id(),
            record_size,
        }
    }

    /// Encoded form, as hashed into the master key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        encode(self)
    }
}

/// Signed ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Every message exchanged during a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    VersionOffer { version: u8 },
    VersionSelect { version: u8 },
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    KeyExchange(KeyExchange),
    /// Sent inside an encrypted record.
    Certificate(Certificate),
    Alert { code: AlertCode },
}

impl HandshakeMessage {
    /// Short name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::VersionOffer { .. } => "VersionOffer",
            HandshakeMessage::VersionSelect { .. } => "VersionSelect",
            HandshakeMessage::ClientHello(_) => "ClientHello",
            HandshakeMessage::ServerHello(_) => "ServerHello",
            HandshakeMessage::KeyExchange(_) => "KeyExchange",
            HandshakeMessage::Certificate(_) => "Certificate",
            HandshakeMessage::Alert { .. } => "Alert",
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        encode(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        bincode::deserialize(bytes).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    /// Error for receiving this message where `expected` was due.
    pub fn unexpected(&self, expected: &str) -> ChannelError {
        ChannelError::Malformed(format!("expected {}, got {}", expected, self.name()))
    }
}

/// Write one handshake frame.
pub async fn send_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    message: &HandshakeMessage,
) -> Result<(), ChannelError> {
    write_length_prefixed(writer, &message.to_bytes()?).await
}

/// Read one handshake frame.
pub async fn receive_message<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<HandshakeMessage, ChannelError> {
    let data = read_length_prefixed(reader).await?;
    HandshakeMessage::from_bytes(&data)
}

/// Data signed by the responder in step 3.
pub fn responder_signed_data(
    client_hello: &[u8],
    server_hello: &[u8],
    responder_public: &[u8],
) -> Vec<u8> {
    signed_data(
        LABEL_RESPONDER_KX,
        &[client_hello, server_hello, responder_public],
    )
}

/// Data signed by the initiator in step 3. Covers both ephemeral keys.
pub fn initiator_signed_data(
    client_hello: &[u8],
    server_hello: &[u8],
    responder_public: &[u8],
    initiator_public: &[u8],
) -> Vec<u8> {
    signed_data(
        LABEL_INITIATOR_KX,
        &[client_hello, server_hello, responder_public, initiator_public],
    )
}

fn signed_data(label: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(label.len() + parts.iter().map(|p| p.len() + 4).sum::<usize>());
    data.extend_from_slice(label);
    for part in parts {
        data.extend_from_slice(&(part.len() as u32).to_le_bytes());
        data.extend_from_slice(part);
    }
    data
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ChannelError> {
    bincode::serialize(value).map_err(|e| ChannelError::Malformed(e.to_string()))
}
