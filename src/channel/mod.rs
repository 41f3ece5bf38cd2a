//! # Secure Channels
//!
//! Mutually authenticated, encrypted byte streams over any duplex transport.
//!
//! ## Handshake
//!
//! 1. Version negotiation (highest common version)
//! 2. Hello exchange: nonces and cipher suite selection
//! 3. Signed ephemeral key exchange (X25519 or P-256)
//! 4. Master key from both hellos, the shared secret and an optional PSK
//! 5. Certificates exchanged under encryption
//! 6. Certificates checked against the trusted roots, signatures verified
//!    against the certified keys, revocation consulted
//!
//! ## Records
//!
//! `[len: u16 LE][flags][payload][padding]` encrypted with AES-256-CBC,
//! followed by an HMAC-SHA256 tag over the ciphertext. Either side can ask
//! for fresh keys in-band; see [`rendezvous`].

pub mod config;
pub(crate) mod engine;
mod error;
pub mod protocol;
pub mod record;
pub mod rendezvous;
mod stream;
pub mod transport;

pub use config::{ChannelConfig, MAX_RECORD_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use engine::{perform_handshake, perform_renegotiation, HandshakeContext, HandshakeOutcome};
pub use error::{ChannelError, ErrorKind};
pub use protocol::Role;
pub use stream::{
    wait_for_state, ChannelInfo, ChannelReader, ChannelState, ChannelWriter, SecureChannel,
};
pub use transport::{boxed, BoxedTransport, TcpListener, TcpTransport, Transport};
