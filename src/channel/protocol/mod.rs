//! Handshake wire messages and key schedule.

pub mod handshake;
pub mod keys;

pub use handshake::{
    initiator_signed_data, receive_message, responder_signed_data, send_message, AlertCode,
    ClientHello, HandshakeMessage, KeyExchange, ServerHello, NONCE_SIZE,
};
pub use keys::{derive_master_key, MasterKey, SessionKeys};

use std::fmt;

/// Which end of the connection opened the handshake.
///
/// Roles are fixed for the lifetime of a channel; renegotiations reuse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}
