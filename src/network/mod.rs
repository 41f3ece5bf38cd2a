//! # Network Membership
//!
//! Maps chat networks onto virtual peers.
//!
//! - A [`NetworkId`] is derived from the network name (or the two emails of
//!   a private network) and a shared secret with PBKDF2
//! - Each pair of nodes meets on a [`ChannelName`] both compute on their own
//! - Inbound connections are routed by the [`NetworkRegistry`] after a short
//!   plaintext preamble, then run the secure handshake with the network's
//!   pre-shared key

mod error;
mod id;
mod membership;
mod node;
pub mod preamble;
mod registry;

pub use error::NetworkError;
pub use id::{ChannelName, NetworkId, PeerId, ID_SIZE, NETWORK_ID_ITERATIONS};
pub use membership::{NetworkEvent, NetworkKind, NetworkMembership};
pub use node::LocalNode;
pub use registry::NetworkRegistry;
