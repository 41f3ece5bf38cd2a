//! # Virtual Peers
//!
//! One remote identity backed by any number of redundant secure channels.
//! Messages are framed with a 2-byte little-endian length and fanned out to
//! every open channel; each channel has its own reading task.

mod config;
mod error;
mod event;
mod virtual_peer;

pub use config::{PeerConfig, MAX_MESSAGE_SIZE};
pub use error::PeerError;
pub use event::PeerEvent;
pub use virtual_peer::{ChannelId, Connector, VirtualPeer};
