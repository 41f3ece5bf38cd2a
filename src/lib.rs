//! # Peerlink - encrypted P2P chat overlay
//!
//! Peerlink connects members of private chat networks over mutually
//! authenticated, encrypted channels.
//!
//! ## Layers
//!
//! - [`crypto`]: Ed25519 identities, certificates, cipher suites and
//!   record protection (AES-256-CBC + HMAC-SHA256)
//! - [`channel`]: the handshake engine and the record layer, including
//!   in-band renegotiation
//! - [`peer`]: virtual peers, one remote identity over redundant channels
//! - [`network`]: network ids, channel names and membership
//!
//! ## Security Model
//!
//! - **Certificates only under encryption**: identities are exchanged after
//!   the first key agreement, hiding them from passive observers
//! - **Deferred trust**: key exchange signatures are checked against the
//!   certificate once it arrives, never against unverified keys
//! - **Network PSK**: every master key also depends on the network secret
//! - **Encrypt-then-MAC**: records are authenticated before any decryption
//! - **Fail closed**: every handshake failure aborts the channel
//!
//! ## Example
//!
//! ```no_run
//! use peerlink::channel::ChannelConfig;
//! use peerlink::crypto::{Identity, TrustStore};
//! use peerlink::network::{LocalNode, NetworkRegistry};
//! use peerlink::peer::PeerConfig;
//!
//! # async fn run(identity: Identity, trust: TrustStore) -> Result<(), Box<dyn std::error::Error>> {
//! let node = LocalNode::new(identity, trust, ChannelConfig::default(), PeerConfig::default())?;
//! let (registry, mut events) = NetworkRegistry::new(node);
//!
//! let network = registry.join_group("friends", b"shared secret")?;
//! let peer = network.connect_tcp("203.0.113.7:7300").await?;
//! peer.send_message(b"hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.peer, event.event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod crypto;
pub mod network;
pub mod peer;

pub use channel::{ChannelConfig, ChannelError, SecureChannel};
pub use crypto::{Certificate, CryptoSuite, Identity, TrustStore};
pub use network::{NetworkError, NetworkEvent, NetworkId, NetworkRegistry};
pub use peer::{PeerConfig, PeerError, PeerEvent, VirtualPeer};
