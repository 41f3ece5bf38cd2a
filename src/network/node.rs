//! The local node: identity, trust anchors and settings shared by all
//! networks it joins.

use std::sync::Arc;

use crate::channel::{ChannelConfig, HandshakeContext};
use crate::crypto::{Identity, NoRevocationCheck, RevocationCheck, TrustStore};
use crate::network::{NetworkError, PeerId};
use crate::peer::PeerConfig;

pub struct LocalNode {
    peer_id: PeerId,
    identity: Identity,
    trust: TrustStore,
    channel_config: ChannelConfig,
    peer_config: PeerConfig,
    revocation: Arc<dyn RevocationCheck>,
}

impl LocalNode {
    /// Create a node with a fresh random peer id.
    pub fn new(
        identity: Identity,
        trust: TrustStore,
        channel_config: ChannelConfig,
        peer_config: PeerConfig,
    ) -> Result<Self, NetworkError> {
        channel_config.validate()?;
        peer_config.validate()?;
        Ok(Self {
            peer_id: PeerId::random(),
            identity,
            trust,
            channel_config,
            peer_config,
            revocation: Arc::new(NoRevocationCheck),
        })
    }

    /// Use `revocation` in handshakes and in the peers' periodic checks.
    pub fn with_revocation(mut self, revocation: Arc<dyn RevocationCheck>) -> Self {
        self.revocation = revocation;
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Normalized email of the local certificate.
    pub fn email(&self) -> String {
        self.identity.certificate().normalized_email()
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn channel_config(&self) -> &ChannelConfig {
        &self.channel_config
    }

    pub fn peer_config(&self) -> &PeerConfig {
        &self.peer_config
    }

    pub fn revocation(&self) -> &Arc<dyn RevocationCheck> {
        &self.revocation
    }

    /// Handshake context for one network, keyed with its pre-shared key.
    pub fn handshake_context(&self, psk: &[u8]) -> Result<HandshakeContext, NetworkError> {
        Ok(HandshakeContext::new(
            self.identity.clone(),
            self.trust.clone(),
            self.channel_config.clone(),
        )?
        .with_psk(psk.to_vec())
        .with_revocation(self.revocation.clone()))
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("peer_id", &self.peer_id)
            .field("email", &self.identity.certificate().email())
            .finish_non_exhaustive()
    }
}
