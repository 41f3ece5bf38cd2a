//! Registry of joined networks.
//!
//! Owned by the node for its whole lifetime: created at startup, consulted
//! for every inbound connection, torn down with [`NetworkRegistry::shutdown`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{BoxedTransport, TcpListener};
use crate::network::preamble::{receive_preamble, send_preamble, timed, Preamble};
use crate::network::{
    ChannelName, LocalNode, NetworkError, NetworkEvent, NetworkId, NetworkMembership, PeerId,
};
use crate::peer::VirtualPeer;

pub struct NetworkRegistry {
    node: Arc<LocalNode>,
    networks: RwLock<HashMap<NetworkId, NetworkMembership>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    shutdown: CancellationToken,
}

impl NetworkRegistry {
    /// Create an empty registry and the receiver for all network events.
    pub fn new(node: LocalNode) -> (Arc<Self>, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            node: Arc::new(node),
            networks: RwLock::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        });
        (registry, rx)
    }

    pub fn node(&self) -> &Arc<LocalNode> {
        &self.node
    }

    pub fn join_group(&self, name: &str, secret: &[u8]) -> Result<NetworkMembership, NetworkError> {
        self.join(NetworkMembership::group(
            self.node.clone(),
            name,
            secret,
            self.events.clone(),
        )?)
    }

    pub fn join_private(
        &self,
        counterpart: &str,
        secret: &[u8],
    ) -> Result<NetworkMembership, NetworkError> {
        self.join(NetworkMembership::private(
            self.node.clone(),
            counterpart,
            secret,
            self.events.clone(),
        )?)
    }

    pub fn join_invitation(
        &self,
        invitation: &str,
        secret: &[u8],
    ) -> Result<NetworkMembership, NetworkError> {
        self.join(NetworkMembership::invitation(
            self.node.clone(),
            invitation,
            secret,
            self.events.clone(),
        )?)
    }

    fn join(&self, membership: NetworkMembership) -> Result<NetworkMembership, NetworkError> {
        if self.shutdown.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }
        let id = membership.id();
        let mut networks = self.write();
        if networks.contains_key(&id) {
            return Err(NetworkError::AlreadyJoined(id));
        }
        networks.insert(id, membership.clone());
        info!(network = %id, kind = ?membership.kind(), "joined network");
        Ok(membership)
    }

    /// Leave a network and disconnect its peers.
    pub async fn leave(&self, id: &NetworkId) -> Result<(), NetworkError> {
        let membership = self
            .write()
            .remove(id)
            .ok_or(NetworkError::UnknownNetwork(*id))?;
        membership.leave().await;
        Ok(())
    }

    pub fn get(&self, id: &NetworkId) -> Option<NetworkMembership> {
        self.read().get(id).cloned()
    }

    pub fn networks(&self) -> Vec<NetworkMembership> {
        self.read().values().cloned().collect()
    }

    /// Find the network whose channel with `remote` is called `name`.
    pub fn resolve(&self, name: &ChannelName, remote: &PeerId) -> Option<NetworkMembership> {
        self.read()
            .values()
            .find(|membership| membership.matches_channel(name, remote))
            .cloned()
    }

    /// Connect to `addr` on a joined network.
    pub async fn connect(&self, id: &NetworkId, addr: &str) -> Result<VirtualPeer, NetworkError> {
        let membership = self.get(id).ok_or(NetworkError::UnknownNetwork(*id))?;
        membership.connect_tcp(addr).await
    }

    /// Run the acceptor side of the preamble and the handshake.
    pub async fn accept(&self, mut transport: BoxedTransport) -> Result<VirtualPeer, NetworkError> {
        if self.shutdown.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }
        let limit = self.node.channel_config().handshake_step_timeout();
        let local = *self.node.peer_id();

        send_preamble(&mut transport, &Preamble::Hello { peer_id: local }).await?;
        let (remote, name) =
            match timed(limit, "join request", receive_preamble(&mut transport)).await? {
                Preamble::JoinRequest {
                    peer_id,
                    channel_name,
                } => (peer_id, channel_name),
                other => return Err(other.unexpected("JoinRequest")),
            };

        let membership = if remote == local {
            None
        } else {
            self.resolve(&name, &remote)
        };
        send_preamble(
            &mut transport,
            &Preamble::JoinResponse {
                accepted: membership.is_some(),
            },
        )
        .await?;

        let membership = membership.ok_or(NetworkError::UnknownChannel)?;
        debug!(network = %membership.id(), remote = ?remote, "join request accepted");
        membership.accept_channel(transport).await
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), NetworkError> {
        info!(addr = ?listener.local_addr().ok(), "accepting connections");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (transport, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let registry = self.clone();
            tokio::spawn(async move {
                match registry.accept(transport).await {
                    Ok(peer) => info!(%addr, peer = %peer.email(), "inbound channel established"),
                    Err(e) if e.is_security_relevant() => {
                        warn!(%addr, "inbound connection refused: {}", e)
                    }
                    Err(e) => debug!(%addr, "inbound connection failed: {}", e),
                }
            });
        }
    }

    /// Stop accepting and leave every network.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let networks: Vec<NetworkMembership> =
            self.write().drain().map(|(_, membership)| membership).collect();
        for membership in networks {
            membership.leave().await;
        }
        info!("registry shut down");
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NetworkId, NetworkMembership>> {
        self.networks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NetworkId, NetworkMembership>> {
        self.networks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::boxed;
    use crate::channel::engine::tests::Authority;
    use crate::channel::ChannelConfig;
    use crate::crypto::TrustStore;
    use crate::peer::{PeerConfig, PeerEvent};
    use std::time::Duration;

    fn registry(
        ca: &Authority,
        email: &str,
    ) -> (Arc<NetworkRegistry>, mpsc::UnboundedReceiver<NetworkEvent>) {
        let peer_config = PeerConfig {
            revocation_check_interval_secs: None,
            reconnect_attempts: 0,
            ..Default::default()
        };
        let node = LocalNode::new(
            ca.identity(email),
            TrustStore::new(vec![ca.root.clone()]),
            ChannelConfig::default(),
            peer_config,
        )
        .unwrap();
        NetworkRegistry::new(node)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_accept_routes_to_matching_network() {
        let ca = Authority::new("CA");
        let (alice, _alice_events) = registry(&ca, "alice@example.org");
        let (bob, mut bob_events) = registry(&ca, "bob@example.org");

        let friends = alice.join_group("friends", b"secret").unwrap();
        bob.join_group("family", b"secret").unwrap();
        let bobs_friends = bob.join_group("friends", b"secret").unwrap();
        assert_eq!(friends.id(), bobs_friends.id());

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbound, inbound) =
            tokio::join!(friends.connect(boxed(a), None), bob.accept(boxed(b)));
        let bob_peer = outbound.unwrap();
        let alice_peer = inbound.unwrap();
        assert_eq!(bob_peer.email(), "bob@example.org");
        assert_eq!(alice_peer.email(), "alice@example.org");
        assert!(bobs_friends.peer("alice@example.org").is_some());

        let online = next_event(&mut bob_events).await;
        assert_eq!(online.network, friends.id());
        assert_eq!(online.peer, "alice@example.org");
        assert!(matches!(online.event, PeerEvent::Online));

        assert_eq!(friends.broadcast(b"hi all").await, 1);
        let message = next_event(&mut bob_events).await;
        match message.event {
            PeerEvent::MessageReceived(m) => assert_eq!(m, b"hi all"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_network_is_rejected() {
        let ca = Authority::new("CA");
        let (alice, _) = registry(&ca, "alice@example.org");
        let (bob, _) = registry(&ca, "bob@example.org");

        let friends = alice.join_group("friends", b"secret").unwrap();
        bob.join_group("friends", b"another secret").unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbound, inbound) =
            tokio::join!(friends.connect(boxed(a), None), bob.accept(boxed(b)));
        assert!(matches!(outbound, Err(NetworkError::JoinRejected)));
        assert!(matches!(inbound, Err(NetworkError::UnknownChannel)));
    }

    #[tokio::test]
    async fn test_invitation_rejects_second_email() {
        let ca = Authority::new("CA");
        let (alice, _) = registry(&ca, "alice@example.org");
        let (bob, _) = registry(&ca, "bob@example.org");
        let (carol, _) = registry(&ca, "carol@example.org");

        let at_bob = bob.join_invitation("lunch", b"secret").unwrap();
        let at_alice = alice.join_invitation("lunch", b"secret").unwrap();
        let at_carol = carol.join_invitation("lunch", b"secret").unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbound, inbound) =
            tokio::join!(at_alice.connect(boxed(a), None), bob.accept(boxed(b)));
        outbound.unwrap();
        inbound.unwrap();
        assert_eq!(at_bob.counterpart().as_deref(), Some("alice@example.org"));

        let (c, b) = tokio::io::duplex(64 * 1024);
        let (_, inbound) = tokio::join!(at_carol.connect(boxed(c), None), bob.accept(boxed(b)));
        assert!(matches!(inbound, Err(NetworkError::Unauthorized { .. })));
        assert!(at_bob.peer("carol@example.org").is_none());
    }

    #[tokio::test]
    async fn test_join_and_leave_bookkeeping() {
        let ca = Authority::new("CA");
        let (alice, _) = registry(&ca, "alice@example.org");

        let friends = alice.join_group("friends", b"secret").unwrap();
        assert!(matches!(
            alice.join_group("Friends", b"secret"),
            Err(NetworkError::AlreadyJoined(_))
        ));
        assert_eq!(alice.networks().len(), 1);

        alice.leave(&friends.id()).await.unwrap();
        assert!(friends.is_closed());
        assert!(alice.get(&friends.id()).is_none());
        assert!(matches!(
            alice.leave(&friends.id()).await,
            Err(NetworkError::UnknownNetwork(_))
        ));

        alice.shutdown().await;
        assert!(matches!(
            alice.join_group("family", b"secret"),
            Err(NetworkError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let ca = Authority::new("CA");
        let (alice, _) = registry(&ca, "alice@example.org");
        let (bob, mut bob_events) = registry(&ca, "bob@example.org");
        let network = alice.join_private("bob@example.org", b"secret").unwrap();
        bob.join_private("alice@example.org", b"secret").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(bob.clone().serve(listener));

        let peer = alice.connect(&network.id(), &addr).await.unwrap();
        assert_eq!(peer.email(), "bob@example.org");
        assert!(matches!(
            next_event(&mut bob_events).await.event,
            PeerEvent::Online
        ));

        bob.shutdown().await;
        server.await.unwrap().unwrap();
        alice.shutdown().await;
    }
}
