//! Membership in one chat network.
//!
//! A membership owns the virtual peers met on its network, authorizes
//! every channel before handing it to a peer, and forwards the peers'
//! events to the application tagged with the network id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{BoxedTransport, HandshakeContext, SecureChannel, TcpTransport};
use crate::crypto::{normalize_email, Certificate};
use crate::network::preamble::{receive_preamble, send_preamble, timed, Preamble};
use crate::network::{ChannelName, LocalNode, NetworkError, NetworkId, PeerId};
use crate::peer::{Connector, PeerError, PeerEvent, VirtualPeer};

/// What kind of network this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    /// Named group; any certificate from a trusted root may join.
    Group { name: String },
    /// Private network with one known counterpart.
    Private { counterpart: String },
    /// Private network from an invitation; the first peer to join is bound.
    Invitation { name: String },
}

impl NetworkKind {
    pub fn is_private(&self) -> bool {
        !matches!(self, NetworkKind::Group { .. })
    }
}

/// A peer event tagged with its network.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub network: NetworkId,
    /// Normalized email of the peer.
    pub peer: String,
    pub event: PeerEvent,
}

struct MembershipInner {
    id: NetworkId,
    kind: NetworkKind,
    node: Arc<LocalNode>,
    context: Arc<HandshakeContext>,
    counterpart: Mutex<Option<String>>,
    peers: RwLock<HashMap<String, VirtualPeer>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    closed: CancellationToken,
}

/// Handle to a joined network. Cheap to clone.
#[derive(Clone)]
pub struct NetworkMembership {
    inner: Arc<MembershipInner>,
}

impl NetworkMembership {
    /// Join the group network `name`.
    pub fn group(
        node: Arc<LocalNode>,
        name: &str,
        secret: &[u8],
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self, NetworkError> {
        let id = NetworkId::for_group(name, secret);
        let kind = NetworkKind::Group {
            name: name.trim().to_string(),
        };
        Self::build(node, id, kind, None, secret, events)
    }

    /// Join the private network with `counterpart`.
    pub fn private(
        node: Arc<LocalNode>,
        counterpart: &str,
        secret: &[u8],
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self, NetworkError> {
        let counterpart = normalize_email(counterpart);
        if counterpart == node.email() {
            return Err(NetworkError::SelfConnection);
        }
        let id = NetworkId::for_private(&node.email(), &counterpart, secret);
        let kind = NetworkKind::Private {
            counterpart: counterpart.clone(),
        };
        Self::build(node, id, kind, Some(counterpart), secret, events)
    }

    /// Join a private network from an invitation.
    pub fn invitation(
        node: Arc<LocalNode>,
        invitation: &str,
        secret: &[u8],
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self, NetworkError> {
        let id = NetworkId::for_invitation(invitation, secret);
        let kind = NetworkKind::Invitation {
            name: invitation.trim().to_string(),
        };
        Self::build(node, id, kind, None, secret, events)
    }

    fn build(
        node: Arc<LocalNode>,
        id: NetworkId,
        kind: NetworkKind,
        counterpart: Option<String>,
        secret: &[u8],
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self, NetworkError> {
        let context = node.handshake_context(&id.psk(secret))?;
        Ok(Self {
            inner: Arc::new(MembershipInner {
                id,
                kind,
                node,
                context: Arc::new(context),
                counterpart: Mutex::new(counterpart),
                peers: RwLock::new(HashMap::new()),
                events,
                closed: CancellationToken::new(),
            }),
        })
    }

    pub fn id(&self) -> NetworkId {
        self.inner.id
    }

    pub fn kind(&self) -> &NetworkKind {
        &self.inner.kind
    }

    pub fn node(&self) -> &Arc<LocalNode> {
        &self.inner.node
    }

    /// Email of the bound counterpart of a private network.
    pub fn counterpart(&self) -> Option<String> {
        self.counterpart_lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Channel name between the local node and `remote` on this network.
    pub fn channel_name(&self, remote: &PeerId) -> ChannelName {
        ChannelName::derive(&self.inner.id, self.inner.node.peer_id(), remote)
    }

    /// Whether `name` is the channel between the local node and `remote`.
    pub fn matches_channel(&self, name: &ChannelName, remote: &PeerId) -> bool {
        name.matches(&self.inner.id, self.inner.node.peer_id(), remote)
    }

    /// Check that `certificate` may hold channels on this network.
    ///
    /// Invitation networks bind the first authorized email for good.
    pub fn authorize(&self, certificate: &Certificate) -> Result<(), NetworkError> {
        let presented = certificate.normalized_email();
        if presented == self.inner.node.email() {
            return Err(NetworkError::SelfConnection);
        }
        if !self.inner.kind.is_private() {
            return Ok(());
        }

        let mut counterpart = self.counterpart_lock();
        match counterpart.as_deref() {
            Some(expected) if expected != presented => Err(NetworkError::Unauthorized {
                expected: expected.to_string(),
                presented,
            }),
            Some(_) => Ok(()),
            None => {
                info!(network = %self.inner.id, peer = %presented, "counterpart bound");
                *counterpart = Some(presented);
                Ok(())
            }
        }
    }

    /// Authorize an established channel and hand it to its virtual peer.
    pub async fn adopt_channel(
        &self,
        channel: SecureChannel,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<VirtualPeer, NetworkError> {
        if self.is_closed() {
            channel.writer().close().await;
            return Err(NetworkError::Shutdown);
        }

        let certificate = channel.info().remote_certificate;
        let email = certificate.normalized_email();
        if let Err(e) = self.authorize(&certificate) {
            channel.writer().close().await;
            warn!(network = %self.inner.id, peer = %email, "channel refused: {}", e);
            if e.is_security_relevant() {
                self.emit(&email, PeerEvent::SecurityFailure(e.to_string()));
            }
            return Err(e);
        }

        let peer = self.peer_for(&email)?;
        peer.add_channel(channel, connector).await?;
        Ok(peer)
    }

    /// Run the preamble as initiator, then the handshake. The channel is not
    /// adopted.
    pub async fn open_channel(
        &self,
        mut transport: BoxedTransport,
    ) -> Result<SecureChannel, NetworkError> {
        let limit = self.inner.node.channel_config().handshake_step_timeout();
        let local = *self.inner.node.peer_id();

        let remote = match timed(limit, "preamble hello", receive_preamble(&mut transport)).await? {
            Preamble::Hello { peer_id } => peer_id,
            other => return Err(other.unexpected("Hello")),
        };
        if remote == local {
            return Err(NetworkError::SelfConnection);
        }

        let request = Preamble::JoinRequest {
            peer_id: local,
            channel_name: self.channel_name(&remote),
        };
        send_preamble(&mut transport, &request).await?;

        match timed(limit, "join response", receive_preamble(&mut transport)).await? {
            Preamble::JoinResponse { accepted: true } => {}
            Preamble::JoinResponse { accepted: false } => return Err(NetworkError::JoinRejected),
            other => return Err(other.unexpected("JoinResponse")),
        }
        debug!(network = %self.inner.id, remote = ?remote, "join accepted");

        Ok(SecureChannel::connect(transport, self.inner.context.clone()).await?)
    }

    /// Open a channel over `transport` and adopt it.
    pub async fn connect(
        &self,
        transport: BoxedTransport,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<VirtualPeer, NetworkError> {
        let channel = self.open_channel(transport).await?;
        self.adopt_channel(channel, connector).await
    }

    /// Connect to `addr` over TCP. The peer reconnects to `addr` on
    /// transport failures.
    pub async fn connect_tcp(&self, addr: &str) -> Result<VirtualPeer, NetworkError> {
        let transport = self.tcp().connect(addr).await?;
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector {
            membership: self.clone(),
            addr: addr.to_string(),
        });
        self.connect(transport, Some(connector)).await
    }

    fn tcp(&self) -> TcpTransport {
        TcpTransport::new()
            .with_connect_timeout(self.inner.node.channel_config().handshake_step_timeout())
    }

    /// Responder side, after the registry routed the preamble here.
    pub(crate) async fn accept_channel(
        &self,
        transport: BoxedTransport,
    ) -> Result<VirtualPeer, NetworkError> {
        let channel = SecureChannel::accept(transport, self.inner.context.clone()).await?;
        self.adopt_channel(channel, None).await
    }

    pub fn peer(&self, email: &str) -> Option<VirtualPeer> {
        self.peers_read().get(&normalize_email(email)).cloned()
    }

    pub fn peers(&self) -> Vec<VirtualPeer> {
        self.peers_read().values().cloned().collect()
    }

    pub fn online_peers(&self) -> Vec<VirtualPeer> {
        self.peers_read()
            .values()
            .filter(|peer| peer.is_online())
            .cloned()
            .collect()
    }

    /// Send a message to one peer.
    pub async fn send_to(&self, email: &str, message: &[u8]) -> Result<usize, NetworkError> {
        let peer = self.peer(email).ok_or(PeerError::Offline)?;
        Ok(peer.send_message(message).await?)
    }

    /// Send a message to every online peer. Returns how many peers got it.
    pub async fn broadcast(&self, message: &[u8]) -> usize {
        let mut delivered = 0;
        for peer in self.online_peers() {
            match peer.send_message(message).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!(peer = %peer.email(), "broadcast failed: {}", e),
            }
        }
        delivered
    }

    /// Disconnect every peer. The membership cannot be reused.
    pub async fn leave(&self) {
        self.inner.closed.cancel();
        let peers: Vec<VirtualPeer> = self.peers_write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.disconnect().await;
        }
        info!(network = %self.inner.id, "left network");
    }

    fn peer_for(&self, email: &str) -> Result<VirtualPeer, NetworkError> {
        if let Some(peer) = self.peers_read().get(email) {
            return Ok(peer.clone());
        }

        let mut peers = self.peers_write();
        if let Some(peer) = peers.get(email) {
            return Ok(peer.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let node = &self.inner.node;
        let peer = VirtualPeer::new(
            email,
            node.peer_config().clone(),
            node.revocation().clone(),
            tx,
        )?;
        spawn_forwarder(self.inner.id, email.to_string(), rx, self.inner.events.clone());
        peers.insert(email.to_string(), peer.clone());
        debug!(network = %self.inner.id, peer = %email, "new virtual peer");
        Ok(peer)
    }

    fn emit(&self, peer: &str, event: PeerEvent) {
        let _ = self.inner.events.send(NetworkEvent {
            network: self.inner.id,
            peer: peer.to_string(),
            event,
        });
    }

    fn counterpart_lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.inner
            .counterpart
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peers_read(&self) -> RwLockReadGuard<'_, HashMap<String, VirtualPeer>> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peers_write(&self) -> RwLockWriteGuard<'_, HashMap<String, VirtualPeer>> {
        self.inner
            .peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for NetworkMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMembership")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

/// Tag a peer's events with the network and pass them on.
fn spawn_forwarder(
    network: NetworkId,
    peer: String,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    output: mpsc::UnboundedSender<NetworkEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let tagged = NetworkEvent {
                network,
                peer: peer.clone(),
                event,
            };
            if output.send(tagged).is_err() {
                break;
            }
        }
    });
}

/// Reconnects a peer to the TCP endpoint it was first reached at.
struct TcpConnector {
    membership: NetworkMembership,
    addr: String,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<SecureChannel, PeerError> {
        let transport = self.membership.tcp().connect(&self.addr).await?;
        let channel = self
            .membership
            .open_channel(transport)
            .await
            .map_err(into_peer_error)?;
        if let Err(e) = self
            .membership
            .authorize(&channel.info().remote_certificate)
        {
            channel.writer().close().await;
            return Err(into_peer_error(e));
        }
        Ok(channel)
    }
}

fn into_peer_error(err: NetworkError) -> PeerError {
    match err {
        NetworkError::Channel(e) => PeerError::Channel(e),
        NetworkError::Peer(e) => e,
        NetworkError::Unauthorized {
            expected,
            presented,
        } => PeerError::EmailMismatch {
            expected,
            presented,
        },
        other => PeerError::Connect(other.to_string()),
    }
}
