//! Integration tests for Peerlink
//!
//! These run whole channels and networks through the public API:
//! - Suite and version negotiation between differently configured nodes
//! - Renegotiation on a live TCP connection
//! - Trust failures never yielding an established channel
//! - Virtual peer identity rules across networks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use peerlink::channel::{
    boxed, ChannelConfig, ChannelError, ChannelReader, ChannelState, HandshakeContext,
    SecureChannel, TcpListener, TcpTransport,
};
use peerlink::crypto::{
    Certificate, CertificateProfile, CryptoSuite, Identity, SigningKeyPair, TrustStore,
};
use peerlink::network::{
    ChannelName, LocalNode, NetworkError, NetworkEvent, NetworkId, NetworkRegistry,
};
use peerlink::peer::{PeerConfig, PeerError, PeerEvent};

const YEAR: Duration = Duration::from_secs(365 * 24 * 3600);
const WAIT: Duration = Duration::from_secs(10);

/// A signing authority issuing test identities.
struct Authority {
    root: Certificate,
    keys: SigningKeyPair,
}

impl Authority {
    fn new(name: &str) -> Self {
        let keys = SigningKeyPair::generate();
        let root =
            Certificate::issue_root(CertificateProfile::authority(name, "ca@example.com"), &keys, YEAR)
                .unwrap();
        Self { root, keys }
    }

    fn identity(&self, email: &str) -> Identity {
        let keys = SigningKeyPair::generate();
        let certificate = Certificate::issue(
            CertificateProfile::user(email, email),
            keys.verifying_key(),
            &self.root,
            &self.keys,
            YEAR,
            None,
        )
        .unwrap();
        Identity::new(certificate, keys).unwrap()
    }

    fn trust(&self) -> TrustStore {
        TrustStore::new(vec![self.root.clone()])
    }

    fn context(&self, email: &str, config: ChannelConfig) -> Arc<HandshakeContext> {
        Arc::new(HandshakeContext::new(self.identity(email), self.trust(), config).unwrap())
    }

    fn registry(&self, email: &str) -> (Arc<NetworkRegistry>, UnboundedReceiver<NetworkEvent>) {
        let node = LocalNode::new(
            self.identity(email),
            self.trust(),
            quick_config(),
            PeerConfig::default(),
        )
        .unwrap();
        NetworkRegistry::new(node)
    }
}

fn quick_config() -> ChannelConfig {
    ChannelConfig {
        handshake_step_timeout_secs: 2,
        ..Default::default()
    }
}

fn with_suites(suites: &[CryptoSuite]) -> ChannelConfig {
    ChannelConfig {
        suites: suites.to_vec(),
        ..quick_config()
    }
}

async fn handshake(
    initiator: Arc<HandshakeContext>,
    responder: Arc<HandshakeContext>,
) -> (
    Result<SecureChannel, ChannelError>,
    Result<SecureChannel, ChannelError>,
) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    tokio::join!(
        SecureChannel::connect(boxed(a), initiator),
        SecureChannel::accept(boxed(b), responder)
    )
}

/// Read until EOF in the background, so renegotiation records get processed.
fn drain(mut reader: ChannelReader) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = reader.read(&mut buf).await {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    })
}

/// Wait for the first event matching `predicate`.
async fn next_event<F>(events: &mut UnboundedReceiver<NetworkEvent>, predicate: F) -> NetworkEvent
where
    F: Fn(&NetworkEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_preferred_common_suite_selected() {
    let ca = Authority::new("CA");
    let alice = ca.context(
        "alice@example.com",
        with_suites(&[
            CryptoSuite::X25519Ed25519Aes256CbcHmacSha256,
            CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256,
        ]),
    );
    let bob = ca.context(
        "bob@example.com",
        with_suites(&[CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256]),
    );

    let (a, b) = handshake(alice, bob).await;
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.info().suite, CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256);
    assert_eq!(b.info().suite, CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256);
    assert_eq!(a.info().remote_certificate.email(), "bob@example.com");
    assert_eq!(b.info().remote_certificate.email(), "alice@example.com");
}

#[tokio::test]
async fn test_disjoint_suites_fail() {
    let ca = Authority::new("CA");
    let alice = ca.context(
        "alice@example.com",
        with_suites(&[CryptoSuite::X25519Ed25519Aes256CbcHmacSha256]),
    );
    let bob = ca.context(
        "bob@example.com",
        with_suites(&[CryptoSuite::EcdheP256Ed25519Aes256CbcHmacSha256]),
    );

    let (a, b) = handshake(alice, bob).await;
    assert!(a.is_err());
    assert!(matches!(b, Err(ChannelError::NoCommonSuite)));
}

#[tokio::test]
async fn test_untrusted_authority_never_established() {
    let ca = Authority::new("CA");
    let rogue = Authority::new("Rogue");
    let alice = ca.context("alice@example.com", quick_config());
    let mallory = rogue.context("mallory@example.com", quick_config());

    let (a, b) = handshake(mallory.clone(), alice.clone()).await;
    assert!(a.is_err());
    assert!(b.unwrap_err().is_security_relevant());

    // The responder checks the initiator first and refuses it.
    let (a, b) = handshake(alice, mallory).await;
    assert!(a.is_err());
    assert!(b.unwrap_err().is_security_relevant());
}

#[tokio::test]
async fn test_version_ranges_pick_highest_common() {
    let ca = Authority::new("CA");
    let alice = ca.context("alice@example.com", quick_config());
    let bob = ca.context("bob@example.com", quick_config());

    let (a, b) = handshake(alice, bob).await;
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.info().version, b.info().version);
    assert_eq!(a.info().version, quick_config().max_version);
}

// ============================================================================
// Record layer
// ============================================================================

#[tokio::test]
async fn test_message_spans_many_small_records() {
    let ca = Authority::new("CA");
    let small = ChannelConfig {
        record_size: 1024,
        ..quick_config()
    };
    let (a, b) = handshake(
        ca.context("alice@example.com", small.clone()),
        ca.context("bob@example.com", small),
    )
    .await;
    let (a, mut b) = (a.unwrap(), b.unwrap());

    let message: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    a.writer().write_all(&message).await.unwrap();

    let mut received = vec![0u8; message.len()];
    assert!(b.reader().read_exact(&mut received).await.unwrap());
    assert_eq!(received, message);
}

#[tokio::test]
async fn test_peers_with_different_record_sizes() {
    let ca = Authority::new("CA");
    let small = ChannelConfig {
        record_size: 1024,
        ..quick_config()
    };
    let (mut a, mut b) = handshake(
        ca.context("alice@example.com", small),
        ca.context("bob@example.com", quick_config()),
    )
    .await;
    let (a, b) = (a.as_mut().unwrap(), b.as_mut().unwrap());

    let message = vec![0x5Au8; 40_000];
    a.writer().write_all(&message).await.unwrap();
    b.writer().write_all(&message).await.unwrap();

    let mut received = vec![0u8; message.len()];
    assert!(b.reader().read_exact(&mut received).await.unwrap());
    assert_eq!(received, message);
    assert!(a.reader().read_exact(&mut received).await.unwrap());
    assert_eq!(received, message);
}

#[tokio::test]
async fn test_renegotiation_over_tcp_keeps_stream_intact() {
    let ca = Authority::new("CA");
    let alice = ca.context("alice@example.com", quick_config());
    let bob = ca.context("bob@example.com", quick_config());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (transport, _) = listener.accept().await.unwrap();
        SecureChannel::accept(transport, bob).await.unwrap()
    });
    let transport = TcpTransport::new().connect(&addr).await.unwrap();
    let client = SecureChannel::connect(transport, alice).await.unwrap();
    let server = server.await.unwrap();

    let (client_reader, client_writer) = client.split();
    let (server_reader, server_writer) = server.split();
    let client_drain = drain(client_reader);
    let server_drain = drain(server_reader);

    let mut expected = Vec::new();
    for round in 0..4u8 {
        let chunk = vec![round; 3000];
        client_writer.write_all(&chunk).await.unwrap();
        expected.extend_from_slice(&chunk);
        client_writer.request_renegotiation().await.unwrap();
    }
    client_writer.write_all(b"done").await.unwrap();
    expected.extend_from_slice(b"done");

    assert_eq!(client_writer.info().renegotiations, 4);
    assert_eq!(client_writer.state(), ChannelState::Established);

    // The server sees the data before the close.
    client_writer.close().await;
    let received = timeout(WAIT, server_drain).await.unwrap().unwrap();
    assert_eq!(received, expected);

    server_writer.close().await;
    timeout(WAIT, client_drain).await.unwrap().unwrap();
}

// ============================================================================
// Networks and virtual peers
// ============================================================================

#[test]
fn test_channel_name_is_symmetric() {
    let network = NetworkId::for_group("friends", b"secret");
    let ca = Authority::new("CA");
    let a = LocalNode::new(
        ca.identity("a@example.com"),
        ca.trust(),
        ChannelConfig::default(),
        PeerConfig::default(),
    )
    .unwrap();
    let b = LocalNode::new(
        ca.identity("b@example.com"),
        ca.trust(),
        ChannelConfig::default(),
        PeerConfig::default(),
    )
    .unwrap();

    let ab = ChannelName::derive(&network, a.peer_id(), b.peer_id());
    let ba = ChannelName::derive(&network, b.peer_id(), a.peer_id());
    assert_eq!(ab, ba);
    assert!(ab.matches(&network, b.peer_id(), a.peer_id()));

    let other = NetworkId::for_group("friends", b"other secret");
    assert!(!ab.matches(&other, a.peer_id(), b.peer_id()));
}

#[tokio::test]
async fn test_group_chat_over_tcp() {
    let ca = Authority::new("CA");
    let (alice, mut alice_events) = ca.registry("alice@example.com");
    let (bob, mut bob_events) = ca.registry("bob@example.com");

    alice.join_group("friends", b"secret").unwrap();
    let bob_network = bob.join_group("friends", b"secret").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(alice.clone().serve(listener));

    let peer = bob_network.connect_tcp(&addr).await.unwrap();
    assert_eq!(peer.email(), "alice@example.com");
    next_event(&mut bob_events, |e| matches!(e.event, PeerEvent::Online)).await;

    peer.send_message(b"hello alice").await.unwrap();
    let event = next_event(&mut alice_events, |e| {
        matches!(e.event, PeerEvent::MessageReceived(_))
    })
    .await;
    assert_eq!(event.peer, "bob@example.com");
    assert_eq!(event.network, bob_network.id());
    match event.event {
        PeerEvent::MessageReceived(message) => assert_eq!(message, b"hello alice"),
        other => panic!("unexpected event {:?}", other),
    }

    alice.shutdown().await;
    next_event(&mut bob_events, |e| matches!(e.event, PeerEvent::Offline { .. })).await;
}

#[tokio::test]
async fn test_second_certificate_for_same_email_rejected() {
    let ca = Authority::new("CA");
    let (alice, _alice_events) = ca.registry("alice@example.com");
    let (bob, _bob_events) = ca.registry("bob@example.com");
    let (impostor, _impostor_events) = ca.registry("bob@example.com");

    alice.join_group("friends", b"secret").unwrap();
    let bob_network = bob.join_group("friends", b"secret").unwrap();
    let impostor_network = impostor.join_group("friends", b"secret").unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (accepted, connected) = tokio::join!(
        alice.accept(boxed(a)),
        bob_network.connect(boxed(b), None)
    );
    accepted.unwrap();
    connected.unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (accepted, _) = tokio::join!(
        alice.accept(boxed(a)),
        impostor_network.connect(boxed(b), None)
    );
    assert!(matches!(
        accepted,
        Err(NetworkError::Peer(PeerError::CertificateConflict { .. }))
    ));

    let network = alice.networks().pop().unwrap();
    let peer = network.peer("bob@example.com").unwrap();
    assert!(peer.is_online());
    assert_eq!(peer.channel_count(), 1);
}

#[tokio::test]
async fn test_invitation_bound_to_first_member() {
    let ca = Authority::new("CA");
    let (alice, mut alice_events) = ca.registry("alice@example.com");
    let (bob, _bob_events) = ca.registry("bob@example.com");
    let (carol, _carol_events) = ca.registry("carol@example.com");

    let alice_network = alice.join_invitation("party", b"secret").unwrap();
    let bob_network = bob.join_invitation("party", b"secret").unwrap();
    let carol_network = carol.join_invitation("party", b"secret").unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (accepted, connected) = tokio::join!(
        alice.accept(boxed(a)),
        bob_network.connect(boxed(b), None)
    );
    accepted.unwrap();
    connected.unwrap();
    assert_eq!(alice_network.counterpart().as_deref(), Some("bob@example.com"));

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (accepted, _) = tokio::join!(
        alice.accept(boxed(a)),
        carol_network.connect(boxed(b), None)
    );
    assert!(matches!(accepted, Err(NetworkError::Unauthorized { .. })));

    let event = next_event(&mut alice_events, |e| e.event.is_security_event()).await;
    assert_eq!(event.peer, "carol@example.com");
    assert!(alice_network.peer("carol@example.com").is_none());
}

#[tokio::test]
async fn test_wrong_secret_rejected_before_handshake() {
    let ca = Authority::new("CA");
    let (alice, _alice_events) = ca.registry("alice@example.com");
    let (bob, _bob_events) = ca.registry("bob@example.com");

    alice.join_group("friends", b"secret").unwrap();
    let bob_network = bob.join_group("friends", b"guess").unwrap();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (accepted, connected) = tokio::join!(
        alice.accept(boxed(a)),
        bob_network.connect(boxed(b), None)
    );
    assert!(matches!(accepted, Err(NetworkError::UnknownChannel)));
    assert!(matches!(connected, Err(NetworkError::JoinRejected)));
}
