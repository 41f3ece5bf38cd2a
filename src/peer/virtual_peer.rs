//! Virtual peer: one remote identity over redundant channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelReader, ChannelWriter, SecureChannel};
use crate::crypto::{normalize_email, Certificate, RevocationCheck};
use crate::peer::{PeerConfig, PeerError, PeerEvent};

/// Identifier of a channel within one virtual peer.
pub type ChannelId = u64;

/// Opens replacement channels after a transport failure.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the same endpoint again and authenticate a new channel.
    async fn connect(&self) -> Result<SecureChannel, PeerError>;
}

struct PeerState {
    certificate: Option<Certificate>,
    channels: HashMap<ChannelId, ChannelWriter>,
    next_channel: ChannelId,
    disposed: bool,
}

struct Inner {
    email: String,
    config: PeerConfig,
    revocation: Arc<dyn RevocationCheck>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
    cancel: CancellationToken,
}

/// A remote identity, online while at least one channel is open.
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct VirtualPeer {
    inner: Arc<Inner>,
}

impl VirtualPeer {
    /// Create an offline peer for `email`.
    ///
    /// Starts the periodic revocation monitor when the config enables it.
    pub fn new(
        email: &str,
        config: PeerConfig,
        revocation: Arc<dyn RevocationCheck>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        config.validate()?;
        let peer = Self {
            inner: Arc::new(Inner {
                email: normalize_email(email),
                config,
                revocation,
                events,
                state: Mutex::new(PeerState {
                    certificate: None,
                    channels: HashMap::new(),
                    next_channel: 1,
                    disposed: false,
                }),
                cancel: CancellationToken::new(),
            }),
        };
        peer.spawn_revocation_monitor();
        Ok(peer)
    }

    /// Normalized email of the remote identity.
    pub fn email(&self) -> &str {
        &self.inner.email
    }

    /// Certificate of the open channels, or the last one seen.
    pub fn certificate(&self) -> Option<Certificate> {
        self.state().certificate.clone()
    }

    pub fn is_online(&self) -> bool {
        !self.state().channels.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    /// Seed the certificate known from an earlier session.
    ///
    /// A later channel presenting a different one raises
    /// [`PeerEvent::CertificateChanged`].
    pub fn remember_certificate(&self, certificate: Certificate) -> Result<(), PeerError> {
        let presented = certificate.normalized_email();
        if presented != self.inner.email {
            return Err(PeerError::EmailMismatch {
                expected: self.inner.email.clone(),
                presented,
            });
        }
        let mut state = self.state();
        if state.certificate.is_none() {
            state.certificate = Some(certificate);
        }
        Ok(())
    }

    /// Adopt an established channel and start reading from it.
    ///
    /// The channel is closed if it authenticated someone else, or a different
    /// certificate than the one behind the already open channels.
    pub async fn add_channel(
        &self,
        channel: SecureChannel,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<ChannelId, PeerError> {
        let certificate = channel.info().remote_certificate;
        let (reader, writer) = channel.split();

        match self.register(certificate, writer.clone()) {
            Ok(id) => {
                debug!(peer = %self.inner.email, channel = id, "channel added");
                self.spawn_reader(id, reader, writer, connector);
                Ok(id)
            }
            Err(e) => {
                writer.close().await;
                if e.is_security_relevant() {
                    warn!(peer = %self.inner.email, "rejected channel: {}", e);
                    self.emit(PeerEvent::SecurityFailure(e.to_string()));
                }
                Err(e)
            }
        }
    }

    fn register(
        &self,
        certificate: Certificate,
        writer: ChannelWriter,
    ) -> Result<ChannelId, PeerError> {
        let presented = certificate.normalized_email();
        if presented != self.inner.email {
            return Err(PeerError::EmailMismatch {
                expected: self.inner.email.clone(),
                presented,
            });
        }

        let mut events = Vec::new();
        let id = {
            let mut state = self.state();
            if state.disposed {
                return Err(PeerError::Disposed);
            }
            if let Some(known) = &state.certificate {
                if *known != certificate {
                    if !state.channels.is_empty() {
                        return Err(PeerError::CertificateConflict {
                            email: self.inner.email.clone(),
                        });
                    }
                    events.push(PeerEvent::CertificateChanged {
                        previous: Box::new(known.clone()),
                        current: Box::new(certificate.clone()),
                    });
                }
            }
            state.certificate = Some(certificate);

            let id = state.next_channel;
            state.next_channel += 1;
            if state.channels.is_empty() {
                events.push(PeerEvent::Online);
            }
            state.channels.insert(id, writer);
            id
        };

        for event in events {
            self.emit(event);
        }
        Ok(id)
    }

    /// Remove a channel; the last one to go takes the peer offline.
    fn unregister(&self, id: ChannelId, graceful: bool) {
        let offline = {
            let mut state = self.state();
            state.channels.remove(&id).is_some() && state.channels.is_empty()
        };
        if offline {
            info!(peer = %self.inner.email, graceful, "peer offline");
            self.emit(PeerEvent::Offline { graceful });
        }
    }

    /// Send one message to every open channel.
    ///
    /// Returns the number of channels that took the message.
    pub async fn send_message(&self, message: &[u8]) -> Result<usize, PeerError> {
        let max = self.inner.config.max_message_size;
        if message.len() > max {
            return Err(PeerError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }

        let writers: Vec<(ChannelId, ChannelWriter)> = {
            let state = self.state();
            if state.disposed {
                return Err(PeerError::Disposed);
            }
            state
                .channels
                .iter()
                .map(|(id, writer)| (*id, writer.clone()))
                .collect()
        };
        if writers.is_empty() {
            return Err(PeerError::Offline);
        }

        let prefix = (message.len() as u16).to_le_bytes();
        let mut delivered = 0;
        let mut last_error = None;
        for (id, writer) in writers {
            match writer.write(&[&prefix, message]).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(peer = %self.inner.email, channel = id, "send failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if delivered == 0 {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }
        Ok(delivered)
    }

    /// Close every channel and stop reconnecting. The peer cannot be reused.
    pub async fn disconnect(&self) {
        let writers: Vec<ChannelWriter> = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.channels.drain().map(|(_, writer)| writer).collect()
        };
        self.inner.cancel.cancel();

        let was_online = !writers.is_empty();
        for writer in writers {
            writer.close().await;
        }
        if was_online {
            self.emit(PeerEvent::Offline { graceful: true });
        }
        info!(peer = %self.inner.email, "peer disconnected");
    }

    /// Ask the revocation service about the current certificate.
    ///
    /// On a positive answer every channel is closed and
    /// [`PeerEvent::InvalidCertificate`] is raised. Returns whether the
    /// certificate was found revoked.
    pub async fn check_revocation(&self) -> bool {
        let certificate = {
            let state = self.state();
            match &state.certificate {
                Some(certificate) if !state.channels.is_empty() => certificate.clone(),
                _ => return false,
            }
        };

        match self.inner.revocation.is_revoked(&certificate).await {
            Ok(false) => false,
            Ok(true) => {
                warn!(peer = %self.inner.email, "certificate revoked, closing channels");
                self.close_revoked().await;
                true
            }
            Err(e) => {
                warn!(peer = %self.inner.email, "revocation check failed: {}", e);
                false
            }
        }
    }

    async fn close_revoked(&self) {
        let writers: Vec<ChannelWriter> = {
            let mut state = self.state();
            state.channels.drain().map(|(_, writer)| writer).collect()
        };
        self.emit(PeerEvent::InvalidCertificate {
            reason: "certificate revoked".to_string(),
        });
        let was_online = !writers.is_empty();
        for writer in writers {
            writer.close().await;
        }
        if was_online {
            self.emit(PeerEvent::Offline { graceful: false });
        }
    }

    fn spawn_revocation_monitor(&self) {
        let Some(interval) = self.inner.config.revocation_check_interval() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                VirtualPeer { inner }.check_revocation().await;
            }
        });
    }

    fn spawn_reader(
        &self,
        id: ChannelId,
        reader: ChannelReader,
        writer: ChannelWriter,
        connector: Option<Arc<dyn Connector>>,
    ) {
        let peer = self.clone();
        tokio::spawn(async move { peer.run_channel(id, reader, writer, connector).await });
    }

    async fn run_channel(
        self,
        id: ChannelId,
        mut reader: ChannelReader,
        writer: ChannelWriter,
        connector: Option<Arc<dyn Connector>>,
    ) {
        let result = self.read_messages(&mut reader).await;
        self.unregister(id, result.is_ok());
        writer.close().await;

        let email = &self.inner.email;
        match result {
            Ok(()) => debug!(peer = %email, channel = id, "channel closed by peer"),
            Err(ChannelError::Closed) => debug!(peer = %email, channel = id, "channel closed"),
            Err(e) if e.is_transport() => {
                info!(peer = %email, channel = id, "channel lost: {}", e);
                if let Some(connector) = connector {
                    self.reconnect(connector).await;
                }
            }
            Err(e) => {
                warn!(peer = %email, channel = id, "channel failed: {}", e);
                if e.is_security_relevant() {
                    self.emit(PeerEvent::SecurityFailure(e.to_string()));
                }
            }
        }
    }

    /// Dispatch length-prefixed messages until the channel ends.
    async fn read_messages(&self, reader: &mut ChannelReader) -> Result<(), ChannelError> {
        let max = self.inner.config.max_message_size;
        let mut prefix = [0u8; 2];
        loop {
            if !reader.read_exact(&mut prefix).await? {
                return Ok(());
            }
            let len = u16::from_le_bytes(prefix) as usize;
            if len > max {
                return Err(ChannelError::FrameTooLarge { size: len, max });
            }
            let mut message = vec![0u8; len];
            if !reader.read_exact(&mut message).await? {
                return Err(ChannelError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            self.emit(PeerEvent::MessageReceived(message));
        }
    }

    /// Bounded reconnect after a transport failure.
    async fn reconnect(&self, connector: Arc<dyn Connector>) {
        let attempts = self.inner.config.reconnect_attempts;
        let delay = self.inner.config.reconnect_delay();
        let cancel = &self.inner.cancel;

        for attempt in 1..=attempts {
            self.emit(PeerEvent::Reconnecting { attempt });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = connector.connect() => r,
            };
            match result {
                Ok(channel) => {
                    match self.add_channel(channel, Some(connector.clone())).await {
                        Ok(id) => info!(peer = %self.inner.email, attempt, channel = id, "reconnected"),
                        Err(e) => warn!(peer = %self.inner.email, "reconnected channel rejected: {}", e),
                    }
                    return;
                }
                Err(e) if e.is_security_relevant() => {
                    warn!(peer = %self.inner.email, "reconnect failed authentication: {}", e);
                    self.emit(PeerEvent::SecurityFailure(e.to_string()));
                    return;
                }
                Err(e) => debug!(peer = %self.inner.email, attempt, "reconnect failed: {}", e),
            }
        }
        if attempts > 0 {
            warn!(peer = %self.inner.email, attempts, "giving up reconnecting");
        }
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for VirtualPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPeer")
            .field("email", &self.inner.email)
            .field("channels", &self.channel_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::engine::tests::Authority;
    use crate::channel::{boxed, ChannelConfig, HandshakeContext};
    use crate::crypto::{NoRevocationCheck, RevocationList};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    fn context(ca: &Authority, email: &str) -> Arc<HandshakeContext> {
        Arc::new(ca.context(email, ChannelConfig::default()))
    }

    async fn channel_pair(
        initiator: &Arc<HandshakeContext>,
        responder: &Arc<HandshakeContext>,
    ) -> (SecureChannel, SecureChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a, b) = tokio::join!(
            SecureChannel::connect(boxed(a), initiator.clone()),
            SecureChannel::accept(boxed(b), responder.clone())
        );
        (a.unwrap(), b.unwrap())
    }

    fn quiet_config() -> PeerConfig {
        PeerConfig {
            revocation_check_interval_secs: None,
            reconnect_delay_secs: 0,
            ..Default::default()
        }
    }

    fn new_peer(
        email: &str,
        config: PeerConfig,
    ) -> (VirtualPeer, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = VirtualPeer::new(email, config, Arc::new(NoRevocationCheck), tx).unwrap();
        (peer, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_messages_and_online_state() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a, b) = channel_pair(&alice, &bob).await;

        let (bob_at_alice, mut alice_events) = new_peer("Bob@Example.org", quiet_config());
        let (alice_at_bob, mut bob_events) = new_peer("alice@example.org", quiet_config());
        assert!(!bob_at_alice.is_online());

        bob_at_alice.add_channel(a, None).await.unwrap();
        alice_at_bob.add_channel(b, None).await.unwrap();
        assert!(matches!(next_event(&mut alice_events).await, PeerEvent::Online));
        assert!(matches!(next_event(&mut bob_events).await, PeerEvent::Online));
        assert!(bob_at_alice.is_online());
        assert_eq!(bob_at_alice.email(), "bob@example.org");

        assert_eq!(bob_at_alice.send_message(b"hello").await.unwrap(), 1);
        assert_eq!(bob_at_alice.send_message(b"").await.unwrap(), 1);
        match next_event(&mut bob_events).await {
            PeerEvent::MessageReceived(m) => assert_eq!(m, b"hello"),
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut bob_events).await {
            PeerEvent::MessageReceived(m) => assert!(m.is_empty()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redundant_channels_fan_out() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a1, b1) = channel_pair(&alice, &bob).await;
        let (a2, b2) = channel_pair(&alice, &bob).await;

        let (bob_at_alice, _alice_events) = new_peer("bob@example.org", quiet_config());
        let (alice_at_bob, mut bob_events) = new_peer("alice@example.org", quiet_config());
        bob_at_alice.add_channel(a1, None).await.unwrap();
        bob_at_alice.add_channel(a2, None).await.unwrap();
        alice_at_bob.add_channel(b1, None).await.unwrap();
        alice_at_bob.add_channel(b2, None).await.unwrap();
        assert_eq!(bob_at_alice.channel_count(), 2);

        assert_eq!(bob_at_alice.send_message(b"twice").await.unwrap(), 2);

        // One Online, then the message once per channel.
        assert!(matches!(next_event(&mut bob_events).await, PeerEvent::Online));
        for _ in 0..2 {
            match next_event(&mut bob_events).await {
                PeerEvent::MessageReceived(m) => assert_eq!(m, b"twice"),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_email_mismatch_is_rejected() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a, _b) = channel_pair(&alice, &bob).await;

        let (carol_at_alice, mut events) = new_peer("carol@example.org", quiet_config());
        let result = carol_at_alice.add_channel(a, None).await;
        assert!(matches!(result, Err(PeerError::EmailMismatch { .. })));
        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::SecurityFailure(_)
        ));
        assert!(!carol_at_alice.is_online());
    }

    #[tokio::test]
    async fn test_second_certificate_conflicts_while_open() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let impostor = context(&ca, "bob@example.org");
        let (a1, _b1) = channel_pair(&alice, &bob).await;
        let (a2, _b2) = channel_pair(&alice, &impostor).await;

        let (bob_at_alice, _events) = new_peer("bob@example.org", quiet_config());
        bob_at_alice.add_channel(a1, None).await.unwrap();
        let result = bob_at_alice.add_channel(a2, None).await;
        assert!(matches!(result, Err(PeerError::CertificateConflict { .. })));
        assert_eq!(bob_at_alice.channel_count(), 1);
        assert_eq!(
            bob_at_alice.certificate().unwrap(),
            *bob.identity().certificate()
        );
    }

    #[tokio::test]
    async fn test_new_certificate_while_offline_raises_change() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let old_bob = ca.identity("bob@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a, _b) = channel_pair(&alice, &bob).await;

        let (bob_at_alice, mut events) = new_peer("bob@example.org", quiet_config());
        bob_at_alice
            .remember_certificate(old_bob.certificate().clone())
            .unwrap();
        bob_at_alice.add_channel(a, None).await.unwrap();

        match next_event(&mut events).await {
            PeerEvent::CertificateChanged { previous, current } => {
                assert_eq!(*previous, *old_bob.certificate());
                assert_eq!(*current, *bob.identity().certificate());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, PeerEvent::Online));
    }

    #[tokio::test]
    async fn test_message_size_and_offline_checks() {
        let config = PeerConfig {
            max_message_size: 16,
            ..quiet_config()
        };
        let (peer, _events) = new_peer("bob@example.org", config);
        assert!(matches!(
            peer.send_message(&[0u8; 17]).await,
            Err(PeerError::MessageTooLarge { size: 17, max: 16 })
        ));
        assert!(matches!(
            peer.send_message(b"hi").await,
            Err(PeerError::Offline)
        ));

        peer.disconnect().await;
        assert!(matches!(
            peer.send_message(b"hi").await,
            Err(PeerError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_remote_disconnect_is_graceful() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a, b) = channel_pair(&alice, &bob).await;

        let (bob_at_alice, mut alice_events) = new_peer("bob@example.org", quiet_config());
        let (alice_at_bob, _bob_events) = new_peer("alice@example.org", quiet_config());
        bob_at_alice.add_channel(a, None).await.unwrap();
        alice_at_bob.add_channel(b, None).await.unwrap();
        assert!(matches!(next_event(&mut alice_events).await, PeerEvent::Online));

        alice_at_bob.disconnect().await;
        assert!(matches!(
            next_event(&mut alice_events).await,
            PeerEvent::Offline { graceful: true }
        ));
        assert!(!bob_at_alice.is_online());
    }

    /// Duplex stream whose reads fail once `broken` is set.
    struct Flaky {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for Flaky {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Flaky {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    struct LoopbackConnector {
        alice: Arc<HandshakeContext>,
        bob: Arc<HandshakeContext>,
        remote: VirtualPeer,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self) -> Result<SecureChannel, PeerError> {
            let (a, b) = channel_pair(&self.alice, &self.bob).await;
            self.remote.add_channel(b, None).await?;
            Ok(a)
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_transport_failure() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");

        let broken = Arc::new(AtomicBool::new(false));
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a = Flaky {
            inner: a,
            broken: broken.clone(),
        };
        let (a, b) = tokio::join!(
            SecureChannel::connect(boxed(a), alice.clone()),
            SecureChannel::accept(boxed(b), bob.clone())
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let (bob_at_alice, mut alice_events) = new_peer("bob@example.org", quiet_config());
        let (alice_at_bob, mut bob_events) = new_peer("alice@example.org", quiet_config());
        let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector {
            alice: alice.clone(),
            bob: bob.clone(),
            remote: alice_at_bob.clone(),
        });
        bob_at_alice.add_channel(a, Some(connector)).await.unwrap();
        assert!(matches!(next_event(&mut alice_events).await, PeerEvent::Online));

        // Break the transport and wake the blocked reader.
        broken.store(true, Ordering::SeqCst);
        drop(b);

        assert!(matches!(
            next_event(&mut alice_events).await,
            PeerEvent::Offline { graceful: false }
        ));
        assert!(matches!(
            next_event(&mut alice_events).await,
            PeerEvent::Reconnecting { attempt: 1 }
        ));
        assert!(matches!(next_event(&mut alice_events).await, PeerEvent::Online));

        bob_at_alice.send_message(b"back").await.unwrap();
        assert!(matches!(next_event(&mut bob_events).await, PeerEvent::Online));
        match next_event(&mut bob_events).await {
            PeerEvent::MessageReceived(m) => assert_eq!(m, b"back"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revocation_closes_all_channels() {
        let ca = Authority::new("CA");
        let alice = context(&ca, "alice@example.org");
        let bob = context(&ca, "bob@example.org");
        let (a, _b) = channel_pair(&alice, &bob).await;

        let list = Arc::new(RevocationList::new());
        let (tx, mut events) = mpsc::unbounded_channel();
        let bob_at_alice =
            VirtualPeer::new("bob@example.org", quiet_config(), list.clone(), tx).unwrap();
        bob_at_alice.add_channel(a, None).await.unwrap();
        assert!(matches!(next_event(&mut events).await, PeerEvent::Online));

        assert!(!bob_at_alice.check_revocation().await);
        list.revoke(*bob.identity().certificate().serial());
        assert!(bob_at_alice.check_revocation().await);

        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::InvalidCertificate { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::Offline { graceful: false }
        ));
        assert!(!bob_at_alice.is_online());
    }
}
