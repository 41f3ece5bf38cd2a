//! Established secure channels.
//!
//! A [`SecureChannel`] splits into a [`ChannelReader`] owned by one reading
//! task and a cloneable [`ChannelWriter`]. Writers are serialized by a
//! per-channel lock. Renegotiation is driven from the read side: the reader
//! notices flagged records, takes the write lock, runs the handshake and
//! installs the new keys, while writers wait for the channel to return to
//! [`ChannelState::Established`].

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::engine::{perform_handshake, perform_renegotiation, HandshakeContext};
use crate::channel::error::ChannelError;
use crate::channel::protocol::Role;
use crate::channel::record::{RecordOpener, RecordSealer, FLAG_RENEGOTIATE, FLAG_RENEGOTIATE_ACK};
use crate::channel::rendezvous::{Rendezvous, RendezvousAction};
use crate::channel::transport::BoxedTransport;
use crate::crypto::{Certificate, CryptoSuite};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Handshaking,
    Established,
    ReNegotiating,
    Closed,
}

/// Negotiated parameters and peer identity.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub role: Role,
    pub version: u8,
    pub suite: CryptoSuite,
    pub remote_certificate: Certificate,
    /// Completed renegotiations.
    pub renegotiations: u32,
}

struct WriteSide {
    transport: WriteHalf<BoxedTransport>,
    sealer: RecordSealer,
    rendezvous: Rendezvous,
    epoch_started: Instant,
}

impl WriteSide {
    fn renegotiation_due(&self, context: &HandshakeContext) -> bool {
        let config = context.config();
        let by_bytes = config
            .renegotiate_after_bytes
            .is_some_and(|limit| self.sealer.bytes_sent() >= limit);
        let by_time = config
            .renegotiation_interval()
            .is_some_and(|interval| self.epoch_started.elapsed() >= interval);
        by_bytes || by_time
    }

    /// Flush a record carrying the renegotiation request.
    async fn send_request(&mut self) -> Result<(), ChannelError> {
        self.rendezvous.request();
        self.sealer.set_flags(FLAG_RENEGOTIATE);
        self.sealer.flush(&mut self.transport).await?;
        Ok(())
    }
}

struct Shared {
    writer: Mutex<WriteSide>,
    state: watch::Sender<ChannelState>,
    info: RwLock<ChannelInfo>,
    context: Arc<HandshakeContext>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            // Closed is terminal.
            if *current == state || *current == ChannelState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    fn abort(&self) {
        self.set_state(ChannelState::Closed);
        self.cancel.cancel();
    }

    fn info(&self) -> ChannelInfo {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// A mutually authenticated, encrypted channel.
pub struct SecureChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl SecureChannel {
    /// Run the handshake as initiator.
    pub async fn connect(
        transport: BoxedTransport,
        context: Arc<HandshakeContext>,
    ) -> Result<Self, ChannelError> {
        Self::establish(transport, Role::Initiator, context).await
    }

    /// Run the handshake as responder.
    pub async fn accept(
        transport: BoxedTransport,
        context: Arc<HandshakeContext>,
    ) -> Result<Self, ChannelError> {
        Self::establish(transport, Role::Responder, context).await
    }

    /// Run the handshake in `role` and wrap the transport on success.
    ///
    /// On failure the transport is shut down; no partially trusted channel
    /// is ever returned.
    pub async fn establish(
        transport: BoxedTransport,
        role: Role,
        context: Arc<HandshakeContext>,
    ) -> Result<Self, ChannelError> {
        let (state, _) = watch::channel(ChannelState::Handshaking);
        let (mut read_half, mut write_half) = tokio::io::split(transport);

        let outcome =
            match perform_handshake(&mut read_half, &mut write_half, role, &context).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%role, "handshake failed: {}", e);
                    let _ = write_half.shutdown().await;
                    return Err(e);
                }
            };

        let info = ChannelInfo {
            role,
            version: outcome.version,
            suite: outcome.suite,
            remote_certificate: outcome.remote_certificate,
            renegotiations: 0,
        };
        let shared = Arc::new(Shared {
            writer: Mutex::new(WriteSide {
                transport: write_half,
                sealer: outcome.sealer,
                rendezvous: Rendezvous::Idle,
                epoch_started: Instant::now(),
            }),
            state,
            info: RwLock::new(info),
            context,
            cancel: CancellationToken::new(),
        });
        shared.set_state(ChannelState::Established);
        spawn_rekey_timer(&shared);

        Ok(Self {
            reader: ChannelReader {
                shared: shared.clone(),
                transport: read_half,
                opener: outcome.opener,
                pending: Vec::new(),
                position: 0,
            },
            writer: ChannelWriter { shared },
        })
    }

    pub fn info(&self) -> ChannelInfo {
        self.writer.info()
    }

    pub fn state(&self) -> ChannelState {
        self.writer.state()
    }

    pub fn reader(&mut self) -> &mut ChannelReader {
        &mut self.reader
    }

    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    /// Separate the read side (for a dedicated task) from the write side.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("SecureChannel")
            .field("role", &info.role)
            .field("peer", &info.remote_certificate.email())
            .field("suite", &info.suite)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Requests a renegotiation whenever the epoch lifetime runs out.
fn spawn_rekey_timer(shared: &Arc<Shared>) {
    let Some(interval) = shared.context.config().renegotiation_interval() else {
        return;
    };
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let cancel = shared.cancel.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if let Err(e) = (ChannelWriter { shared }).renegotiate_if_due().await {
                debug!("rekey timer stopped: {}", e);
                break;
            }
        }
    });
}

/// Write half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelWriter {
    shared: Arc<Shared>,
}

impl ChannelWriter {
    /// Write `parts` back to back and flush them.
    ///
    /// No other writer can interleave with the parts of one call.
    pub async fn write(&self, parts: &[&[u8]]) -> Result<(), ChannelError> {
        let mut side = self.lock_established().await?;
        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(ChannelError::Closed),
            r = self.write_locked(&mut side, parts) => r,
        };
        drop(side);
        if result.is_err() {
            self.shared.abort();
        }
        result
    }

    /// Write one buffer and flush it.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.write(&[data]).await
    }

    async fn write_locked(
        &self,
        side: &mut WriteSide,
        parts: &[&[u8]],
    ) -> Result<(), ChannelError> {
        for part in parts {
            side.sealer.write(&mut side.transport, part).await?;
        }

        let request = side.renegotiation_due(&self.shared.context);
        if request {
            side.rendezvous.request();
            side.sealer.set_flags(FLAG_RENEGOTIATE);
        }
        side.sealer.flush(&mut side.transport).await?;

        if request {
            self.shared.set_state(ChannelState::ReNegotiating);
            info!(
                bytes = side.sealer.bytes_sent(),
                "key epoch exhausted, renegotiation requested"
            );
        }
        Ok(())
    }

    /// Ask the peer for fresh keys now.
    ///
    /// Returns once the request is on the wire; subsequent writes wait until
    /// the new epoch is installed.
    pub async fn request_renegotiation(&self) -> Result<(), ChannelError> {
        let mut side = self.lock_established().await?;
        self.send_request_locked(&mut side).await
    }

    async fn renegotiate_if_due(&self) -> Result<(), ChannelError> {
        let mut side = self.lock_established().await?;
        if side.renegotiation_due(&self.shared.context) {
            self.send_request_locked(&mut side).await?;
        }
        Ok(())
    }

    async fn send_request_locked(&self, side: &mut WriteSide) -> Result<(), ChannelError> {
        if let Err(e) = side.send_request().await {
            self.shared.abort();
            return Err(e);
        }
        self.shared.set_state(ChannelState::ReNegotiating);
        info!("renegotiation requested");
        Ok(())
    }

    /// Lock the write side once the channel is usable.
    async fn lock_established(&self) -> Result<MutexGuard<'_, WriteSide>, ChannelError> {
        let mut state = self.shared.state.subscribe();
        let mut deadline: Option<Instant> = None;

        loop {
            let guard = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(ChannelError::Closed),
                guard = self.shared.writer.lock() => guard,
            };
            let current = *state.borrow_and_update();
            match current {
                ChannelState::Established => return Ok(guard),
                ChannelState::Closed => return Err(ChannelError::Closed),
                ChannelState::Handshaking | ChannelState::ReNegotiating => drop(guard),
            }

            let until = *deadline.get_or_insert_with(|| {
                Instant::now() + self.shared.context.config().renegotiation_timeout()
            });
            match tokio::time::timeout_at(until, state.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ChannelError::Closed),
                Err(_) => {
                    warn!("renegotiation did not complete in time, closing channel");
                    self.shared.abort();
                    return Err(ChannelError::RenegotiationDesync(
                        "timed out waiting for renegotiation".to_string(),
                    ));
                }
            }
        }
    }

    /// Tear the channel down. Pending reads return [`ChannelError::Closed`].
    pub async fn close(&self) {
        self.shared.abort();
        let mut side = self.shared.writer.lock().await;
        if let Err(e) = side.transport.shutdown().await {
            debug!("transport shutdown failed: {}", e);
        }
    }

    /// Resolves once the channel is closed for any reason.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn info(&self) -> ChannelInfo {
        self.shared.info()
    }

    /// Peer certificate of this channel.
    pub fn remote_certificate(&self) -> Certificate {
        self.shared.info().remote_certificate
    }
}

/// Read half of a channel. Must be polled for renegotiations to progress.
pub struct ChannelReader {
    shared: Arc<Shared>,
    transport: ReadHalf<BoxedTransport>,
    opener: RecordOpener,
    pending: Vec<u8>,
    position: usize,
}

impl ChannelReader {
    /// Read some bytes. Returns 0 once the peer closed the stream cleanly.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.fill().await? {
            return Ok(0);
        }
        let available = &self.pending[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }

    /// Fill `buf` completely.
    ///
    /// Returns `Ok(false)` if the stream ended cleanly before the first byte;
    /// ending part way through is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(ChannelError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    pub fn info(&self) -> ChannelInfo {
        self.shared.info()
    }

    /// Make sure decrypted bytes are buffered. `false` on clean end of stream.
    async fn fill(&mut self) -> Result<bool, ChannelError> {
        while self.position >= self.pending.len() {
            let record = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => Err(ChannelError::Closed),
                r = self.opener.read_record(&mut self.transport) => r,
            };

            let record = match record {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("peer closed the channel");
                    self.shared.abort();
                    return Ok(false);
                }
                Err(e) => {
                    self.shared.abort();
                    return Err(e);
                }
            };

            let requested = record.requests_renegotiation();
            let acknowledged = record.acknowledges_renegotiation();
            self.pending = record.payload;
            self.position = 0;

            if let Err(e) = self.handle_flags(requested, acknowledged).await {
                warn!("renegotiation failed: {}", e);
                self.shared.abort();
                return Err(e);
            }
        }
        Ok(true)
    }

    async fn handle_flags(&mut self, requested: bool, acknowledged: bool) -> Result<(), ChannelError> {
        if !requested && !acknowledged {
            return Ok(());
        }

        let shared = self.shared.clone();
        let mut guard = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(ChannelError::Closed),
            guard = shared.writer.lock() => guard,
        };
        let side = &mut *guard;

        let action = match side.rendezvous.on_flags(requested, acknowledged)? {
            Some(action) => action,
            None => return Ok(()),
        };
        if action == RendezvousAction::AcknowledgeAndProceed {
            side.sealer.set_flags(FLAG_RENEGOTIATE_ACK);
            side.sealer.flush(&mut side.transport).await?;
        }
        shared.set_state(ChannelState::ReNegotiating);

        let previous = shared.info();
        debug!(role = %previous.role, ?action, "renegotiating");

        let outcome = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(ChannelError::Closed),
            r = perform_renegotiation(
                &mut self.transport,
                &mut side.transport,
                previous.role,
                previous.version,
                &shared.context,
                &previous.remote_certificate,
            ) => r,
        }?;

        side.sealer = outcome.sealer;
        side.rendezvous.complete();
        side.epoch_started = Instant::now();
        self.opener = outcome.opener;

        let renegotiations = {
            let mut info = shared
                .info
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            info.suite = outcome.suite;
            info.renegotiations += 1;
            info.renegotiations
        };
        drop(guard);
        shared.set_state(ChannelState::Established);
        info!(renegotiations, suite = %outcome.suite, "new key epoch installed");
        Ok(())
    }
}

/// Wait up to `timeout` for `writer` to reach `state`.
pub async fn wait_for_state(
    writer: &ChannelWriter,
    state: ChannelState,
    timeout: Duration,
) -> bool {
    let mut rx = writer.subscribe_state();
    tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
