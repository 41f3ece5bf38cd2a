//! Pause agreement that precedes every renegotiation.
//!
//! Handshake frames must never be read as records, so both directions have
//! to stop carrying application data before the first new handshake
//! message goes out. A side asks by setting [`FLAG_RENEGOTIATE`] on its last
//! record. The other side confirms with [`FLAG_RENEGOTIATE_ACK`] unless it
//! had asked at the same time, in which case both requests serve as each
//! other's confirmation.
//!
//! [`FLAG_RENEGOTIATE`]: crate::channel::record::FLAG_RENEGOTIATE
//! [`FLAG_RENEGOTIATE_ACK`]: crate::channel::record::FLAG_RENEGOTIATE_ACK

use crate::channel::error::ChannelError;

/// Local view of the pause agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rendezvous {
    /// No renegotiation in flight.
    #[default]
    Idle,
    /// This side sent a request and waits for the peer.
    Requested,
}

/// What the reader has to do after a rendezvous transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousAction {
    /// Confirm with an acknowledgement record, then run the handshake.
    AcknowledgeAndProceed,
    /// Both sides are paused; run the handshake.
    Proceed,
}

impl Rendezvous {
    /// Local side asks for a renegotiation. Returns `false` if a request is
    /// already outstanding.
    pub fn request(&mut self) -> bool {
        match self {
            Rendezvous::Idle => {
                *self = Rendezvous::Requested;
                true
            }
            Rendezvous::Requested => false,
        }
    }

    /// Peer's request arrived.
    pub fn on_peer_request(&mut self) -> RendezvousAction {
        match self {
            Rendezvous::Idle => RendezvousAction::AcknowledgeAndProceed,
            Rendezvous::Requested => RendezvousAction::Proceed,
        }
    }

    /// Peer's acknowledgement arrived.
    pub fn on_peer_ack(&mut self) -> Result<RendezvousAction, ChannelError> {
        match self {
            Rendezvous::Requested => Ok(RendezvousAction::Proceed),
            Rendezvous::Idle => Err(ChannelError::RenegotiationDesync(
                "acknowledgement without a pending request".to_string(),
            )),
        }
    }

    /// Dispatch on the flag bits of a received record.
    pub fn on_flags(
        &mut self,
        requested: bool,
        acknowledged: bool,
    ) -> Result<Option<RendezvousAction>, ChannelError> {
        match (requested, acknowledged) {
            (false, false) => Ok(None),
            (true, false) => Ok(Some(self.on_peer_request())),
            (false, true) => self.on_peer_ack().map(Some),
            (true, true) => Err(ChannelError::RenegotiationDesync(
                "request and acknowledgement on the same record".to_string(),
            )),
        }
    }

    /// The new key epoch is installed.
    pub fn complete(&mut self) {
        *self = Rendezvous::Idle;
    }

    pub fn is_pending(&self) -> bool {
        *self == Rendezvous::Requested
    }
}
