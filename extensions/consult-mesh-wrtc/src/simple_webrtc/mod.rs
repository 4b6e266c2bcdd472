//! simple-webrtc
//! The transport seam between the peer session manager and a WebRTC implementation.
//!
//! A `PeerTransport` is one peer connection. It exchanges session descriptions and ICE candidates,
//! and manages one RTP sender per local track. It reports what happens on the connection through
//! the event channel it was created with; every event is stamped with the `ConnectionId` assigned
//! at creation so the receiver can tell a discarded connection from its replacement.
//!
//! Transforming audio/video into RTP packets is the capture side's responsibility: packets written
//! to a `LocalTrack` are forwarded to every connection holding a sender for it.
//!
//! `rtc` implements the seam over webrtc-rs. `loopback` is an in-memory implementation that
//! produces synthetic session descriptions.

use std::sync::Arc;

use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{
        signal::{IceCandidate, SessionDescription},
        SessionId,
    },
};
use derive_more::Display;
use tokio::sync::mpsc;

use crate::host_media::LocalTrack;

pub mod events;
pub mod loopback;
pub mod remote;
pub mod rtc;

pub use events::{ConnectivityState, TransportEvent, TransportEventKind};
pub use remote::{RemoteStream, RemoteTrack};

/// Generation of a connection to one remote session. A connection created after glare gets a
/// new id.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "conn-{}", _0)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display(fmt = "sender-{}", _0)]
pub struct SenderId(u64);

impl SenderId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// creates an offer and sets it as the local description. starts ICE gathering
    async fn create_offer(&self) -> Result<SessionDescription, Error>;
    /// sets the remote offer, then creates and sets the answer
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, Error>;
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error>;
    /// abandons an offer that was created but never answered. no-op when none is pending
    async fn rollback(&self) -> Result<(), Error>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    /// adding or removing a sender changes the media sections, and the caller must renegotiate.
    /// replacing does not
    async fn add_sender(&self, track: Arc<LocalTrack>) -> Result<SenderId, Error>;
    async fn replace_sender(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), Error>;
    async fn remove_sender(&self, sender: SenderId) -> Result<(), Error>;

    /// releases every sender and closes the connection. idempotent
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &SessionId,
        connection_id: ConnectionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error>;
}
