use std::{collections::HashMap, sync::Arc};

use consult::mesh::{SessionId, TrackKind};
use derive_more::Display;

use crate::simple_webrtc::{
    ConnectionId, ConnectivityState, PeerTransport, RemoteStream, SenderId,
};

/// Offer/answer progress of one connection.
///
/// `Idle -> OfferSent -> Stable` when we offer, `Idle -> AnswerPending -> Stable` when we answer.
/// A stable connection re-enters `OfferSent` or `AnswerPending` for every renegotiation. When
/// glare is resolved against us, the entry passes through `AnswerPending` on its way back to
/// `Stable`; when it is resolved in our favor it simply stays in `OfferSent`.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "offer-sent")]
    OfferSent,
    #[display(fmt = "answer-pending")]
    AnswerPending,
    #[display(fmt = "stable")]
    Stable,
    #[display(fmt = "closed")]
    Closed,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    #[display(fmt = "offerer")]
    Offerer,
    #[display(fmt = "answerer")]
    Answerer,
}

#[derive(Debug, Clone)]
pub(crate) struct SenderSlot {
    pub id: SenderId,
    pub track_id: String,
}

/// One connection to one remote participant. At most one exists per session id.
pub struct PeerConnectionEntry {
    pub(crate) session_id: SessionId,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) signaling: SignalingState,
    pub(crate) connectivity: ConnectivityState,
    /// held from offer creation (or offer receipt) until the answer is applied
    pub(crate) negotiating: bool,
    /// a track change arrived while `negotiating`. one more offer follows the current exchange
    pub(crate) renegotiate_pending: bool,
    /// the connection reached `Stable` at least once
    pub(crate) established: bool,
    pub(crate) announced_connected: bool,
    pub(crate) glare_resolutions: u32,
    pub(crate) senders: HashMap<TrackKind, SenderSlot>,
    pub(crate) remote_stream: Option<Arc<RemoteStream>>,
}

impl PeerConnectionEntry {
    pub(crate) fn new(session_id: SessionId, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            session_id,
            transport,
            signaling: SignalingState::Idle,
            connectivity: ConnectivityState::New,
            negotiating: false,
            renegotiate_pending: false,
            established: false,
            announced_connected: false,
            glare_resolutions: 0,
            senders: HashMap::new(),
            remote_stream: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.transport.connection_id()
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        match self.signaling {
            SignalingState::OfferSent => Some(NegotiationRole::Offerer),
            SignalingState::AnswerPending => Some(NegotiationRole::Answerer),
            _ => None,
        }
    }

    pub(crate) fn snapshot(&self) -> PeerSnapshot {
        let mut senders: Vec<_> = self
            .senders
            .iter()
            .map(|(kind, slot)| (*kind, slot.track_id.clone()))
            .collect();
        senders.sort_by_key(|(kind, _)| *kind == TrackKind::Video);
        PeerSnapshot {
            session_id: self.session_id.clone(),
            connection_id: self.connection_id(),
            signaling: self.signaling,
            role: self.role(),
            connectivity: self.connectivity,
            negotiating: self.negotiating,
            renegotiate_pending: self.renegotiate_pending,
            glare_resolutions: self.glare_resolutions,
            senders,
            has_remote_stream: self.remote_stream.is_some(),
        }
    }
}

/// Read-only view of a `PeerConnectionEntry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub signaling: SignalingState,
    /// which side of the exchange in flight we are on, if one is
    pub role: Option<NegotiationRole>,
    pub connectivity: ConnectivityState,
    pub negotiating: bool,
    pub renegotiate_pending: bool,
    pub glare_resolutions: u32,
    /// (kind, local track id) for every sender, audio first
    pub senders: Vec<(TrackKind, String)>,
    pub has_remote_stream: bool,
}

impl PeerSnapshot {
    pub fn is_stable(&self) -> bool {
        self.signaling == SignalingState::Stable
    }

    pub fn sender_track(&self, kind: TrackKind) -> Option<&str> {
        self.senders
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
    }
}
