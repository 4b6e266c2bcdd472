use std::sync::Arc;

use consult::mesh::{signal::IceCandidate, SessionId};
use derive_more::Display;

use super::{remote::RemoteTrack, ConnectionId};

/// ICE connectivity of one connection
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    #[default]
    #[display(fmt = "new")]
    New,
    #[display(fmt = "checking")]
    Checking,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "closed")]
    Closed,
}

impl ConnectivityState {
    /// nothing comes back from these
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Closed)
    }
}

/// Something a transport reported about one of its connections. `connection_id` lets the
/// receiver ignore events from a connection it already discarded.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub kind: TransportEventKind,
}

#[derive(Display, Clone)]
pub enum TransportEventKind {
    /// a locally gathered candidate that must reach the remote side
    #[display(fmt = "IceCandidate")]
    IceCandidate(IceCandidate),
    #[display(fmt = "Connectivity({})", _0)]
    Connectivity(ConnectivityState),
    /// the remote side is sending a track. its reader is already running
    #[display(fmt = "RemoteTrack")]
    RemoteTrack {
        stream_id: String,
        track: Arc<RemoteTrack>,
    },
}

impl std::fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
