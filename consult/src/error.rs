/// Errors surfaced by the mesh core and its extensions.
use thiserror::Error;

use crate::mesh::{RoomId, SessionId, TrackKind};

#[derive(Error, Debug)]
pub enum Error {
    //Media Errors
    /// the capture device for `kind` could not be opened. never retried automatically.
    #[error("{kind} is unavailable: {reason}")]
    MediaUnavailable {
        kind: TrackKind,
        reason: MediaAccessError,
    },
    #[error("Local media has been stopped")]
    MediaStopped,

    //Negotiation Errors
    #[error("Negotiation with {session_id} failed: {reason}")]
    NegotiationFailed {
        session_id: SessionId,
        reason: String,
    },
    #[error("Session description is invalid: {_0}")]
    InvalidSessionDescription(String),
    #[error("TransportError: {_0}")]
    TransportError(String),

    //Room Errors
    #[error("Not currently in a room")]
    RoomNotJoined,
    #[error("Already in room {_0}")]
    AlreadyInRoom(RoomId),
    #[error("Signaling channel is closed")]
    SignalingChannelClosed,
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),
    #[error("Operation was cancelled")]
    Cancelled,

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl Error {
    /// true for device denial or absence. callers report these to the user.
    pub fn is_media_unavailable(&self) -> bool {
        matches!(self, Error::MediaUnavailable { .. })
    }
}

/// Why a capture device could not be opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission denied")]
    Denied,
    #[error("device not found")]
    NotFound,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn media_unavailable_is_distinct() {
        let err = Error::MediaUnavailable {
            kind: TrackKind::Video,
            reason: MediaAccessError::Denied,
        };
        assert!(err.is_media_unavailable());
        assert_eq!(err.to_string(), "video is unavailable: permission denied");
        assert!(!Error::RoomNotJoined.is_media_unavailable());
    }
}
