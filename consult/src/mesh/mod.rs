//! Mesh provides full-mesh teleconferencing for a meeting room. It should handle the following:
//! - joining a room through a signaling relay and learning who is already present
//! - negotiating one WebRTC connection with every other participant
//! - keeping locally captured audio/video in sync across all of those connections
//! - tracking participant metadata and media state
//! - detecting which participant is currently speaking
//!
use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod signal;

/// Opaque identifier assigned by the relay to one connected participant instance
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// microphone/camera flags as announced over signaling
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub microphone_enabled: bool,
    pub camera_enabled: bool,
}

impl MediaState {
    pub fn new(microphone_enabled: bool, camera_enabled: bool) -> Self {
        Self {
            microphone_enabled,
            camera_enabled,
        }
    }
}

/// display metadata for one participant, as delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub session_id: SessionId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// media flags at the time the relay produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaState>,
}

impl ParticipantInfo {
    pub fn new(session_id: impl Into<SessionId>, name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            name: name.into(),
            role: None,
            specialty: None,
            avatar: None,
            media: None,
        }
    }
}

/// A read-only view of one registry entry, handed to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub info: ParticipantInfo,
    pub media: MediaState,
    pub is_local: bool,
    /// false means the UI should show an avatar placeholder
    pub has_stream: bool,
}

impl Participant {
    pub fn session_id(&self) -> &SessionId {
        &self.info.session_id
    }
}

/// Provides full-mesh teleconferencing for one room at a time
#[async_trait]
pub trait Mesh: Send + Sync {
    // ------ Misc ------
    /// The event stream notifies the UI of room related events
    async fn get_event_stream(&mut self) -> Result<MeshEventStream, Error>;

    // ------ Join/Leave a room ------

    /// connect to the relay and announce ourselves in `room_id`. only one room may be joined at a time.
    async fn join_room(&mut self, room_id: RoomId) -> Result<(), Error>;
    /// tear down every peer connection and forget the room. local capture keeps running
    /// so a preview can continue between screens.
    async fn leave_network(&mut self) -> Result<(), Error>;
    /// leave_network, then release every local capture track
    async fn leave_completely(&mut self) -> Result<(), Error>;

    // ------ Select input devices ------

    async fn get_available_cameras(&self) -> Result<Vec<String>, Error>;
    async fn get_available_microphones(&self) -> Result<Vec<String>, Error>;

    // ------ Media controls ------

    /// `device_id` of None keeps the active device, or uses the default if nothing is captured yet
    async fn set_camera_enabled(
        &mut self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error>;
    async fn set_microphone_enabled(
        &mut self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error>;

    // ------ Utility Functions ------

    /// every participant of the current room, the local one included
    async fn get_participants(&self) -> Result<Vec<Participant>, Error>;
    async fn get_active_speaker(&self) -> Result<Option<SessionId>, Error>;
    /// Returns the ID of the current room, or None if not in a room
    async fn get_room_id(&self) -> Option<RoomId>;
}

/// Drives the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEventKind {
    /// the relay told us who we are
    SelfJoined { session_id: SessionId },
    /// Someone is in the room
    ParticipantJoined { session_id: SessionId },
    /// Someone left the room
    ParticipantLeft { session_id: SessionId },
    ParticipantMediaChanged {
        session_id: SessionId,
        media: MediaState,
    },
    /// transport connectivity reached `connected`
    PeerConnected { session_id: SessionId },
    /// the connection was torn down. the participant may still be in the room
    PeerDisconnected { session_id: SessionId },
    StreamAdded { session_id: SessionId },
    StreamRemoved { session_id: SessionId },
    ActiveSpeakerChanged { session_id: Option<SessionId> },
    /// the signaling channel went away. every connection was torn down
    ConnectionLost { room_id: RoomId },
}

pub struct MeshEventStream(pub BoxStream<'static, MeshEventKind>);

impl core::ops::Deref for MeshEventStream {
    type Target = BoxStream<'static, MeshEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for MeshEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
