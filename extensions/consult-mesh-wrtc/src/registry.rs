//! Participant Registry: session id -> display metadata, media flags and stream.
//!
//! Pure state. Metadata and media flags are merged independently so that neither kind of update
//! clobbers the other. Once a `media-status-changed` has been seen for a session, the media flags
//! carried by later metadata records are ignored.

use std::sync::Arc;

use consult::mesh::{MediaState, Participant, ParticipantInfo, SessionId, TrackKind};
use indexmap::IndexMap;

use crate::{
    host_media::{LevelTap, LocalStream},
    simple_webrtc::RemoteStream,
};

#[derive(Debug, Clone)]
pub enum StreamRef {
    Local(LocalStream),
    Remote(Arc<RemoteStream>),
}

impl StreamRef {
    fn same(&self, other: &StreamRef) -> bool {
        match (self, other) {
            (StreamRef::Local(a), StreamRef::Local(b)) => a == b,
            (StreamRef::Remote(a), StreamRef::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn audio_level(&self) -> Option<Arc<LevelTap>> {
        match self {
            StreamRef::Local(stream) => stream
                .track(TrackKind::Audio)
                .filter(|t| t.is_enabled() && !t.is_stopped())
                .map(|t| t.level().clone()),
            StreamRef::Remote(stream) => stream.audio_level(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    info: ParticipantInfo,
    media: MediaState,
    media_confirmed: bool,
    is_local: bool,
    stream: Option<StreamRef>,
}

impl Entry {
    fn participant(&self) -> Participant {
        Participant {
            info: self.info.clone(),
            media: self.media,
            is_local: self.is_local,
            has_stream: self.stream.is_some(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    entries: IndexMap<SessionId, Entry>,
    local: Option<SessionId>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_id(&self) -> Option<&SessionId> {
        self.local.as_ref()
    }

    /// installs the local participant's own entry. its media flags always mirror local media
    pub fn set_local(
        &mut self,
        mut info: ParticipantInfo,
        media: MediaState,
        stream: Option<LocalStream>,
    ) {
        if let Some(prev) = self.local.take() {
            if prev != info.session_id {
                self.entries.shift_remove(&prev);
            }
        }
        info.media = Some(media);
        let id = info.session_id.clone();
        self.entries.insert(
            id.clone(),
            Entry {
                info,
                media,
                media_confirmed: true,
                is_local: true,
                stream: stream.map(StreamRef::Local),
            },
        );
        self.local = Some(id);
    }

    /// returns true if the local media flags changed
    pub fn update_local(&mut self, media: MediaState, stream: Option<LocalStream>) -> bool {
        let Some(entry) = self.local.as_ref().and_then(|id| self.entries.get_mut(id)) else {
            return false;
        };
        entry.stream = stream.map(StreamRef::Local);
        let changed = entry.media != media;
        entry.media = media;
        entry.info.media = Some(media);
        changed
    }

    /// inserts or merges display metadata. returns true if the session was not known before
    pub fn upsert_info(&mut self, info: ParticipantInfo) -> bool {
        match self.entries.get_mut(&info.session_id) {
            Some(entry) => {
                if !entry.media_confirmed {
                    if let Some(media) = info.media {
                        entry.media = media;
                    }
                }
                let media = entry.info.media;
                entry.info = info;
                if entry.media_confirmed {
                    entry.info.media = media;
                }
                false
            }
            None => {
                let media = info.media.unwrap_or_default();
                self.entries.insert(
                    info.session_id.clone(),
                    Entry {
                        info,
                        media,
                        media_confirmed: false,
                        is_local: false,
                        stream: None,
                    },
                );
                true
            }
        }
    }

    /// applies a media-status change. unknown sessions are ignored.
    /// returns true if the stored flags changed
    pub fn update_media(&mut self, session_id: &SessionId, media: MediaState) -> bool {
        let Some(entry) = self.entries.get_mut(session_id) else {
            return false;
        };
        entry.media_confirmed = true;
        entry.info.media = Some(media);
        let changed = entry.media != media;
        entry.media = media;
        changed
    }

    /// returns true if the stream reference changed
    pub fn set_stream(&mut self, session_id: &SessionId, stream: StreamRef) -> bool {
        let Some(entry) = self.entries.get_mut(session_id) else {
            return false;
        };
        if entry.stream.as_ref().map(|s| s.same(&stream)).unwrap_or(false) {
            return false;
        }
        entry.stream = Some(stream);
        true
    }

    pub fn clear_stream(&mut self, session_id: &SessionId) -> Option<StreamRef> {
        self.entries
            .get_mut(session_id)
            .and_then(|entry| entry.stream.take())
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<Participant> {
        let entry = self.entries.shift_remove(session_id)?;
        if entry.is_local {
            self.local = None;
        }
        Some(entry.participant())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Participant> {
        self.entries.get(session_id).map(Entry::participant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// every participant in arrival order
    pub fn participants(&self) -> Vec<Participant> {
        self.entries.values().map(Entry::participant).collect()
    }

    /// level taps of unmuted participants with an audio-bearing stream
    pub fn audio_sources(&self) -> Vec<(SessionId, Arc<LevelTap>)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.media.microphone_enabled)
            .filter_map(|(id, entry)| {
                entry
                    .stream
                    .as_ref()
                    .and_then(StreamRef::audio_level)
                    .map(|tap| (id.clone(), tap))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.local = None;
    }
}
