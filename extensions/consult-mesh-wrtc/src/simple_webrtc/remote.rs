use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use consult::mesh::{SessionId, TrackKind};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast, task::JoinHandle};
use webrtc::rtp;

use crate::host_media::LevelTap;

/// A track received from a remote participant.
///
/// Audio tracks carry a level tap fed from the RTP audio-level header extension. Received packets
/// are rebroadcast to whoever renders or decodes them. The reader task is aborted when the track
/// stops.
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    level: Option<Arc<LevelTap>>,
    // negotiated id of the audio-level header extension
    level_extension: Mutex<Option<u8>>,
    packets: broadcast::Sender<rtp::packet::Packet>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let level = match kind {
            TrackKind::Audio => Some(Arc::new(LevelTap::new())),
            TrackKind::Video => None,
        };
        let (packets, _) = broadcast::channel(256);
        Self {
            id: id.into(),
            kind,
            level,
            level_extension: Mutex::new(None),
            packets,
            reader: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<rtp::packet::Packet> {
        self.packets.subscribe()
    }

    pub fn set_audio_level_extension(&self, id: u8) {
        *self.level_extension.lock() = Some(id);
    }

    /// called by the reader for every received packet
    pub fn deliver(&self, packet: rtp::packet::Packet) {
        let extension = *self.level_extension.lock();
        if let (Some(level), Some(id)) = (self.level.as_ref(), extension) {
            if let Some(payload) = packet.header.get_extension(id) {
                level.push_level(payload.first().copied().unwrap_or(127));
            }
        }
        let _ = self.packets.send(packet);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn level(&self) -> Option<&Arc<LevelTap>> {
        self.level.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn attach_reader(&self, handle: JoinHandle<()>) {
        if self.is_stopped() {
            handle.abort();
            return;
        }
        if let Some(prev) = self.reader.lock().replace(handle) {
            prev.abort();
        }
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(level) = self.level.as_ref() {
            level.drain();
        }
    }
}

impl Drop for RemoteTrack {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Everything one remote participant sends over its connection
pub struct RemoteStream {
    session_id: SessionId,
    stream_id: String,
    tracks: RwLock<Vec<Arc<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new(session_id: SessionId, stream_id: impl Into<String>) -> Self {
        Self {
            session_id,
            stream_id: stream_id.into(),
            tracks: RwLock::new(vec![]),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// a newer track of the same kind replaces (and stops) the older one
    pub fn add_track(&self, track: Arc<RemoteTrack>) {
        let mut tracks = self.tracks.write();
        tracks.retain(|t| {
            if t.kind() == track.kind() && !Arc::ptr_eq(t, &track) {
                t.stop();
                false
            } else {
                !Arc::ptr_eq(t, &track)
            }
        });
        tracks.push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.tracks.read().clone()
    }

    pub fn audio_level(&self) -> Option<Arc<LevelTap>> {
        self.tracks
            .read()
            .iter()
            .filter(|t| !t.is_stopped())
            .find_map(|t| t.level().cloned())
    }

    pub fn stop(&self) {
        for track in self.tracks.write().drain(..) {
            track.stop();
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn newer_track_of_same_kind_wins() {
        let stream = RemoteStream::new("s-1".into(), "remote");
        let first = Arc::new(RemoteTrack::new("a1", TrackKind::Audio));
        let video = Arc::new(RemoteTrack::new("v1", TrackKind::Video));
        stream.add_track(first.clone());
        stream.add_track(video.clone());
        stream.add_track(first.clone());
        assert_eq!(stream.tracks().len(), 2);

        let second = Arc::new(RemoteTrack::new("a2", TrackKind::Audio));
        stream.add_track(second.clone());
        assert!(first.is_stopped());
        assert!(!video.is_stopped());
        assert!(Arc::ptr_eq(
            &stream.audio_level().unwrap(),
            second.level().unwrap()
        ));

        stream.stop();
        assert!(second.is_stopped());
        assert!(stream.audio_level().is_none());
    }

    fn packet_with(extensions: &[(u8, u8)]) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                extension: true,
                extension_profile: rtp::header::EXTENSION_PROFILE_ONE_BYTE,
                extensions: extensions
                    .iter()
                    .map(|(id, byte)| rtp::header::Extension {
                        id: *id,
                        payload: vec![*byte, 0].into(),
                    })
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn audio_level_is_read_from_its_negotiated_extension() {
        let track = RemoteTrack::new("a1", TrackKind::Audio);
        let level = track.level().cloned().unwrap();

        // id not known yet: nothing is measured
        track.deliver(packet_with(&[(1, 0x80 | 10)]));
        assert!(level.is_empty());

        // transport-cc sits in front of the audio level
        track.set_audio_level_extension(1);
        track.deliver(packet_with(&[(3, 0x00), (1, 0x80 | 10)]));
        let samples = level.drain();
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 10f32.powf(-0.5)).abs() < 1e-4);

        track.deliver(packet_with(&[(3, 0x00)]));
        assert!(level.is_empty());
    }
}
