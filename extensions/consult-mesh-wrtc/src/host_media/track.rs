use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use consult::{error::Error, mesh::TrackKind};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::{
    rtp,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
};

use super::level::LevelTap;

/// msid stream id announced for every local track
pub const LOCAL_STREAM_ID: &str = "consult-local";

/// One captured audio or video track.
///
/// The capturing side writes RTP packets through `write_rtp`; every peer connection holding a
/// sender for this track forwards them. Disabling the track drops packets without releasing the
/// device. Only the local media controller stops tracks.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    device_id: Option<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticRTP>,
    level: Arc<LevelTap>,
    capture: Mutex<Option<JoinHandle<()>>>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, device_id: Option<String>, codec: RTCRtpCodecCapability) -> Self {
        let id = Uuid::new_v4().to_string();
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        Self {
            id,
            kind,
            device_id,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
            level: Arc::new(LevelTap::new()),
            capture: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// the webrtc-rs track handed to RTP senders
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.rtp.clone()
    }

    /// capture code pushes PCM (or audio levels) here for local speaker detection
    pub fn level(&self) -> &Arc<LevelTap> {
        &self.level
    }

    /// ties a capture task to the track's lifetime. it is aborted when the track stops
    pub fn attach_capture(&self, handle: JoinHandle<()>) {
        if self.is_stopped() {
            handle.abort();
            return;
        }
        if let Some(prev) = self.capture.lock().replace(handle) {
            prev.abort();
        }
    }

    /// forwards a packet to every peer connection sending this track.
    /// returns 0 without writing while the track is disabled
    pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize, Error> {
        if self.is_stopped() {
            return Err(Error::MediaStopped);
        }
        if !self.is_enabled() {
            return Ok(0);
        }
        self.rtp
            .write_rtp(packet)
            .await
            .map_err(|e| Error::TransportError(e.to_string()))
    }

    /// releases the device. idempotent
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return;
        }
        self.set_enabled(false);
        if let Some(handle) = self.capture.lock().take() {
            handle.abort();
        }
        self.level.drain();
        tracing::debug!(track = %self.id, kind = %self.kind, "local track stopped");
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        if let Some(handle) = self.capture.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The composite local stream: at most one track of each kind
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
}

impl LocalStream {
    pub(crate) fn new(audio: Option<Arc<LocalTrack>>, video: Option<Arc<LocalTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            audio,
            video,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    /// puts `track` in the slot for its kind, returning whatever was there
    pub(crate) fn splice(&mut self, track: Arc<LocalTrack>) -> Option<Arc<LocalTrack>> {
        match track.kind() {
            TrackKind::Audio => self.audio.replace(track),
            TrackKind::Video => self.video.replace(track),
        }
    }

    pub(crate) fn take(&mut self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => self.audio.take(),
            TrackKind::Video => self.video.take(),
        }
    }
}

impl PartialEq for LocalStream {
    fn eq(&self, other: &Self) -> bool {
        let same = |a: &Option<Arc<LocalTrack>>, b: &Option<Arc<LocalTrack>>| match (a, b) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.id == other.id && same(&self.audio, &other.audio) && same(&self.video, &other.video)
    }
}
