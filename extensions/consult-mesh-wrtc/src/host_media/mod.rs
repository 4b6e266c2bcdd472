//! Local capture. One `LocalMediaController` per process, independent of any room.
//!
//! The controller owns the composite local stream and is the only thing allowed to stop its
//! tracks. Every change is published through a `watch` channel; the room task subscribes and runs
//! a track synchronization pass over its peer connections whenever the snapshot changes.

use std::{collections::HashMap, sync::Arc};

use consult::{
    error::Error,
    mesh::{MediaState, TrackKind},
};
use tokio::sync::{watch, Mutex};

pub mod devices;
pub mod level;
pub mod track;

pub use devices::{codec_for, DeviceInfo, HostDevices, MediaDevices};
pub use level::LevelTap;
pub use track::{LocalStream, LocalTrack, LOCAL_STREAM_ID};

/// What the rest of the mesh sees of local media
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMediaSnapshot {
    pub stream: Option<LocalStream>,
    pub microphone_enabled: bool,
    pub camera_enabled: bool,
}

impl LocalMediaSnapshot {
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.stream.as_ref().and_then(|s| s.track(kind))
    }

    pub fn media_state(&self) -> MediaState {
        MediaState::new(self.microphone_enabled, self.camera_enabled)
    }
}

#[derive(Default)]
struct LocalMediaState {
    stream: Option<LocalStream>,
    last_device: HashMap<TrackKind, String>,
}

impl LocalMediaState {
    fn track(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.stream.as_ref().and_then(|s| s.track(kind)).cloned()
    }

    fn snapshot(&self) -> LocalMediaSnapshot {
        let enabled = |kind| {
            self.track(kind)
                .map(|t| t.is_enabled() && !t.is_stopped())
                .unwrap_or(false)
        };
        LocalMediaSnapshot {
            stream: self.stream.clone(),
            microphone_enabled: enabled(TrackKind::Audio),
            camera_enabled: enabled(TrackKind::Video),
        }
    }

    fn insert(&mut self, track: Arc<LocalTrack>) -> Option<Arc<LocalTrack>> {
        match self.stream.as_mut() {
            Some(stream) => stream.splice(track),
            None => {
                let (audio, video) = match track.kind() {
                    TrackKind::Audio => (Some(track), None),
                    TrackKind::Video => (None, Some(track)),
                };
                self.stream = Some(LocalStream::new(audio, video));
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    // held across device acquisition so a second toggle waits for the first one
    state: Arc<Mutex<LocalMediaState>>,
    publisher: Arc<watch::Sender<LocalMediaSnapshot>>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (publisher, _) = watch::channel(LocalMediaSnapshot::default());
        Self {
            devices,
            state: Arc::new(Mutex::new(LocalMediaState::default())),
            publisher: Arc::new(publisher),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LocalMediaSnapshot> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> LocalMediaSnapshot {
        self.publisher.borrow().clone()
    }

    pub async fn available(&self, kind: TrackKind) -> Result<Vec<DeviceInfo>, Error> {
        self.devices.enumerate(kind).await
    }

    pub async fn set_camera_enabled(
        &self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error> {
        self.set_enabled(TrackKind::Video, enabled, device_id).await
    }

    pub async fn set_microphone_enabled(
        &self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error> {
        self.set_enabled(TrackKind::Audio, enabled, device_id).await
    }

    async fn set_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let current = state.track(kind);

        if !enabled {
            if let Some(track) = current {
                track.set_enabled(false);
            }
            if let Some(id) = device_id {
                state.last_device.insert(kind, id);
            }
            self.publish(&state);
            return Ok(());
        }

        match current {
            Some(track)
                if device_id.is_none() || device_id.as_deref() == track.device_id() =>
            {
                track.set_enabled(true);
            }
            Some(_) | None => {
                let requested = device_id.or_else(|| state.last_device.get(&kind).cloned());
                // on failure nothing below runs and the previous track stays in place
                let track = self.devices.acquire(kind, requested.as_deref()).await?;
                track.set_enabled(true);
                if let Some(id) = track.device_id() {
                    state.last_device.insert(kind, id.to_string());
                }
                if let Some(old) = state.insert(track) {
                    tracing::debug!(%kind, old = %old.id(), "replacing local track");
                    old.stop();
                }
            }
        }

        self.publish(&state);
        Ok(())
    }

    /// stops the current video track and republishes a new composite stream that carries the
    /// existing audio track and `track`
    pub async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), Error> {
        if track.kind() != TrackKind::Video {
            return Err(Error::OtherWithContext(format!(
                "replace_video_track called with an {} track",
                track.kind()
            )));
        }
        if track.is_stopped() {
            return Err(Error::MediaStopped);
        }
        let mut state = self.state.lock().await;
        let mut previous = state.stream.take();
        if let Some(old) = previous.as_mut().and_then(|s| s.take(TrackKind::Video)) {
            old.stop();
        }
        let audio = previous.and_then(|mut s| s.take(TrackKind::Audio));
        if let Some(id) = track.device_id() {
            state.last_device.insert(TrackKind::Video, id.to_string());
        }
        state.stream = Some(LocalStream::new(audio, Some(track)));
        self.publish(&state);
        Ok(())
    }

    /// releases every track and forgets the selected devices
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        if let Some(stream) = state.stream.take() {
            for track in stream.tracks() {
                track.stop();
            }
        }
        state.last_device.clear();
        self.publish(&state);
    }

    fn publish(&self, state: &LocalMediaState) {
        let next = state.snapshot();
        self.publisher.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use consult::error::MediaAccessError;
    use tokio::sync::Notify;

    fn controller() -> (Arc<HostDevices>, LocalMediaController) {
        let devices = Arc::new(HostDevices::new());
        devices.add_device(TrackKind::Video, "cam-1", "Built-in camera");
        devices.add_device(TrackKind::Video, "cam-2", "USB camera");
        devices.add_device(TrackKind::Audio, "mic-1", "Headset");
        let controller = LocalMediaController::new(devices.clone());
        (devices, controller)
    }

    #[tokio::test]
    async fn same_device_toggle_keeps_the_track() -> anyhow::Result<()> {
        let (devices, media) = controller();
        media.set_camera_enabled(true, None).await?;
        let first = media.snapshot().track(TrackKind::Video).cloned().unwrap();

        media.set_camera_enabled(false, None).await?;
        assert!(!media.snapshot().camera_enabled);
        assert!(!first.is_stopped());

        media
            .set_camera_enabled(true, Some("cam-1".into()))
            .await?;
        let second = media.snapshot().track(TrackKind::Video).cloned().unwrap();
        assert_eq!(first.id(), second.id());
        assert!(media.snapshot().camera_enabled);
        assert_eq!(devices.acquisitions(), 1);
        Ok(())
    }

    /// host devices whose acquisition waits until the test releases it
    #[derive(Default)]
    struct GatedDevices {
        inner: HostDevices,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MediaDevices for GatedDevices {
        async fn enumerate(&self, kind: TrackKind) -> Result<Vec<DeviceInfo>, Error> {
            self.inner.enumerate(kind).await
        }

        async fn acquire(
            &self,
            kind: TrackKind,
            device_id: Option<&str>,
        ) -> Result<Arc<LocalTrack>, Error> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.acquire(kind, device_id).await
        }
    }

    #[tokio::test]
    async fn concurrent_toggles_share_one_acquisition() -> anyhow::Result<()> {
        let devices = Arc::new(GatedDevices::default());
        devices.inner.add_device(TrackKind::Video, "cam-1", "Built-in camera");
        let media = LocalMediaController::new(devices.clone());
        let mut rx = media.subscribe();

        let (first, second, ()) = tokio::join!(
            media.set_camera_enabled(true, None),
            media.set_camera_enabled(true, None),
            async {
                devices.entered.notified().await;
                // give the second toggle a chance to run while the first is in flight
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                devices.release.notify_one();
            }
        );
        first?;
        second?;

        assert_eq!(devices.inner.acquisitions(), 1);
        let track = rx.borrow_and_update().track(TrackKind::Video).cloned().unwrap();
        assert!(track.is_enabled());
        assert_eq!(track.device_id(), Some("cam-1"));
        assert_eq!(media.snapshot().track(TrackKind::Video).unwrap().id(), track.id());
        Ok(())
    }

    #[tokio::test]
    async fn device_switch_only_touches_one_kind() -> anyhow::Result<()> {
        let (devices, media) = controller();
        media.set_microphone_enabled(true, None).await?;
        media.set_camera_enabled(true, None).await?;
        let before = media.snapshot();
        let audio = before.track(TrackKind::Audio).cloned().unwrap();
        let old_video = before.track(TrackKind::Video).cloned().unwrap();

        media
            .set_camera_enabled(true, Some("cam-2".into()))
            .await?;
        let after = media.snapshot();
        let new_video = after.track(TrackKind::Video).unwrap();
        assert_eq!(new_video.device_id(), Some("cam-2"));
        assert!(old_video.is_stopped());
        assert!(Arc::ptr_eq(after.track(TrackKind::Audio).unwrap(), &audio));
        // spliced, not republished
        assert_eq!(
            before.stream.as_ref().map(|s| s.id()),
            after.stream.as_ref().map(|s| s.id())
        );
        assert_eq!(devices.acquisitions(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn denial_leaves_state_untouched() -> anyhow::Result<()> {
        let (devices, media) = controller();
        media.set_microphone_enabled(true, None).await?;
        let before = media.snapshot();

        devices.set_permission(TrackKind::Video, false);
        let err = media.set_camera_enabled(true, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MediaUnavailable {
                kind: TrackKind::Video,
                reason: MediaAccessError::Denied
            }
        ));
        assert_eq!(media.snapshot(), before);

        let err = media
            .set_microphone_enabled(true, Some("mic-9".into()))
            .await
            .unwrap_err();
        assert!(err.is_media_unavailable());
        assert_eq!(media.snapshot(), before);
        Ok(())
    }

    #[tokio::test]
    async fn replace_video_republishes() -> anyhow::Result<()> {
        let (_devices, media) = controller();
        media.set_microphone_enabled(true, None).await?;
        media.set_camera_enabled(true, None).await?;
        let before = media.snapshot();
        let old_video = before.track(TrackKind::Video).cloned().unwrap();

        let screen = Arc::new(LocalTrack::new(
            TrackKind::Video,
            None,
            codec_for(TrackKind::Video),
        ));
        media.replace_video_track(screen.clone()).await?;
        let after = media.snapshot();
        assert!(old_video.is_stopped());
        assert!(Arc::ptr_eq(after.track(TrackKind::Video).unwrap(), &screen));
        assert!(Arc::ptr_eq(
            after.track(TrackKind::Audio).unwrap(),
            before.track(TrackKind::Audio).unwrap()
        ));
        assert_ne!(
            before.stream.as_ref().map(|s| s.id().to_string()),
            after.stream.as_ref().map(|s| s.id().to_string())
        );

        let mic = after.track(TrackKind::Audio).cloned().unwrap();
        assert!(media.replace_video_track(mic).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stop_all_releases_everything() -> anyhow::Result<()> {
        let (_devices, media) = controller();
        let mut rx = media.subscribe();
        media.set_microphone_enabled(true, None).await?;
        assert!(rx.has_changed()?);
        let mic = rx.borrow_and_update().track(TrackKind::Audio).cloned().unwrap();

        media.stop_all().await;
        assert!(rx.has_changed()?);
        assert!(mic.is_stopped());
        assert_eq!(*rx.borrow(), LocalMediaSnapshot::default());

        // nothing to publish the second time
        media.stop_all().await;
        rx.borrow_and_update();
        media.stop_all().await;
        assert!(!rx.has_changed()?);
        Ok(())
    }
}
