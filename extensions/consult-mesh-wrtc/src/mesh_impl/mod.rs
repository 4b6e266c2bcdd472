mod event_handler;

use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{Mesh, MeshEventKind, MeshEventStream, Participant, RoomId, SessionId, TrackKind},
    sync::RwLock,
    Extension,
};
use std::sync::Arc;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    config::MeshConfig,
    host_media::{LocalMediaController, LocalMediaSnapshot, LocalTrack, MediaDevices},
    peer_session::PeerSnapshot,
    signaling::SignalingConnector,
    simple_webrtc::{rtc::RtcTransportFactory, TransportFactory},
};

use self::event_handler::{Args, EventHandler};

struct ActiveRoom {
    room_id: RoomId,
    handler: EventHandler,
    task: JoinHandle<()>,
}

// implements Mesh
#[derive(Clone)]
pub struct MeshImpl {
    config: Arc<MeshConfig>,
    media: LocalMediaController,
    transports: Arc<dyn TransportFactory>,
    connector: Arc<dyn SignalingConnector>,
    ui_event_ch: broadcast::Sender<MeshEventKind>,
    room: Arc<RwLock<Option<ActiveRoom>>>,
    drop_handler: Arc<DropHandler>,
}

struct DropHandler {
    media: LocalMediaController,
    room: Arc<RwLock<Option<ActiveRoom>>>,
}

impl Drop for DropHandler {
    fn drop(&mut self) {
        if let Some(room) = self.room.write().take() {
            room.handler.cancel();
        }
        let media = self.media.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                media.stop_all().await;
                tracing::debug!("mesh drop handler finished");
            });
        }
    }
}

impl MeshImpl {
    pub fn new(
        config: MeshConfig,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        let (ui_event_ch, _rx) = broadcast::channel(config.event_capacity().max(1));
        let media = LocalMediaController::new(devices);
        let room = Arc::new(RwLock::new(None));
        Self {
            config: Arc::new(config),
            media: media.clone(),
            transports,
            connector,
            ui_event_ch,
            room: room.clone(),
            drop_handler: Arc::new(DropHandler { media, room }),
        }
    }

    /// a mesh whose peer connections run over webrtc-rs
    pub fn with_webrtc(
        config: MeshConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Result<Self, Error> {
        let transports = Arc::new(RtcTransportFactory::new(&config)?);
        Ok(Self::new(config, devices, transports, connector))
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_media(&self) -> LocalMediaSnapshot {
        self.media.snapshot()
    }

    fn handler(&self) -> Option<EventHandler> {
        self.room
            .read()
            .as_ref()
            .filter(|room| room.handler.is_active())
            .map(|room| room.handler.clone())
    }

    /// waits until the room has applied the current local media, if a room is active
    async fn flush(&self) -> Result<(), Error> {
        match self.handler() {
            Some(handler) => match handler.flush().await {
                // the room ended in the meantime. local media is still updated
                Err(Error::RoomNotJoined) => Ok(()),
                r => r,
            },
            None => Ok(()),
        }
    }

    /// swaps the outgoing video for `track` (e.g. a screen capture) on every connection
    pub async fn replace_video_track(&mut self, track: Arc<LocalTrack>) -> Result<(), Error> {
        self.media.replace_video_track(track).await?;
        self.flush().await
    }

    /// per-connection negotiation state of the current room
    pub async fn peer_states(&self) -> Result<Vec<PeerSnapshot>, Error> {
        let handler = self.handler().ok_or(Error::RoomNotJoined)?;
        handler.get_peer_states().await
    }

    async fn device_ids(&self, kind: TrackKind) -> Result<Vec<String>, Error> {
        let devices = self.media.available(kind).await?;
        Ok(devices.into_iter().map(|d| d.device_id).collect())
    }
}

impl Extension for MeshImpl {
    fn id(&self) -> String {
        "consult-mesh-wrtc".to_string()
    }
    fn name(&self) -> String {
        "Mesh WebRTC".into()
    }
}

#[async_trait]
impl Mesh for MeshImpl {
    async fn get_event_stream(&mut self) -> Result<MeshEventStream, Error> {
        let mut rx = self.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(MeshEventStream(Box::pin(stream)))
    }

    async fn join_room(&mut self, room_id: RoomId) -> Result<(), Error> {
        // a room that ended on its own still has to be cleaned up
        let finished = {
            let mut room = self.room.write();
            match room.as_ref() {
                Some(active) if active.handler.is_active() => {
                    return Err(Error::AlreadyInRoom(active.room_id.clone()));
                }
                _ => room.take(),
            }
        };
        if let Some(finished) = finished {
            let _ = finished.task.await;
        }

        let link = self.connector.connect(&room_id).await?;
        let (handler, task) = EventHandler::spawn(Args {
            room_id: room_id.clone(),
            config: (*self.config).clone(),
            link,
            transports: self.transports.clone(),
            media_rx: self.media.subscribe(),
            ui_event_ch: self.ui_event_ch.clone(),
        });

        let previous = self.room.write().replace(ActiveRoom {
            room_id: room_id.clone(),
            handler,
            task,
        });
        if let Some(previous) = previous {
            // join_room raced with another join_room
            previous.handler.cancel();
        }
        tracing::info!(%room_id, "joining room");
        Ok(())
    }

    async fn leave_network(&mut self) -> Result<(), Error> {
        let room = self.room.write().take();
        let Some(room) = room else {
            tracing::debug!("leave_network: not in a room");
            return Ok(());
        };
        room.handler.cancel();
        if let Err(e) = room.task.await {
            tracing::error!(room_id = %room.room_id, "room task failed: {e}");
        }
        tracing::info!(room_id = %room.room_id, "left room");
        Ok(())
    }

    async fn leave_completely(&mut self) -> Result<(), Error> {
        self.leave_network().await?;
        self.media.stop_all().await;
        Ok(())
    }

    async fn get_available_cameras(&self) -> Result<Vec<String>, Error> {
        self.device_ids(TrackKind::Video).await
    }

    async fn get_available_microphones(&self) -> Result<Vec<String>, Error> {
        self.device_ids(TrackKind::Audio).await
    }

    async fn set_camera_enabled(
        &mut self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error> {
        self.media.set_camera_enabled(enabled, device_id).await?;
        self.flush().await
    }

    async fn set_microphone_enabled(
        &mut self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<(), Error> {
        self.media.set_microphone_enabled(enabled, device_id).await?;
        self.flush().await
    }

    async fn get_participants(&self) -> Result<Vec<Participant>, Error> {
        match self.handler() {
            Some(handler) => handler.get_participants().await,
            None => Ok(vec![]),
        }
    }

    async fn get_active_speaker(&self) -> Result<Option<SessionId>, Error> {
        match self.handler() {
            Some(handler) => handler.get_active_speaker().await,
            None => Ok(None),
        }
    }

    async fn get_room_id(&self) -> Option<RoomId> {
        self.room
            .read()
            .as_ref()
            .filter(|room| room.handler.is_active())
            .map(|room| room.room_id.clone())
    }
}
