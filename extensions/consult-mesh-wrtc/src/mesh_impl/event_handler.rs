use futures::channel::oneshot;
use futures::StreamExt;

use consult::{
    error::Error,
    mesh::{
        signal::{InboundSignal, OutboundSignal},
        MediaState, MeshEventKind, Participant, ParticipantInfo, RoomId, SessionId,
    },
};
use std::sync::Arc;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{MeshConfig, OfferPolicy},
    host_media::LocalMediaSnapshot,
    peer_session::{PeerSessionManager, PeerSnapshot},
    signaling::{SignalingChannel, SignalingLink},
    simple_webrtc::{TransportEvent, TransportFactory},
    speaker::ActiveSpeakerDetector,
};

enum EventHandlerCmd {
    GetParticipants {
        rsp: oneshot::Sender<Vec<Participant>>,
    },
    GetActiveSpeaker {
        rsp: oneshot::Sender<Option<SessionId>>,
    },
    GetPeerStates {
        rsp: oneshot::Sender<Vec<PeerSnapshot>>,
    },
    /// apply the latest local media now instead of on the next change notification
    Flush {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
}

pub(crate) struct Args {
    pub room_id: RoomId,
    pub config: MeshConfig,
    pub link: SignalingLink,
    pub transports: Arc<dyn TransportFactory>,
    pub media_rx: watch::Receiver<LocalMediaSnapshot>,
    pub ui_event_ch: broadcast::Sender<MeshEventKind>,
}

/// Handle to the task that runs one room. Cancelling it tears down every connection of the room.
#[derive(Clone)]
pub struct EventHandler {
    ch: UnboundedSender<EventHandlerCmd>,
    cancel: CancellationToken,
}

impl EventHandler {
    pub(crate) fn spawn(args: Args) -> (Self, JoinHandle<()>) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let task = tokio::spawn(async move {
            run(args, cmd_rx, cancel2).await;
        });
        (Self { ch: tx, cancel }, task)
    }

    /// false once the room was left or its signaling channel was lost
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn get_participants(&self) -> Result<Vec<Participant>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetParticipants { rsp: tx })
            .map_err(|_| Error::RoomNotJoined)?;
        rx.await.map_err(|_| Error::RoomNotJoined)
    }

    pub async fn get_active_speaker(&self) -> Result<Option<SessionId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetActiveSpeaker { rsp: tx })
            .map_err(|_| Error::RoomNotJoined)?;
        rx.await.map_err(|_| Error::RoomNotJoined)
    }

    pub async fn get_peer_states(&self) -> Result<Vec<PeerSnapshot>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetPeerStates { rsp: tx })
            .map_err(|_| Error::RoomNotJoined)?;
        rx.await.map_err(|_| Error::RoomNotJoined)
    }

    pub async fn flush(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::Flush { rsp: tx })
            .map_err(|_| Error::RoomNotJoined)?;
        rx.await.map_err(|_| Error::RoomNotJoined)?
    }
}

/// per-room state owned by the event handler task
struct Room {
    room_id: RoomId,
    policy: OfferPolicy,
    signaling: Arc<dyn SignalingChannel>,
    manager: PeerSessionManager,
    speaker: ActiveSpeakerDetector,
    ui_event_ch: broadcast::Sender<MeshEventKind>,
    // media flags last sent to the relay
    announced: MediaState,
}

impl Room {
    fn new(
        room_id: RoomId,
        config: &MeshConfig,
        signaling: Arc<dyn SignalingChannel>,
        manager: PeerSessionManager,
        ui_event_ch: broadcast::Sender<MeshEventKind>,
        announced: MediaState,
    ) -> Self {
        Self {
            room_id,
            policy: config.offer_policy(),
            signaling,
            manager,
            speaker: ActiveSpeakerDetector::new(config.speaker().clone()),
            ui_event_ch,
            announced,
        }
    }

    fn emit(&self, event: MeshEventKind) {
        let _ = self.ui_event_ch.send(event);
    }

    fn is_local(&self, session_id: &SessionId) -> bool {
        self.manager.local_id() == Some(session_id)
    }

    async fn handle_signal(&mut self, signal: InboundSignal) -> Result<(), Error> {
        let result = self.apply_signal(signal).await;
        self.prune_speaker();
        result
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        let result = self.manager.handle_transport_event(event).await;
        self.prune_speaker();
        result
    }

    async fn apply_signal(&mut self, signal: InboundSignal) -> Result<(), Error> {
        match signal {
            InboundSignal::SelfInfo { participant } => {
                let session_id = participant.session_id.clone();
                tracing::info!(room_id = %self.room_id, %session_id, "joined room");
                self.manager.set_local_id(session_id.clone());
                let local = self.manager.local_media().clone();
                self.manager
                    .registry_mut()
                    .set_local(participant, local.media_state(), local.stream);
                self.emit(MeshEventKind::SelfJoined { session_id });
            }
            InboundSignal::ExistingParticipants { participants } => {
                for participant in participants {
                    self.participant_joined(participant, false).await?;
                }
            }
            InboundSignal::ParticipantJoined { participant } => {
                self.participant_joined(participant, true).await?;
            }
            InboundSignal::ParticipantLeft { session_id } => {
                self.participant_left(&session_id).await;
            }
            InboundSignal::OfferReceived {
                sdp_offer,
                from_session_id,
            } => {
                self.manager.handle_offer(&from_session_id, sdp_offer).await?;
            }
            InboundSignal::AnswerReceived {
                sdp_answer,
                from_session_id,
            } => {
                self.manager
                    .handle_answer(&from_session_id, sdp_answer)
                    .await?;
            }
            InboundSignal::IceCandidateReceived {
                candidate,
                from_session_id,
            } => {
                self.manager
                    .handle_remote_candidate(&from_session_id, candidate)
                    .await?;
            }
            InboundSignal::MediaStatusChanged {
                session_id,
                microphone_enabled,
                camera_enabled,
            } => {
                if self.is_local(&session_id) {
                    return Ok(());
                }
                let media = MediaState::new(microphone_enabled, camera_enabled);
                if self.manager.registry_mut().update_media(&session_id, media) {
                    self.emit(MeshEventKind::ParticipantMediaChanged { session_id, media });
                }
            }
        }
        Ok(())
    }

    /// `joined_later` is true for a participant-joined notification and false for an entry of
    /// existing-participants. which of the two makes us offer depends on the policy
    async fn participant_joined(
        &mut self,
        participant: ParticipantInfo,
        joined_later: bool,
    ) -> Result<(), Error> {
        let session_id = participant.session_id.clone();
        if self.is_local(&session_id) {
            return Ok(());
        }
        // a second join for a session we are connected to means the remote side started over
        if joined_later && self.manager.contains(&session_id) {
            tracing::info!(%session_id, "participant joined again. dropping the old connection");
            self.manager.teardown(&session_id).await;
        }
        self.manager.forget_closed(&session_id);

        if self.manager.registry_mut().upsert_info(participant) {
            tracing::info!(room_id = %self.room_id, %session_id, "participant joined");
            self.emit(MeshEventKind::ParticipantJoined {
                session_id: session_id.clone(),
            });
        }

        let offer = match self.policy {
            OfferPolicy::Newcomer => !joined_later,
            OfferPolicy::Incumbent => joined_later,
        };
        if offer {
            self.manager.connect(&session_id).await?;
        }
        Ok(())
    }

    async fn participant_left(&mut self, session_id: &SessionId) {
        if self.is_local(session_id) || !self.manager.registry().contains(session_id) {
            tracing::debug!(%session_id, "ignoring leave for unknown session");
            return;
        }
        self.manager.teardown(session_id).await;
        self.manager.registry_mut().remove(session_id);
        // late offers are refused by the registry check
        self.manager.forget_closed(session_id);
        if self.speaker.forget(session_id) {
            self.emit(MeshEventKind::ActiveSpeakerChanged { session_id: None });
        }
        tracing::info!(room_id = %self.room_id, %session_id, "participant left");
        self.emit(MeshEventKind::ParticipantLeft {
            session_id: session_id.clone(),
        });
    }

    async fn apply_local_media(&mut self, snapshot: LocalMediaSnapshot) -> Result<(), Error> {
        self.manager.sync_tracks(&snapshot).await?;

        let media = snapshot.media_state();
        if media != self.announced {
            self.announced = media;
            let signal = OutboundSignal::MediaStatusChange {
                room_id: self.room_id.clone(),
                microphone_enabled: media.microphone_enabled,
                camera_enabled: media.camera_enabled,
            };
            if let Err(e) = self.signaling.send(signal).await {
                tracing::warn!(room_id = %self.room_id, "failed to announce media status: {e}");
            }
        }

        if self
            .manager
            .registry_mut()
            .update_local(media, snapshot.stream)
        {
            if let Some(session_id) = self.manager.local_id().cloned() {
                self.emit(MeshEventKind::ParticipantMediaChanged { session_id, media });
            }
        }
        self.prune_speaker();
        Ok(())
    }

    /// A session that lost its audio (connection gone, muted) stops being the speaker right away
    /// instead of on the next sampling pass
    fn prune_speaker(&mut self) {
        let sources = self.manager.registry().audio_sources();
        if self
            .speaker
            .retain(|id| sources.iter().any(|(source, _)| source == id))
        {
            self.emit(MeshEventKind::ActiveSpeakerChanged { session_id: None });
        }
    }

    fn sample_speaker(&mut self) {
        let sources = self.manager.registry().audio_sources();
        if let Some(session_id) = self.speaker.tick(&sources) {
            self.emit(MeshEventKind::ActiveSpeakerChanged { session_id });
        }
    }

    async fn close(&mut self) {
        self.manager.close_all().await;
        self.manager.registry_mut().clear();
        if self.speaker.current().is_some() {
            self.emit(MeshEventKind::ActiveSpeakerChanged { session_id: None });
        }
        self.speaker.reset();
    }
}

async fn run(
    args: Args,
    mut cmd_rx: UnboundedReceiver<EventHandlerCmd>,
    cancel: CancellationToken,
) {
    let Args {
        room_id,
        config,
        link,
        transports,
        mut media_rx,
        ui_event_ch,
    } = args;
    let SignalingLink {
        outbound,
        mut inbound,
    } = link;

    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let manager = PeerSessionManager::new(
        transports,
        outbound.clone(),
        transport_tx,
        ui_event_ch.clone(),
        cancel.clone(),
    );
    let local = media_rx.borrow_and_update().clone();
    let announced = local.media_state();
    let mut room = Room::new(
        room_id.clone(),
        &config,
        outbound.clone(),
        manager,
        ui_event_ch.clone(),
        announced,
    );

    // no connections yet. this only records the tracks new connections start with
    if let Err(e) = room.manager.sync_tracks(&local).await {
        tracing::error!(%room_id, "failed to apply local media: {e}");
    }

    let join = OutboundSignal::JoinRoom {
        room_id: room_id.clone(),
        microphone_enabled: announced.microphone_enabled,
        camera_enabled: announced.camera_enabled,
    };
    if let Err(e) = outbound.send(join).await {
        tracing::error!(%room_id, "failed to join room: {e}");
        cancel.cancel();
        let _ = ui_event_ch.send(MeshEventKind::ConnectionLost { room_id });
        return;
    }

    let mut sample_interval = tokio::time::interval(config.speaker().sample_interval());
    sample_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let lost = loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%room_id, "leaving room");
                break false;
            }
            res = media_rx.changed() => {
                if res.is_err() {
                    tracing::debug!(%room_id, "local media controller is gone. quitting");
                    break false;
                }
                let snapshot = media_rx.borrow_and_update().clone();
                room.apply_local_media(snapshot).await
            }
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        tracing::debug!(%room_id, "mesh handler cmd_rx channel is closed. quitting");
                        break false;
                    }
                };
                match cmd {
                    EventHandlerCmd::GetParticipants { rsp } => {
                        let _ = rsp.send(room.manager.registry().participants());
                        Ok(())
                    }
                    EventHandlerCmd::GetActiveSpeaker { rsp } => {
                        let _ = rsp.send(room.speaker.current().cloned());
                        Ok(())
                    }
                    EventHandlerCmd::GetPeerStates { rsp } => {
                        let _ = rsp.send(room.manager.snapshot());
                        Ok(())
                    }
                    EventHandlerCmd::Flush { rsp } => {
                        let snapshot = media_rx.borrow_and_update().clone();
                        let r = room.apply_local_media(snapshot).await;
                        let cancelled = matches!(r, Err(Error::Cancelled));
                        let _ = rsp.send(r);
                        if cancelled {
                            Err(Error::Cancelled)
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            opt = inbound.next() => {
                match opt {
                    Some(signal) => {
                        tracing::trace!(%room_id, "received {signal}");
                        room.handle_signal(signal).await
                    }
                    None => {
                        tracing::warn!(%room_id, "signaling channel closed");
                        break true;
                    }
                }
            }
            Some(event) = transport_rx.recv() => {
                room.handle_transport_event(event).await
            }
            _ = sample_interval.tick() => {
                room.sample_speaker();
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => break false,
            Err(e) => tracing::error!(%room_id, "mesh event handler error: {e}"),
        }
    };

    room.close().await;
    cancel.cancel();
    if lost {
        let _ = ui_event_ch.send(MeshEventKind::ConnectionLost {
            room_id: room_id.clone(),
        });
    }
    tracing::debug!(%room_id, "mesh event handler finished");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        host_media::{codec_for, LocalTrack},
        simple_webrtc::{
            loopback::LoopbackTransportFactory, ConnectionId, ConnectivityState, PeerTransport,
        },
    };
    use async_trait::async_trait;
    use consult::mesh::{signal::SessionDescription, TrackKind};

    struct Capture(UnboundedSender<OutboundSignal>);

    #[async_trait]
    impl SignalingChannel for Capture {
        async fn send(&self, signal: OutboundSignal) -> Result<(), Error> {
            self.0
                .send(signal)
                .map_err(|e| Error::FailedToSendSignal(e.to_string()))
        }
    }

    struct Harness {
        room: Room,
        factory: LoopbackTransportFactory,
        signals: UnboundedReceiver<OutboundSignal>,
        transport_rx: UnboundedReceiver<TransportEvent>,
        ui: broadcast::Receiver<MeshEventKind>,
    }

    impl Harness {
        fn new() -> Self {
            let factory = LoopbackTransportFactory::new();
            let (sig_tx, signals) = mpsc::unbounded_channel();
            let (transport_tx, transport_rx) = mpsc::unbounded_channel();
            let (ui_tx, ui) = broadcast::channel(64);
            let signaling: Arc<dyn SignalingChannel> = Arc::new(Capture(sig_tx));
            let manager = PeerSessionManager::new(
                Arc::new(factory.clone()),
                signaling.clone(),
                transport_tx,
                ui_tx.clone(),
                CancellationToken::new(),
            );
            let room = Room::new(
                "ward-7".into(),
                &MeshConfig::testing(),
                signaling,
                manager,
                ui_tx,
                MediaState::default(),
            );
            Self {
                room,
                factory,
                signals,
                transport_rx,
                ui,
            }
        }

        fn take_offer(&mut self) -> Option<SessionDescription> {
            while let Ok(signal) = self.signals.try_recv() {
                if let OutboundSignal::Offer { sdp_offer, .. } = signal {
                    return Some(sdp_offer);
                }
            }
            None
        }

        async fn pump_transport(&mut self) -> anyhow::Result<()> {
            while let Ok(event) = self.transport_rx.try_recv() {
                self.room.handle_transport_event(event).await?;
            }
            Ok(())
        }

        fn ui_events(&mut self) -> Vec<MeshEventKind> {
            let mut out = vec![];
            while let Ok(event) = self.ui.try_recv() {
                out.push(event);
            }
            out
        }
    }

    /// joins as s-a, connects to an unmuted s-b that sends audio and makes s-b the speaker
    async fn speaking_remote() -> anyhow::Result<Harness> {
        let mut h = Harness::new();
        h.room
            .handle_signal(InboundSignal::SelfInfo {
                participant: ParticipantInfo::new("s-a", "Dr. Local"),
            })
            .await?;
        let mut remote = ParticipantInfo::new("s-b", "Dr. Remote");
        remote.media = Some(MediaState::new(true, false));
        h.room
            .handle_signal(InboundSignal::ExistingParticipants {
                participants: vec![remote],
            })
            .await?;
        let offer = h.take_offer().expect("offer to s-b");

        let remote_side = LoopbackTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = remote_side
            .create(&"s-a".into(), ConnectionId::new(1), tx)
            .await?;
        transport
            .add_sender(Arc::new(LocalTrack::new(
                TrackKind::Audio,
                None,
                codec_for(TrackKind::Audio),
            )))
            .await?;
        let answer = transport.accept_offer(offer).await?;
        h.room
            .handle_signal(InboundSignal::AnswerReceived {
                sdp_answer: answer,
                from_session_id: "s-b".into(),
            })
            .await?;
        h.pump_transport().await?;

        let sources = h.room.manager.registry().audio_sources();
        assert_eq!(sources.len(), 1);
        sources[0].1.push_samples(&[0.5; 16]);
        h.room.sample_speaker();
        assert_eq!(h.room.speaker.current(), Some(&"s-b".into()));
        h.ui_events();
        Ok(h)
    }

    #[tokio::test]
    async fn failed_connection_is_never_the_active_speaker() -> anyhow::Result<()> {
        let mut h = speaking_remote().await?;
        h.factory
            .transport_for(&"s-b".into())
            .unwrap()
            .report(ConnectivityState::Failed);
        h.pump_transport().await?;

        // cleared before any sampling pass runs
        assert_eq!(h.room.speaker.current(), None);
        assert!(!h.room.speaker.is_measuring(&"s-b".into()));
        let participant = h.room.manager.registry().get(&"s-b".into()).unwrap();
        assert!(!participant.has_stream);
        assert!(h
            .ui_events()
            .contains(&MeshEventKind::ActiveSpeakerChanged { session_id: None }));
        Ok(())
    }

    #[tokio::test]
    async fn remote_mute_clears_the_active_speaker() -> anyhow::Result<()> {
        let mut h = speaking_remote().await?;
        h.room
            .handle_signal(InboundSignal::media_status_changed(
                "s-b",
                MediaState::new(false, false),
            ))
            .await?;
        assert_eq!(h.room.speaker.current(), None);
        assert_eq!(
            h.ui_events(),
            vec![
                MeshEventKind::ParticipantMediaChanged {
                    session_id: "s-b".into(),
                    media: MediaState::new(false, false),
                },
                MeshEventKind::ActiveSpeakerChanged { session_id: None },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn departure_does_not_leave_the_session_closed() -> anyhow::Result<()> {
        let mut h = speaking_remote().await?;
        h.room
            .handle_signal(InboundSignal::ParticipantLeft {
                session_id: "s-b".into(),
            })
            .await?;
        assert!(!h.room.manager.contains(&"s-b".into()));
        assert!(!h.room.manager.is_closed(&"s-b".into()));
        assert!(!h.room.manager.registry().contains(&"s-b".into()));
        assert_eq!(h.room.speaker.current(), None);
        Ok(())
    }
}
