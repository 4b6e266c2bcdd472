#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{
        signal::{InboundSignal, OutboundSignal},
        MediaState, Mesh, MeshEventKind, MeshEventStream, ParticipantInfo, RoomId, SessionId,
        TrackKind,
    },
};
use consult_mesh_wrtc::{
    host_media::HostDevices,
    peer_session::PeerSnapshot,
    signaling::{self, SignalingConnector, SignalingLink},
    simple_webrtc::{loopback::LoopbackTransportFactory, ConnectivityState},
    MeshConfig, MeshImpl, OfferPolicy,
};
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn timeout<F>(duration: Duration, fut: F) -> anyhow::Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(anyhow::Error::from)
}

struct Member {
    room_id: RoomId,
    info: ParticipantInfo,
    tx: mpsc::UnboundedSender<InboundSignal>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    members: IndexMap<SessionId, Member>,
    log: Vec<(SessionId, OutboundSignal)>,
}

impl RelayState {
    fn forward(&self, target: &SessionId, signal: InboundSignal) {
        if let Some(member) = self.members.get(target) {
            let _ = member.tx.send(signal);
        }
    }

    fn broadcast(&self, room_id: &RoomId, except: &SessionId, signal: InboundSignal) {
        for (id, member) in &self.members {
            if id != except && &member.room_id == room_id {
                let _ = member.tx.send(signal.clone());
            }
        }
    }
}

/// An in-memory signaling relay. Session ids are handed out in connection order ("s-001",
/// "s-002", ...) so they sort the same way.
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, name: &str) -> Arc<dyn SignalingConnector> {
        Arc::new(RelayConnector {
            relay: self.clone(),
            name: name.to_string(),
        })
    }

    /// drops the relay's side of a member's link, as if its socket died
    pub fn disconnect(&self, session_id: &SessionId) {
        self.leave(session_id);
    }

    pub fn signals_from(&self, session_id: &SessionId) -> Vec<OutboundSignal> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(from, _)| from == session_id)
            .map(|(_, signal)| signal.clone())
            .collect()
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<SessionId> {
        self.state
            .lock()
            .members
            .iter()
            .filter(|(_, m)| &m.room_id == room_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn allocate(&self) -> SessionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        SessionId::new(format!("s-{:03}", state.next_id))
    }

    fn leave(&self, session_id: &SessionId) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.shift_remove(session_id) {
            state.broadcast(
                &member.room_id,
                session_id,
                InboundSignal::ParticipantLeft {
                    session_id: session_id.clone(),
                },
            );
        }
    }

    fn handle(
        &self,
        from: &SessionId,
        name: &str,
        pending: &mut Option<mpsc::UnboundedSender<InboundSignal>>,
        signal: OutboundSignal,
    ) {
        let mut state = self.state.lock();
        state.log.push((from.clone(), signal.clone()));
        match signal {
            OutboundSignal::JoinRoom {
                room_id,
                microphone_enabled,
                camera_enabled,
            } => {
                let Some(tx) = pending.take() else {
                    return;
                };
                let mut info = ParticipantInfo::new(from.clone(), name);
                info.role = Some("physician".into());
                info.media = Some(MediaState::new(microphone_enabled, camera_enabled));

                let others: Vec<ParticipantInfo> = state
                    .members
                    .values()
                    .filter(|m| m.room_id == room_id)
                    .map(|m| m.info.clone())
                    .collect();
                state.broadcast(
                    &room_id,
                    from,
                    InboundSignal::ParticipantJoined {
                        participant: info.clone(),
                    },
                );
                let _ = tx.send(InboundSignal::SelfInfo {
                    participant: info.clone(),
                });
                let _ = tx.send(InboundSignal::ExistingParticipants {
                    participants: others,
                });
                state
                    .members
                    .insert(from.clone(), Member { room_id, info, tx });
            }
            OutboundSignal::Offer {
                sdp_offer,
                target_session_id,
            } => state.forward(
                &target_session_id,
                InboundSignal::OfferReceived {
                    sdp_offer,
                    from_session_id: from.clone(),
                },
            ),
            OutboundSignal::Answer {
                sdp_answer,
                target_session_id,
            } => state.forward(
                &target_session_id,
                InboundSignal::AnswerReceived {
                    sdp_answer,
                    from_session_id: from.clone(),
                },
            ),
            OutboundSignal::IceCandidate {
                candidate,
                target_session_id,
            } => state.forward(
                &target_session_id,
                InboundSignal::IceCandidateReceived {
                    candidate,
                    from_session_id: from.clone(),
                },
            ),
            OutboundSignal::MediaStatusChange {
                room_id,
                microphone_enabled,
                camera_enabled,
            } => {
                let media = MediaState::new(microphone_enabled, camera_enabled);
                if let Some(member) = state.members.get_mut(from) {
                    member.info.media = Some(media);
                }
                state.broadcast(
                    &room_id,
                    from,
                    InboundSignal::media_status_changed(from.clone(), media),
                );
            }
        }
    }
}

struct RelayConnector {
    relay: Relay,
    name: String,
}

#[async_trait]
impl SignalingConnector for RelayConnector {
    async fn connect(&self, _room_id: &RoomId) -> Result<SignalingLink, Error> {
        let (link, end) = signaling::channel();
        let (mut outbound, inbound) = end.into_parts();
        let session_id = self.relay.allocate();
        let relay = self.relay.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut pending = Some(inbound);
            while let Some(signal) = outbound.recv().await {
                relay.handle(&session_id, &name, &mut pending, signal);
            }
            relay.leave(&session_id);
        });
        Ok(link)
    }
}

pub struct Node {
    pub mesh: MeshImpl,
    pub devices: Arc<HostDevices>,
    pub transports: LoopbackTransportFactory,
    pub events: MeshEventStream,
}

pub async fn create_node(relay: &Relay, name: &str, policy: OfferPolicy) -> anyhow::Result<Node> {
    let devices = Arc::new(HostDevices::new());
    devices.add_device(TrackKind::Video, "cam-1", "Built-in camera");
    devices.add_device(TrackKind::Video, "cam-2", "USB camera");
    devices.add_device(TrackKind::Audio, "mic-1", "Headset");
    let transports = LoopbackTransportFactory::new();

    let mut config = MeshConfig::testing();
    *config.offer_policy_mut() = policy;
    let mut mesh = MeshImpl::new(
        config,
        devices.clone(),
        Arc::new(transports.clone()),
        relay.connector(name),
    );
    let events = mesh.get_event_stream().await?;
    Ok(Node {
        mesh,
        devices,
        transports,
        events,
    })
}

impl Node {
    /// joins `room_id` and waits for the relay to assign our session id
    pub async fn join(&mut self, room_id: &str) -> anyhow::Result<SessionId> {
        self.mesh.join_room(room_id.into()).await?;
        self.wait_for_event(|event| matches!(event, MeshEventKind::SelfJoined { .. }))
            .await
            .and_then(|event| match event {
                MeshEventKind::SelfJoined { session_id } => Ok(session_id),
                other => anyhow::bail!("unexpected event {other:?}"),
            })
    }

    pub async fn wait_for_event<F>(&mut self, mut matches: F) -> anyhow::Result<MeshEventKind>
    where
        F: FnMut(&MeshEventKind) -> bool,
    {
        let events = &mut self.events;
        timeout(TIMEOUT, async {
            loop {
                match events.next().await {
                    Some(event) if matches(&event) => break Ok(event),
                    Some(_) => continue,
                    None => break Err(anyhow::anyhow!("event stream closed")),
                }
            }
        })
        .await?
    }

    /// waits until exactly `expected` connections are stable and connected
    pub async fn wait_for_peers(&self, expected: usize) -> anyhow::Result<Vec<PeerSnapshot>> {
        timeout(TIMEOUT, async {
            loop {
                if let Ok(states) = self.mesh.peer_states().await {
                    let ready = states.iter().all(|s| {
                        s.is_stable()
                            && !s.negotiating
                            && s.connectivity == ConnectivityState::Connected
                    });
                    if states.len() == expected && ready {
                        break states;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    pub async fn wait_for_participants(&self, expected: usize) -> anyhow::Result<()> {
        timeout(TIMEOUT, async {
            loop {
                if let Ok(participants) = self.mesh.get_participants().await {
                    if participants.len() == expected {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }
}
