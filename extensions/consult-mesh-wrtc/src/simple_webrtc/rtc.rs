//! webrtc-rs implementation of the transport seam

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{
        signal::{IceCandidate, SdpType, SessionDescription},
        SessionId, TrackKind,
    },
};
use parking_lot::Mutex;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiver,
    },
    sdp::extmap::AUDIO_LEVEL_URI,
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use super::{
    ConnectionId, ConnectivityState, PeerTransport, RemoteTrack, SenderId, TransportEvent,
    TransportEventKind, TransportEventSender, TransportFactory,
};
use crate::{config::MeshConfig, host_media::LocalTrack};

fn transport_err(e: webrtc::Error) -> Error {
    Error::TransportError(e.to_string())
}

pub struct RtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(config: &MeshConfig) -> Result<Self, Error> {
        let ice_servers = config
            .ice_servers()
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Ok(Self {
            api: Arc::new(create_api()?),
            ice_servers,
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        remote: &SessionId,
        connection_id: ConnectionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(transport_err)?,
        );

        let emitter = Emitter {
            session_id: remote.clone(),
            connection_id,
            tx: events,
        };

        // configure callbacks

        let tx = emitter.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => tx.emit(TransportEventKind::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => {
                        tracing::error!(session_id = %tx.session_id, "failed to serialize ice candidate: {e}")
                    }
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let tx = emitter.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                tracing::info!(
                    session_id = %tx.session_id,
                    connection_id = %tx.connection_id,
                    "ICE connection state changed: {state}"
                );
                let mapped = match state {
                    RTCIceConnectionState::New => Some(ConnectivityState::New),
                    RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        Some(ConnectivityState::Connected)
                    }
                    RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
                    RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
                    RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
                    RTCIceConnectionState::Unspecified => None,
                };
                if let Some(state) = mapped {
                    tx.emit(TransportEventKind::Connectivity(state));
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let tx = emitter.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return Box::pin(futures::future::ready(())),
                };
                let remote = Arc::new(RemoteTrack::new(track.id(), kind));
                let handle = tokio::spawn(read_remote_track(
                    track.clone(),
                    remote.clone(),
                    tx.session_id.clone(),
                ));
                remote.attach_reader(handle);
                tx.emit(TransportEventKind::RemoteTrack {
                    stream_id: track.stream_id(),
                    track: remote,
                });
                Box::pin(futures::future::ready(()))
            },
        ));

        Ok(Arc::new(RtcTransport {
            connection_id,
            session_id: remote.clone(),
            connection,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    session_id: SessionId,
    connection_id: ConnectionId,
    tx: TransportEventSender,
}

impl Emitter {
    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            session_id: self.session_id.clone(),
            connection_id: self.connection_id,
            kind,
        };
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(session_id = %self.session_id, "dropping transport event: {}", e.0.kind);
        }
    }
}

async fn read_remote_track(track: Arc<TrackRemote>, remote: Arc<RemoteTrack>, peer: SessionId) {
    let level_extension = track
        .params()
        .header_extensions
        .iter()
        .find(|ext| ext.uri == AUDIO_LEVEL_URI)
        .and_then(|ext| u8::try_from(ext.id).ok());
    if let Some(id) = level_extension {
        remote.set_audio_level_extension(id);
    }
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => remote.deliver(packet),
            Err(e) => {
                tracing::debug!(session_id = %peer, track = %remote.id(), "remote track reader terminated: {e}");
                break;
            }
        }
    }
}

struct RtpSenderHandle {
    sender: Arc<RTCRtpSender>,
    rtcp_reader: tokio::task::JoinHandle<()>,
}

impl Drop for RtpSenderHandle {
    fn drop(&mut self) {
        self.rtcp_reader.abort();
    }
}

pub struct RtcTransport {
    connection_id: ConnectionId,
    session_id: SessionId,
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, RtpSenderHandle>>,
    next_sender: AtomicU64,
    closed: AtomicBool,
}

impl RtcTransport {
    fn local_track(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        track.rtp_track()
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, Error> {
        self.senders
            .lock()
            .get(&id)
            .map(|h| h.sender.clone())
            .ok_or_else(|| Error::OtherWithContext(format!("{id} not found")))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(transport_err)?;
        // Sets the LocalDescription, and starts our UDP listeners
        // Note: this will start the gathering of ICE candidates
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(transport_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, Error> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::InvalidSessionDescription(format!(
                "expected an offer, got an {}",
                offer.sdp_type
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::InvalidSessionDescription(e.to_string()))?;
        self.connection
            .set_remote_description(remote)
            .await
            .map_err(transport_err)?;
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(transport_err)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(transport_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error> {
        if answer.sdp_type != SdpType::Answer {
            return Err(Error::InvalidSessionDescription(format!(
                "expected an answer, got an {}",
                answer.sdp_type
            )));
        }
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| Error::InvalidSessionDescription(e.to_string()))?;
        self.connection
            .set_remote_description(remote)
            .await
            .map_err(transport_err)
    }

    async fn rollback(&self) -> Result<(), Error> {
        let Some(pending) = self.connection.pending_local_description().await else {
            return Ok(());
        };
        // RTCSessionDescription has no public rollback constructor
        let rollback: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": "rollback",
            "sdp": pending.sdp,
        }))?;
        self.connection
            .set_local_description(rollback)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(transport_err)
    }

    async fn add_sender(&self, track: Arc<LocalTrack>) -> Result<SenderId, Error> {
        let sender = self
            .connection
            .add_track(Self::local_track(&track))
            .await
            .map_err(transport_err)?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let sender2 = sender.clone();
        let session_id = self.session_id.clone();
        let rtcp_reader = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
            tracing::trace!(%session_id, "terminating rtcp reader");
        });

        let id = SenderId::new(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(
            id,
            RtpSenderHandle {
                sender,
                rtcp_reader,
            },
        );
        Ok(id)
    }

    async fn replace_sender(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), Error> {
        let sender = self.sender(sender)?;
        sender
            .replace_track(Some(Self::local_track(&track)))
            .await
            .map_err(transport_err)
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<(), Error> {
        let handle = self
            .senders
            .lock()
            .remove(&sender)
            .ok_or_else(|| Error::OtherWithContext(format!("{sender} not found")))?;
        self.connection
            .remove_track(&handle.sender)
            .await
            .map_err(transport_err)
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let senders: Vec<_> = self.senders.lock().drain().map(|(_, h)| h).collect();
        for handle in senders {
            if let Err(e) = handle.sender.stop().await {
                tracing::warn!(session_id = %self.session_id, "failed to stop rtp sender: {e}");
            }
        }
        self.connection.close().await.map_err(transport_err)
    }
}

// todo: make the codec list configurable
fn create_api() -> Result<API> {
    let mut media = MediaEngine::default();

    media.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.into(),
        },
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverDirection::Sendrecv),
    )?;
    media.register_default_codecs()?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
