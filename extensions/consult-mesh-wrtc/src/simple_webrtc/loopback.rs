//! An in-memory transport. Session descriptions are synthetic: one `m=` section per sender, each
//! with an `a=msid` line naming the local stream and track. Applying the remote description
//! announces the remote side's tracks and reports the connection as connected. No packets flow;
//! the host (or a test) feeds remote level taps directly.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{
        signal::{IceCandidate, SdpType, SessionDescription},
        SessionId, TrackKind,
    },
};
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{
    ConnectionId, ConnectivityState, PeerTransport, RemoteTrack, SenderId, TransportEvent,
    TransportEventKind, TransportEventSender, TransportFactory,
};
use crate::host_media::{LocalTrack, LOCAL_STREAM_ID};

#[derive(Default)]
struct FactoryState {
    transports: Vec<Arc<LoopbackTransport>>,
    fail_negotiation: bool,
    stall_negotiation: bool,
}

/// Creates `LoopbackTransport`s and remembers them so callers can inspect or poke a connection
#[derive(Clone, Default)]
pub struct LoopbackTransportFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl LoopbackTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// the most recent connection created for `remote`
    pub fn transport_for(&self, remote: &SessionId) -> Option<Arc<LoopbackTransport>> {
        self.state
            .lock()
            .transports
            .iter()
            .rev()
            .find(|t| &t.session_id == remote)
            .cloned()
    }

    /// every connection created so far, closed ones included
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.state.lock().transports.clone()
    }

    /// connections created from now on fail to produce offers and answers
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.state.lock().fail_negotiation = fail;
    }

    /// connections created from now on never finish producing offers and answers
    pub fn set_stall_negotiation(&self, stall: bool) {
        self.state.lock().stall_negotiation = stall;
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create(
        &self,
        remote: &SessionId,
        connection_id: ConnectionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        let mut state = self.state.lock();
        let transport = Arc::new(LoopbackTransport {
            session_id: remote.clone(),
            connection_id,
            events,
            fail_negotiation: state.fail_negotiation,
            stall_negotiation: state.stall_negotiation,
            next_sender: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        });
        state.transports.push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct Inner {
    senders: IndexMap<SenderId, Arc<LocalTrack>>,
    remote_candidates: Vec<IceCandidate>,
    remote_tracks: HashMap<String, Arc<RemoteTrack>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    version: u64,
    stable_local: Option<SessionDescription>,
    pending_offer: bool,
    gathered: bool,
    connected: bool,
    offers: usize,
    rollbacks: usize,
}

pub struct LoopbackTransport {
    session_id: SessionId,
    connection_id: ConnectionId,
    events: TransportEventSender,
    fail_negotiation: bool,
    stall_negotiation: bool,
    next_sender: AtomicU64,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl LoopbackTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn sender_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.inner.lock().senders.values().cloned().collect()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote_candidates.clone()
    }

    /// live tracks announced by the remote side
    pub fn remote_tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.inner
            .lock()
            .remote_tracks
            .values()
            .filter(|t| !t.is_stopped())
            .cloned()
            .collect()
    }

    pub fn offers_created(&self) -> usize {
        self.inner.lock().offers
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.lock().rollbacks
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote_description.clone()
    }

    /// reports a connectivity change as if ICE had produced it
    pub fn report(&self, state: ConnectivityState) {
        self.emit(TransportEventKind::Connectivity(state));
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            session_id: self.session_id.clone(),
            connection_id: self.connection_id,
            kind,
        });
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::TransportError(format!(
                "{} to {} is closed",
                self.connection_id, self.session_id
            )));
        }
        Ok(())
    }

    fn ensure_can_negotiate(&self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.fail_negotiation {
            return Err(Error::NegotiationFailed {
                session_id: self.session_id.clone(),
                reason: "loopback negotiation disabled".into(),
            });
        }
        Ok(())
    }

    async fn stall(&self) {
        if self.stall_negotiation {
            futures::future::pending::<()>().await;
        }
    }

    fn describe(&self, inner: &mut Inner) -> String {
        inner.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.connection_id, inner.version
        );
        for track in inner.senders.values() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {}\r\n",
                track.kind(),
                LOCAL_STREAM_ID,
                track.id()
            ));
        }
        sdp
    }

    /// the first local description starts gathering, which yields one host candidate
    fn gather(&self, inner: &mut Inner) {
        if inner.gathered {
            return;
        }
        inner.gathered = true;
        let port = 40000 + (self.connection_id.0 % 20000) as u16;
        self.emit(TransportEventKind::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn apply_remote(&self, inner: &mut Inner, desc: SessionDescription) -> Result<(), Error> {
        if !desc.sdp.starts_with("v=0") {
            return Err(Error::InvalidSessionDescription(
                "missing version line".into(),
            ));
        }
        let announced = parse_tracks(&desc.sdp);
        inner.remote_tracks.retain(|id, track| {
            let keep = announced.iter().any(|(_, _, t)| t == id);
            if !keep {
                track.stop();
            }
            keep
        });
        for (kind, stream_id, track_id) in announced {
            if inner.remote_tracks.contains_key(&track_id) {
                continue;
            }
            let track = Arc::new(RemoteTrack::new(track_id.clone(), kind));
            inner.remote_tracks.insert(track_id, track.clone());
            self.emit(TransportEventKind::RemoteTrack { stream_id, track });
        }
        inner.remote_description = Some(desc);
        if !inner.connected {
            inner.connected = true;
            self.emit(TransportEventKind::Connectivity(ConnectivityState::Checking));
            self.emit(TransportEventKind::Connectivity(ConnectivityState::Connected));
        }
        Ok(())
    }
}

fn parse_tracks(sdp: &str) -> Vec<(TrackKind, String, String)> {
    let mut tracks = vec![];
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            kind = match rest.split(' ').next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let Some(rest) = line.strip_prefix("a=msid:") {
            let mut parts = rest.split_whitespace();
            if let (Some(kind), Some(stream), Some(track)) = (kind, parts.next(), parts.next()) {
                tracks.push((kind, stream.to_string(), track.to_string()));
            }
        }
    }
    tracks
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.ensure_can_negotiate()?;
        self.stall().await;
        let mut inner = self.inner.lock();
        let offer = SessionDescription::offer(self.describe(&mut inner));
        inner.local_description = Some(offer.clone());
        inner.pending_offer = true;
        inner.offers += 1;
        self.gather(&mut inner);
        Ok(offer)
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, Error> {
        self.ensure_can_negotiate()?;
        self.stall().await;
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::InvalidSessionDescription(format!(
                "expected an offer, got an {}",
                offer.sdp_type
            )));
        }
        let mut inner = self.inner.lock();
        if inner.pending_offer {
            return Err(Error::TransportError(
                "remote offer received while a local offer is pending".into(),
            ));
        }
        self.apply_remote(&mut inner, offer)?;
        let answer = SessionDescription::answer(self.describe(&mut inner));
        inner.local_description = Some(answer.clone());
        inner.stable_local = Some(answer.clone());
        self.gather(&mut inner);
        Ok(answer)
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        if answer.sdp_type != SdpType::Answer {
            return Err(Error::InvalidSessionDescription(format!(
                "expected an answer, got an {}",
                answer.sdp_type
            )));
        }
        let mut inner = self.inner.lock();
        if !inner.pending_offer {
            return Err(Error::TransportError("no local offer to answer".into()));
        }
        self.apply_remote(&mut inner, answer)?;
        inner.pending_offer = false;
        inner.stable_local = inner.local_description.clone();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), Error> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        if inner.pending_offer {
            inner.pending_offer = false;
            inner.local_description = inner.stable_local.clone();
            inner.rollbacks += 1;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_sender(&self, track: Arc<LocalTrack>) -> Result<SenderId, Error> {
        self.ensure_open()?;
        let id = SenderId::new(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().senders.insert(id, track);
        Ok(id)
    }

    async fn replace_sender(&self, sender: SenderId, track: Arc<LocalTrack>) -> Result<(), Error> {
        self.ensure_open()?;
        match self.inner.lock().senders.get_mut(&sender) {
            Some(slot) => {
                *slot = track;
                Ok(())
            }
            None => Err(Error::OtherWithContext(format!("{sender} not found"))),
        }
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner
            .lock()
            .senders
            .shift_remove(&sender)
            .map(|_| ())
            .ok_or_else(|| Error::OtherWithContext(format!("{sender} not found")))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.senders.clear();
        for (_, track) in inner.remote_tracks.drain() {
            track.stop();
        }
        Ok(())
    }
}
