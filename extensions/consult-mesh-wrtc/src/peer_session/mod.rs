//! Peer Session Manager: one `PeerConnectionEntry` per remote participant.
//!
//! The manager is driven by a single task per room, so every method runs to completion before the
//! next event is looked at. Offer/answer creation is awaited inline and is the only place the task
//! suspends while an entry is in flux; those awaits are abandoned when the room is cancelled.
//!
//! Glare: when an offer arrives while our own offer to the same session is unanswered, the side
//! whose session id sorts higher yields. A connection that never reached `Stable` is discarded and
//! the incoming offer is answered on a fresh one; an established connection rolls its offer back,
//! answers on the same connection and re-offers afterwards. The lower side ignores the incoming
//! offer and keeps waiting for its answer. Exactly one connection survives either way.

use std::{collections::HashSet, future::Future, sync::Arc};

use consult::{
    error::Error,
    mesh::{
        signal::{IceCandidate, OutboundSignal, SessionDescription},
        MeshEventKind, SessionId, TrackKind,
    },
};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    host_media::{LocalMediaSnapshot, LocalTrack},
    registry::{ParticipantRegistry, StreamRef},
    signaling::SignalingChannel,
    simple_webrtc::{
        ConnectionId, ConnectivityState, RemoteStream, TransportEvent, TransportEventKind,
        TransportEventSender, TransportFactory,
    },
};

mod entry;

pub use entry::{NegotiationRole, PeerConnectionEntry, PeerSnapshot, SignalingState};
use entry::SenderSlot;

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

pub struct PeerSessionManager {
    local_id: Option<SessionId>,
    registry: ParticipantRegistry,
    transports: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    transport_tx: TransportEventSender,
    ui_event_ch: broadcast::Sender<MeshEventKind>,
    cancel: CancellationToken,
    entries: IndexMap<SessionId, PeerConnectionEntry>,
    // sessions whose connection was closed. nothing is negotiated with them until they join again
    closed: HashSet<SessionId>,
    local_media: LocalMediaSnapshot,
    next_connection: u64,
}

impl PeerSessionManager {
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        transport_tx: TransportEventSender,
        ui_event_ch: broadcast::Sender<MeshEventKind>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_id: None,
            registry: ParticipantRegistry::new(),
            transports,
            signaling,
            transport_tx,
            ui_event_ch,
            cancel,
            entries: IndexMap::new(),
            closed: HashSet::new(),
            local_media: LocalMediaSnapshot::default(),
            next_connection: 0,
        }
    }

    pub fn set_local_id(&mut self, id: SessionId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&SessionId> {
        self.local_id.as_ref()
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ParticipantRegistry {
        &mut self.registry
    }

    pub fn local_media(&self) -> &LocalMediaSnapshot {
        &self.local_media
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&PeerConnectionEntry> {
        self.entries.get(session_id)
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.entries.values().map(|e| e.snapshot()).collect()
    }

    pub fn is_closed(&self, session_id: &SessionId) -> bool {
        self.closed.contains(session_id)
    }

    /// a new join notification for `session_id` lifts the closed state
    pub fn forget_closed(&mut self, session_id: &SessionId) {
        self.closed.remove(session_id);
    }

    fn emit(&self, event: MeshEventKind) {
        let _ = self.ui_event_ch.send(event);
    }

    fn is_local(&self, session_id: &SessionId) -> bool {
        self.local_id.as_ref() == Some(session_id)
    }

    /// true if we give up our own offer when both sides offered at once.
    /// without a known local id there is nothing to compare, so we yield
    fn yields_to(&self, remote: &SessionId) -> bool {
        match self.local_id.as_ref() {
            Some(local) => local > remote,
            None => true,
        }
    }

    async fn send(&self, signal: OutboundSignal) {
        let kind = signal.to_string();
        let target = signal.target().cloned();
        if let Err(e) = self.signaling.send(signal).await {
            tracing::warn!(?target, "failed to send {kind}: {e}");
        }
    }

    /// creates a connection to `remote` carrying every current local track
    async fn create_entry(&mut self, remote: &SessionId) -> Result<PeerConnectionEntry, Error> {
        self.next_connection += 1;
        let connection_id = ConnectionId::new(self.next_connection);
        let transport = self
            .transports
            .create(remote, connection_id, self.transport_tx.clone())
            .await?;
        let mut entry = PeerConnectionEntry::new(remote.clone(), transport.clone());

        // attach all media sources to the peer
        let tracks: Vec<Arc<LocalTrack>> = self
            .local_media
            .stream
            .iter()
            .flat_map(|s| s.tracks().cloned())
            .collect();
        for track in tracks {
            match transport.add_sender(track.clone()).await {
                Ok(id) => {
                    entry.senders.insert(
                        track.kind(),
                        SenderSlot {
                            id,
                            track_id: track.id().to_string(),
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(session_id = %remote, "failed to add {} track: {e}", track.kind());
                }
            }
        }
        tracing::debug!(session_id = %remote, %connection_id, "peer connection created");
        Ok(entry)
    }

    /// Bootstrap: we send the first offer. Does nothing if an entry already exists.
    pub async fn connect(&mut self, remote: &SessionId) -> Result<(), Error> {
        if self.is_local(remote) || self.entries.contains_key(remote) {
            return Ok(());
        }
        if self.closed.contains(remote) {
            tracing::debug!(session_id = %remote, "not connecting to a closed session");
            return Ok(());
        }
        let entry = self.create_entry(remote).await?;
        self.entries.insert(remote.clone(), entry);
        self.negotiate(remote).await
    }

    /// Sends an offer, or marks one as pending if a negotiation is already in progress
    async fn negotiate(&mut self, remote: &SessionId) -> Result<(), Error> {
        let Some(entry) = self.entries.get_mut(remote) else {
            return Ok(());
        };
        if entry.negotiating {
            tracing::debug!(session_id = %remote, "negotiation in progress. deferring");
            entry.renegotiate_pending = true;
            return Ok(());
        }
        entry.negotiating = true;
        entry.renegotiate_pending = false;
        let transport = entry.transport.clone();

        match cancellable(&self.cancel, transport.create_offer()).await {
            Ok(offer) => {
                if let Some(entry) = self.entries.get_mut(remote) {
                    entry.signaling = SignalingState::OfferSent;
                }
                self.send(OutboundSignal::Offer {
                    sdp_offer: offer,
                    target_session_id: remote.clone(),
                })
                .await;
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.fail(remote, e).await;
                Ok(())
            }
        }
    }

    /// releases the guard, then sends the deferred offer if one is owed
    async fn settle(&mut self, remote: &SessionId) -> Result<(), Error> {
        let Some(entry) = self.entries.get_mut(remote) else {
            return Ok(());
        };
        entry.signaling = SignalingState::Stable;
        entry.negotiating = false;
        entry.established = true;
        let pending = std::mem::take(&mut entry.renegotiate_pending);
        tracing::debug!(session_id = %remote, connection_id = %entry.connection_id(), "negotiation complete");
        if pending {
            self.negotiate(remote).await
        } else {
            Ok(())
        }
    }

    pub async fn handle_offer(
        &mut self,
        from: &SessionId,
        offer: SessionDescription,
    ) -> Result<(), Error> {
        if self.is_local(from) || self.closed.contains(from) || !self.registry.contains(from) {
            tracing::debug!(session_id = %from, "ignoring offer from unknown or closed session");
            return Ok(());
        }

        let current = self
            .entries
            .get(from)
            .map(|e| (e.signaling, e.established));
        match current {
            None => match self.create_entry(from).await {
                Ok(entry) => {
                    self.entries.insert(from.clone(), entry);
                }
                Err(e) => {
                    tracing::error!(session_id = %from, "failed to create peer connection: {e}");
                    return Ok(());
                }
            },
            Some((SignalingState::OfferSent, established)) => {
                if !self.yields_to(from) {
                    tracing::info!(session_id = %from, "glare: keeping our offer");
                    return Ok(());
                }
                tracing::info!(session_id = %from, "glare: yielding to the remote offer");
                if established {
                    self.yield_in_place(from).await?;
                } else if !self.yield_with_fresh_connection(from).await {
                    return Ok(());
                }
            }
            Some(_) => {}
        }

        self.answer(from, offer).await
    }

    async fn yield_in_place(&mut self, remote: &SessionId) -> Result<(), Error> {
        let Some(entry) = self.entries.get(remote) else {
            return Ok(());
        };
        let transport = entry.transport.clone();
        match cancellable(&self.cancel, transport.rollback()).await {
            Ok(()) => {
                if let Some(entry) = self.entries.get_mut(remote) {
                    entry.negotiating = false;
                    // our changes still need to reach the remote side
                    entry.renegotiate_pending = true;
                    entry.glare_resolutions += 1;
                }
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.fail(remote, e).await;
                Ok(())
            }
        }
    }

    /// returns false if the replacement could not be created
    async fn yield_with_fresh_connection(&mut self, remote: &SessionId) -> bool {
        let Some(old) = self.entries.shift_remove(remote) else {
            return false;
        };
        if let Err(e) = old.transport.close().await {
            tracing::warn!(session_id = %remote, "failed to close discarded connection: {e}");
        }
        if let Some(stream) = old.remote_stream.as_ref() {
            stream.stop();
        }
        match self.create_entry(remote).await {
            Ok(mut entry) => {
                entry.glare_resolutions = old.glare_resolutions + 1;
                self.entries.insert(remote.clone(), entry);
                true
            }
            Err(e) => {
                tracing::error!(session_id = %remote, "failed to replace connection after glare: {e}");
                self.discard(remote, old.remote_stream.is_some());
                false
            }
        }
    }

    async fn answer(&mut self, from: &SessionId, offer: SessionDescription) -> Result<(), Error> {
        let Some(entry) = self.entries.get_mut(from) else {
            return Ok(());
        };
        entry.negotiating = true;
        entry.signaling = SignalingState::AnswerPending;
        let transport = entry.transport.clone();

        match cancellable(&self.cancel, transport.accept_offer(offer)).await {
            Ok(answer) => {
                self.send(OutboundSignal::Answer {
                    sdp_answer: answer,
                    target_session_id: from.clone(),
                })
                .await;
                self.settle(from).await
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.fail(from, e).await;
                Ok(())
            }
        }
    }

    pub async fn handle_answer(
        &mut self,
        from: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), Error> {
        let Some(entry) = self.entries.get(from) else {
            tracing::debug!(session_id = %from, "ignoring answer: no connection");
            return Ok(());
        };
        if entry.signaling != SignalingState::OfferSent {
            tracing::debug!(session_id = %from, state = %entry.signaling, "ignoring unexpected answer");
            return Ok(());
        }
        let transport = entry.transport.clone();
        match cancellable(&self.cancel, transport.apply_answer(answer)).await {
            Ok(()) => self.settle(from).await,
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.fail(from, e).await;
                Ok(())
            }
        }
    }

    /// candidates for a connection that does not exist (yet) are dropped
    pub async fn handle_remote_candidate(
        &mut self,
        from: &SessionId,
        candidate: IceCandidate,
    ) -> Result<(), Error> {
        let Some(entry) = self.entries.get(from) else {
            tracing::trace!(session_id = %from, "dropping ice candidate: no connection");
            return Ok(());
        };
        let transport = entry.transport.clone();
        match cancellable(&self.cancel, transport.add_ice_candidate(candidate)).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::debug!(session_id = %from, "failed to add ice candidate: {e}");
                Ok(())
            }
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        let TransportEvent {
            session_id,
            connection_id,
            kind,
        } = event;

        let current = self.entries.get(&session_id).map(|e| e.connection_id());
        if current != Some(connection_id) {
            tracing::trace!(%session_id, %connection_id, "dropping {kind} from a discarded connection");
            if let TransportEventKind::RemoteTrack { track, .. } = kind {
                track.stop();
            }
            return Ok(());
        }

        match kind {
            TransportEventKind::IceCandidate(candidate) => {
                self.send(OutboundSignal::IceCandidate {
                    candidate,
                    target_session_id: session_id,
                })
                .await;
            }
            TransportEventKind::Connectivity(state) => {
                let Some(entry) = self.entries.get_mut(&session_id) else {
                    return Ok(());
                };
                entry.connectivity = state;
                match state {
                    ConnectivityState::Connected if !entry.announced_connected => {
                        entry.announced_connected = true;
                        tracing::info!(%session_id, %connection_id, "peer connected");
                        self.emit(MeshEventKind::PeerConnected { session_id });
                    }
                    state if state.is_terminal() => {
                        tracing::warn!(%session_id, %connection_id, "connectivity {state}. tearing down");
                        self.teardown(&session_id).await;
                    }
                    _ => {}
                }
            }
            TransportEventKind::RemoteTrack { stream_id, track } => {
                let Some(entry) = self.entries.get_mut(&session_id) else {
                    return Ok(());
                };
                tracing::debug!(%session_id, track = %track.id(), kind = %track.kind(), "remote track added");
                let stream = entry
                    .remote_stream
                    .get_or_insert_with(|| {
                        Arc::new(RemoteStream::new(session_id.clone(), stream_id))
                    })
                    .clone();
                stream.add_track(track);
                if self
                    .registry
                    .set_stream(&session_id, StreamRef::Remote(stream))
                {
                    self.emit(MeshEventKind::StreamAdded { session_id });
                }
            }
        }
        Ok(())
    }

    /// Track synchronization pass. For every live connection: add a sender for a new local
    /// track, swap the track of an existing sender in place, remove the sender of a track that
    /// is gone. Connections whose media sections changed renegotiate (or defer).
    pub async fn sync_tracks(&mut self, snapshot: &LocalMediaSnapshot) -> Result<(), Error> {
        self.local_media = snapshot.clone();
        let ids: Vec<SessionId> = self.entries.keys().cloned().collect();
        for id in ids {
            if !self.sync_entry(&id).await {
                continue;
            }
            let ready = self
                .entries
                .get(&id)
                .map(|e| e.signaling != SignalingState::Idle)
                .unwrap_or(false);
            if ready {
                self.negotiate(&id).await?;
            }
        }
        Ok(())
    }

    /// returns true if senders were added or removed
    async fn sync_entry(&mut self, id: &SessionId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        let transport = entry.transport.clone();
        let mut changed = false;

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let local = self.local_media.track(kind).cloned();
            let slot = entry.senders.get(&kind).cloned();
            match (local, slot) {
                (Some(track), None) => match transport.add_sender(track.clone()).await {
                    Ok(sender) => {
                        entry.senders.insert(
                            kind,
                            SenderSlot {
                                id: sender,
                                track_id: track.id().to_string(),
                            },
                        );
                        changed = true;
                    }
                    Err(e) => tracing::error!(session_id = %id, "failed to add {kind} sender: {e}"),
                },
                (Some(track), Some(slot)) if slot.track_id != track.id() => {
                    match transport.replace_sender(slot.id, track.clone()).await {
                        Ok(()) => {
                            entry.senders.insert(
                                kind,
                                SenderSlot {
                                    id: slot.id,
                                    track_id: track.id().to_string(),
                                },
                            );
                        }
                        Err(e) => {
                            tracing::error!(session_id = %id, "failed to replace {kind} sender: {e}")
                        }
                    }
                }
                (None, Some(slot)) => {
                    if let Err(e) = transport.remove_sender(slot.id).await {
                        tracing::error!(session_id = %id, "failed to remove {kind} sender: {e}");
                    }
                    entry.senders.remove(&kind);
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }

    async fn fail(&mut self, remote: &SessionId, e: Error) {
        tracing::error!(session_id = %remote, "negotiation failed: {e}");
        self.teardown(remote).await;
    }

    /// Closes the connection to `remote`, stops its stream and keeps the participant's metadata.
    /// The session stays closed until it joins again.
    pub async fn teardown(&mut self, remote: &SessionId) -> bool {
        let Some(mut entry) = self.entries.shift_remove(remote) else {
            return false;
        };
        entry.signaling = SignalingState::Closed;
        entry.negotiating = false;
        if let Err(e) = entry.transport.close().await {
            tracing::warn!(session_id = %remote, "failed to close peer connection: {e}");
        }
        let had_stream = match entry.remote_stream.take() {
            Some(stream) => {
                stream.stop();
                true
            }
            None => false,
        };
        self.discard(remote, had_stream);
        true
    }

    fn discard(&mut self, remote: &SessionId, had_stream: bool) {
        if self.registry.clear_stream(remote).is_some() || had_stream {
            self.emit(MeshEventKind::StreamRemoved {
                session_id: remote.clone(),
            });
        }
        self.closed.insert(remote.clone());
        tracing::info!(session_id = %remote, "peer connection closed");
        self.emit(MeshEventKind::PeerDisconnected {
            session_id: remote.clone(),
        });
    }

    /// tears down every connection. used when leaving the room or losing the relay
    pub async fn close_all(&mut self) {
        let ids: Vec<SessionId> = self.entries.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
        self.closed.clear();
    }
}
