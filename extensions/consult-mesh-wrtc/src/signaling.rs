//! The boundary to the signaling relay.
//!
//! A `SignalingLink` is one ordered, bidirectional connection to the relay for one room. The
//! inbound stream ending means the channel is gone. The relay itself lives outside this crate;
//! hosts bridge their socket of choice through `channel()`, which hands back both ends.

use std::sync::Arc;

use async_trait::async_trait;
use consult::{
    error::Error,
    mesh::{
        signal::{InboundSignal, OutboundSignal},
        RoomId,
    },
};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<(), Error>;
}

pub struct SignalingLink {
    pub outbound: Arc<dyn SignalingChannel>,
    pub inbound: BoxStream<'static, InboundSignal>,
}

/// Opens a link to the relay when a room is joined
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, room_id: &RoomId) -> Result<SignalingLink, Error>;
}

struct ChannelSender {
    tx: mpsc::UnboundedSender<OutboundSignal>,
}

#[async_trait]
impl SignalingChannel for ChannelSender {
    async fn send(&self, signal: OutboundSignal) -> Result<(), Error> {
        self.tx
            .send(signal)
            .map_err(|e| Error::FailedToSendSignal(e.0.to_string()))
    }
}

/// The relay side of an in-process link
pub struct RelayEnd {
    outbound: mpsc::UnboundedReceiver<OutboundSignal>,
    inbound: mpsc::UnboundedSender<InboundSignal>,
}

impl RelayEnd {
    /// next signal sent by the mesh. None once the mesh dropped its link
    pub async fn recv(&mut self) -> Option<OutboundSignal> {
        self.outbound.recv().await
    }

    pub fn send(&self, signal: InboundSignal) -> Result<(), Error> {
        self.inbound
            .send(signal)
            .map_err(|_| Error::SignalingChannelClosed)
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<OutboundSignal>,
        mpsc::UnboundedSender<InboundSignal>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// creates an in-process link. dropping the `RelayEnd` (or its inbound sender) disconnects the mesh
pub fn channel() -> (SignalingLink, RelayEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<InboundSignal>();

    let inbound = async_stream::stream! {
        while let Some(signal) = in_rx.recv().await {
            yield signal;
        }
    };

    let link = SignalingLink {
        outbound: Arc::new(ChannelSender { tx: out_tx }),
        inbound: Box::pin(inbound),
    };
    let relay = RelayEnd {
        outbound: out_rx,
        inbound: in_tx,
    };
    (link, relay)
}
