//! A Mesh implementation relying on webrtc-rs (hence the name consult-mesh-wrtc)
//!
//! `MeshImpl` implements `consult::mesh::Mesh`. It is built from a `MeshConfig`, the host's
//! capture devices (`MediaDevices`), a way to create peer connections (`TransportFactory`) and a
//! way to reach the signaling relay (`SignalingConnector`).
//!
//! Local media lives as long as the `MeshImpl`. Each joined room runs as one task that owns the
//! room's peer connections, participant registry and speaker detector; leaving the room (or losing
//! the relay) ends that task and tears the connections down.
//!

pub mod config;
pub mod host_media;
mod mesh_impl;
pub mod peer_session;
pub mod registry;
pub mod signaling;
pub mod simple_webrtc;
pub mod speaker;

pub use config::{IceServer, MeshConfig, OfferPolicy, SpeakerConfig};
pub use mesh_impl::MeshImpl;
