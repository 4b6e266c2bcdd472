use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A STUN or TURN server handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Which side of a pair of participants sends the first offer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfferPolicy {
    /// the participant that joins last offers to everyone already present
    /// and waits for offers from anyone who joins after it
    #[default]
    Newcomer,
    /// participants already in the room offer to whoever joins.
    /// the newcomer answers
    Incumbent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// time between two sampling passes
    pub sample_interval_ms: u64,
    /// number of amplitude samples in the RMS window
    pub window: usize,
    /// weight of the previous smoothed value, in [0, 1)
    pub smoothing: f32,
    /// smoothed RMS at or below this value is silence
    pub silence_threshold: f32,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            // ~30 passes per second
            sample_interval_ms: 33,
            window: 480,
            smoothing: 0.8,
            silence_threshold: 0.02,
        }
    }
}

impl SpeakerConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    ice_servers: Vec<IceServer>,
    offer_policy: OfferPolicy,
    speaker: SpeakerConfig,
    event_capacity: usize,
}

impl MeshConfig {
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn offer_policy(&self) -> OfferPolicy {
        self.offer_policy
    }

    pub fn speaker(&self) -> &SpeakerConfig {
        &self.speaker
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }
}

impl MeshConfig {
    pub fn ice_servers_mut(&mut self) -> &mut Vec<IceServer> {
        &mut self.ice_servers
    }

    pub fn offer_policy_mut(&mut self) -> &mut OfferPolicy {
        &mut self.offer_policy
    }

    pub fn speaker_mut(&mut self) -> &mut SpeakerConfig {
        &mut self.speaker
    }

    pub fn event_capacity_mut(&mut self) -> &mut usize {
        &mut self.event_capacity
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(&[
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302",
                "stun:stun3.l.google.com:19302",
            ])],
            offer_policy: OfferPolicy::default(),
            speaker: SpeakerConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Default configuration for local development: no ICE servers, host candidates only
    pub fn development() -> MeshConfig {
        MeshConfig {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    /// Test configuration. No ICE servers and a fast, lightly smoothed speaker detector
    pub fn testing() -> MeshConfig {
        MeshConfig {
            ice_servers: vec![],
            speaker: SpeakerConfig {
                sample_interval_ms: 5,
                window: 16,
                smoothing: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parses a JSON document. missing fields take their default values
    pub fn from_json(json: &str) -> Result<MeshConfig, consult::error::Error> {
        Ok(serde_json::from_str(json)?)
    }
}
