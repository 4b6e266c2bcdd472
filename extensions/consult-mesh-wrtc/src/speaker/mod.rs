//! Active Speaker Detector.
//!
//! Called once per sampling pass with the level taps of every audio-bearing participant. Each tap
//! feeds a short-window RMS `Calculator`; the RMS is smoothed across passes. The loudest smoothed
//! value above the silence threshold is the active speaker. A tap that produced nothing since the
//! last pass decays toward silence.

use std::{collections::HashMap, sync::Arc};

use consult::mesh::SessionId;

use crate::{config::SpeakerConfig, host_media::LevelTap};

mod loudness;

pub use loudness::Calculator;

struct Meter {
    calc: Calculator,
    smoothed: f32,
}

pub struct ActiveSpeakerDetector {
    config: SpeakerConfig,
    meters: HashMap<SessionId, Meter>,
    current: Option<SessionId>,
}

impl ActiveSpeakerDetector {
    pub fn new(config: SpeakerConfig) -> Self {
        Self {
            config,
            meters: HashMap::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    /// smoothed level of a measured session
    pub fn level(&self, session_id: &SessionId) -> Option<f32> {
        self.meters.get(session_id).map(|m| m.smoothed)
    }

    pub fn is_measuring(&self, session_id: &SessionId) -> bool {
        self.meters.contains_key(session_id)
    }

    /// One sampling pass. Meters for sessions missing from `sources` are dropped.
    /// Returns `Some` with the new speaker only when it changed.
    pub fn tick(&mut self, sources: &[(SessionId, Arc<LevelTap>)]) -> Option<Option<SessionId>> {
        self.meters
            .retain(|id, _| sources.iter().any(|(source, _)| source == id));

        let smoothing = self.config.smoothing.clamp(0.0, 0.999);
        let window = self.config.window;
        for (id, tap) in sources {
            let meter = self.meters.entry(id.clone()).or_insert_with(|| Meter {
                calc: Calculator::new(window),
                smoothed: 0.0,
            });
            let samples = tap.drain();
            if samples.is_empty() {
                meter.smoothed *= smoothing;
                continue;
            }
            for sample in samples {
                meter.calc.insert(sample);
            }
            meter.smoothed = smoothing * meter.smoothed + (1.0 - smoothing) * meter.calc.get_rms();
        }

        let loudest = self
            .meters
            .iter()
            .filter(|(_, m)| m.smoothed > self.config.silence_threshold)
            // ties go to the lower session id
            .max_by(|(a_id, a), (b_id, b)| {
                a.smoothed
                    .total_cmp(&b.smoothed)
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone());

        if loudest == self.current {
            return None;
        }
        tracing::trace!(previous = ?self.current, current = ?loudest, "active speaker changed");
        self.current = loudest.clone();
        Some(loudest)
    }

    /// Drops the meter for a removed session. Returns true if it was the active speaker.
    pub fn forget(&mut self, session_id: &SessionId) -> bool {
        self.meters.remove(session_id);
        if self.current.as_ref() == Some(session_id) {
            self.current = None;
            return true;
        }
        false
    }

    /// Drops the meters of sessions `present` rejects, between sampling passes.
    /// Returns true if that cleared the active speaker.
    pub fn retain(&mut self, mut present: impl FnMut(&SessionId) -> bool) -> bool {
        self.meters.retain(|id, _| present(id));
        match self.current.as_ref() {
            Some(current) if !present(current) => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.meters.clear();
        self.current = None;
    }
}
