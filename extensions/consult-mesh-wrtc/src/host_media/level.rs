use std::collections::VecDeque;

use parking_lot::Mutex;

/// at 48kHz, 100ms of audio
const DEFAULT_CAPACITY: usize = 4800;

/// Amplitude samples waiting to be measured by the speaker detector.
///
/// Capture code (local) or the RTP reader (remote) pushes into the tap; the detector drains it
/// once per sampling pass. When nobody drains, the oldest samples are discarded.
pub struct LevelTap {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl Default for LevelTap {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelTap {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// PCM samples normalized to [-1.0, 1.0]
    pub fn push_samples(&self, samples: &[f32]) {
        let mut buf = self.samples.lock();
        for sample in samples {
            if buf.len() == self.capacity {
                buf.pop_front();
            }
            buf.push_back(*sample);
        }
    }

    /// an RFC 6464 audio level: 0 is 0 dBov (loudest), 127 is -127 dBov.
    /// only the low 7 bits are used; the high bit is the voice activity flag.
    pub fn push_level(&self, level: u8) {
        let dbov = -f32::from(level & 0x7F);
        self.push_samples(&[10f32.powf(dbov / 20.0)]);
    }

    pub fn drain(&self) -> Vec<f32> {
        self.samples.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}
