/// calculates loudness using root mean square.
/// is basically a moving average filter. has a delay (in samples) equal to the window size
pub struct Calculator {
    buf: Vec<f32>,
    ss: f32,
    idx: usize,
    // equals 1/buf.len()
    normalizer: f32,
}

impl Calculator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            buf: vec![0.0; window],
            ss: 0.0,
            idx: 0,
            normalizer: 1.0 / window as f32,
        }
    }

    pub fn insert(&mut self, sample: f32) {
        let sq = sample * sample;
        self.ss += sq;
        self.ss -= self.buf[self.idx];
        self.buf[self.idx] = sq;
        self.idx = (self.idx + 1) % self.buf.len();
    }

    pub fn get_rms(&self) -> f32 {
        // the running sum can drift slightly below zero
        f32::sqrt(self.ss.max(0.0) * self.normalizer)
    }

    pub fn reset(&mut self) {
        self.buf.iter_mut().for_each(|x| *x = 0.0);
        self.ss = 0.0;
        self.idx = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rms_covers_the_window_only() {
        let mut calc = Calculator::new(4);
        for _ in 0..4 {
            calc.insert(0.5);
        }
        assert!((calc.get_rms() - 0.5).abs() < 1e-6);

        // the loud samples age out
        for _ in 0..4 {
            calc.insert(0.0);
        }
        assert!(calc.get_rms() < 1e-3);

        calc.insert(1.0);
        assert!((calc.get_rms() - 0.5).abs() < 1e-6);
        calc.reset();
        assert_eq!(calc.get_rms(), 0.0);
    }
}
