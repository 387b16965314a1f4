//! Global low-frequency oscillator.

pub const WAVE_SAW: i32 = 0;
pub const WAVE_SQUARE: i32 = 1;
pub const WAVE_TRIANGLE: i32 = 2;
pub const WAVE_RANDOM: i32 = 3;

/// A low-frequency oscillator producing per-sample modulation, shared
/// across all voices of an engine. Depth units depend on the target:
/// semitones for pitch, a 0..1 factor for amplitude, cutoff units for
/// the filter.
#[derive(Clone, Debug, Default)]
pub struct Lfo {
    depth: f64,
    rate_hz: f64,
    waveform: i32,
    phase: f64,
    /// Held value for sample-and-hold random.
    rand_val: f64,
}

impl Lfo {
    pub fn set(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        self.depth = depth;
        self.rate_hz = rate_hz;
        self.waveform = if (0..=3).contains(&waveform) {
            waveform
        } else {
            WAVE_TRIANGLE
        };
    }

    /// Advance by one sample and return a value in [-depth, +depth].
    /// Returns 0 while depth or rate is zero.
    pub fn sample(&mut self, sample_rate: f64) -> f64 {
        if self.depth == 0.0 || self.rate_hz == 0.0 || sample_rate == 0.0 {
            return 0.0;
        }

        let wave_val = match self.waveform {
            WAVE_SAW => 1.0 - 2.0 * self.phase,
            WAVE_SQUARE => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            WAVE_RANDOM => self.rand_val,
            _ => {
                if self.phase < 0.5 {
                    4.0 * self.phase - 1.0
                } else {
                    3.0 - 4.0 * self.phase
                }
            }
        };

        let old_phase = self.phase;
        self.phase += self.rate_hz / sample_rate;
        while self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        // Sample-and-hold: refresh the held value at each cycle start.
        // A sine hash keeps offline renders reproducible.
        if self.waveform == WAVE_RANDOM && self.phase < old_phase {
            let mut r = (self.phase * 12345.678_9 + self.rand_val * 67890.123_4).sin() * 2.0;
            r -= r.floor();
            self.rand_val = r * 2.0 - 1.0;
        }

        wave_val * self.depth
    }

    pub fn active(&self) -> bool {
        self.depth != 0.0 && self.rate_hz != 0.0
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.rand_val = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_basic_shape() {
        let mut l = Lfo::default();
        l.set(1.0, 1.0, WAVE_TRIANGLE);
        let sr = 100.0;
        let samples: Vec<f64> = (0..100).map(|_| l.sample(sr)).collect();
        assert!((samples[0] - (-1.0)).abs() < 0.05);
        assert!(samples[25].abs() < 0.05);
        assert!((samples[50] - 1.0).abs() < 0.05);
    }

    #[test]
    fn square_shape_scales_with_depth() {
        let mut l = Lfo::default();
        l.set(2.0, 1.0, WAVE_SQUARE);
        let sr = 100.0;
        assert!((l.sample(sr) - 2.0).abs() < 0.01);
        for _ in 1..50 {
            l.sample(sr);
        }
        assert!((l.sample(sr) - (-2.0)).abs() < 0.01);
    }

    #[test]
    fn saw_starts_at_peak() {
        let mut l = Lfo::default();
        l.set(1.0, 1.0, WAVE_SAW);
        assert!((l.sample(100.0) - 1.0).abs() < 0.05);
    }

    #[test]
    fn zero_depth_or_rate_is_silent() {
        let mut l = Lfo::default();
        l.set(0.0, 5.0, WAVE_TRIANGLE);
        assert_eq!(l.sample(44100.0), 0.0);
        l.set(1.0, 0.0, WAVE_TRIANGLE);
        assert_eq!(l.sample(44100.0), 0.0);
    }

    #[test]
    fn active_tracks_configuration() {
        let mut l = Lfo::default();
        assert!(!l.active());
        l.set(1.0, 5.0, WAVE_TRIANGLE);
        assert!(l.active());
        l.set(0.0, 5.0, WAVE_TRIANGLE);
        assert!(!l.active());
    }

    #[test]
    fn random_stays_within_depth() {
        let mut l = Lfo::default();
        l.set(1.0, 10.0, WAVE_RANDOM);
        for _ in 0..200 {
            let v = l.sample(1000.0);
            assert!(v.abs() <= 1.0);
        }
    }
}
