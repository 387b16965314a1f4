//! 5-band master equalizer with lock-free runtime gains.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::effects::Effector;

const CROSSOVERS: [f64; 4] = [200.0, 800.0, 2500.0, 8000.0];

/// Shared per-band gains, stored as f32 bit patterns so the UI thread
/// may write while the audio thread reads without locking.
#[derive(Clone, Debug)]
pub struct Eq5Gains(Arc<[AtomicU32; 5]>);

impl Eq5Gains {
    pub fn unity() -> Self {
        Self(Arc::new(std::array::from_fn(|_| {
            AtomicU32::new(1.0f32.to_bits())
        })))
    }

    /// Set the gain for band 0-4. 1.0 = unity, 2.0 = +6dB.
    pub fn set(&self, band: usize, gain: f32) {
        if band < 5 {
            self.0[band].store(gain.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn get(&self, band: usize) -> f32 {
        if band < 5 {
            f32::from_bits(self.0[band].load(Ordering::Relaxed))
        } else {
            1.0
        }
    }
}

/// Always-on master EQ. Bands split at 200/800/2500/8000 Hz using four
/// cascaded one-pole crossovers.
pub struct Eq5Band {
    gains: Eq5Gains,
    alphas: [f32; 4],
    lp_l: [f32; 4],
    lp_r: [f32; 4],
}

impl Eq5Band {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_gains(sample_rate, Eq5Gains::unity())
    }

    pub fn with_gains(sample_rate: u32, gains: Eq5Gains) -> Self {
        let dt = 1.0 / sample_rate as f64;
        let alphas = std::array::from_fn(|i| {
            let rc = 1.0 / (2.0 * PI * CROSSOVERS[i]);
            (dt / (rc + dt)) as f32
        });
        Self {
            gains,
            alphas,
            lp_l: [0.0; 4],
            lp_r: [0.0; 4],
        }
    }

    pub fn gains(&self) -> Eq5Gains {
        self.gains.clone()
    }
}

impl Effector for Eq5Band {
    fn process(&mut self, l: f32, r: f32) -> (f32, f32) {
        let mut band_l = [0.0f32; 5];
        let mut band_r = [0.0f32; 5];
        let (mut rem_l, mut rem_r) = (l, r);
        for i in 0..4 {
            self.lp_l[i] += self.alphas[i] * (rem_l - self.lp_l[i]);
            self.lp_r[i] += self.alphas[i] * (rem_r - self.lp_r[i]);
            band_l[i] = self.lp_l[i];
            band_r[i] = self.lp_r[i];
            rem_l -= band_l[i];
            rem_r -= band_r[i];
        }
        band_l[4] = rem_l;
        band_r[4] = rem_r;

        let (mut out_l, mut out_r) = (0.0, 0.0);
        for i in 0..5 {
            let g = self.gains.get(i);
            out_l += band_l[i] * g;
            out_r += band_r[i] * g;
        }
        (out_l, out_r)
    }

    fn reset(&mut self) {
        self.lp_l = [0.0; 4];
        self.lp_r = [0.0; 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_reconstruction_is_exact() {
        // The band split is subtractive, so unity gains must sum back
        // to the input to the last bit.
        let mut eq = Eq5Band::new(48000);
        for i in 0..1000 {
            let x = ((i % 17) as f32 - 8.0) / 10.0;
            let (l, r) = eq.process(x, -x);
            assert!((l - x).abs() < 1e-5);
            assert!((r + x).abs() < 1e-5);
        }
    }

    #[test]
    fn gains_are_shared_and_applied() {
        let mut eq = Eq5Band::new(48000);
        let gains = eq.gains();
        for band in 0..5 {
            gains.set(band, 0.0);
        }
        for _ in 0..100 {
            let (l, r) = eq.process(0.5, 0.5);
            assert_eq!((l, r), (0.0, 0.0));
        }
        assert_eq!(gains.get(2), 0.0);
    }

    #[test]
    fn out_of_range_band_reads_unity() {
        let gains = Eq5Gains::unity();
        assert_eq!(gains.get(9), 1.0);
    }
}
