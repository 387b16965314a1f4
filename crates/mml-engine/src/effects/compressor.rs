//! Basic dynamic range compression with linear envelope followers.

use crate::effects::Effector;

pub struct Compressor {
    threshold: f32,
    ratio: f32,
    attack: f32,
    release: f32,
    makeup: f32,
    env_l: f32,
    env_r: f32,
}

impl Compressor {
    pub fn new(
        sample_rate: u32,
        threshold_db: f32,
        ratio: f32,
        attack_ms: f32,
        release_ms: f32,
        makeup_db: f32,
    ) -> Self {
        let sr = sample_rate as f64;
        Self {
            threshold: 10f32.powf(threshold_db / 20.0),
            ratio,
            attack: (1.0 - (-1.0 / (attack_ms as f64 * sr / 1000.0)).exp()) as f32,
            release: (1.0 - (-1.0 / (release_ms as f64 * sr / 1000.0)).exp()) as f32,
            makeup: 10f32.powf(makeup_db / 20.0),
            env_l: 0.0,
            env_r: 0.0,
        }
    }

    fn compute_gain(&self, env: f32) -> f32 {
        if env <= self.threshold || self.threshold <= 0.0 {
            return 1.0;
        }
        let over = env / self.threshold;
        over.powf(1.0 / self.ratio - 1.0)
    }
}

impl Effector for Compressor {
    fn process(&mut self, l: f32, r: f32) -> (f32, f32) {
        let abs_l = l.abs();
        let abs_r = r.abs();
        if abs_l > self.env_l {
            self.env_l += self.attack * (abs_l - self.env_l);
        } else {
            self.env_l += self.release * (abs_l - self.env_l);
        }
        if abs_r > self.env_r {
            self.env_r += self.attack * (abs_r - self.env_r);
        } else {
            self.env_r += self.release * (abs_r - self.env_r);
        }
        let gain_l = self.compute_gain(self.env_l);
        let gain_r = self.compute_gain(self.env_r);
        (l * gain_l * self.makeup, r * gain_r * self.makeup)
    }

    fn reset(&mut self) {
        self.env_l = 0.0;
        self.env_r = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_signal_is_attenuated() {
        let mut c = Compressor::new(44100, -10.0, 4.0, 1.0, 50.0, 0.0);
        let mut out = 0.0;
        for _ in 0..1000 {
            (out, _) = c.process(1.0, 1.0);
        }
        assert!(out < 1.0);
    }

    #[test]
    fn quiet_signal_passes_at_makeup_gain() {
        let mut c = Compressor::new(44100, -10.0, 4.0, 1.0, 50.0, 6.0);
        let makeup = 10f32.powf(6.0 / 20.0);
        let (l, _) = c.process(0.01, 0.01);
        assert!((l - 0.01 * makeup).abs() < 1e-4);
    }
}
