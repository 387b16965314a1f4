//! 3-band equalizer built from one-pole crossovers.

use std::f64::consts::PI;

use crate::effects::Effector;

pub struct Eq3Band {
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
    lp_alpha: f32,
    hp_alpha: f32,
    lp_l: f32,
    lp_r: f32,
    hp_l: f32,
    hp_r: f32,
}

impl Eq3Band {
    pub fn new(
        sample_rate: u32,
        low_gain: f32,
        mid_gain: f32,
        high_gain: f32,
        low_freq: f32,
        high_freq: f32,
    ) -> Self {
        let lp_rc = 1.0 / (2.0 * PI * low_freq as f64);
        let hp_rc = 1.0 / (2.0 * PI * high_freq as f64);
        let dt = 1.0 / sample_rate as f64;
        Self {
            low_gain,
            mid_gain,
            high_gain,
            lp_alpha: (dt / (lp_rc + dt)) as f32,
            hp_alpha: (dt / (hp_rc + dt)) as f32,
            lp_l: 0.0,
            lp_r: 0.0,
            hp_l: 0.0,
            hp_r: 0.0,
        }
    }
}

impl Effector for Eq3Band {
    fn process(&mut self, l: f32, r: f32) -> (f32, f32) {
        self.lp_l += self.lp_alpha * (l - self.lp_l);
        self.lp_r += self.lp_alpha * (r - self.lp_r);
        let (low_l, low_r) = (self.lp_l, self.lp_r);

        self.hp_l += self.hp_alpha * (l - self.hp_l);
        self.hp_r += self.hp_alpha * (r - self.hp_r);
        let high_l = l - self.hp_l;
        let high_r = r - self.hp_r;

        let mid_l = l - low_l - high_l;
        let mid_r = r - low_r - high_r;

        (
            low_l * self.low_gain + mid_l * self.mid_gain + high_l * self.high_gain,
            low_r * self.low_gain + mid_r * self.mid_gain + high_r * self.high_gain,
        )
    }

    fn reset(&mut self) {
        self.lp_l = 0.0;
        self.lp_r = 0.0;
        self.hp_l = 0.0;
        self.hp_r = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_gains_pass_dc_through() {
        let mut eq = Eq3Band::new(44100, 1.0, 1.0, 1.0, 300.0, 3000.0);
        for _ in 0..1000 {
            eq.process(0.5, 0.5);
        }
        let (l, r) = eq.process(0.5, 0.5);
        assert!((l - 0.5).abs() < 0.1);
        assert!((r - 0.5).abs() < 0.1);
    }
}
