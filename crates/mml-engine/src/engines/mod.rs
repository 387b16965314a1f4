//! Synthesis engines and the DSP helpers they share.

pub mod chiptune;
pub mod fm;
pub mod nesapu;
pub mod wavetable;

use std::f64::consts::PI;

pub(crate) const TWO_PI: f64 = PI * 2.0;

pub(crate) fn midi_to_freq(note: i32) -> f64 {
    440.0 * 2f64.powf((note - 69) as f64 / 12.0)
}

/// Unpack `program | module<<8 | channel<<16` as encoded by the
/// sequencer (the filter byte in bits 24.. is ignored here).
pub(crate) fn decode_program(encoded: i32) -> (i32, i32, i32) {
    let encoded = encoded.max(0);
    (encoded & 0xFF, (encoded >> 8) & 0xFF, (encoded >> 16) & 0xFF)
}

/// Equal-power pan gains for pan in -64..=64.
pub(crate) fn pan_gains(pan: f64) -> (f64, f64) {
    let angle = ((pan + 64.0) / 128.0) * (PI / 2.0);
    (angle.cos(), angle.sin())
}

/// Snap an envelope level onto `steps` discrete levels for the stepped
/// character of old volume registers.
pub(crate) fn quantize_level(v: f64, steps: i32) -> f64 {
    if steps <= 1 {
        return v.clamp(0.0, 1.0);
    }
    ((v * (steps - 1) as f64).round() / (steps - 1) as f64).clamp(0.0, 1.0)
}

/// Polynomial band-limited step correction for hard edges.
/// `t` is the phase in [0,1), `dt` the per-sample phase increment.
pub(crate) fn poly_blep(t: f64, dt: f64) -> f64 {
    if t < dt {
        let t = t / dt;
        t + t - t * t - 1.0
    } else if t > 1.0 - dt {
        let t = (t - 1.0) / dt;
        t * t + t + t + 1.0
    } else {
        0.0
    }
}

/// Resolve the pending note-on phase request into [0, 1):
/// 0 = reset, -1 = random, 1..=255 = fixed at `phase/128 * PI` radians.
pub(crate) fn unit_phase_for(next_phase: i32) -> f64 {
    match next_phase {
        -1 => rand::random::<f64>(),
        0 => 0.0,
        p => ((p as f64) / 128.0 * PI).rem_euclid(TWO_PI) / TWO_PI,
    }
}

// --- envelopes -----------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum EnvStage {
    #[default]
    Attack,
    Decay,
    Sustain,
    Release,
    Off,
}

/// Linear-segment ADSR. Rates are stage durations in seconds; sustain
/// is a 0..1 level.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Adsr {
    pub level: f64,
    pub stage: EnvStage,
}

impl Adsr {
    pub fn trigger() -> Self {
        Self {
            level: 0.0,
            stage: EnvStage::Attack,
        }
    }

    pub fn release(&mut self) {
        if self.stage != EnvStage::Release {
            self.stage = EnvStage::Release;
        }
    }

    pub fn is_off(&self) -> bool {
        self.stage == EnvStage::Off
    }

    /// Advance one sample and return the new level.
    pub fn advance(
        &mut self,
        sample_rate: f64,
        attack_sec: f64,
        decay_sec: f64,
        sustain_lvl: f64,
        release_sec: f64,
    ) -> f64 {
        match self.stage {
            EnvStage::Attack => {
                let mut step = 1.0 / (attack_sec * sample_rate);
                if step <= 0.0 {
                    step = 1.0;
                }
                self.level += step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvStage::Decay;
                }
            }
            EnvStage::Decay => {
                let mut step = (1.0 - sustain_lvl) / (decay_sec * sample_rate);
                if step <= 0.0 {
                    step = 1.0;
                }
                self.level -= step;
                if self.level <= sustain_lvl {
                    self.level = sustain_lvl;
                    self.stage = EnvStage::Sustain;
                }
            }
            EnvStage::Sustain => {}
            EnvStage::Release => {
                let mut step = sustain_lvl / (release_sec * sample_rate);
                if step <= 0.0 {
                    step = 1.0;
                }
                self.level -= step;
                if self.level <= 0.0001 {
                    self.level = 0.0;
                    self.stage = EnvStage::Off;
                }
            }
            EnvStage::Off => self.level = 0.0,
        }
        self.level
    }
}

// --- per-voice portamento ------------------------------------------------

/// Frequency glide applied frame by frame after note-on.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Glide {
    pub target: f64,
    pub frames: i32,
    pub step: f64,
}

impl Glide {
    /// Start frequency plus glide state for a note, consuming the
    /// engine-level pending portamento request.
    pub fn begin(target_freq: f64, from_note: i32, frames: i32) -> (f64, Glide) {
        if from_note >= 0 && frames > 0 {
            let start = midi_to_freq(from_note);
            (
                start,
                Glide {
                    target: target_freq,
                    frames,
                    step: (target_freq - start) / frames as f64,
                },
            )
        } else {
            (target_freq, Glide::default())
        }
    }

    /// Advance one frame, updating `freq` toward the target.
    pub fn advance(&mut self, freq: &mut f64) {
        if self.frames > 0 {
            self.frames -= 1;
            *freq += self.step;
            if self.frames <= 0 {
                *freq = self.target;
            }
        }
    }
}

// --- output filter -------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum FilterKind {
    #[default]
    LowPass,
    HighPass,
    BandPass,
}

impl FilterKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => FilterKind::BandPass,
            2 => FilterKind::HighPass,
            _ => FilterKind::LowPass,
        }
    }
}

/// One-pole stereo output filter with a bandpass second stage. The
/// filter LFO shifts the base cutoff, recomputing alpha per frame.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OutputFilter {
    sample_rate: f64,
    lpf_l: f64,
    lpf_r: f64,
    bpf_l: f64,
    bpf_r: f64,
    alpha: f64,
    base_cutoff: f64,
    kind: FilterKind,
}

impl OutputFilter {
    pub fn new(sample_rate: f64, cutoff_hz: f64) -> Self {
        let mut f = Self {
            sample_rate,
            ..Self::default()
        };
        if cutoff_hz > 0.0 && cutoff_hz < sample_rate / 2.0 {
            f.alpha = alpha_for(cutoff_hz, sample_rate);
            f.base_cutoff = cutoff_hz;
        }
        f
    }

    pub fn set_kind(&mut self, kind: FilterKind) {
        self.kind = kind;
    }

    /// Apply the filter to a stereo pair. `filter_mod` is the filter
    /// LFO sample in cutoff units.
    pub fn process(&mut self, mut l: f64, mut r: f64, filter_mod: f64) -> (f64, f64) {
        if self.base_cutoff > 0.0 && filter_mod != 0.0 {
            let cutoff = (self.base_cutoff + filter_mod * 100.0).clamp(20.0, self.sample_rate / 2.0);
            self.alpha = alpha_for(cutoff, self.sample_rate);
        }
        if self.alpha > 0.0 {
            self.lpf_l += self.alpha * (l - self.lpf_l);
            self.lpf_r += self.alpha * (r - self.lpf_r);
            match self.kind {
                FilterKind::LowPass => {
                    l = self.lpf_l;
                    r = self.lpf_r;
                }
                FilterKind::HighPass => {
                    l -= self.lpf_l;
                    r -= self.lpf_r;
                }
                FilterKind::BandPass => {
                    self.bpf_l += self.alpha * (self.lpf_l - self.bpf_l);
                    self.bpf_r += self.alpha * (self.lpf_r - self.bpf_r);
                    l = self.lpf_l - self.bpf_l;
                    r = self.lpf_r - self.bpf_r;
                }
            }
        }
        (l, r)
    }
}

fn alpha_for(cutoff_hz: f64, sample_rate: f64) -> f64 {
    let rc = 1.0 / (TWO_PI * cutoff_hz);
    let dt = 1.0 / sample_rate;
    dt / (rc + dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midi_reference_pitch() {
        assert!((midi_to_freq(69) - 440.0).abs() < 1e-9);
        assert!((midi_to_freq(57) - 220.0).abs() < 1e-9);
    }

    #[test]
    fn program_encoding_round_trips() {
        let encoded = 5 | (2 << 8) | (3 << 16);
        assert_eq!(decode_program(encoded), (5, 2, 3));
        assert_eq!(decode_program(-1), (0, 0, 0));
    }

    #[test]
    fn pan_gains_are_equal_power() {
        let (l, r) = pan_gains(0.0);
        assert!((l - r).abs() < 1e-9);
        let (l, r) = pan_gains(-64.0);
        assert!((l - 1.0).abs() < 1e-9);
        assert!(r.abs() < 1e-9);
    }

    #[test]
    fn quantize_snaps_to_steps() {
        assert_eq!(quantize_level(0.5, 2), 1.0);
        assert_eq!(quantize_level(0.26, 5), 0.25);
    }

    #[test]
    fn adsr_walks_through_stages() {
        let mut env = Adsr::trigger();
        let sr = 1000.0;
        for _ in 0..20 {
            env.advance(sr, 0.01, 0.01, 0.5, 0.01);
        }
        assert!(env.level <= 1.0);
        env.release();
        for _ in 0..1000 {
            env.advance(sr, 0.01, 0.01, 0.5, 0.01);
        }
        assert!(env.is_off());
    }

    #[test]
    fn glide_reaches_target() {
        let (mut freq, mut glide) = Glide::begin(440.0, 57, 10);
        assert!((freq - 220.0).abs() < 1e-9);
        for _ in 0..10 {
            glide.advance(&mut freq);
        }
        assert!((freq - 440.0).abs() < 1e-9);
    }

    #[test]
    fn poly_blep_is_zero_away_from_edges() {
        assert_eq!(poly_blep(0.5, 0.01), 0.0);
        assert!(poly_blep(0.001, 0.01) != 0.0);
    }
}
