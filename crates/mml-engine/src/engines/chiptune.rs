//! Chiptune engine: polyBLEP pulses, triangle, and LFSR noise with a
//! step-quantised envelope and a DC blocker.

use crate::engines::{
    decode_program, midi_to_freq, pan_gains, poly_blep, quantize_level, unit_phase_for, Adsr,
    FilterKind, Glide, OutputFilter,
};
use crate::lfo::Lfo;
use crate::voice_engine::{MasterGain, VoiceEngine};

#[derive(Clone, Copy, Debug)]
pub struct ChiptuneParams {
    pub voices: usize,
    pub master_gain: f64,
    pub attack_sec: f64,
    pub decay_sec: f64,
    pub sustain_lvl: f64,
    pub release_sec: f64,
    /// Discrete envelope levels for the stepped chip character.
    pub step_levels: i32,
    pub pulse_duty_a: f64,
    pub pulse_duty_b: f64,
    pub velocity_amp: f64,
    pub lpf_cutoff: f64,
}

impl Default for ChiptuneParams {
    fn default() -> Self {
        Self {
            voices: 12,
            master_gain: 0.28,
            attack_sec: 0.005,
            decay_sec: 0.15,
            sustain_lvl: 0.65,
            release_sec: 0.20,
            step_levels: 16,
            pulse_duty_a: 0.125,
            pulse_duty_b: 0.25,
            velocity_amp: 0.85,
            lpf_cutoff: 12000.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum WaveType {
    #[default]
    PulseA,
    PulseB,
    Triangle,
    Noise,
}

#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    active: bool,
    id: i32,
    age: u32,
    wave: WaveType,
    freq: f64,
    phase: f64,
    velocity: f64,
    env: Adsr,
    pan: f64,
    noise_lfsr: u16,
    glide: Glide,
}

pub struct ChiptuneEngine {
    sample_rate: f64,
    params: ChiptuneParams,
    voices: Vec<Voice>,
    next_id: i32,
    master_gain: MasterGain,
    dc_prev_in_l: f64,
    dc_prev_out_l: f64,
    dc_prev_in_r: f64,
    dc_prev_out_r: f64,
    filter: OutputFilter,
    next_phase: i32,
    portamento_from: i32,
    portamento_frames: i32,
    pitch_lfo: Lfo,
    amp_lfo: Lfo,
    filter_lfo: Lfo,
}

impl ChiptuneEngine {
    pub fn new(sample_rate: u32, mut params: ChiptuneParams) -> Self {
        if params.voices == 0 {
            params.voices = 12;
        }
        if params.step_levels <= 1 {
            params.step_levels = 16;
        }
        let mut voices = vec![Voice::default(); params.voices];
        for (i, v) in voices.iter_mut().enumerate() {
            v.noise_lfsr = 0xACE1u16.wrapping_add((i as u16).wrapping_mul(97));
        }
        Self {
            sample_rate: sample_rate as f64,
            voices,
            next_id: 0,
            master_gain: MasterGain::new(params.master_gain),
            dc_prev_in_l: 0.0,
            dc_prev_out_l: 0.0,
            dc_prev_in_r: 0.0,
            dc_prev_out_r: 0.0,
            filter: OutputFilter::new(sample_rate as f64, params.lpf_cutoff),
            next_phase: 0,
            portamento_from: -1,
            portamento_frames: 0,
            pitch_lfo: Lfo::default(),
            amp_lfo: Lfo::default(),
            filter_lfo: Lfo::default(),
            params,
        }
    }

    pub fn master_gain(&self) -> MasterGain {
        self.master_gain.clone()
    }

    fn steal_voice(&self) -> usize {
        for (i, v) in self.voices.iter().enumerate() {
            if !v.active {
                return i;
            }
        }
        // Steal the oldest releasing voice, else the oldest overall.
        let mut oldest_release = None;
        let mut oldest_release_age = 0;
        let mut oldest_active = 0;
        let mut oldest_active_age = 0;
        for (i, v) in self.voices.iter().enumerate() {
            if v.env.stage == crate::engines::EnvStage::Release && v.age >= oldest_release_age {
                oldest_release = Some(i);
                oldest_release_age = v.age;
            }
            if v.age >= oldest_active_age {
                oldest_active = i;
                oldest_active_age = v.age;
            }
        }
        oldest_release.unwrap_or(oldest_active)
    }

    fn dc_block(prev_in: &mut f64, prev_out: &mut f64, x: f64) -> f64 {
        const R: f64 = 0.995;
        let y = x - *prev_in + R * *prev_out;
        *prev_in = x;
        *prev_out = y;
        y
    }
}

/// Deterministic waveform selection from program/module/channel.
/// Program ranges: 0-31 pulseA, 32-63 pulseB, 64-95 triangle, 96+
/// noise. Module 2 forces triangle, module 9 noise; channel parity
/// splits the pulse duties for low program numbers.
fn wave_for_program(program: i32, module: i32, channel: i32) -> WaveType {
    if module == 9 {
        return WaveType::Noise;
    }
    if module == 2 {
        return WaveType::Triangle;
    }
    if program >= 96 {
        return WaveType::Noise;
    }
    if program >= 64 {
        return WaveType::Triangle;
    }
    if program >= 32 {
        return WaveType::PulseB;
    }
    if channel % 2 == 1 {
        return WaveType::PulseB;
    }
    WaveType::PulseA
}

impl VoiceEngine for ChiptuneEngine {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, encoded_program: i32) -> i32 {
        let slot = self.steal_voice();
        let id = self.next_id;
        self.next_id += 1;
        let (program, module, channel) = decode_program(encoded_program);
        let target_freq = midi_to_freq(note);
        let (freq, glide) = Glide::begin(target_freq, self.portamento_from, self.portamento_frames);
        self.portamento_from = -1;
        self.portamento_frames = 0;
        let phase = unit_phase_for(self.next_phase);
        self.next_phase = 0;

        let v = &mut self.voices[slot];
        let lfsr = if v.noise_lfsr == 0 { 0xACE1 } else { v.noise_lfsr };
        *v = Voice {
            active: true,
            id,
            age: 0,
            wave: wave_for_program(program, module, channel),
            freq,
            phase,
            velocity: (velocity as f64 / 127.0).clamp(0.0, 1.0),
            env: Adsr::trigger(),
            pan: (pan as f64).clamp(-64.0, 64.0),
            noise_lfsr: lfsr,
            glide,
        };
        id
    }

    fn note_off(&mut self, id: i32) {
        for v in &mut self.voices {
            if v.active && v.id == id {
                v.env.release();
            }
        }
    }

    fn render_frame(&mut self) -> (f32, f32) {
        let pitch_mod = self.pitch_lfo.sample(self.sample_rate);
        let amp_mod = self.amp_lfo.sample(self.sample_rate);
        let filter_mod = self.filter_lfo.sample(self.sample_rate);
        let gain = self.master_gain.get();
        let freq_mul = if pitch_mod != 0.0 {
            2f64.powf(pitch_mod / 12.0)
        } else {
            1.0
        };

        let params = self.params;
        let sr = self.sample_rate;
        let (mut l, mut r) = (0.0, 0.0);
        for v in &mut self.voices {
            if !v.active {
                continue;
            }
            v.age += 1;
            let mut freq = v.freq;
            v.glide.advance(&mut freq);
            v.freq = freq;
            let env = v.env.advance(
                sr,
                params.attack_sec,
                params.decay_sec,
                params.sustain_lvl,
                params.release_sec,
            );
            if v.env.is_off() {
                v.active = false;
                continue;
            }
            let sample = render_wave(v, freq * freq_mul, sr, &params);
            let level = quantize_level(
                env * (0.15 + v.velocity * params.velocity_amp),
                params.step_levels,
            );
            let sig = sample * level * (1.0 + amp_mod);
            let (pl, pr) = pan_gains(v.pan);
            l += sig * pl * gain;
            r += sig * pr * gain;
        }

        let l = Self::dc_block(&mut self.dc_prev_in_l, &mut self.dc_prev_out_l, l);
        let r = Self::dc_block(&mut self.dc_prev_in_r, &mut self.dc_prev_out_r, r);
        let (l, r) = self.filter.process(l, r, filter_mod);
        (l.clamp(-1.0, 1.0) as f32, r.clamp(-1.0, 1.0) as f32)
    }

    fn set_master_gain(&mut self, gain: f64) {
        self.master_gain.set(gain);
    }

    fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn set_filter_type(&mut self, filter_type: i32) {
        self.filter.set_kind(FilterKind::from_code(filter_type));
    }

    fn set_note_on_phase(&mut self, phase: i32) {
        self.next_phase = phase;
    }

    fn set_portamento(&mut self, from_note: i32, frames: i32) {
        self.portamento_from = from_note;
        self.portamento_frames = frames;
    }

    fn set_pitch_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        self.pitch_lfo.set(depth, rate_hz, waveform);
    }

    fn set_amp_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        self.amp_lfo.set(depth, rate_hz, waveform);
    }

    fn set_filter_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        self.filter_lfo.set(depth, rate_hz, waveform);
    }
}

fn render_wave(v: &mut Voice, freq: f64, sample_rate: f64, params: &ChiptuneParams) -> f64 {
    let dt = freq / sample_rate;
    v.phase += dt;
    if v.phase >= 1.0 {
        v.phase -= 1.0;
    }
    match v.wave {
        WaveType::PulseA | WaveType::PulseB => {
            let duty = if v.wave == WaveType::PulseA {
                params.pulse_duty_a
            } else {
                params.pulse_duty_b
            };
            let mut out = if v.phase < duty { 1.0 } else { -1.0 };
            out += poly_blep(v.phase, dt);
            out -= poly_blep((v.phase - duty + 1.0).rem_euclid(1.0), dt);
            out
        }
        WaveType::Triangle => 2.0 * (2.0 * v.phase - 1.0).abs() - 1.0,
        WaveType::Noise => {
            if v.phase < dt {
                let bit = (v.noise_lfsr ^ (v.noise_lfsr >> 1)) & 1;
                v.noise_lfsr = (v.noise_lfsr >> 1) | (bit << 15);
            }
            if v.noise_lfsr & 1 == 1 {
                1.0
            } else {
                -1.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_generates_signal() {
        let mut e = ChiptuneEngine::new(48000, ChiptuneParams::default());
        let id = e.note_on(60, 100, 0, 0);
        assert!(id >= 0);
        let non_zero = (0..5000).any(|_| {
            let (l, r) = e.render_frame();
            l != 0.0 || r != 0.0
        });
        assert!(non_zero);
    }

    #[test]
    fn program_ranges_select_waveforms() {
        assert_eq!(wave_for_program(0, 0, 0), WaveType::PulseA);
        assert_eq!(wave_for_program(0, 0, 1), WaveType::PulseB);
        assert_eq!(wave_for_program(40, 0, 0), WaveType::PulseB);
        assert_eq!(wave_for_program(70, 0, 0), WaveType::Triangle);
        assert_eq!(wave_for_program(100, 0, 0), WaveType::Noise);
        assert_eq!(wave_for_program(0, 2, 0), WaveType::Triangle);
        assert_eq!(wave_for_program(0, 9, 0), WaveType::Noise);
    }

    #[test]
    fn output_stays_bounded_through_release() {
        let mut e = ChiptuneEngine::new(48000, ChiptuneParams::default());
        let id = e.note_on(60, 127, 0, 0);
        for _ in 0..2000 {
            e.render_frame();
        }
        e.note_off(id);
        for _ in 0..48000 {
            let (l, r) = e.render_frame();
            assert!(l.abs() <= 1.0 && r.abs() <= 1.0);
        }
        assert_eq!(e.active_voice_count(), 0);
    }

    #[test]
    fn voice_stealing_when_pool_is_full() {
        let mut e = ChiptuneEngine::new(
            48000,
            ChiptuneParams {
                voices: 2,
                ..ChiptuneParams::default()
            },
        );
        e.note_on(60, 100, 0, 0);
        e.note_on(64, 100, 0, 0);
        let id = e.note_on(67, 100, 0, 0);
        assert!(id >= 0);
        assert_eq!(e.active_voice_count(), 2);
    }
}
