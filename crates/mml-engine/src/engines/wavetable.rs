//! Wavetable engine: 16 single-cycle slots with linear interpolation.
//!
//! `#WAVBn{hex}` bodies load slot `n`; pairs of hex digits become
//! signed 8-bit samples normalised to [-1, 1]. Slot 0 falls back to a
//! 64-sample sine when a program selects an empty slot.

use mml_ir::Definitions;

use crate::engines::{
    decode_program, midi_to_freq, pan_gains, Adsr, FilterKind, Glide, OutputFilter, TWO_PI,
};
use crate::lfo::Lfo;
use crate::voice_engine::{MasterGain, VoiceEngine};

const MAX_SLOTS: usize = 16;
const MAX_VOICES: usize = 16;

#[derive(Clone, Copy, Debug)]
pub struct WavetableParams {
    pub polyphony: usize,
    pub attack_sec: f64,
    pub decay_sec: f64,
    pub sustain_lvl: f64,
    pub release_sec: f64,
    pub master_gain: f64,
    pub velocity_amp: f64,
    pub lpf_cutoff: f64,
}

impl Default for WavetableParams {
    fn default() -> Self {
        Self {
            polyphony: MAX_VOICES,
            attack_sec: 0.005,
            decay_sec: 0.12,
            sustain_lvl: 0.75,
            release_sec: 0.2,
            master_gain: 0.42,
            velocity_amp: 0.8,
            lpf_cutoff: 12000.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    active: bool,
    id: i32,
    velocity: f64,
    freq: f64,
    /// Float index into the slot's table.
    phase: f64,
    env: Adsr,
    pan: f64,
    slot: usize,
    glide: Glide,
}

pub struct WavetableEngine {
    sample_rate: f64,
    params: WavetableParams,
    voices: Vec<Voice>,
    tables: [Vec<f64>; MAX_SLOTS],
    next_id: i32,
    master_gain: MasterGain,
    next_phase: i32,
    portamento_from: i32,
    portamento_frames: i32,
    filter: OutputFilter,
    pitch_lfo: Lfo,
    amp_lfo: Lfo,
    filter_lfo: Lfo,
}

impl WavetableEngine {
    pub fn new(sample_rate: u32, mut params: WavetableParams) -> Self {
        if params.polyphony == 0 || params.polyphony > MAX_VOICES {
            params.polyphony = MAX_VOICES;
        }
        let mut tables: [Vec<f64>; MAX_SLOTS] = Default::default();
        tables[0] = (0..64)
            .map(|i| (TWO_PI * i as f64 / 64.0).sin())
            .collect();
        Self {
            sample_rate: sample_rate as f64,
            voices: vec![Voice::default(); params.polyphony],
            tables,
            next_id: 0,
            master_gain: MasterGain::new(params.master_gain),
            next_phase: 0,
            portamento_from: -1,
            portamento_frames: 0,
            filter: OutputFilter::new(sample_rate as f64, params.lpf_cutoff),
            pitch_lfo: Lfo::default(),
            amp_lfo: Lfo::default(),
            filter_lfo: Lfo::default(),
            params,
        }
    }

    pub fn master_gain(&self) -> MasterGain {
        self.master_gain.clone()
    }

    /// Install a single-cycle waveform into slot 0-15.
    pub fn set_wavetable(&mut self, slot: usize, samples: &[f64]) {
        if slot < MAX_SLOTS {
            self.tables[slot] = samples.to_vec();
        }
    }

    /// Load every `#WAVBn{hex}` definition into its slot.
    pub fn load_wavb_definitions(&mut self, defs: &Definitions) {
        for (key, body) in defs {
            let upper = key.to_ascii_uppercase();
            let Some(slot_raw) = upper.strip_prefix("WAVB") else {
                continue;
            };
            let Ok(slot) = slot_raw.trim().parse::<usize>() else {
                continue;
            };
            if slot >= MAX_SLOTS {
                continue;
            }
            let Some(open) = body.find('{') else { continue };
            let Some(close) = body.find('}') else { continue };
            if close <= open {
                continue;
            }
            let samples = parse_wavb(body[open + 1..close].trim());
            if !samples.is_empty() {
                self.set_wavetable(slot, &samples);
            }
        }
    }

    fn steal_voice(&self) -> usize {
        for (i, v) in self.voices.iter().enumerate() {
            if !v.active {
                return i;
            }
        }
        let mut quiet = 0;
        let mut min_env = self.voices[0].env.level;
        for (i, v) in self.voices.iter().enumerate().skip(1) {
            if v.env.level < min_env {
                min_env = v.env.level;
                quiet = i;
            }
        }
        quiet
    }
}

/// Hex string (two digits per sample, signed 8-bit) to [-1, 1] floats.
pub fn parse_wavb(hex: &str) -> Vec<f64> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let (Some(hi), Some(lo)) = (hex_digit(pair[0]), hex_digit(pair[1])) else {
            return Vec::new();
        };
        let b = (hi << 4) | lo;
        out.push(b as i8 as f64 / 127.0);
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl VoiceEngine for WavetableEngine {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, encoded_program: i32) -> i32 {
        let slot = self.steal_voice();
        let id = self.next_id;
        self.next_id += 1;

        let (program, _, _) = decode_program(encoded_program);
        let mut table_slot = (program & 0x0F) as usize;
        if table_slot >= MAX_SLOTS || self.tables[table_slot].is_empty() {
            table_slot = 0;
        }
        let table_len = self.tables[table_slot].len() as f64;

        let target_freq = midi_to_freq(note);
        let (freq, glide) = Glide::begin(target_freq, self.portamento_from, self.portamento_frames);
        self.portamento_from = -1;
        self.portamento_frames = 0;

        let phase = match self.next_phase {
            -1 => rand::random::<f64>() * table_len,
            0 => 0.0,
            p => ((p as f64) / 128.0 * table_len / 2.0).rem_euclid(table_len),
        };
        self.next_phase = 0;

        self.voices[slot] = Voice {
            active: true,
            id,
            velocity: (velocity as f64 / 127.0).clamp(0.0, 1.0),
            freq,
            phase,
            env: Adsr::trigger(),
            pan: (pan as f64).clamp(-64.0, 64.0),
            slot: table_slot,
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
            let table = &self.tables[v.slot];
            if table.is_empty() {
                continue;
            }
            let table_len = table.len() as f64;

            let idx = v.phase.floor();
            let frac = v.phase - idx;
            let i0 = (idx as usize) % table.len();
            let i1 = (i0 + 1) % table.len();
            let mut sig = table[i0] * (1.0 - frac) + table[i1] * frac;

            sig *= env * gain * (0.2 + v.velocity * params.velocity_amp);
            sig *= 1.0 + amp_mod;

            let (pl, pr) = pan_gains(v.pan);
            l += sig * pl;
            r += sig * pr;

            let mut freq = v.freq;
            v.glide.advance(&mut freq);
            v.freq = freq;

            v.phase += freq * freq_mul * table_len / sr;
            while v.phase >= table_len {
                v.phase -= table_len;
            }
            while v.phase < 0.0 {
                v.phase += table_len;
            }
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sine_slot_generates_signal() {
        let mut e = WavetableEngine::new(48000, WavetableParams::default());
        let id = e.note_on(69, 100, 0, 0);
        assert!(id >= 0);
        let non_zero = (0..5000).any(|_| {
            let (l, r) = e.render_frame();
            l != 0.0 || r != 0.0
        });
        assert!(non_zero);
    }

    #[test]
    fn wavb_hex_decodes_signed_bytes() {
        let samples = parse_wavb("7f80");
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 1.0).abs() < 0.01);
        assert!(samples[1] < -1.0 + 0.02);
    }

    #[test]
    fn wavb_definitions_load_into_slots() {
        let mut defs = Definitions::new();
        defs.insert("WAVB3".into(), "WAVB3{7f00817f}".into());
        let mut e = WavetableEngine::new(48000, WavetableParams::default());
        e.load_wavb_definitions(&defs);
        assert_eq!(e.tables[3].len(), 4);
        // Program low nibble selects the slot.
        e.note_on(60, 100, 0, 3);
        assert_eq!(e.voices[0].slot, 3);
    }

    #[test]
    fn empty_slot_falls_back_to_sine() {
        let mut e = WavetableEngine::new(48000, WavetableParams::default());
        e.note_on(60, 100, 0, 7);
        assert_eq!(e.voices[0].slot, 0);
    }

    #[test]
    fn invalid_hex_yields_empty() {
        assert!(parse_wavb("zz").is_empty());
        assert!(parse_wavb("abc").is_empty());
    }
}
