//! Multi-operator FM engine (up to 4 operators, 8 carrier waveforms).

use std::collections::BTreeMap;

use mml_ir::Definitions;

use crate::engines::{
    decode_program, midi_to_freq, pan_gains, unit_phase_for, Adsr, FilterKind, Glide,
    OutputFilter, TWO_PI,
};
use crate::lfo::Lfo;
use crate::voice_engine::{MasterGain, VoiceEngine};

#[derive(Clone, Copy, Debug)]
pub struct FmParams {
    pub polyphony: usize,
    pub carrier_mul: f64,
    pub mod_mul: f64,
    pub mod_index: f64,
    pub attack_sec: f64,
    pub decay_sec: f64,
    pub sustain_lvl: f64,
    pub release_sec: f64,
    pub master_gain: f64,
    pub velocity_amp: f64,
    /// Lowpass cutoff in Hz; 0 disables the output filter.
    pub lpf_cutoff: f64,
}

impl Default for FmParams {
    fn default() -> Self {
        Self {
            polyphony: 32,
            carrier_mul: 1.0,
            mod_mul: 2.0,
            mod_index: 1.6,
            attack_sec: 0.005,
            decay_sec: 0.12,
            sustain_lvl: 0.75,
            release_sec: 0.2,
            master_gain: 0.45,
            velocity_amp: 0.8,
            lpf_cutoff: 12000.0,
        }
    }
}

/// OPM-format operator parameters for one program, converted from the
/// hardware register ranges into seconds and linear levels.
#[derive(Clone, Copy, Debug, Default)]
struct OpmPatch {
    alg: i32,
    fb: f64,
    ops: [OpmOperator; 4],
}

#[derive(Clone, Copy, Debug, Default)]
struct OpmOperator {
    ar: f64,
    dr: f64,
    sr: f64,
    rr: f64,
    sl: f64,
    tl: f64,
    mul: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Operator {
    phase: f64,
    env: Adsr,
    mul: f64,
    /// Total level: 1.0 = full output, 0 = silent.
    tl: f64,
    ar: f64,
    dr: f64,
    sl: f64,
    rr: f64,
    prev_out: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    active: bool,
    id: i32,
    velocity: f64,
    freq: f64,
    ops: [Operator; 4],
    num_ops: usize,
    alg: i32,
    fb: f64,
    pan: f64,
    waveform: i32,
    glide: Glide,
}

pub struct FmEngine {
    sample_rate: f64,
    params: FmParams,
    voices: Vec<Voice>,
    next_id: i32,
    master_gain: MasterGain,
    next_phase: i32,
    portamento_from: i32,
    portamento_frames: i32,
    filter: OutputFilter,
    algorithm: i32,
    feedback: f64,
    op_count: usize,
    patches: BTreeMap<i32, OpmPatch>,
    noise_lfsr: u32,
    pitch_lfo: Lfo,
    amp_lfo: Lfo,
    filter_lfo: Lfo,
}

impl FmEngine {
    pub fn new(sample_rate: u32, mut params: FmParams) -> Self {
        if params.polyphony == 0 {
            params.polyphony = 32;
        }
        Self {
            sample_rate: sample_rate as f64,
            voices: vec![Voice::default(); params.polyphony],
            next_id: 0,
            master_gain: MasterGain::new(params.master_gain),
            next_phase: 0,
            portamento_from: -1,
            portamento_frames: 0,
            filter: OutputFilter::new(sample_rate as f64, params.lpf_cutoff),
            algorithm: 0,
            feedback: 0.0,
            op_count: 2,
            patches: BTreeMap::new(),
            noise_lfsr: 0x7FFF,
            pitch_lfo: Lfo::default(),
            amp_lfo: Lfo::default(),
            filter_lfo: Lfo::default(),
            params,
        }
    }

    /// Shared handle for lock-free gain changes while audio is running.
    pub fn master_gain(&self) -> MasterGain {
        self.master_gain.clone()
    }

    /// Store an OPM patch for `program`. Layout: alg, fb, then 4
    /// operators of AR, D1R, D2R, RR, D1L, TL, KS, MUL, DT1, DT2, AMS.
    pub fn load_opm_patch(&mut self, program: i32, data: &[i32]) {
        if data.len() < 2 + 4 * 11 {
            return;
        }
        let mut patch = OpmPatch {
            alg: data[0].clamp(0, 7),
            fb: data[1].clamp(0, 7) as f64 / 7.0,
            ops: Default::default(),
        };
        for (oi, op) in patch.ops.iter_mut().enumerate() {
            let base = 2 + oi * 11;
            let [ar, d1r, d2r, rr, d1l, tl] = [
                data[base],
                data[base + 1],
                data[base + 2],
                data[base + 3],
                data[base + 4],
                data[base + 5],
            ];
            let mul = data[base + 7];
            op.ar = (0.001 + (31 - ar.clamp(0, 31)) as f64 / 31.0 * 0.3).clamp(0.001, 8.0);
            op.dr = (0.01 + (31 - d1r.clamp(0, 31)) as f64 / 31.0 * 0.2).clamp(0.01, 4.0);
            op.sr = (0.01 + (31 - d2r.clamp(0, 31)) as f64 / 31.0 * 0.2).clamp(0.01, 4.0);
            op.rr = (0.01 + (15 - rr.clamp(0, 15)) as f64 / 15.0 * 0.3).clamp(0.01, 4.0);
            op.sl = (d1l.clamp(0, 15) as f64 / 15.0).clamp(0.0, 1.0);
            op.tl = ((127 - tl.clamp(0, 127)) as f64 / 127.0).clamp(0.0, 1.0);
            op.mul = if mul == 0 {
                0.5
            } else {
                mul.clamp(0, 15) as f64
            };
        }
        self.patches.insert(program, patch);
    }

    /// Load every `#OPM@n{...}` definition captured by the parser.
    pub fn load_opm_patches(&mut self, defs: &Definitions) {
        for (key, body) in defs {
            let upper = key.to_ascii_uppercase();
            if !upper.starts_with("OPM@") {
                continue;
            }
            let Some(at) = key.find('@') else { continue };
            let Ok(program) = key[at + 1..].trim().parse::<i32>() else {
                continue;
            };
            // Numbers are taken from inside the braces only, so the
            // program id in the key never poisons the stream.
            let Some(brace) = body.find('{') else { continue };
            let data = extract_ints(&body[brace..]);
            if data.len() >= 2 + 4 * 11 {
                self.load_opm_patch(program, &data);
            }
        }
    }

    fn steal_voice(&self) -> usize {
        for (i, v) in self.voices.iter().enumerate() {
            if !v.active {
                return i;
            }
        }
        // All slots busy: take the quietest carrier.
        let mut quiet = 0;
        let mut min_env = self.voices[0].ops[0].env.level;
        for (i, v) in self.voices.iter().enumerate().skip(1) {
            if v.ops[0].env.level < min_env {
                min_env = v.ops[0].env.level;
                quiet = i;
            }
        }
        quiet
    }
}

impl VoiceEngine for FmEngine {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, encoded_program: i32) -> i32 {
        let slot = self.steal_voice();
        let id = self.next_id;
        self.next_id += 1;
        let (program, _, _) = decode_program(encoded_program);
        let target_freq = midi_to_freq(note);
        let (freq, glide) = Glide::begin(target_freq, self.portamento_from, self.portamento_frames);
        self.portamento_from = -1;
        self.portamento_frames = 0;

        let init_phase = unit_phase_for(self.next_phase) * TWO_PI;
        self.next_phase = 0;

        let patch = self.patches.get(&program).copied();
        let (alg, fb, num_ops) = match &patch {
            Some(p) => (p.alg, p.fb, 4),
            None => (self.algorithm, self.feedback, self.op_count.max(1)),
        };

        let params = self.params;
        let default_muls = [params.carrier_mul, params.mod_mul, 3.0, 4.0];
        let v = &mut self.voices[slot];
        *v = Voice {
            active: true,
            id,
            velocity: (velocity as f64 / 127.0).clamp(0.0, 1.0),
            freq,
            num_ops,
            alg,
            fb,
            pan: (pan as f64).clamp(-64.0, 64.0),
            waveform: program % 8,
            glide,
            ops: Default::default(),
        };
        for oi in 0..num_ops {
            v.ops[oi] = match &patch {
                Some(p) => Operator {
                    phase: init_phase,
                    env: Adsr::trigger(),
                    mul: p.ops[oi].mul,
                    tl: p.ops[oi].tl,
                    ar: p.ops[oi].ar,
                    dr: p.ops[oi].dr,
                    sl: p.ops[oi].sl,
                    rr: p.ops[oi].rr,
                    prev_out: 0.0,
                },
                None => Operator {
                    phase: init_phase,
                    env: Adsr::trigger(),
                    mul: default_muls[oi],
                    tl: 1.0,
                    ar: params.attack_sec,
                    dr: params.decay_sec,
                    sl: params.sustain_lvl,
                    rr: params.release_sec,
                    prev_out: 0.0,
                },
            };
        }
        if patch.is_none() {
            for op in v.ops.iter_mut().take(num_ops).skip(1) {
                op.tl = params.mod_index / 8.0;
            }
        }
        id
    }

    fn note_off(&mut self, id: i32) {
        for v in &mut self.voices {
            if v.active && v.id == id {
                for op in v.ops.iter_mut().take(v.num_ops) {
                    op.env.release();
                }
            }
        }
    }

    fn render_frame(&mut self) -> (f32, f32) {
        // LFOs are global: sampled once per frame, shared by all voices.
        let pitch_mod = self.pitch_lfo.sample(self.sample_rate);
        let amp_mod = self.amp_lfo.sample(self.sample_rate);
        let filter_mod = self.filter_lfo.sample(self.sample_rate);
        let gain = self.master_gain.get();
        let freq_mul = if pitch_mod != 0.0 {
            2f64.powf(pitch_mod / 12.0)
        } else {
            1.0
        };

        let Self {
            voices,
            noise_lfsr,
            params,
            sample_rate,
            ..
        } = self;
        let sr = *sample_rate;

        let (mut l, mut r) = (0.0, 0.0);
        for v in voices.iter_mut() {
            if !v.active {
                continue;
            }
            let mut all_off = true;
            for oi in 0..v.num_ops {
                let op = &mut v.ops[oi];
                op.env.advance(sr, op.ar, op.dr, op.sl, op.rr);
                if !op.env.is_off() {
                    all_off = false;
                }
            }
            if all_off {
                v.active = false;
                continue;
            }
            let mut sig = render_voice(v, params.mod_index, noise_lfsr);
            sig *= gain * (0.2 + v.velocity * params.velocity_amp);
            sig *= 1.0 + amp_mod;
            let (pl, pr) = pan_gains(v.pan);
            l += sig * pl;
            r += sig * pr;
            let mut freq = v.freq;
            v.glide.advance(&mut freq);
            v.freq = freq;
            for oi in 0..v.num_ops {
                let op = &mut v.ops[oi];
                op.phase += TWO_PI * (v.freq * freq_mul * op.mul) / sr;
                if op.phase > TWO_PI {
                    op.phase -= TWO_PI;
                }
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

    fn set_algorithm(&mut self, alg: i32) {
        self.algorithm = alg.clamp(0, 7);
    }

    fn set_feedback(&mut self, feedback: f64) {
        self.feedback = feedback.clamp(0.0, 1.0);
    }

    fn set_operator_count(&mut self, count: i32) {
        self.op_count = count.clamp(1, 4) as usize;
    }
}

/// Compute one FM output sample for a voice. Algorithms define the
/// modulator-to-carrier topology; parallel branches scale by 1/sqrt(N)
/// for equal RMS.
fn render_voice(v: &mut Voice, mod_index: f64, lfsr: &mut u32) -> f64 {
    let n = v.num_ops;
    let mut out = [0.0f64; 4];
    for oi in 0..n {
        out[oi] = v.ops[oi].env.level * v.ops[oi].tl;
    }
    let ops = &mut v.ops;
    match n {
        1 => {
            let fb = ops[0].prev_out * v.fb * std::f64::consts::PI;
            let s = waveform_sample(ops[0].phase + fb, v.waveform, lfsr) * out[0];
            ops[0].prev_out = s;
            s
        }
        2 => match v.alg {
            1 => {
                let s0 = waveform_sample(ops[0].phase, v.waveform, lfsr) * out[0];
                let s1 = waveform_sample(ops[1].phase, v.waveform, lfsr) * out[1];
                (s0 + s1) * std::f64::consts::FRAC_1_SQRT_2
            }
            _ => {
                let fb = ops[1].prev_out * v.fb * std::f64::consts::PI;
                let m = (ops[1].phase + fb).sin() * out[1] * mod_index;
                ops[1].prev_out = (ops[1].phase + fb).sin() * out[1];
                waveform_sample(ops[0].phase + m, v.waveform, lfsr) * out[0]
            }
        },
        3 => match v.alg {
            1 => {
                let fb = ops[2].prev_out * v.fb * std::f64::consts::PI;
                let s2 = (ops[2].phase + fb).sin() * out[2] * mod_index;
                ops[2].prev_out = (ops[2].phase + fb).sin() * out[2];
                let s1 = (ops[1].phase + s2).sin() * out[1] * mod_index;
                waveform_sample(ops[0].phase + s1, v.waveform, lfsr) * out[0]
            }
            2 => {
                let s1 = ops[1].phase.sin() * out[1] * mod_index;
                let s2 = ops[2].phase.sin() * out[2] * mod_index;
                waveform_sample(ops[0].phase + s1 + s2, v.waveform, lfsr) * out[0]
            }
            3 => {
                let s0 = waveform_sample(ops[0].phase, v.waveform, lfsr) * out[0];
                let s1 = waveform_sample(ops[1].phase, v.waveform, lfsr) * out[1];
                let s2 = waveform_sample(ops[2].phase, v.waveform, lfsr) * out[2];
                (s0 + s1 + s2) * (1.0 / 3f64.sqrt())
            }
            _ => {
                let s2 = ops[2].phase.sin() * out[2] * mod_index;
                let s1 = (ops[1].phase + s2).sin() * out[1] * mod_index;
                waveform_sample(ops[0].phase + s1, v.waveform, lfsr) * out[0]
            }
        },
        _ => match v.alg {
            1 => {
                let s3 = ops[3].phase.sin() * out[3] * mod_index;
                let s2 = (ops[2].phase + s3).sin() * out[2] * mod_index;
                let s1 = (ops[1].phase + s2).sin() * out[1] * mod_index;
                waveform_sample(ops[0].phase + s1, v.waveform, lfsr) * out[0]
            }
            2 => {
                let s2 = ops[2].phase.sin() * out[2] * mod_index;
                let s3 = ops[3].phase.sin() * out[3] * mod_index;
                let s1 = (ops[1].phase + s2 + s3).sin() * out[1] * mod_index;
                waveform_sample(ops[0].phase + s1, v.waveform, lfsr) * out[0]
            }
            3 => {
                let s2 = ops[2].phase.sin() * out[2] * mod_index;
                let s3 = ops[3].phase.sin() * out[3] * mod_index;
                let c0 = waveform_sample(ops[0].phase + s3, v.waveform, lfsr) * out[0];
                let c1 = waveform_sample(ops[1].phase + s2, v.waveform, lfsr) * out[1];
                (c0 + c1) * std::f64::consts::FRAC_1_SQRT_2
            }
            4 => {
                let s3 = ops[3].phase.sin() * out[3] * mod_index;
                let s2 = (ops[2].phase + s3).sin() * out[2] * mod_index;
                let s1 = (ops[1].phase + s2).sin() * out[1];
                let s0 = waveform_sample(ops[0].phase, v.waveform, lfsr) * out[0];
                (s0 + s1) * std::f64::consts::FRAC_1_SQRT_2
            }
            5 => {
                let mut s = 0.0;
                for oi in 0..4 {
                    s += waveform_sample(ops[oi].phase, v.waveform, lfsr) * out[oi];
                }
                s * 0.5
            }
            _ => {
                let fb = ops[3].prev_out * v.fb * std::f64::consts::PI;
                let s3 = (ops[3].phase + fb).sin() * out[3] * mod_index;
                ops[3].prev_out = (ops[3].phase + fb).sin() * out[3];
                let s2 = (ops[2].phase + s3).sin() * out[2] * mod_index;
                let s1 = (ops[1].phase + s2).sin() * out[1] * mod_index;
                waveform_sample(ops[0].phase + s1, v.waveform, lfsr) * out[0]
            }
        },
    }
}

fn waveform_sample(phase: f64, waveform: i32, lfsr: &mut u32) -> f64 {
    let ph = phase.rem_euclid(TWO_PI);
    match waveform {
        1 => 1.0 - 2.0 * ph / TWO_PI,
        2 => 2.0 * (2.0 * ph / TWO_PI - 1.0).abs() - 1.0,
        3 => {
            if ph < std::f64::consts::PI {
                1.0
            } else {
                -1.0
            }
        }
        4 => {
            if ph < std::f64::consts::PI / 2.0 {
                1.0
            } else {
                -1.0
            }
        }
        5 => {
            if ph < std::f64::consts::PI / 4.0 {
                1.0
            } else {
                -1.0
            }
        }
        6 => phase.sin().max(0.0),
        7 => {
            *lfsr = (*lfsr >> 1) ^ ((*lfsr & 1).wrapping_neg() & 0xB400);
            *lfsr as f64 / 0x7FFF as f64 * 2.0 - 1.0
        }
        _ => phase.sin(),
    }
}

// Scan signed decimal integers out of a patch body without pulling in a
// regex dependency.
fn extract_ints(s: &str) -> Vec<i32> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let negative = bytes[i] == b'-'
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_digit();
        if negative {
            i += 1;
        }
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(v) = s[start..i].parse::<i32>() {
                out.push(if negative { -v } else { v });
            }
        } else {
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_generates_signal() {
        let mut e = FmEngine::new(48000, FmParams::default());
        let id = e.note_on(60, 100, 0, 0);
        assert!(id >= 0);
        let non_zero = (0..5000).any(|_| {
            let (l, r) = e.render_frame();
            l != 0.0 || r != 0.0
        });
        assert!(non_zero);
        e.note_off(id);
    }

    #[test]
    fn pan_extremes_bias_channels() {
        let mut e = FmEngine::new(48000, FmParams::default());
        e.note_on(60, 127, -64, 0);
        let (mut left, mut right) = (0.0, 0.0);
        for _ in 0..4096 {
            let (l, r) = e.render_frame();
            left += l.abs() as f64;
            right += r.abs() as f64;
        }
        assert!(left > right);
    }

    #[test]
    fn multi_operator_algorithms_produce_output() {
        for (op_count, alg) in [(1, 0), (2, 0), (2, 1), (3, 0), (3, 3), (4, 0), (4, 5)] {
            let mut e = FmEngine::new(48000, FmParams::default());
            e.set_operator_count(op_count);
            e.set_algorithm(alg);
            let id = e.note_on(60, 100, 0, 0);
            let max_abs = (0..2000)
                .map(|_| {
                    let (l, r) = e.render_frame();
                    l.abs().max(r.abs())
                })
                .fold(0.0f32, f32::max);
            assert!(
                max_abs > 0.001,
                "no output for {op_count} ops, alg {alg}"
            );
            e.note_off(id);
        }
    }

    #[test]
    fn all_waveforms_produce_output() {
        for wf in 0..8 {
            let mut e = FmEngine::new(48000, FmParams::default());
            e.note_on(60, 100, 0, wf);
            let max_abs = (0..1000)
                .map(|_| e.render_frame().0.abs())
                .fold(0.0f32, f32::max);
            assert!(max_abs > 0.001, "waveform {wf} produced no output");
        }
    }

    #[test]
    fn all_filter_types_pass_signal() {
        for ft in 0..3 {
            let mut e = FmEngine::new(48000, FmParams::default());
            e.set_filter_type(ft);
            e.note_on(60, 100, 0, 0);
            let max_abs = (0..2000)
                .map(|_| e.render_frame().0.abs())
                .fold(0.0f32, f32::max);
            assert!(max_abs > 0.001, "filter type {ft} produced no output");
        }
    }

    #[test]
    fn feedback_changes_output() {
        let render_sum = |fb: f64| {
            let mut e = FmEngine::new(48000, FmParams::default());
            e.set_feedback(fb);
            e.note_on(60, 100, 0, 0);
            (0..1000).map(|_| e.render_frame().0 as f64).sum::<f64>()
        };
        assert_ne!(render_sum(0.0), render_sum(0.7));
    }

    #[test]
    fn opm_patch_overrides_defaults() {
        let mut e = FmEngine::new(48000, FmParams::default());
        let mut data = vec![4, 7];
        for _ in 0..4 {
            data.extend_from_slice(&[31, 10, 5, 10, 5, 20, 0, 2, 0, 0, 0]);
        }
        e.load_opm_patch(3, &data);
        e.note_on(60, 100, 0, 3);
        assert_eq!(e.voices[0].alg, 4);
        assert_eq!(e.voices[0].num_ops, 4);
        assert!((e.voices[0].fb - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opm_defs_parsed_from_definitions() {
        let mut defs = Definitions::new();
        let mut body = String::from("OPM@5{ 2, 3,\n");
        for _ in 0..4 {
            body.push_str("31, 10, 5, 10, 5, 20, 0, 2, 0, 0, 0,\n");
        }
        body.push('}');
        defs.insert("OPM@5".into(), body);
        let mut e = FmEngine::new(48000, FmParams::default());
        e.load_opm_patches(&defs);
        assert!(e.patches.contains_key(&5));
        assert_eq!(e.patches[&5].alg, 2);
    }

    #[test]
    fn voice_stealing_prefers_quietest() {
        let mut e = FmEngine::new(48000, FmParams { polyphony: 2, ..FmParams::default() });
        e.note_on(60, 100, 0, 0);
        e.note_on(64, 100, 0, 0);
        // Let envelopes diverge, then steal.
        let first = e.voices[0].id;
        e.note_off(first);
        for _ in 0..2000 {
            e.render_frame();
        }
        let id = e.note_on(67, 100, 0, 0);
        assert!(id >= 0);
        assert_eq!(e.active_voice_count(), 2);
    }
}
