//! NES-APU style engine: two pulse slots, one triangle, one noise,
//! with releases stepped on a ~240 Hz frame clock.

use std::collections::BTreeMap;

use crate::engines::{
    decode_program, midi_to_freq, pan_gains, poly_blep, quantize_level, unit_phase_for, FilterKind,
    Glide, OutputFilter,
};
use crate::lfo::Lfo;
use crate::voice_engine::{MasterGain, VoiceEngine};

const DEFAULT_FRAME_RATE: f64 = 240.0;

#[derive(Clone, Copy, Debug)]
pub struct NesApuParams {
    pub master_gain: f64,
    pub pulse_duty_a: f64,
    pub pulse_duty_b: f64,
    /// Volume decrement per frame-clock tick while released.
    pub release_step: f64,
    /// Notes at or above this number route to the noise slot.
    pub noise_cutoff: i32,
    pub triangle_gain: f64,
    pub pulse_gain: f64,
    pub noise_gain: f64,
    pub lpf_cutoff: f64,
}

impl Default for NesApuParams {
    fn default() -> Self {
        Self {
            master_gain: 0.32,
            pulse_duty_a: 0.125,
            pulse_duty_b: 0.25,
            release_step: 1.0 / 48.0,
            noise_cutoff: 84,
            triangle_gain: 0.85,
            pulse_gain: 1.0,
            noise_gain: 0.45,
            lpf_cutoff: 12000.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotKind {
    Pulse1,
    Pulse2,
    Triangle,
    Noise,
}

#[derive(Clone, Copy, Debug, Default)]
struct ToneSlot {
    active: bool,
    id: i32,
    age: u32,
    freq: f64,
    phase: f64,
    vol: f64,
    pan: f64,
    released: bool,
    glide: Glide,
}

#[derive(Clone, Copy, Debug)]
struct NoiseSlot {
    active: bool,
    id: i32,
    age: u32,
    vol: f64,
    pan: f64,
    released: bool,
    lfsr: u16,
}

impl Default for NoiseSlot {
    fn default() -> Self {
        Self {
            active: false,
            id: 0,
            age: 0,
            vol: 0.0,
            pan: 0.0,
            released: false,
            lfsr: 0xACE1,
        }
    }
}

pub struct NesApuEngine {
    sample_rate: f64,
    params: NesApuParams,
    pulse_a: ToneSlot,
    pulse_b: ToneSlot,
    triangle: ToneSlot,
    noise: NoiseSlot,
    active_by_id: BTreeMap<i32, SlotKind>,
    next_id: i32,
    assign_counter: i32,
    frame_counter: i32,
    frame_period: i32,
    master_gain: MasterGain,
    filter: OutputFilter,
    next_phase: i32,
    portamento_from: i32,
    portamento_frames: i32,
    pitch_lfo: Lfo,
    amp_lfo: Lfo,
    filter_lfo: Lfo,
}

impl NesApuEngine {
    pub fn new(sample_rate: u32, params: NesApuParams) -> Self {
        let period = ((sample_rate as f64 / DEFAULT_FRAME_RATE) as i32).max(1);
        Self {
            sample_rate: sample_rate as f64,
            pulse_a: ToneSlot::default(),
            pulse_b: ToneSlot::default(),
            triangle: ToneSlot::default(),
            noise: NoiseSlot::default(),
            active_by_id: BTreeMap::new(),
            next_id: 0,
            assign_counter: 0,
            frame_counter: 0,
            frame_period: period,
            master_gain: MasterGain::new(params.master_gain),
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

    fn tone_slot(&mut self, note: i32, vel: f64, pan: f64, id: i32) -> ToneSlot {
        let target = midi_to_freq(note);
        let (freq, glide) = Glide::begin(target, self.portamento_from, self.portamento_frames);
        ToneSlot {
            active: true,
            id,
            age: 0,
            freq,
            phase: unit_phase_for(self.next_phase),
            vol: vel,
            pan,
            released: false,
            glide,
        }
    }

    /// Step releases on the frame clock; dead slots free their ids.
    fn clock_frame(&mut self) {
        let release = if self.params.release_step > 0.0 {
            self.params.release_step
        } else {
            1.0 / 48.0
        };
        for kind in [SlotKind::Pulse1, SlotKind::Pulse2, SlotKind::Triangle] {
            let slot = match kind {
                SlotKind::Pulse1 => &mut self.pulse_a,
                SlotKind::Pulse2 => &mut self.pulse_b,
                _ => &mut self.triangle,
            };
            if slot.active && slot.released {
                slot.vol -= release;
                if slot.vol <= 0.0 {
                    self.active_by_id.remove(&slot.id);
                    *slot = ToneSlot::default();
                }
            }
        }
        if self.noise.active && self.noise.released {
            self.noise.vol -= release;
            if self.noise.vol <= 0.0 {
                self.active_by_id.remove(&self.noise.id);
                self.noise = NoiseSlot::default();
            }
        }
    }
}

/// Route a note to a hardware slot by musical context rather than pure
/// round-robin: high notes and drum programs to noise, module 2 /
/// program 64..95 / low notes to triangle, everything else alternates
/// across the two pulse channels.
fn assign_slot(
    note: i32,
    program: i32,
    module: i32,
    channel: i32,
    noise_cutoff: i32,
    counter: i32,
) -> SlotKind {
    if note >= noise_cutoff || module == 9 || program == 9 {
        return SlotKind::Noise;
    }
    if module == 2 {
        return SlotKind::Triangle;
    }
    if (64..96).contains(&program) {
        return SlotKind::Triangle;
    }
    if note < 48 {
        return SlotKind::Triangle;
    }
    if (channel + counter) % 2 == 0 {
        SlotKind::Pulse1
    } else {
        SlotKind::Pulse2
    }
}

fn seed_lfsr(prev: u16, note: i32, id: i32) -> u16 {
    let s = prev ^ (((note & 0x7f) as u16) << 1) ^ (id as u16).wrapping_mul(73);
    if s == 0 {
        0xACE1
    } else {
        s
    }
}

impl VoiceEngine for NesApuEngine {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, encoded_program: i32) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        let (program, module, channel) = decode_program(encoded_program);
        let vel = (velocity as f64 / 127.0).clamp(0.0, 1.0);
        let pan_norm = (pan as f64).clamp(-64.0, 64.0);

        let slot = assign_slot(
            note,
            program,
            module,
            channel,
            self.params.noise_cutoff,
            self.assign_counter,
        );
        match slot {
            SlotKind::Noise => {
                if self.noise.active && !self.noise.released {
                    self.active_by_id.remove(&self.noise.id);
                }
                self.noise = NoiseSlot {
                    active: true,
                    id,
                    age: 0,
                    vol: vel,
                    pan: pan_norm,
                    released: false,
                    lfsr: seed_lfsr(self.noise.lfsr, note, id),
                };
                self.active_by_id.insert(id, SlotKind::Noise);
            }
            SlotKind::Triangle => {
                if self.triangle.active && !self.triangle.released {
                    self.active_by_id.remove(&self.triangle.id);
                }
                self.triangle = self.tone_slot(note, vel, pan_norm, id);
                self.active_by_id.insert(id, SlotKind::Triangle);
            }
            SlotKind::Pulse2 => {
                if self.pulse_b.active && !self.pulse_b.released {
                    self.active_by_id.remove(&self.pulse_b.id);
                }
                self.pulse_b = self.tone_slot(note, vel, pan_norm, id);
                self.active_by_id.insert(id, SlotKind::Pulse2);
            }
            SlotKind::Pulse1 => {
                if self.pulse_a.active && !self.pulse_a.released {
                    self.active_by_id.remove(&self.pulse_a.id);
                }
                self.pulse_a = self.tone_slot(note, vel, pan_norm, id);
                self.active_by_id.insert(id, SlotKind::Pulse1);
            }
        }
        self.assign_counter += 1;
        self.portamento_from = -1;
        self.portamento_frames = 0;
        self.next_phase = 0;
        id
    }

    fn note_off(&mut self, id: i32) {
        let Some(kind) = self.active_by_id.get(&id).copied() else {
            return;
        };
        match kind {
            SlotKind::Pulse1 if self.pulse_a.id == id => self.pulse_a.released = true,
            SlotKind::Pulse2 if self.pulse_b.id == id => self.pulse_b.released = true,
            SlotKind::Triangle if self.triangle.id == id => self.triangle.released = true,
            SlotKind::Noise if self.noise.id == id => self.noise.released = true,
            _ => {}
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

        self.frame_counter += 1;
        if self.frame_counter >= self.frame_period {
            self.frame_counter = 0;
            self.clock_frame();
        }

        let params = self.params;
        let sr = self.sample_rate;
        let (p1, p1l, p1r) = render_pulse(&mut self.pulse_a, params.pulse_duty_a, freq_mul, sr);
        let (p2, p2l, p2r) = render_pulse(&mut self.pulse_b, params.pulse_duty_b, freq_mul, sr);
        let (t, tl, tr) = render_triangle(&mut self.triangle, freq_mul, sr);
        let (n, nl, nr) = render_noise(&mut self.noise);

        let amp_scale = 1.0 + amp_mod;
        let l = (p1 * p1l * params.pulse_gain
            + p2 * p2l * params.pulse_gain
            + t * tl * params.triangle_gain
            + n * nl * params.noise_gain)
            * gain
            * amp_scale;
        let r = (p1 * p1r * params.pulse_gain
            + p2 * p2r * params.pulse_gain
            + t * tr * params.triangle_gain
            + n * nr * params.noise_gain)
            * gain
            * amp_scale;

        let (l, r) = self.filter.process(l, r, filter_mod);
        (l.clamp(-1.0, 1.0) as f32, r.clamp(-1.0, 1.0) as f32)
    }

    fn set_master_gain(&mut self, gain: f64) {
        self.master_gain.set(gain);
    }

    fn active_voice_count(&self) -> usize {
        [
            self.pulse_a.active,
            self.pulse_b.active,
            self.triangle.active,
            self.noise.active,
        ]
        .iter()
        .filter(|a| **a)
        .count()
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

fn render_pulse(p: &mut ToneSlot, duty: f64, freq_mul: f64, sample_rate: f64) -> (f64, f64, f64) {
    if !p.active {
        return (0.0, 0.0, 0.0);
    }
    p.age += 1;
    let mut freq = p.freq;
    p.glide.advance(&mut freq);
    p.freq = freq;
    let dt = freq * freq_mul / sample_rate;
    p.phase += dt;
    if p.phase >= 1.0 {
        p.phase -= 1.0;
    }
    let mut v = if p.phase < duty { 1.0 } else { -1.0 };
    v += poly_blep(p.phase, dt);
    v -= poly_blep((p.phase - duty + 1.0).rem_euclid(1.0), dt);
    let level = quantize_level(p.vol, 16);
    let (pl, pr) = pan_gains(p.pan);
    (v * level, pl, pr)
}

fn render_triangle(t: &mut ToneSlot, freq_mul: f64, sample_rate: f64) -> (f64, f64, f64) {
    if !t.active {
        return (0.0, 0.0, 0.0);
    }
    t.age += 1;
    let mut freq = t.freq;
    t.glide.advance(&mut freq);
    t.freq = freq;
    let dt = freq * freq_mul / sample_rate;
    t.phase += dt;
    if t.phase >= 1.0 {
        t.phase -= 1.0;
    }
    let raw = 2.0 * (2.0 * t.phase - 1.0).abs() - 1.0;
    let level = quantize_level(t.vol, 16);
    let (pl, pr) = pan_gains(t.pan);
    (raw * level, pl, pr)
}

fn render_noise(n: &mut NoiseSlot) -> (f64, f64, f64) {
    if !n.active {
        return (0.0, 0.0, 0.0);
    }
    n.age += 1;
    let bit = (n.lfsr ^ (n.lfsr >> 1)) & 1;
    n.lfsr = (n.lfsr >> 1) | (bit << 15);
    let v = if n.lfsr & 1 == 1 { 1.0 } else { -1.0 };
    let level = quantize_level(n.vol, 16);
    let (pl, pr) = pan_gains(n.pan);
    (v * level, pl, pr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_generates_signal() {
        let mut e = NesApuEngine::new(48000, NesApuParams::default());
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
    fn stereo_pan_biases_right() {
        let mut e = NesApuEngine::new(48000, NesApuParams::default());
        e.note_on(60, 127, 64, 0);
        let (mut left, mut right) = (0.0f64, 0.0f64);
        for _ in 0..4096 {
            let (l, r) = e.render_frame();
            left += l.abs() as f64;
            right += r.abs() as f64;
        }
        assert!(right > left);
    }

    #[test]
    fn slot_routing_follows_musical_rules() {
        assert_eq!(assign_slot(90, 0, 0, 0, 84, 0), SlotKind::Noise);
        assert_eq!(assign_slot(60, 0, 9, 0, 84, 0), SlotKind::Noise);
        assert_eq!(assign_slot(60, 9, 0, 0, 84, 0), SlotKind::Noise);
        assert_eq!(assign_slot(60, 0, 2, 0, 84, 0), SlotKind::Triangle);
        assert_eq!(assign_slot(60, 70, 0, 0, 84, 0), SlotKind::Triangle);
        assert_eq!(assign_slot(40, 0, 0, 0, 84, 0), SlotKind::Triangle);
        assert_eq!(assign_slot(60, 0, 0, 0, 84, 0), SlotKind::Pulse1);
        assert_eq!(assign_slot(60, 0, 0, 0, 84, 1), SlotKind::Pulse2);
    }

    #[test]
    fn pulse_slots_alternate() {
        let mut e = NesApuEngine::new(48000, NesApuParams::default());
        e.note_on(60, 100, 0, 0);
        e.note_on(62, 100, 0, 0);
        assert!(e.pulse_a.active);
        assert!(e.pulse_b.active);
        assert_eq!(e.active_voice_count(), 2);
    }

    #[test]
    fn release_steps_down_to_silence() {
        let mut e = NesApuEngine::new(48000, NesApuParams::default());
        let id = e.note_on(60, 127, 0, 0);
        for _ in 0..1000 {
            e.render_frame();
        }
        e.note_off(id);
        // 48 release steps at 240Hz is 0.2s; render half a second.
        for _ in 0..24000 {
            e.render_frame();
        }
        assert_eq!(e.active_voice_count(), 0);
    }
}
