//! Composite engine routing notes to sub-engines by module number.

use std::collections::BTreeMap;

use crate::voice_engine::VoiceEngine;

/// Routes note and control events to registered engines by module
/// number and mixes their output. Voice ids are packed as
/// `(module << 16) | local_id` so note-offs find their way back.
pub struct MultiEngine {
    engines: BTreeMap<i32, Box<dyn VoiceEngine>>,
    default_mod: i32,
    current_mod: i32,
}

impl MultiEngine {
    pub fn new(default_mod: i32) -> Self {
        Self {
            engines: BTreeMap::new(),
            default_mod,
            current_mod: default_mod,
        }
    }

    /// Register an engine for the given module number.
    pub fn add_engine(&mut self, module: i32, engine: Box<dyn VoiceEngine>) {
        self.engines.insert(module, engine);
    }

    pub fn modules(&self) -> impl Iterator<Item = i32> + '_ {
        self.engines.keys().copied()
    }

    fn route(&mut self, module: i32) -> Option<&mut Box<dyn VoiceEngine>> {
        if self.engines.contains_key(&module) {
            return self.engines.get_mut(&module);
        }
        if self.engines.contains_key(&self.default_mod) {
            return self.engines.get_mut(&self.default_mod);
        }
        self.engines.values_mut().next()
    }

    fn route_module(&self, module: i32) -> i32 {
        if self.engines.contains_key(&module) {
            module
        } else {
            self.default_mod
        }
    }

    fn current(&mut self) -> Option<&mut Box<dyn VoiceEngine>> {
        let m = self.current_mod;
        self.route(m)
    }
}

fn encode_voice_id(module: i32, local_id: i32) -> i32 {
    (module << 16) | (local_id & 0xFFFF)
}

fn decode_voice_id(id: i32) -> (i32, i32) {
    ((id >> 16) & 0xFF, id & 0xFFFF)
}

impl VoiceEngine for MultiEngine {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, program: i32) -> i32 {
        let mut module = (program >> 8) & 0xFF;
        if module == 0 {
            module = self.current_mod;
        }
        let routed = self.route_module(module);
        let Some(e) = self.route(module) else {
            return -1;
        };
        let local_id = e.note_on(note, velocity, pan, program);
        encode_voice_id(routed, local_id)
    }

    fn note_off(&mut self, id: i32) {
        let (module, local_id) = decode_voice_id(id);
        if let Some(e) = self.route(module) {
            e.note_off(local_id);
        }
    }

    fn render_frame(&mut self) -> (f32, f32) {
        let (mut l, mut r) = (0.0, 0.0);
        for e in self.engines.values_mut() {
            let (el, er) = e.render_frame();
            l += el;
            r += er;
        }
        (l, r)
    }

    fn set_master_gain(&mut self, gain: f64) {
        for e in self.engines.values_mut() {
            e.set_master_gain(gain);
        }
    }

    fn active_voice_count(&self) -> usize {
        self.engines.values().map(|e| e.active_voice_count()).sum()
    }

    fn set_filter_type(&mut self, filter_type: i32) {
        if let Some(e) = self.current() {
            e.set_filter_type(filter_type);
        }
    }

    fn set_note_on_phase(&mut self, phase: i32) {
        if let Some(e) = self.current() {
            e.set_note_on_phase(phase);
        }
    }

    fn set_portamento(&mut self, from_note: i32, frames: i32) {
        if let Some(e) = self.current() {
            e.set_portamento(from_note, frames);
        }
    }

    fn set_pitch_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        if let Some(e) = self.current() {
            e.set_pitch_lfo(depth, rate_hz, waveform);
        }
    }

    fn set_amp_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        if let Some(e) = self.current() {
            e.set_amp_lfo(depth, rate_hz, waveform);
        }
    }

    fn set_filter_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
        if let Some(e) = self.current() {
            e.set_filter_lfo(depth, rate_hz, waveform);
        }
    }

    fn set_current_module(&mut self, module: i32) {
        self.current_mod = module;
    }

    fn set_algorithm(&mut self, alg: i32) {
        if let Some(e) = self.current() {
            e.set_algorithm(alg);
        }
    }

    fn set_feedback(&mut self, feedback: f64) {
        if let Some(e) = self.current() {
            e.set_feedback(feedback);
        }
    }

    fn set_operator_count(&mut self, count: i32) {
        if let Some(e) = self.current() {
            e.set_operator_count(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::chiptune::{ChiptuneEngine, ChiptuneParams};
    use crate::engines::fm::{FmEngine, FmParams};

    fn multi() -> MultiEngine {
        let mut m = MultiEngine::new(0);
        m.add_engine(0, Box::new(FmEngine::new(48000, FmParams::default())));
        m.add_engine(
            1,
            Box::new(ChiptuneEngine::new(48000, ChiptuneParams::default())),
        );
        m
    }

    #[test]
    fn voice_ids_round_trip_module_routing() {
        let mut m = multi();
        let id = m.note_on(60, 100, 0, 1 << 8);
        assert_eq!(id >> 16, 1);
        assert_eq!(m.active_voice_count(), 1);
        m.note_off(id);
        for _ in 0..48000 {
            m.render_frame();
        }
        assert_eq!(m.active_voice_count(), 0);
    }

    #[test]
    fn unknown_module_falls_back_to_default() {
        let mut m = multi();
        let id = m.note_on(60, 100, 0, 7 << 8);
        assert_eq!(id >> 16, 0);
        assert_eq!(m.active_voice_count(), 1);
    }

    #[test]
    fn render_mixes_all_engines() {
        let mut m = multi();
        m.note_on(60, 120, 0, 0);
        m.note_on(72, 120, 0, 1 << 8);
        let non_zero = (0..2000).any(|_| {
            let (l, r) = m.render_frame();
            l != 0.0 || r != 0.0
        });
        assert!(non_zero);
    }
}
