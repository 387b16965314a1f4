//! The contract every synthesis engine implements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared lock-free master gain.
///
/// The audio thread loads it once per rendered frame; the control side
/// may store a new value at any time. Stored as f64 bits in an
/// `AtomicU64` so no lock is ever held on the render path.
#[derive(Clone, Debug)]
pub struct MasterGain(Arc<AtomicU64>);

impl MasterGain {
    pub fn new(gain: f64) -> Self {
        Self(Arc::new(AtomicU64::new(gain.max(0.0).to_bits())))
    }

    pub fn set(&self, gain: f64) {
        self.0.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// A polyphonic synthesis engine driven by the sequencer.
///
/// `note_on` returns a voice id used by `note_off`; ids are never
/// reused within a playback session. Control setters apply to the next
/// note-on (`set_note_on_phase`, `set_portamento`) or to the whole
/// engine (filter, LFOs, gain).
pub trait VoiceEngine: Send {
    fn note_on(&mut self, note: i32, velocity: i32, pan: i32, program: i32) -> i32;
    fn note_off(&mut self, id: i32);
    /// Produce one stereo frame in [-1, +1].
    fn render_frame(&mut self) -> (f32, f32);
    fn set_master_gain(&mut self, gain: f64);
    /// Voices still sounding in any envelope stage, release included.
    /// Used to detect when playback has fully ended.
    fn active_voice_count(&self) -> usize;
    /// Output filter: 0 = lowpass, 1 = bandpass, 2 = highpass.
    fn set_filter_type(&mut self, filter_type: i32);
    /// Phase for the next note-on: 0 = reset, -1 = random,
    /// 1..=255 = fixed at `phase/128 * PI` radians.
    fn set_note_on_phase(&mut self, phase: i32);
    /// Glide for the next note-on. `from_note < 0` disables; `frames`
    /// is the glide duration in samples.
    fn set_portamento(&mut self, from_note: i32, frames: i32);
    /// Per-frame pitch modulation; depth in semitones.
    fn set_pitch_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32);
    /// Per-frame amplitude modulation; depth is a 0..1 factor.
    fn set_amp_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32);
    /// Per-frame filter cutoff modulation; depth in cutoff units.
    fn set_filter_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32);

    /// Route subsequent control setters to the engine serving `module`.
    /// Meaningful on composite engines only.
    fn set_current_module(&mut self, _module: i32) {}
    /// FM operator topology (0-7). No-op on non-FM engines.
    fn set_algorithm(&mut self, _alg: i32) {}
    /// FM operator-1 self-feedback (0.0-1.0). No-op on non-FM engines.
    fn set_feedback(&mut self, _feedback: f64) {}
    /// Active FM operator count (1-4). No-op on non-FM engines.
    fn set_operator_count(&mut self, _count: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_gain_round_trips() {
        let g = MasterGain::new(0.45);
        assert_eq!(g.get(), 0.45);
        g.set(0.8);
        assert_eq!(g.get(), 0.8);
    }

    #[test]
    fn master_gain_clamps_negative() {
        let g = MasterGain::new(-1.0);
        assert_eq!(g.get(), 0.0);
        g.set(-0.5);
        assert_eq!(g.get(), 0.0);
    }

    #[test]
    fn master_gain_shared_between_clones() {
        let g = MasterGain::new(1.0);
        let h = g.clone();
        h.set(0.25);
        assert_eq!(g.get(), 0.25);
    }
}
