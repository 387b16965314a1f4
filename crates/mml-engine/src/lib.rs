//! Playback engine for mmlbox.
//!
//! Walks a compiled [`mml_ir::Score`] on a fractional tick clock,
//! dispatches events into per-track runtime state, and drives a
//! polyphonic [`VoiceEngine`] that renders stereo frames. A master
//! effects chain and 5-band EQ sit behind the engine output.

pub mod effects;
mod engines;
mod lfo;
mod multi;
mod sequencer;
mod voice_engine;

pub use engines::chiptune::{ChiptuneEngine, ChiptuneParams};
pub use engines::fm::{FmEngine, FmParams};
pub use engines::nesapu::{NesApuEngine, NesApuParams};
pub use engines::wavetable::{parse_wavb, WavetableEngine, WavetableParams};
pub use lfo::{Lfo, WAVE_RANDOM, WAVE_SAW, WAVE_SQUARE, WAVE_TRIANGLE};
pub use multi::MultiEngine;
pub use sequencer::{Sequencer, SequencerEvent, SequencerOptions, TriggerEvent};
pub use voice_engine::{MasterGain, VoiceEngine};
