//! Offline renderers: score to interleaved stereo samples, no device.

use std::sync::Arc;

use mml_engine::{
    ChiptuneEngine, ChiptuneParams, FmEngine, FmParams, NesApuEngine, NesApuParams, Sequencer,
    VoiceEngine, WavetableEngine, WavetableParams,
};
use mml_ir::Score;

fn render(score: &Score, engine: Box<dyn VoiceEngine>, sample_rate: u32, seconds: f64) -> Vec<f32> {
    let mut seq = Sequencer::new(Arc::new(score.clone()), engine, sample_rate as i32);
    let frames = (sample_rate as f64 * seconds) as usize;
    let mut out = vec![0.0f32; frames * 2];
    seq.process(&mut out);
    out
}

/// Render through the FM engine.
pub fn render_samples(score: &Score, sample_rate: u32, seconds: f64) -> Vec<f32> {
    render(
        score,
        Box::new(FmEngine::new(sample_rate, FmParams::default())),
        sample_rate,
        seconds,
    )
}

/// Render through the chiptune engine.
pub fn render_samples_chiptune(score: &Score, sample_rate: u32, seconds: f64) -> Vec<f32> {
    render(
        score,
        Box::new(ChiptuneEngine::new(sample_rate, ChiptuneParams::default())),
        sample_rate,
        seconds,
    )
}

/// Render through the NES-APU engine.
pub fn render_samples_nesapu(score: &Score, sample_rate: u32, seconds: f64) -> Vec<f32> {
    render(
        score,
        Box::new(NesApuEngine::new(sample_rate, NesApuParams::default())),
        sample_rate,
        seconds,
    )
}

/// Render through the wavetable engine.
pub fn render_samples_wavetable(score: &Score, sample_rate: u32, seconds: f64) -> Vec<f32> {
    render(
        score,
        Box::new(WavetableEngine::new(sample_rate, WavetableParams::default())),
        sample_rate,
        seconds,
    )
}
