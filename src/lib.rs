//! mmlbox — a Music Macro Language playback engine.
//!
//! Compiles textual MML scores into tick-stamped event streams and
//! renders them through polyphonic synthesis engines (FM, chiptune,
//! NES-APU, wavetable) into deterministic stereo audio.
//!
//! The [`Player`] facade covers realtime playback through the system
//! audio device; [`compile`] plus the offline renderers cover headless
//! use. Everything else lives in the member crates: `mml-ir` (score
//! model), `mml-parse` (front-end), `mml-engine` (sequencer + DSP),
//! `mml-audio` (backend), `mml-export` (WAV).

mod offline;
mod player;

pub use mml_export::{decode_wav_f32, encode_wav_f32};
pub use mml_ir::{Event, EventPayload, NoteEvent, ParserConfig, Score, SlurMode, Track};
pub use mml_parse::{ParseError, Parser};
pub use offline::{
    render_samples, render_samples_chiptune, render_samples_nesapu, render_samples_wavetable,
};
pub use player::{
    PlaybackEvent, PlaybackEventKind, Player, PlayerError, PlayerOptions, SampleTap, SynthMode,
};

/// Compile MML text into a score with the default parser settings.
pub fn compile(mml_text: &str) -> Result<Score, ParseError> {
    Parser::new(ParserConfig::default()).parse(mml_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_short_phrase() {
        let score = compile("t140 o5 l8 cdefgab>c<c").unwrap();
        assert_eq!(score.resolution, 1920);
        assert_eq!(score.tracks.len(), 1);
    }

    #[test]
    fn compile_reports_structural_errors() {
        assert!(compile("[cde").is_err());
    }
}
