//! Score and track containers plus parser configuration.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::event::Event;

/// Directive bodies captured verbatim by the preprocessor, keyed by
/// uppercase directive name (`TITLE`, `SIGN`, `TABLE3`, `OPM@0`, ...).
///
/// A `BTreeMap` keeps iteration deterministic so repeated compiles of
/// the same source stay byte-identical downstream.
pub type Definitions = BTreeMap<String, String>;

/// One parallel voice line of a score.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Track {
    /// Tick-ordered events.
    pub events: Vec<Event>,
    /// Tick cursor at parse end; the track's playable duration.
    pub end_tick: i64,
    /// Tick recorded by `$`; -1 when the track does not loop.
    pub loop_tick: i64,
    /// Event index recorded by `$`; -1 when the track does not loop.
    pub loop_index: i64,
}

impl Track {
    /// Whether `$` marked an internal loop with something after it.
    pub fn loops(&self) -> bool {
        self.loop_index >= 0 && self.end_tick > self.loop_tick
    }
}

/// The compiled output of the parser.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Score {
    /// Ticks per whole note.
    pub resolution: i32,
    /// Initial tempo in beats per minute.
    pub initial_bpm: f64,
    pub tracks: Vec<Track>,
    pub definitions: Definitions,
}

/// Tunable defaults for the parser.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParserConfig {
    /// Ticks per whole note (quarter note = resolution / 4).
    pub resolution: i32,
    pub default_bpm: f64,
    /// Default length denominator for `l` (4 = quarter note).
    pub default_l_value: i32,
    pub default_octave: i32,
    pub min_octave: i32,
    pub max_octave: i32,
    pub default_volume: i32,
    pub default_fine_vol: i32,
    /// Octave shift direction: -1 means `<` raises and `>` lowers
    /// (the classic MML convention).
    pub octave_polarize: i32,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            resolution: 1920,
            default_bpm: 120.0,
            default_l_value: 4,
            default_octave: 5,
            min_octave: 0,
            max_octave: 9,
            default_volume: 16,
            default_fine_vol: 127,
            octave_polarize: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_classic_mml() {
        let cfg = ParserConfig::default();
        assert_eq!(cfg.resolution, 1920);
        assert_eq!(cfg.resolution / cfg.default_l_value, 480);
        assert_eq!(cfg.octave_polarize, -1);
    }

    #[test]
    fn track_loops_requires_marker_and_tail() {
        let mut tr = Track {
            loop_tick: -1,
            loop_index: -1,
            ..Track::default()
        };
        assert!(!tr.loops());
        tr.loop_index = 0;
        tr.loop_tick = 0;
        tr.end_tick = 480;
        assert!(tr.loops());
        tr.loop_tick = 480;
        assert!(!tr.loops());
    }
}
