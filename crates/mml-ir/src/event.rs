//! Event types for the compiled score.

use alloc::string::String;
use alloc::vec::Vec;

/// How a note connects to the previous one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlurMode {
    /// Independent note with its own key-off.
    #[default]
    None,
    /// Suppress the key-off between the previous note and this one.
    Normal,
    /// Like `Normal`, but the engine also re-runs the envelope attack.
    Weak,
}

/// A scheduled event in a track.
///
/// `tick` is the source position; during per-track looping the sequencer
/// offsets it by whole loop lengths to get the effective fire time.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub tick: i64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(tick: i64, payload: EventPayload) -> Self {
        Self { tick, payload }
    }
}

/// A note with its gate and routing context captured at parse time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteEvent {
    /// MIDI note number, clamped to 0..=127.
    pub note: i32,
    /// Velocity 0..=127; 0 means "compute from runtime state".
    pub velocity: i32,
    /// Gated on-time in ticks.
    pub duration: i64,
    pub program: i32,
    /// Pan -64..=64, 0 = center.
    pub pan: i32,
    pub module: i32,
    pub channel: i32,
    /// Signed detune; 64 units = one semitone.
    pub detune: i32,
    /// Expression 0..=128.
    pub expr: i32,
    /// Absolute gate override in ticks from `@q`; -1 = unused.
    pub gate_tick: i64,
    /// Key-on delay in ticks from `@q`'s second argument.
    pub delay: i64,
    pub slur: SlurMode,
}

/// What an event does.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Note(NoteEvent),
    Rest { duration: i64 },
    /// Tempo change, rounded to whole BPM.
    Tempo { bpm: i32 },
    Volume { value: i32 },
    FineVolume { value: i32, values: Vec<i32> },
    Expression { value: i32 },
    Pan { value: i32 },
    Program { value: i32, values: Vec<i32> },
    Module { module: i32, channel: i32 },
    Quantize { value: i32 },
    KeyOnDelay { gate_tick: i64, delay: i64 },
    Transpose { value: i32 },
    Detune { value: i32 },
    Slur { mode: SlurMode },
    /// Table-envelope assignment: `na`/`np`/`nt`/`nf`/`@@` and the
    /// release-prefixed `_`-forms. `value` is the table id, `delay` the
    /// step rate in frames.
    TableEnv {
        command: String,
        value: i32,
        delay: i32,
        values: Vec<i32>,
    },
    /// Free-form command with its first numeric argument and raw tail.
    Control {
        command: String,
        value: i32,
        values: Vec<i32>,
        text: String,
    },
}

impl EventPayload {
    /// Shorthand for a control event with no extra arguments.
    pub fn control(command: &str, value: i32) -> Self {
        Self::Control {
            command: String::from(command),
            value,
            values: Vec::new(),
            text: String::new(),
        }
    }
}
