//! Track splitting, loop expansion, and single-pass event emission.

use mml_ir::{
    Definitions, Event, EventPayload, NoteEvent, ParserConfig, Score, SlurMode, Track,
};

use crate::preprocess::{is_volume_reversed, preprocess_input};
use crate::ParseError;

/// MML parser. Construct once, reuse for any number of scores.
pub struct Parser {
    cfg: ParserConfig,
}

impl Parser {
    pub fn new(cfg: ParserConfig) -> Self {
        Self { cfg }
    }

    /// Compile MML text into a score. Compilation is deterministic: the
    /// same input yields an identical event stream.
    pub fn parse(&self, input: &str) -> Result<Score, ParseError> {
        let pre = preprocess_input(input);
        let parts = split_sections_as_tracks(&pre.text);
        let opts = ParserOptions {
            quant_max: parse_quant_max(&pre.definitions),
            tempo: parse_tmode(&pre.definitions),
        };
        let mut tracks = Vec::with_capacity(parts.len());
        for part in &parts {
            if part.trim().is_empty() {
                continue;
            }
            tracks.push(self.parse_track(part, &opts, &pre.definitions)?);
        }
        Ok(Score {
            resolution: self.cfg.resolution,
            initial_bpm: self.cfg.default_bpm,
            tracks,
            definitions: pre.definitions,
        })
    }

    fn parse_track(
        &self,
        input: &str,
        opts: &ParserOptions,
        defs: &Definitions,
    ) -> Result<Track, ParseError> {
        let expanded = expand_loops(input)?;
        let s = expanded.as_str();
        let bytes = s.as_bytes();
        let mut st = ParseState::new(&self.cfg, opts, defs);
        let mut events: Vec<Event> = Vec::with_capacity(256);
        let mut loop_tick: i64 = -1;
        let mut loop_index: i64 = -1;
        let mut i = 0;

        while i < bytes.len() {
            let ch = bytes[i].to_ascii_lowercase();
            if is_space(ch) {
                i += 1;
                continue;
            }
            // Guillemets are multi-byte; test them before the byte match.
            if bytes[i..].starts_with("«".as_bytes()) {
                st.octave = clamp(
                    st.octave + 2 * self.cfg.octave_polarize,
                    self.cfg.min_octave,
                    self.cfg.max_octave,
                );
                i += "«".len();
                continue;
            }
            if bytes[i..].starts_with("»".as_bytes()) {
                st.octave = clamp(
                    st.octave - 2 * self.cfg.octave_polarize,
                    self.cfg.min_octave,
                    self.cfg.max_octave,
                );
                i += "»".len();
                continue;
            }
            if ch == b'n' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                let (nn, next) = parse_number_default(s, i + 1, 60)?;
                let (dur, next) = parse_length_with_tie(s, next, &st)?;
                let nn = nn as i64 + st.transpose as i64 + (st.detune / 64) as i64;
                events.push(Event::new(st.tick, st.note_payload(nn, dur)));
                st.slur_mode = SlurMode::None;
                st.tick += dur;
                i = next;
            } else if note_base(ch).is_some() {
                let (payload, dur, next) = parse_note(s, i, &st)?;
                events.push(Event::new(st.tick, payload));
                st.slur_mode = SlurMode::None;
                st.tick += dur;
                i = next;
            } else if ch == b'r' {
                let (dur, next) = parse_length_with_tie(s, i + 1, &st)?;
                events.push(Event::new(st.tick, EventPayload::Rest { duration: dur }));
                st.tick += dur;
                i = next;
            } else if ch == b'l' {
                let (length, next) = parse_length_token(s, i + 1, &st)?;
                st.default_len = length;
                i = next;
            } else if ch == b't' {
                let (val, next) = parse_number_default(s, i + 1, st.bpm as i32)?;
                let bpm = opts.tempo.apply(val);
                st.bpm = bpm;
                events.push(Event::new(
                    st.tick,
                    EventPayload::Tempo {
                        bpm: bpm.round() as i32,
                    },
                ));
                i = next;
            } else if ch == b'o' {
                let (val, next) = parse_number_default(s, i + 1, st.octave)?;
                if val < self.cfg.min_octave || val > self.cfg.max_octave {
                    return Err(ParseError::OctaveOutOfRange(i));
                }
                st.octave = val;
                i = next;
            } else if ch == b'<' {
                let (val, next) = parse_number_default(s, i + 1, 1)?;
                st.octave = clamp(
                    st.octave + val * self.cfg.octave_polarize,
                    self.cfg.min_octave,
                    self.cfg.max_octave,
                );
                i = next;
            } else if ch == b'>' {
                let (val, next) = parse_number_default(s, i + 1, 1)?;
                st.octave = clamp(
                    st.octave - val * self.cfg.octave_polarize,
                    self.cfg.min_octave,
                    self.cfg.max_octave,
                );
                i = next;
            } else if ch == b'v' {
                let (val, next) = parse_number_default(s, i + 1, st.volume)?;
                st.volume = val;
                events.push(Event::new(st.tick, EventPayload::Volume { value: val }));
                i = next;
            } else if ch == b'x' {
                let (val, next) = parse_number_default(s, i + 1, st.expression)?;
                st.expression = clamp(val, 0, 128);
                events.push(Event::new(
                    st.tick,
                    EventPayload::Expression {
                        value: st.expression,
                    },
                ));
                i = next;
            } else if ch == b'q' {
                let (val, next) = parse_number_default(s, i + 1, st.quant_value)?;
                let val = clamp(val, 0, st.quant_max);
                st.quant_value = val;
                st.gate_percent = ((val as i64 * 100) / st.quant_max as i64) as i32;
                events.push(Event::new(st.tick, EventPayload::Quantize { value: val }));
                i = next;
            } else if ch == b'k' {
                if i + 1 < bytes.len() && bytes[i + 1].to_ascii_lowercase() == b't' {
                    let (val, next) = parse_signed_number_default(s, i + 2, st.transpose)?;
                    st.transpose = val;
                    events.push(Event::new(st.tick, EventPayload::Transpose { value: val }));
                    i = next;
                } else {
                    let (val, next) = parse_signed_number_default(s, i + 1, st.detune)?;
                    st.detune = val;
                    events.push(Event::new(st.tick, EventPayload::Detune { value: val }));
                    i = next;
                }
            } else if ch == b'p' {
                if i + 1 < bytes.len() && bytes[i + 1].to_ascii_lowercase() == b'o' {
                    let (val, next) = parse_signed_number_default(s, i + 2, 0)?;
                    events.push(Event::new(st.tick, EventPayload::control("po", val)));
                    i = next;
                } else {
                    let (val, next) = parse_signed_number_default(s, i + 1, st.pan)?;
                    st.pan = normalize_pan_value(val);
                    events.push(Event::new(st.tick, EventPayload::Pan { value: st.pan }));
                    i = next;
                }
            } else if ch == b'%' {
                i = self.parse_percent(s, i, &mut st, &mut events)?;
            } else if ch == b'&' {
                let mode = if i + 1 < bytes.len() && bytes[i + 1] == b'&' {
                    i += 2;
                    SlurMode::Weak
                } else {
                    i += 1;
                    SlurMode::Normal
                };
                st.slur_mode = mode;
                events.push(Event::new(st.tick, EventPayload::Slur { mode }));
            } else if ch == b's' {
                // s n1,n2: n1 = release rate, n2 = pitch sweep.
                let (val, mut next) = parse_signed_number_default(s, i + 1, 0)?;
                let mut values = vec![val];
                if next < bytes.len() && bytes[next] == b',' {
                    let (v2, n2) = parse_signed_number_default(s, next + 1, 0)?;
                    values.push(v2);
                    next = n2;
                }
                events.push(Event::new(
                    st.tick,
                    EventPayload::Control {
                        command: "s".into(),
                        value: val,
                        values,
                        text: String::new(),
                    },
                ));
                i = next;
            } else if ch == b'(' || ch == b')' {
                let (shift, next) = parse_number_default(s, i + 1, 1)?;
                let mut up = ch == b'(';
                if st.rev_volume {
                    up = !up;
                }
                st.volume = clamp(
                    if up {
                        st.volume.saturating_add(shift)
                    } else {
                        st.volume.saturating_sub(shift)
                    },
                    0,
                    127,
                );
                events.push(Event::new(
                    st.tick,
                    EventPayload::Volume { value: st.volume },
                ));
                i = next;
            } else if ch == b'@' {
                i = self.parse_at(s, i, &mut st, &mut events)?;
            } else if ch == b'$' {
                loop_tick = st.tick;
                loop_index = events.len() as i64;
                i += 1;
            } else if starts_with_word(s, i, "po") || ch == b'*' {
                let (cmd, advance) = if starts_with_word(s, i, "po") {
                    ("po", i + 2)
                } else {
                    ("*", i + 1)
                };
                let (val, next) = parse_signed_number_default(s, advance, 0)?;
                events.push(Event::new(st.tick, EventPayload::control(cmd, val)));
                i = next;
            } else if starts_with_word(s, i, "mp")
                || starts_with_word(s, i, "ma")
                || starts_with_word(s, i, "mf")
            {
                let cmd = s[i..i + 2].to_ascii_lowercase();
                let (val, next) = parse_signed_number_default(s, i + 2, 0)?;
                let (text, next) = take_argument_tail(s, next);
                events.push(Event::new(
                    st.tick,
                    EventPayload::Control {
                        command: cmd,
                        value: val,
                        values: Vec::new(),
                        text,
                    },
                ));
                i = next;
            } else if is_table_env_word(s, i) {
                let (cmd, next) = parse_word_token(s, i);
                let (val, mut n2) = parse_signed_number_default(s, next, 0)?;
                let mut step = 1;
                let mut values = vec![val];
                if n2 < bytes.len() && bytes[n2] == b',' {
                    let (v2, n3) = parse_number_default(s, n2 + 1, 1)?;
                    step = v2;
                    values.push(v2);
                    n2 = n3;
                }
                events.push(Event::new(
                    st.tick,
                    EventPayload::TableEnv {
                        command: cmd,
                        value: val,
                        delay: step,
                        values,
                    },
                ));
                i = n2;
            } else {
                // Unknown character; the grammar is lenient.
                i += 1;
            }
        }

        Ok(Track {
            events,
            end_tick: st.tick,
            loop_tick,
            loop_index,
        })
    }

    /// `%` commands: `%f`/`%t`/`%e` triggers, `%v`/`%x` scaling modes,
    /// or a bare module/channel selector.
    fn parse_percent(
        &self,
        s: &str,
        i: usize,
        st: &mut ParseState,
        events: &mut Vec<Event>,
    ) -> Result<usize, ParseError> {
        let bytes = s.as_bytes();
        let next_ch = if i + 1 < bytes.len() {
            bytes[i + 1].to_ascii_lowercase()
        } else {
            0
        };
        if matches!(next_ch, b'f' | b't' | b'e') {
            let cmd = format!("%{}", next_ch as char);
            let (val, mut next) = parse_signed_number_default(s, i + 2, 0)?;
            let mut values = vec![val];
            while next < bytes.len() && bytes[next] == b',' {
                let (arg, n2) = parse_signed_number_default(s, next + 1, 0)?;
                values.push(arg);
                next = n2;
            }
            events.push(Event::new(
                st.tick,
                EventPayload::Control {
                    command: cmd,
                    value: val,
                    values,
                    text: String::new(),
                },
            ));
            return Ok(next);
        }
        if matches!(next_ch, b'v' | b'x') {
            let (val, mut next) = parse_number_default(s, i + 2, 0)?;
            if next_ch == b'v' {
                let mode = val;
                let mut max = st.v_scale_max;
                if next < bytes.len() && bytes[next] == b',' {
                    let (mv, n2) = parse_number_default(s, next + 1, 0)?;
                    // The second argument encodes the maximum as 256 >> n2.
                    if mv > 0 {
                        max = if mv < 32 { 256 >> mv } else { 0 };
                    }
                    next = n2;
                }
                if max <= 0 {
                    max = 16;
                }
                st.v_scale_mode = mode;
                st.v_scale_max = max;
                events.push(Event::new(
                    st.tick,
                    EventPayload::Control {
                        command: "%v".into(),
                        value: mode,
                        values: vec![mode, max],
                        text: String::new(),
                    },
                ));
            } else {
                st.x_scale_mode = val;
                events.push(Event::new(
                    st.tick,
                    EventPayload::Control {
                        command: "%x".into(),
                        value: val,
                        values: vec![val],
                        text: String::new(),
                    },
                ));
            }
            return Ok(next);
        }
        let (module, mut next) = parse_number_default(s, i + 1, st.module)?;
        st.module = module;
        st.channel = 0;
        if next < bytes.len() && bytes[next] == b',' {
            let (chv, n2) = parse_number_default(s, next + 1, 0)?;
            st.channel = chv;
            next = n2;
        }
        events.push(Event::new(
            st.tick,
            EventPayload::Module {
                module: st.module,
                channel: st.channel,
            },
        ));
        Ok(next)
    }

    /// `@` commands, dispatched on the alphabetic word after the `@`:
    /// `@v` fine volume, `@q` gate override, `@p` pan, `@mask`, `@@`
    /// timbre table, a numeric `@N` program change, or any other word as
    /// a free-form control with its raw argument tail.
    fn parse_at(
        &self,
        s: &str,
        i: usize,
        st: &mut ParseState,
        events: &mut Vec<Event>,
    ) -> Result<usize, ParseError> {
        let bytes = s.as_bytes();
        if i + 1 < bytes.len() && bytes[i + 1] == b'@' {
            let (cmd, next) = parse_word_token(s, i);
            let (val, mut n2) = parse_signed_number_default(s, next, 0)?;
            let mut step = 1;
            let mut values = vec![val];
            if n2 < bytes.len() && bytes[n2] == b',' {
                let (v2, n3) = parse_number_default(s, n2 + 1, 1)?;
                step = v2;
                values.push(v2);
                n2 = n3;
            }
            events.push(Event::new(
                st.tick,
                EventPayload::TableEnv {
                    command: cmd,
                    value: val,
                    delay: step,
                    values,
                },
            ));
            return Ok(n2);
        }

        let mut word_end = i + 1;
        while word_end < bytes.len() && bytes[word_end].is_ascii_alphabetic() && word_end - i <= 7 {
            word_end += 1;
        }
        let word = s[i + 1..word_end].to_ascii_lowercase();

        match word.as_str() {
            "v" => {
                let (val, mut next) = parse_number_default(s, i + 2, st.fine_vol)?;
                let mut values = vec![val];
                while next < bytes.len() && bytes[next] == b',' {
                    let (arg, n2) = parse_number_default(s, next + 1, 0)?;
                    values.push(arg);
                    next = n2;
                }
                st.fine_vol = val;
                events.push(Event::new(
                    st.tick,
                    EventPayload::FineVolume { value: val, values },
                ));
                Ok(next)
            }
            "q" => {
                let (off, mut next) = parse_number_default(s, i + 2, st.key_off_tick as i32)?;
                let mut converted_off = convert_quarter192_to_ticks(off as i64, st.resolution);
                if converted_off <= 0 {
                    converted_off = -1;
                }
                st.key_off_tick = converted_off;
                st.key_on_delay = 0;
                if next < bytes.len() && bytes[next] == b',' {
                    let (delay, n2) = parse_number_default(s, next + 1, 0)?;
                    st.key_on_delay = convert_quarter192_to_ticks(delay as i64, st.resolution);
                    next = n2;
                }
                events.push(Event::new(
                    st.tick,
                    EventPayload::KeyOnDelay {
                        gate_tick: st.key_off_tick,
                        delay: st.key_on_delay,
                    },
                ));
                Ok(next)
            }
            "p" => {
                let (val, next) = parse_signed_number_default(s, i + 2, st.pan)?;
                st.pan = normalize_pan_value(val);
                events.push(Event::new(st.tick, EventPayload::Pan { value: st.pan }));
                Ok(next)
            }
            "mask" => {
                let (val, next) = parse_number_default(s, i + 5, 0)?;
                events.push(Event::new(
                    st.tick,
                    EventPayload::control("@mask", clamp(val, 0, 63)),
                ));
                Ok(next)
            }
            "" => {
                let (val, mut next) = parse_number_default(s, i + 1, st.program)?;
                st.program = val;
                let mut args = Vec::new();
                while next < bytes.len() && bytes[next] == b',' {
                    let Ok((arg, n2)) = parse_number_default(s, next + 1, 0) else {
                        break;
                    };
                    args.push(arg);
                    next = n2;
                }
                events.push(Event::new(
                    st.tick,
                    EventPayload::Program { value: val, values: args },
                ));
                Ok(next)
            }
            _ => {
                let (first, next) = match parse_signed_number_default(s, word_end, 0) {
                    Ok((v, n)) => (v, n),
                    Err(_) => (0, word_end),
                };
                let (text, next) = take_argument_tail(s, next);
                events.push(Event::new(
                    st.tick,
                    EventPayload::Control {
                        command: format!("@{word}"),
                        value: first,
                        values: Vec::new(),
                        text,
                    },
                ));
                Ok(next)
            }
        }
    }
}

// --- parse state ---------------------------------------------------------

struct ParseState {
    resolution: i32,
    tick: i64,
    octave: i32,
    default_len: i64,
    bpm: f64,
    volume: i32,
    fine_vol: i32,
    expression: i32,
    quant_max: i32,
    quant_value: i32,
    gate_percent: i32,
    key_off_tick: i64,
    key_on_delay: i64,
    slur_mode: SlurMode,
    transpose: i32,
    detune: i32,
    pan: i32,
    program: i32,
    module: i32,
    channel: i32,
    rev_volume: bool,
    key_sig: [i32; 7],
    vmode: String,
    v_scale_mode: i32,
    v_scale_max: i32,
    x_scale_mode: i32,
}

impl ParseState {
    fn new(cfg: &ParserConfig, opts: &ParserOptions, defs: &Definitions) -> Self {
        let quant_max = if opts.quant_max > 0 { opts.quant_max } else { 8 };
        let mut quant_value = ((quant_max as i64 * 3) / 4) as i32;
        if quant_value <= 0 {
            quant_value = quant_max;
        }
        Self {
            resolution: cfg.resolution,
            tick: 0,
            octave: cfg.default_octave,
            default_len: (cfg.resolution / cfg.default_l_value) as i64,
            bpm: cfg.default_bpm,
            volume: cfg.default_volume,
            fine_vol: cfg.default_fine_vol,
            expression: 128,
            quant_max,
            quant_value,
            gate_percent: ((quant_value as i64 * 100) / quant_max as i64) as i32,
            key_off_tick: -1,
            key_on_delay: 0,
            slur_mode: SlurMode::None,
            transpose: 0,
            detune: 0,
            pan: 0,
            program: 0,
            module: 0,
            channel: 0,
            rev_volume: is_volume_reversed(defs),
            key_sig: parse_key_signature(defs),
            vmode: defs
                .get("VMODE")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_default(),
            v_scale_mode: 0,
            v_scale_max: 16,
            x_scale_mode: 0,
        }
    }

    /// Build a Note payload from the current state, clamping the note
    /// number and applying the quantize gate and `@q` overrides.
    fn note_payload(&self, nn: i64, dur: i64) -> EventPayload {
        let nn = nn.clamp(0, 127) as i32;
        let vel = scaled_velocity(
            self.volume,
            self.expression,
            self.fine_vol,
            self.v_scale_mode,
            self.v_scale_max,
            self.x_scale_mode,
            &self.vmode,
        );
        let mut note_dur = gate_duration(dur, self.gate_percent);
        if self.key_off_tick > 0 {
            note_dur = (note_dur - self.key_off_tick - self.key_on_delay).max(0);
        }
        EventPayload::Note(NoteEvent {
            note: nn,
            velocity: vel,
            duration: note_dur,
            program: self.program,
            pan: self.pan,
            module: self.module,
            channel: self.channel,
            detune: self.detune,
            expr: self.expression,
            gate_tick: self.key_off_tick,
            delay: self.key_on_delay,
            slur: self.slur_mode,
        })
    }
}

struct ParserOptions {
    quant_max: i32,
    tempo: TempoMode,
}

/// How a raw `t` argument maps to BPM, per `#TMODE`.
#[derive(Clone, Copy, Debug, PartialEq)]
enum TempoMode {
    Bpm,
    /// `t raw` yields `raw / unit` BPM.
    Unit(i32),
    /// `t raw` is frames per beat: `fps * 60 / raw` BPM.
    Fps(i32),
}

impl TempoMode {
    fn apply(self, raw: i32) -> f64 {
        if raw <= 0 {
            return 120.0;
        }
        match self {
            TempoMode::Bpm => raw as f64,
            TempoMode::Unit(unit) => raw as f64 / unit.max(1) as f64,
            TempoMode::Fps(fps) => (fps.max(1) as f64 * 60.0) / raw as f64,
        }
    }
}

fn parse_tmode(defs: &Definitions) -> TempoMode {
    let Some(raw) = defs.get("TMODE") else {
        return TempoMode::Bpm;
    };
    let raw = raw.trim().to_ascii_lowercase();
    if let Some(v) = raw.strip_prefix("unit=") {
        if let Ok(unit) = v.trim().parse::<i32>() {
            if unit > 0 {
                return TempoMode::Unit(unit);
            }
        }
        return TempoMode::Bpm;
    }
    if let Some(v) = raw.strip_prefix("fps=") {
        if let Ok(fps) = v.trim().parse::<i32>() {
            if fps > 0 {
                return TempoMode::Fps(fps);
            }
        }
    }
    TempoMode::Bpm
}

fn parse_quant_max(defs: &Definitions) -> i32 {
    defs.get("QUANT")
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8)
}

// --- notes ---------------------------------------------------------------

fn note_base(b: u8) -> Option<i32> {
    match b {
        b'c' => Some(0),
        b'd' => Some(2),
        b'e' => Some(4),
        b'f' => Some(5),
        b'g' => Some(7),
        b'a' => Some(9),
        b'b' => Some(11),
        _ => None,
    }
}

fn letter_index(b: u8) -> Option<usize> {
    match b {
        b'c' => Some(0),
        b'd' => Some(1),
        b'e' => Some(2),
        b'f' => Some(3),
        b'g' => Some(4),
        b'a' => Some(5),
        b'b' => Some(6),
        _ => None,
    }
}

fn parse_note(s: &str, at: usize, st: &ParseState) -> Result<(EventPayload, i64, usize), ParseError> {
    let bytes = s.as_bytes();
    let letter = bytes[at].to_ascii_lowercase();
    let base = note_base(letter).unwrap_or(0);
    let mut i = at + 1;
    let mut shift = 0;
    let mut explicit_accidental = false;
    while i < bytes.len() {
        match bytes[i].to_ascii_lowercase() {
            b'#' | b'+' => {
                shift += 1;
                explicit_accidental = true;
                i += 1;
            }
            b'-' | b'b' => {
                shift -= 1;
                explicit_accidental = true;
                i += 1;
            }
            _ => break,
        }
    }
    if !explicit_accidental {
        if let Some(idx) = letter_index(letter) {
            shift += st.key_sig[idx];
        }
    }
    let (dur, next) = parse_length_with_tie(s, i, st)?;
    let nn = (st.octave * 12 + base + shift) as i64 + st.transpose as i64 + (st.detune / 64) as i64;
    Ok((st.note_payload(nn, dur), dur, next))
}

// --- lengths and numbers -------------------------------------------------

fn parse_length_with_tie(s: &str, at: usize, st: &ParseState) -> Result<(i64, usize), ParseError> {
    let (mut dur, mut i) = parse_length_token(s, at, st)?;
    let bytes = s.as_bytes();
    while i < bytes.len() && bytes[i].to_ascii_lowercase() == b'^' {
        let (extra, next) = parse_length_token(s, i + 1, st)?;
        dur += extra;
        i = next;
    }
    Ok((dur, i))
}

fn parse_length_token(s: &str, at: usize, st: &ParseState) -> Result<(i64, usize), ParseError> {
    let (val, mut i) = parse_number_optional(s, at)?;
    let base = match val {
        Some(v) if v > 0 => (st.resolution / v) as i64,
        _ => st.default_len,
    };
    let bytes = s.as_bytes();
    let mut dots = 0;
    while i < bytes.len() && bytes[i] == b'.' {
        dots += 1;
        i += 1;
    }
    let mut dur = base;
    let mut term = base;
    for _ in 0..dots {
        term >>= 1;
        dur += term;
    }
    Ok((dur, i))
}

fn parse_number_optional(s: &str, at: usize) -> Result<(Option<i32>, usize), ParseError> {
    let bytes = s.as_bytes();
    let mut i = at;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == at {
        return Ok((None, i));
    }
    let v = s[at..i]
        .parse::<i32>()
        .map_err(|_| ParseError::MalformedNumber(at))?;
    Ok((Some(v), i))
}

fn parse_number_default(s: &str, at: usize, default: i32) -> Result<(i32, usize), ParseError> {
    let (v, i) = parse_number_optional(s, at)?;
    Ok((v.unwrap_or(default), i))
}

fn parse_signed_number_default(
    s: &str,
    at: usize,
    default: i32,
) -> Result<(i32, usize), ParseError> {
    let bytes = s.as_bytes();
    if at >= bytes.len() {
        return Ok((default, at));
    }
    let mut i = at;
    let mut sign = 1;
    if bytes[i] == b'+' {
        i += 1;
    } else if bytes[i] == b'-' {
        sign = -1;
        i += 1;
    }
    let (v, next) = parse_number_optional(s, i)?;
    match v {
        Some(v) => Ok((sign * v, next)),
        None => Ok((default, next)),
    }
}

fn gate_duration(dur: i64, gate_percent: i32) -> i64 {
    if gate_percent <= 0 {
        return 0;
    }
    let gated = (dur * gate_percent as i64) / 100;
    if gated <= 0 && dur > 0 {
        1
    } else {
        gated
    }
}

/// `@q` arguments are in 1/192-note units.
fn convert_quarter192_to_ticks(v: i64, resolution: i32) -> i64 {
    if v < 0 {
        return v;
    }
    let resolution = if resolution > 0 { resolution } else { 1920 };
    (v * resolution as i64) / 192
}

/// Center is `@p0` in -64..64. Coarse legacy `p0..p8` values map onto
/// the same range so old scores keep their stereo placement.
fn normalize_pan_value(v: i32) -> i32 {
    if (0..=8).contains(&v) {
        return (v - 4) * 16;
    }
    clamp(v, -64, 64)
}

// --- velocity ------------------------------------------------------------

fn scaled_velocity(
    volume: i32,
    expression: i32,
    fine_vol: i32,
    v_scale_mode: i32,
    v_scale_max: i32,
    x_scale_mode: i32,
    vmode: &str,
) -> i32 {
    let vol_max = if v_scale_max > 0 { v_scale_max } else { 16 };
    let vol = clamp(volume, 0, 127);
    let expr = clamp(expression, 0, 128);
    let fine = clamp(fine_vol, 0, 128);
    let mut vol_norm = (vol as f64 / vol_max as f64).clamp(0.0, 1.0);
    vol_norm = match v_scale_mode {
        1 => db_scale(vol_norm, 96.0),
        2 => db_scale(vol_norm, 64.0),
        3 => db_scale(vol_norm, 48.0),
        4 => db_scale(vol_norm, 32.0),
        0 if vmode.contains("n88") => db_scale(vol_norm, 96.0),
        0 if vmode.contains("mdx") => db_scale(vol_norm, 64.0),
        0 if vmode.contains("mck") => db_scale(vol_norm, 48.0),
        0 if vmode.contains("tss") => db_scale(vol_norm, 32.0),
        _ => vol_norm,
    };
    let mut expr_norm = expr as f64 / 128.0;
    expr_norm = match x_scale_mode {
        1 => expr_norm.sqrt(),
        2 => expr_norm * expr_norm,
        3 => db_scale(expr_norm, 48.0),
        4 => db_scale(expr_norm, 32.0),
        _ => expr_norm,
    };
    let vel = vol_norm * expr_norm * (fine as f64 / 128.0) * 127.0;
    clamp(vel.round() as i32, 0, 127)
}

fn db_scale(norm: f64, db_range: f64) -> f64 {
    if norm <= 0.0 {
        return 0.0;
    }
    if norm >= 1.0 {
        return 1.0;
    }
    10f64.powf(-db_range * (1.0 - norm) / 20.0)
}

// --- key signatures ------------------------------------------------------

/// Build the implicit-accidental table from `#SIGN`. Accepts a named key
/// (`G`, `F#m`, `Bbm`, ...) or a per-note comma list (`f+,c+`).
fn parse_key_signature(defs: &Definitions) -> [i32; 7] {
    let mut out = [0i32; 7];
    let Some(raw) = defs.get("SIGN") else {
        return out;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return out;
    }
    let lower_raw = raw.to_ascii_lowercase();
    if lower_raw.contains(',') {
        for tok in lower_raw.split(',') {
            let tok = tok.trim();
            if tok.len() < 2 {
                continue;
            }
            let Some(idx) = letter_index(tok.as_bytes()[0]) else {
                continue;
            };
            out[idx] = match tok.as_bytes()[tok.len() - 1] {
                b'+' | b'#' => 1,
                b'-' | b'b' => -1,
                _ => 0,
            };
        }
        return out;
    }
    let key = lower_raw.replace('+', "#").replace(' ', "");
    let sharps: &[u8] = match key.as_str() {
        "c" | "am" => &[],
        "g" | "em" => b"f",
        "d" | "bm" => b"fc",
        "a" | "f#m" => b"fcg",
        "e" | "c#m" => b"fcgd",
        "b" | "g#m" => b"fcgda",
        "f#" | "d#m" => b"fcgdae",
        "c#" | "a#m" => b"fcgdaeb",
        _ => {
            let flats: &[u8] = match key.as_str() {
                "f" | "dm" => b"b",
                "bb" | "gm" => b"be",
                "eb" | "cm" => b"bea",
                "ab" | "fm" => b"bead",
                "db" | "bbm" => b"beadg",
                "gb" | "ebm" => b"beadgc",
                "cb" | "abm" => b"beadgcf",
                _ => &[],
            };
            for &n in flats {
                if let Some(idx) = letter_index(n) {
                    out[idx] = -1;
                }
            }
            return out;
        }
    };
    for &n in sharps {
        if let Some(idx) = letter_index(n) {
            out[idx] = 1;
        }
    }
    out
}

// --- track splitting -----------------------------------------------------

/// Split the preprocessed stream into per-track source strings. A first
/// section with no playable notes is a global prelude, prepended to
/// every track so shared tempo/patch setup applies everywhere.
fn split_sections_as_tracks(src: &str) -> Vec<String> {
    let sections: Vec<&str> = split_top_level(src, b';')
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if sections.is_empty() {
        return Vec::new();
    }

    let (global_prelude, start) = if sections.len() > 1 && !contains_playable_events(sections[0]) {
        (sections[0], 1)
    } else {
        ("", 0)
    };

    let mut parts = Vec::new();
    for section in &sections[start..] {
        for part in split_top_level(section, b',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if global_prelude.is_empty() {
                parts.push(part.to_string());
            } else {
                parts.push(format!("{global_prelude} {part}"));
            }
        }
    }
    if parts.is_empty() && !global_prelude.is_empty() {
        parts.push(global_prelude.to_string());
    }
    parts
}

fn split_top_level(src: &str, sep: u8) -> Vec<&str> {
    let bytes = src.as_bytes();
    let mut depth = 0i32;
    let mut start = 0;
    let mut parts = Vec::with_capacity(4);
    for i in 0..bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            b => {
                if b == sep && depth == 0 {
                    if sep == b',' && is_argument_comma(src, i) {
                        continue;
                    }
                    parts.push(&src[start..i]);
                    start = i + 1;
                }
            }
        }
    }
    parts.push(&src[start..]);
    parts
}

/// A comma whose next non-space character is a digit or sign belongs to
/// a command's argument list, not the track separator grammar.
fn is_argument_comma(src: &str, at: usize) -> bool {
    let bytes = src.as_bytes();
    if at >= bytes.len() || bytes[at] != b',' {
        return false;
    }
    for &b in &bytes[at + 1..] {
        if is_space(b) {
            continue;
        }
        return b.is_ascii_digit() || b == b'+' || b == b'-';
    }
    false
}

fn contains_playable_events(src: &str) -> bool {
    src.bytes().any(|b| {
        let lo = b.to_ascii_lowercase();
        note_base(lo).is_some() || lo == b'r'
    })
}

// --- loop expansion ------------------------------------------------------

/// Textually expand `[BODY]n` and `[PRE|POST]n` blocks.
fn expand_loops(src: &str) -> Result<String, ParseError> {
    let (out, _) = parse_expanded(src, 0, 0)?;
    Ok(out)
}

fn parse_expanded(src: &str, mut at: usize, depth: u32) -> Result<(String, usize), ParseError> {
    let bytes = src.as_bytes();
    let mut out = String::new();
    while at < bytes.len() {
        let ch = bytes[at];
        if ch == b']' {
            if depth == 0 {
                return Err(ParseError::UnmatchedLoopClose(at));
            }
            return Ok((out, at));
        }
        if ch != b'[' {
            out.push(ch as char);
            at += 1;
            continue;
        }
        let (body, next) = parse_loop_body(src, at + 1, depth + 1)?;
        out.push_str(&body);
        at = next;
    }
    if depth > 0 {
        return Err(ParseError::UnclosedLoop);
    }
    Ok((out, at))
}

fn parse_loop_body(src: &str, mut at: usize, depth: u32) -> Result<(String, usize), ParseError> {
    let bytes = src.as_bytes();
    let mut pre = String::new();
    let mut post = String::new();
    let mut break_hit = false;
    while at < bytes.len() {
        let ch = bytes[at];
        if ch == b'[' {
            let (body, next) = parse_loop_body(src, at + 1, depth + 1)?;
            if break_hit {
                post.push_str(&body);
            } else {
                pre.push_str(&body);
            }
            at = next;
            continue;
        }
        if ch == b'|' && depth == 1 {
            break_hit = true;
            at += 1;
            continue;
        }
        if ch == b']' {
            let (repeat, next) = parse_number_default(src, at + 1, 2)?;
            let repeat = repeat.max(1);
            let mut out = String::new();
            if break_hit {
                for _ in 0..repeat - 1 {
                    out.push_str(&pre);
                }
                out.push_str(&post);
            } else {
                for _ in 0..repeat {
                    out.push_str(&pre);
                }
            }
            return Ok((out, next));
        }
        if break_hit {
            post.push(ch as char);
        } else {
            pre.push(ch as char);
        }
        at += 1;
    }
    Err(ParseError::UnclosedLoop)
}

// --- misc ----------------------------------------------------------------

fn is_table_env_word(s: &str, i: usize) -> bool {
    const WORDS: [&str; 10] = [
        "_na", "_np", "_nt", "_nf", "_@@", "na", "np", "nt", "nf", "@@",
    ];
    WORDS.iter().any(|w| starts_with_word(s, i, w))
}

fn starts_with_word(src: &str, at: usize, word: &str) -> bool {
    let src = src.as_bytes();
    let word = word.as_bytes();
    if at + word.len() > src.len() {
        return false;
    }
    word.iter()
        .enumerate()
        .all(|(k, w)| src[at + k].to_ascii_lowercase() == w.to_ascii_lowercase())
}

/// A command word: letters plus `@` and `_` (for `_na`, `@@`, ...).
fn parse_word_token(src: &str, at: usize) -> (String, usize) {
    let bytes = src.as_bytes();
    let mut i = at;
    while i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'@' || bytes[i] == b'_')
    {
        i += 1;
    }
    (src[at..i].to_string(), i)
}

/// Consume a raw argument tail (commas, signs, digits, whitespace) and
/// return it trimmed.
fn take_argument_tail(s: &str, start: usize) -> (String, usize) {
    let bytes = s.as_bytes();
    let mut next = start;
    while next < bytes.len()
        && (bytes[next] == b','
            || bytes[next] == b'+'
            || bytes[next] == b'-'
            || bytes[next].is_ascii_digit()
            || is_space(bytes[next]))
    {
        next += 1;
    }
    (s[start..next].trim().to_string(), next)
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r' | b'\t')
}

fn clamp(v: i32, lo: i32, hi: i32) -> i32 {
    v.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Score {
        Parser::new(ParserConfig::default())
            .parse(src)
            .expect("parse failed")
    }

    fn note_numbers(tr: &Track) -> Vec<i32> {
        tr.events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Note(n) => Some(n.note),
                _ => None,
            })
            .collect()
    }

    fn first_note(tr: &Track) -> Option<NoteEvent> {
        tr.events.iter().find_map(|e| match &e.payload {
            EventPayload::Note(n) => Some(n.clone()),
            _ => None,
        })
    }

    #[test]
    fn basic_melody_emits_notes_and_tempo() {
        let score = parse("t140 o5 l8 cdefgab>c<c");
        let tr = &score.tracks[0];
        assert_eq!(
            tr.events[0].payload,
            EventPayload::Tempo { bpm: 140 },
        );
        let notes = note_numbers(tr);
        assert_eq!(notes.len(), 9);
        // >c<c round-trips to the starting pitch.
        assert_eq!(notes[0], 60);
        assert_eq!(notes[7], 72);
        assert_eq!(notes[8], 60);
        assert_eq!(notes.first(), notes.last());
    }

    #[test]
    fn events_are_tick_nondecreasing_and_end_tick_matches() {
        let score = parse("t120 o5 l8 [cde]4 r4 fg");
        for tr in &score.tracks {
            let mut last = 0;
            for ev in &tr.events {
                assert!(ev.tick >= last);
                last = ev.tick;
            }
            assert!(tr.end_tick >= last);
        }
    }

    #[test]
    fn note_by_number() {
        let score = parse("o5 l4 n60n64n67");
        assert_eq!(note_numbers(&score.tracks[0]), vec![60, 64, 67]);
    }

    #[test]
    fn guillemets_shift_two_octaves() {
        let score = parse("o5 «c »c c");
        assert_eq!(note_numbers(&score.tracks[0]), vec![36, 60, 60]);
    }

    #[test]
    fn octave_shift_clamps_to_range() {
        let score = parse("o0<<<<<<c, o9>>>>>>b");
        assert_eq!(note_numbers(&score.tracks[0]), vec![0]);
        assert_eq!(note_numbers(&score.tracks[1]), vec![119]);
    }

    #[test]
    fn default_quant_gates_three_quarters() {
        let score = parse("o5 l4 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.duration, 360); // 480 * 6/8
        assert_eq!(score.tracks[0].end_tick, 480);
    }

    #[test]
    fn quant_and_transpose() {
        let score = parse("#QUANT100; o4 l4 k2 q50 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.note, 48);
        assert_eq!(n.duration, 240);
        assert_eq!(score.tracks[0].end_tick, 480);
    }

    #[test]
    fn at_q_uses_192nd_note_units() {
        let score = parse("l4 @q48,12 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.gate_tick, 480);
        assert_eq!(n.delay, 120);
        // gated 360 - 480 - 120 clamps to zero.
        assert_eq!(n.duration, 0);
    }

    #[test]
    fn at_q_subtracts_from_gated_duration() {
        let score = parse("q8 @q24 l4 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.duration, 240);
    }

    #[test]
    fn at_q_zero_disables_gate_override() {
        let score = parse("l4 q8 @q0 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.gate_tick, -1);
        assert!(n.duration > 0);
    }

    #[test]
    fn dotted_and_tied_lengths() {
        let score = parse("q8 l4 c. c4^8");
        let tr = &score.tracks[0];
        let notes: Vec<i64> = tr
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Note(n) => Some(n.duration),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![720, 720]);
        assert_eq!(tr.end_tick, 1440);
    }

    #[test]
    fn loop_alternate_expansion() {
        let score = parse("o4 l8 [cdef|gab]2");
        // PRE once (repeat-1) then POST once: cdefgab.
        assert_eq!(note_numbers(&score.tracks[0]).len(), 7);
    }

    #[test]
    fn loop_default_repeat_is_two() {
        let score = parse("o4 l8 [ce]");
        assert_eq!(note_numbers(&score.tracks[0]).len(), 4);
    }

    #[test]
    fn dollar_records_loop_point() {
        let score = parse("l8 cdef$gab");
        let tr = &score.tracks[0];
        assert_eq!(tr.loop_tick, 4 * 240);
        assert_eq!(tr.loop_index, 4);
        assert!(tr.loops());
    }

    #[test]
    fn sectioned_tracks_with_global_prelude() {
        let score = parse("t111; o5 l4 c, o5 l4 e; o4 l4 g;");
        assert_eq!(score.tracks.len(), 3);
        for tr in &score.tracks {
            assert_eq!(tr.events[0].payload, EventPayload::Tempo { bpm: 111 });
        }
    }

    #[test]
    fn four_tracks_from_two_sections() {
        let score = parse("o5a,o5b;o5c,o5d");
        assert_eq!(score.tracks.len(), 4);
    }

    #[test]
    fn program_pan_and_multitrack() {
        let score = parse("o4 p-50 @3 c, o5 c");
        assert_eq!(score.tracks.len(), 2);
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.program, 3);
        assert_eq!(n.pan, -50);
    }

    #[test]
    fn coarse_pan_values_map_to_signed_range() {
        let score = parse("p0 c p8 c");
        let pans: Vec<i32> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Pan { value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(pans, vec![-64, 64]);
    }

    #[test]
    fn sign_applies_implicit_accidentals() {
        let score = parse("#SIGN{G}; o4 l4 f f+");
        assert_eq!(note_numbers(&score.tracks[0]), vec![54, 54]);
    }

    #[test]
    fn sign_plus_alias_and_minor_keys() {
        let score = parse("#SIGN{F+m}; o4 l4 f");
        assert_eq!(note_numbers(&score.tracks[0]), vec![54]);
    }

    #[test]
    fn sign_comma_list() {
        let score = parse("#SIGN{f+,c+}; o4 l4 f c");
        assert_eq!(note_numbers(&score.tracks[0]), vec![54, 49]);
    }

    #[test]
    fn volume_shift_and_rev_volume() {
        let score = parse("v10(2)c");
        let vols: Vec<i32> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Volume { value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(vols[0], 10);
        assert_eq!(vols[1], 12);

        let score = parse("#REV{volume}; v10(2)c");
        let vols: Vec<i32> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Volume { value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(vols[1], 8);
    }

    #[test]
    fn rev_octave_swaps_markers() {
        let score = parse("#REV; o4<c; #END; o4c;");
        assert_eq!(note_numbers(&score.tracks[0]), vec![60]);
    }

    #[test]
    fn macro_expansion_with_transpose() {
        let score = parse("#A=c; o5 A(2);");
        assert_eq!(note_numbers(&score.tracks[0]), vec![62]);
    }

    #[test]
    fn macro_static_vs_dynamic() {
        let s = parse("#MACRO{static}; #A=cde; #B=Afg; B; #A=gfe; B;");
        let d = parse("#MACRO{dynamic}; #A=cde; #B=Afg; B; #A=gfe; B;");
        assert_eq!(note_numbers(&s.tracks[1])[0], 60);
        assert_eq!(note_numbers(&d.tracks[1])[0], 67);
    }

    #[test]
    fn macro_range_and_append() {
        let score = parse("#A-C=c; #AB+=d; l8ABCD");
        assert_eq!(note_numbers(&score.tracks[0]).len(), 6);
    }

    #[test]
    fn tmode_unit_tempo() {
        let score = parse("#TMODE{unit=100}; t13755 o5 c;");
        let EventPayload::Tempo { bpm } = score.tracks[0].events[0].payload else {
            panic!("expected tempo event");
        };
        assert!((137..=138).contains(&bpm));
    }

    #[test]
    fn tmode_fps_tempo() {
        let score = parse("#TMODE{fps=60}; t30 o5 c;");
        let EventPayload::Tempo { bpm } = score.tracks[0].events[0].payload else {
            panic!("expected tempo event");
        };
        assert_eq!(bpm, 120);
    }

    #[test]
    fn slur_flags_attach_to_next_note() {
        let score = parse("o5 l8 c&d&&e");
        let slurs: Vec<SlurMode> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Note(n) => Some(n.slur),
                _ => None,
            })
            .collect();
        assert_eq!(slurs, vec![SlurMode::None, SlurMode::Normal, SlurMode::Weak]);
    }

    #[test]
    fn percent_v_scale_max_shift() {
        let score = parse("%v0,4 o5 c");
        let found = score.tracks[0].events.iter().any(|e| {
            matches!(
                &e.payload,
                EventPayload::Control { command, values, .. }
                    if command == "%v" && values.get(1) == Some(&16)
            )
        });
        assert!(found);
    }

    #[test]
    fn percent_triggers_capture_all_args() {
        let score = parse("%f1,2 %t3,4,5 %e6 o5 c");
        let mut cmds = std::collections::BTreeMap::new();
        for e in &score.tracks[0].events {
            if let EventPayload::Control { command, values, .. } = &e.payload {
                cmds.insert(command.clone(), values.clone());
            }
        }
        assert_eq!(cmds["%f"], vec![1, 2]);
        assert_eq!(cmds["%t"], vec![3, 4, 5]);
        assert_eq!(cmds["%e"], vec![6]);
    }

    #[test]
    fn s_command_keeps_both_args() {
        let score = parse("s32,-128 o5 c");
        let found = score.tracks[0].events.iter().any(|e| {
            matches!(
                &e.payload,
                EventPayload::Control { command, values, .. }
                    if command == "s" && values == &vec![32, -128]
            )
        });
        assert!(found);
    }

    #[test]
    fn module_and_channel_selection() {
        let score = parse("%2,1 o5 c");
        let n = first_note(&score.tracks[0]).unwrap();
        assert_eq!(n.module, 2);
        assert_eq!(n.channel, 1);
    }

    #[test]
    fn unknown_at_command_captures_tail() {
        let score = parse("@xyz1,2,3 o5 c");
        let found = score.tracks[0].events.iter().any(|e| {
            matches!(
                &e.payload,
                EventPayload::Control { command, value, text, .. }
                    if command == "@xyz" && *value == 1 && text == ",2,3"
            )
        });
        assert!(found);
    }

    #[test]
    fn at_ph_and_at_f_are_controls() {
        let score = parse("@ph8 @f100,2,10,20,30,40,110,90,80,0 o5 c");
        let cmds: Vec<String> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Control { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect();
        assert!(cmds.contains(&"@ph".to_string()));
        assert!(cmds.contains(&"@f".to_string()));
    }

    #[test]
    fn table_env_words_emit_events() {
        let score = parse("na1 np2,3 _nt4 @@5 _@@6 o5 c");
        let cmds: Vec<(String, i32, i32)> = score.tracks[0]
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::TableEnv {
                    command,
                    value,
                    delay,
                    ..
                } => Some((command.clone(), *value, *delay)),
                _ => None,
            })
            .collect();
        assert_eq!(cmds[0], ("na".to_string(), 1, 1));
        assert_eq!(cmds[1], ("np".to_string(), 2, 3));
        assert_eq!(cmds[2], ("_nt".to_string(), 4, 1));
        assert_eq!(cmds[3], ("@@".to_string(), 5, 1));
        assert_eq!(cmds[4], ("_@@".to_string(), 6, 1));
    }

    #[test]
    fn compile_is_deterministic() {
        let src = "#TITLE{x}; t150 o5 l16 [c+d-ef|gab]3 $ @q12,4 mp8,16,32,64 cde";
        let a = parse(src);
        let b = parse(src);
        assert_eq!(a, b);
    }

    #[test]
    fn comments_are_stripped() {
        let score = parse("t120 /* intro */ o5 l4 c // first\n d;");
        assert_eq!(note_numbers(&score.tracks[0]).len(), 2);
    }
}
