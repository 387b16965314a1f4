//! Fractional-tick scheduler walking per-track event cursors.

use std::collections::BTreeMap;
use std::sync::Arc;

use mml_ir::{parse_table_definitions, Definitions, Event, EventPayload, NoteEvent, Score,
    SlurMode, TableData};

use crate::voice_engine::VoiceEngine;

/// Lifecycle notifications emitted from the render path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerEvent {
    LoopCompleted,
    PlaybackEnded,
}

/// `%t`/`%e` trigger payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerEvent {
    pub trigger_id: i32,
    pub note_on_type: i32,
    pub note_off_type: i32,
}

pub struct SequencerOptions {
    pub loop_whole_score: bool,
    pub on_event: Option<Box<dyn FnMut(SequencerEvent) + Send>>,
    pub on_trigger: Option<Box<dyn FnMut(TriggerEvent) + Send>>,
    /// Frames rendered after the last voice ends; 0 = half a second.
    pub release_tail_frames: i32,
    /// Master shift applied to all notes, in octaves.
    pub master_transpose: i32,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            loop_whole_score: false,
            on_event: None,
            on_trigger: None,
            release_tail_frames: 0,
            master_transpose: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TrackCursor {
    index: usize,
    loop_index: i64,
    loop_tick: i64,
    end_tick: i64,
    loop_cycle: i64,
}

#[derive(Clone, Copy, Debug, Default)]
struct NoteOff {
    tick: i64,
    voice: i32,
    fired: bool,
}

/// Table-envelope cursor families. The release-prefixed variants are
/// armed by `_na`-style commands and reuse the same slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TableKind {
    Amp,
    Pitch,
    Pan,
    Filter,
    Timbre,
    RelAmp,
    RelPitch,
    RelPan,
    RelFilter,
    RelTimbre,
}

const TABLE_KINDS: usize = 10;

#[derive(Clone, Copy, Debug, Default)]
struct TableCursor {
    active: bool,
    start: i64,
    rate: i32,
}

/// `@f co,res,ar,dr,sr,rr,co2,co3,sc,rc`: four-stage piecewise-linear
/// cutoff automation. A zero rate jumps straight to the stage target.
#[derive(Clone, Copy, Debug, Default)]
struct FilterEnvelope {
    co: i32,
    ar: i32,
    dr: i32,
    sr: i32,
    rr: i32,
    co2: i32,
    co3: i32,
    sc: i32,
    rc: i32,
    state: i32,
    frame: i32,
    current: i32,
}

impl FilterEnvelope {
    fn step(&mut self) -> i32 {
        match self.state {
            0 => {
                if self.ar <= 0 {
                    self.current = self.co2;
                    self.state = 1;
                    self.frame = 0;
                } else {
                    self.current = lerp_step(self.co, self.co2, self.frame, self.ar);
                    self.frame += 1;
                    if self.frame >= self.ar {
                        self.current = self.co2;
                        self.state = 1;
                        self.frame = 0;
                    }
                }
            }
            1 => {
                if self.dr <= 0 {
                    self.current = self.co3;
                    self.state = 2;
                    self.frame = 0;
                } else {
                    self.current = lerp_step(self.co2, self.co3, self.frame, self.dr);
                    self.frame += 1;
                    if self.frame >= self.dr {
                        self.current = self.co3;
                        self.state = 2;
                        self.frame = 0;
                    }
                }
            }
            2 => {
                if self.sr <= 0 {
                    self.current = self.sc;
                } else {
                    self.current = lerp_step(self.co3, self.sc, self.frame, self.sr);
                    self.frame += 1;
                    if self.frame >= self.sr {
                        self.current = self.sc;
                    }
                }
            }
            _ => {
                if self.rr <= 0 {
                    self.current = self.rc;
                } else {
                    let start = self.current;
                    self.current = lerp_step(start, self.rc, self.frame, self.rr);
                    self.frame += 1;
                    if self.frame >= self.rr {
                        self.current = self.rc;
                    }
                }
            }
        }
        self.current.clamp(0, 128)
    }
}

/// Integer interpolation from `from` toward `to`, `frame` of `rate`
/// steps in. Widened so hostile rates cannot overflow.
fn lerp_step(from: i32, to: i32, frame: i32, rate: i32) -> i32 {
    (from as i64 + ((to - from) as i64 * frame as i64) / rate as i64) as i32
}

/// Mutable per-track state rebuilt on every whole-score loop reset.
#[derive(Clone, Debug)]
struct RuntimeState {
    volume: i32,
    fine_volume: i32,
    expression: i32,
    v_scale_mode: i32,
    v_scale_max: i32,
    x_scale_mode: i32,
    pan: i32,
    program: i32,
    module: i32,
    channel: i32,
    transpose: i32,
    detune: i32,
    filter_cut: i32,
    filter_env: FilterEnvelope,
    filter_env_on: bool,
    phase: i32,
    portamento: i32,
    lfo_rate: i32,
    lfo_depth: i32,
    lfo_wave: i32,
    mod_pitch: i32,
    mod_amp: i32,
    mod_pan: i32,
    mod_filter: i32,
    tables: [TableCursor; TABLE_KINDS],
    mask: i32,
    last_voice: i32,
    last_note: i32,
    mp_end: i32,
    mp_delay: i32,
    mp_change: i32,
    ma_end: i32,
    ma_delay: i32,
    ma_change: i32,
    mf_end: i32,
    fps_rate: i32,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            volume: 16,
            fine_volume: 127,
            expression: 128,
            v_scale_mode: 0,
            v_scale_max: 16,
            x_scale_mode: 0,
            pan: 0,
            program: 0,
            module: 0,
            channel: 0,
            transpose: 0,
            detune: 0,
            filter_cut: 128,
            filter_env: FilterEnvelope::default(),
            filter_env_on: false,
            phase: 0,
            portamento: 0,
            lfo_rate: 0,
            lfo_depth: 0,
            lfo_wave: 0,
            mod_pitch: 0,
            mod_amp: 0,
            mod_pan: 0,
            mod_filter: 0,
            tables: [TableCursor::default(); TABLE_KINDS],
            mask: 0,
            last_voice: -1,
            last_note: 0,
            mp_end: 0,
            mp_delay: 0,
            mp_change: 0,
            ma_end: 0,
            ma_delay: 0,
            ma_change: 0,
            mf_end: 0,
            fps_rate: 0,
        }
    }
}

/// `mp`/`ma`/`mf` argument sets attached to an `#OPM@n{...}` suffix,
/// re-applied whenever that program is selected.
#[derive(Clone, Debug, Default)]
struct PatchMod {
    mp_args: Vec<i32>,
    ma_args: Vec<i32>,
    mf_args: Vec<i32>,
}

pub struct Sequencer {
    score: Arc<Score>,
    engine: Box<dyn VoiceEngine>,
    sample_rate: i32,
    ticks_per_samp: f64,
    initial_ticks_per_samp: f64,
    tick_frac: f64,
    tick_int: i64,
    track_state: Vec<TrackCursor>,
    track_runtime: Vec<RuntimeState>,
    table_defs: BTreeMap<i32, TableData>,
    note_offs: Vec<NoteOff>,
    loop_whole_score: bool,
    pending_reset: bool,
    on_event: Option<Box<dyn FnMut(SequencerEvent) + Send>>,
    on_trigger: Option<Box<dyn FnMut(TriggerEvent) + Send>>,
    playback_ended_fired: bool,
    /// Score done and note-offs drained; waiting out the release tail.
    command_exhausted: bool,
    release_tail_frames: i32,
    /// Loop end reached; waiting for silence before the cursor reset.
    loop_pending: bool,
    loop_tail_countdown: i32,
    master_transpose: i32,
    patch_mods: BTreeMap<i32, PatchMod>,
    score_fps: i32,
}

impl Sequencer {
    pub fn new(score: Arc<Score>, engine: Box<dyn VoiceEngine>, sample_rate: i32) -> Self {
        Self::with_options(score, engine, sample_rate, SequencerOptions::default())
    }

    pub fn with_options(
        score: Arc<Score>,
        engine: Box<dyn VoiceEngine>,
        sample_rate: i32,
        opts: SequencerOptions,
    ) -> Self {
        let tail_frames = if opts.release_tail_frames > 0 {
            opts.release_tail_frames
        } else {
            sample_rate / 2
        };
        let bpm = if score.initial_bpm > 0.0 {
            score.initial_bpm
        } else {
            120.0
        };
        let ticks_per_samp = (bpm * score.resolution as f64) / (240.0 * sample_rate as f64);
        let track_count = score.tracks.len();
        let track_state = score
            .tracks
            .iter()
            .map(|tr| TrackCursor {
                index: 0,
                loop_index: tr.loop_index,
                loop_tick: tr.loop_tick,
                end_tick: tr.end_tick,
                loop_cycle: 0,
            })
            .collect();
        let table_defs = parse_table_definitions(&score.definitions);
        let patch_mods = parse_patch_mods(&score.definitions);
        let score_fps = score
            .definitions
            .get("FPS")
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(0);
        Self {
            score,
            engine,
            sample_rate,
            ticks_per_samp,
            initial_ticks_per_samp: ticks_per_samp,
            tick_frac: 0.0,
            tick_int: 0,
            track_state,
            track_runtime: vec![RuntimeState::default(); track_count],
            table_defs,
            note_offs: Vec::with_capacity(64),
            loop_whole_score: opts.loop_whole_score,
            pending_reset: false,
            on_event: opts.on_event,
            on_trigger: opts.on_trigger,
            playback_ended_fired: false,
            command_exhausted: false,
            release_tail_frames: tail_frames,
            loop_pending: false,
            loop_tail_countdown: 0,
            master_transpose: opts.master_transpose * 12,
            patch_mods,
            score_fps,
        }
    }

    pub fn engine_mut(&mut self) -> &mut dyn VoiceEngine {
        self.engine.as_mut()
    }

    /// Render interleaved stereo frames into `dst`, dispatching any
    /// events whose tick falls inside the rendered span.
    pub fn process(&mut self, dst: &mut [f32]) {
        let frames = dst.len() / 2;
        for f in 0..frames {
            self.tick_frac += self.ticks_per_samp;
            let next_tick = self.tick_frac as i64;
            while self.tick_int <= next_tick {
                self.dispatch_tick(self.tick_int);
                self.tick_int += 1;
            }
            if self.pending_reset {
                self.reset_for_whole_score_loop();
            }
            let (l, r) = self.engine.render_frame();
            dst[f * 2] = l;
            dst[f * 2 + 1] = r;
            if self.loop_pending && self.engine.active_voice_count() == 0 {
                if self.loop_tail_countdown <= 0 {
                    self.loop_pending = false;
                    self.pending_reset = true;
                    if let Some(cb) = self.on_event.as_mut() {
                        cb(SequencerEvent::LoopCompleted);
                    }
                } else {
                    self.loop_tail_countdown -= 1;
                }
            }
            if self.command_exhausted
                && !self.playback_ended_fired
                && self.engine.active_voice_count() == 0
            {
                if self.release_tail_frames <= 0 {
                    self.playback_ended_fired = true;
                    if let Some(cb) = self.on_event.as_mut() {
                        cb(SequencerEvent::PlaybackEnded);
                    }
                } else {
                    self.release_tail_frames -= 1;
                }
            }
        }
    }

    pub fn playback_ended(&self) -> bool {
        self.playback_ended_fired
    }

    fn dispatch_tick(&mut self, tick: i64) {
        let score = self.score.clone();
        for trk in 0..self.track_state.len() {
            loop {
                let tc = self.track_state[trk];
                let events = &score.tracks[trk].events;
                let Some(ev) = events.get(tc.index) else { break };
                let effective = effective_tick(&tc, ev.tick);
                if effective > tick {
                    break;
                }
                let ev = ev.clone();
                self.apply_event(trk, &ev, effective, &tc);
                let tc = &mut self.track_state[trk];
                tc.index += 1;
                if tc.index >= events.len() && tc.loop_index >= 0 && tc.end_tick > tc.loop_tick {
                    tc.index = tc.loop_index as usize;
                    tc.loop_cycle += 1;
                }
            }
        }
        for off in &mut self.note_offs {
            if !off.fired && off.tick <= tick {
                self.engine.note_off(off.voice);
                off.fired = true;
            }
        }
        self.compact_note_offs();
        if self.note_offs.is_empty() && self.score_exhausted() {
            if self.loop_whole_score {
                if !self.loop_pending {
                    self.loop_pending = true;
                    self.loop_tail_countdown = self.release_tail_frames;
                }
            } else {
                self.command_exhausted = true;
            }
        }
    }

    fn score_exhausted(&self) -> bool {
        for (trk, tc) in self.track_state.iter().enumerate() {
            if tc.index < self.score.tracks[trk].events.len() {
                return false;
            }
            if tc.loop_index >= 0 && tc.end_tick > tc.loop_tick {
                return false;
            }
        }
        true
    }

    fn reset_for_whole_score_loop(&mut self) {
        self.pending_reset = false;
        self.loop_pending = false;
        self.tick_frac = 0.0;
        self.tick_int = 0;
        self.ticks_per_samp = self.initial_ticks_per_samp;
        self.note_offs.clear();
        for (trk, tc) in self.track_state.iter_mut().enumerate() {
            let tr = &self.score.tracks[trk];
            *tc = TrackCursor {
                index: 0,
                loop_index: tr.loop_index,
                loop_tick: tr.loop_tick,
                end_tick: tr.end_tick,
                loop_cycle: 0,
            };
        }
        for rt in &mut self.track_runtime {
            *rt = RuntimeState::default();
        }
    }

    fn apply_event(&mut self, trk: usize, ev: &Event, event_tick: i64, tc: &TrackCursor) {
        let module = self.track_runtime[trk].module;
        self.engine.set_current_module(module);
        match &ev.payload {
            EventPayload::Tempo { bpm } => {
                // Tempo ramps must not re-apply on loop repeats.
                if tc.loop_cycle > 0 && tc.loop_index >= 0 && ev.tick >= tc.loop_tick {
                    return;
                }
                self.ticks_per_samp = (*bpm as f64 * self.score.resolution as f64)
                    / (240.0 * self.sample_rate as f64);
            }
            EventPayload::Volume { value } => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x01 != 0 {
                    return;
                }
                rt.volume = *value;
            }
            EventPayload::FineVolume { value, .. } => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x01 != 0 {
                    return;
                }
                rt.fine_volume = *value;
            }
            EventPayload::Expression { value } => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x01 != 0 {
                    return;
                }
                rt.expression = *value;
            }
            EventPayload::Pan { value } => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x02 != 0 {
                    return;
                }
                rt.pan = *value;
            }
            EventPayload::Program { value, .. } => {
                self.apply_program(trk, *value);
            }
            EventPayload::Module { module, channel } => {
                let rt = &mut self.track_runtime[trk];
                rt.module = *module;
                rt.channel = *channel;
            }
            EventPayload::Quantize { .. } => {
                // Gate time was already folded into note durations at
                // parse time; the event only participates in masking.
            }
            EventPayload::KeyOnDelay { .. } => {
                // The parser attaches gate/delay overrides to each note
                // event directly.
            }
            EventPayload::Transpose { value } => {
                self.track_runtime[trk].transpose = *value;
            }
            EventPayload::Detune { value } => {
                self.track_runtime[trk].detune = *value;
            }
            EventPayload::Slur { .. } => {
                // Notes carry their own slur flag.
            }
            EventPayload::TableEnv {
                command,
                value,
                delay,
                ..
            } => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x10 != 0 {
                    return;
                }
                apply_table_env(rt, command, *value, *delay, ev.tick);
            }
            EventPayload::Control {
                command,
                value,
                values,
                text,
            } => {
                self.apply_control(trk, command, *value, values, text);
            }
            EventPayload::Rest { .. } => {}
            EventPayload::Note(note) => {
                self.apply_note(trk, note, event_tick);
            }
        }
    }

    fn apply_program(&mut self, trk: usize, program: i32) {
        let rt = &mut self.track_runtime[trk];
        rt.program = program;
        if let Some(pm) = self.patch_mods.get(&program) {
            if !pm.mp_args.is_empty() {
                rt.mod_pitch = pm.mp_args[0];
                if pm.mp_args.len() >= 2 {
                    rt.mp_end = pm.mp_args[1];
                    rt.lfo_depth = pm.mp_args[1].abs();
                }
                if pm.mp_args.len() >= 3 {
                    rt.mp_delay = pm.mp_args[2];
                }
                if pm.mp_args.len() >= 4 {
                    rt.mp_change = pm.mp_args[3];
                }
            }
            if !pm.ma_args.is_empty() {
                rt.mod_amp = pm.ma_args[0];
                if pm.ma_args.len() >= 2 {
                    rt.ma_end = pm.ma_args[1];
                }
                if pm.ma_args.len() >= 3 {
                    rt.ma_delay = pm.ma_args[2];
                }
                if pm.ma_args.len() >= 4 {
                    rt.ma_change = pm.ma_args[3];
                }
            }
            if !pm.mf_args.is_empty() {
                rt.mod_filter = pm.mf_args[0];
                if pm.mf_args.len() >= 2 {
                    rt.mf_end = pm.mf_args[1];
                }
            }
            self.update_engine_lfo(trk);
        }
    }

    fn apply_control(&mut self, trk: usize, command: &str, value: i32, values: &[i32], text: &str) {
        let cmd = command.trim().to_ascii_lowercase();
        match cmd.as_str() {
            "@mask" => self.track_runtime[trk].mask = value.clamp(0, 63),
            "%v" => {
                let rt = &mut self.track_runtime[trk];
                rt.v_scale_mode = value;
                if values.len() > 1 && values[1] > 0 {
                    rt.v_scale_max = values[1];
                }
            }
            "%x" => self.track_runtime[trk].x_scale_mode = value,
            "%f" => {
                if (0..=2).contains(&value) {
                    self.engine.set_filter_type(value);
                }
            }
            "%t" => {
                if let Some(cb) = self.on_trigger.as_mut() {
                    let mut te = TriggerEvent {
                        trigger_id: value,
                        ..TriggerEvent::default()
                    };
                    if values.len() >= 2 {
                        te.note_on_type = values[1];
                    }
                    if values.len() >= 3 {
                        te.note_off_type = values[2];
                    }
                    cb(te);
                }
            }
            "%e" => {
                if let Some(cb) = self.on_trigger.as_mut() {
                    let mut te = TriggerEvent {
                        trigger_id: value,
                        ..TriggerEvent::default()
                    };
                    if values.len() >= 2 {
                        te.note_on_type = values[1];
                    }
                    cb(te);
                }
            }
            "po" => self.track_runtime[trk].portamento = value,
            "*" => {
                // Pitch slide toward the next note; bare * uses 50ms.
                self.track_runtime[trk].portamento = if value > 0 { value } else { 50 };
            }
            "@ph" => self.track_runtime[trk].phase = value,
            "@f" => {
                let rt = &mut self.track_runtime[trk];
                if rt.mask & 0x20 != 0 {
                    return;
                }
                rt.filter_cut = value;
                let args = parse_csv(text);
                // co, res, ar, dr, sr, rr, co2, co3, sc, rc
                if args.len() >= 2 {
                    let mut fe = FilterEnvelope {
                        co: value,
                        current: value,
                        co2: value,
                        co3: value,
                        sc: value,
                        ..FilterEnvelope::default()
                    };
                    if args.len() >= 2 {
                        fe.ar = args[1];
                    }
                    if args.len() >= 3 {
                        fe.dr = args[2];
                    }
                    if args.len() >= 4 {
                        fe.sr = args[3];
                    }
                    if args.len() >= 5 {
                        fe.rr = args[4];
                    }
                    if args.len() >= 6 {
                        fe.co2 = args[5];
                    }
                    if args.len() >= 7 {
                        fe.co3 = args[6];
                    }
                    if args.len() >= 8 {
                        fe.sc = args[7];
                    }
                    if args.len() >= 9 {
                        fe.rc = args[8];
                    }
                    rt.filter_env = fe;
                    rt.filter_env_on = true;
                }
            }
            "@lfo" => {
                {
                    let rt = &mut self.track_runtime[trk];
                    if rt.mask & 0x20 != 0 {
                        return;
                    }
                    rt.lfo_wave = value;
                    let args = parse_csv(text);
                    if let Some(rate) = args.first() {
                        rt.lfo_rate = *rate;
                    }
                }
                self.update_engine_lfo(trk);
            }
            "mp" => {
                {
                    let rt = &mut self.track_runtime[trk];
                    if rt.mask & 0x20 != 0 {
                        return;
                    }
                    rt.mod_pitch = value;
                    let args = parse_csv(text);
                    if !args.is_empty() {
                        rt.mp_end = args[0];
                        rt.lfo_depth = args[0].abs();
                    }
                    if args.len() >= 2 {
                        rt.mp_delay = args[1];
                    }
                    if args.len() >= 3 {
                        rt.mp_change = args[2];
                    }
                }
                self.update_engine_lfo(trk);
            }
            "ma" => {
                {
                    let rt = &mut self.track_runtime[trk];
                    if rt.mask & 0x20 != 0 {
                        return;
                    }
                    rt.mod_amp = value;
                    let args = parse_csv(text);
                    if !args.is_empty() {
                        rt.ma_end = args[0];
                    }
                    if args.len() >= 2 {
                        rt.ma_delay = args[1];
                    }
                    if args.len() >= 3 {
                        rt.ma_change = args[2];
                    }
                }
                self.update_engine_lfo(trk);
            }
            "mf" => {
                {
                    let rt = &mut self.track_runtime[trk];
                    if rt.mask & 0x20 != 0 {
                        return;
                    }
                    rt.mod_filter = value;
                    let args = parse_csv(text);
                    if !args.is_empty() {
                        rt.mf_end = args[0];
                    }
                }
                self.update_engine_lfo(trk);
            }
            "s" => {
                // Release shaping approximated as an amplitude bias;
                // only the first argument participates.
                if value > 0 {
                    self.track_runtime[trk].mod_amp = value;
                }
            }
            "@al" => {
                self.engine.set_operator_count(value);
                let args = parse_csv(text);
                if let Some(alg) = args.first() {
                    if *alg >= 0 {
                        self.engine.set_algorithm(*alg);
                    }
                }
            }
            "@fb" => self.engine.set_feedback(value as f64 / 7.0),
            "@fps" => {
                if value > 0 {
                    self.track_runtime[trk].fps_rate = value;
                }
            }
            _ => {}
        }
    }

    fn apply_note(&mut self, trk: usize, ev: &NoteEvent, event_tick: i64) {
        if ev.slur != SlurMode::None && self.track_runtime[trk].last_voice >= 0 {
            // Close the previous voice at the slur boundary so
            // polyphonic engines do not accumulate hanging notes.
            let prev = self.track_runtime[trk].last_voice;
            self.engine.note_off(prev);
            self.cancel_pending_note_off(prev);
        }

        let ctx = TableCtx {
            tables: &self.table_defs,
            resolution: self.score.resolution,
            score_fps: self.score_fps,
        };
        let rt = &self.track_runtime[trk];
        let mut vel = ev.velocity;
        if vel <= 0 {
            vel = scaled_velocity(
                rt.volume,
                rt.expression,
                rt.fine_volume,
                rt.v_scale_mode,
                rt.v_scale_max,
                rt.x_scale_mode,
            );
        }
        let mut note = ev.note as i64
            + rt.transpose as i64
            + (rt.detune / 64) as i64
            + self.master_transpose as i64;
        note += sample_table(&ctx, rt, TableKind::Pitch, 16, event_tick) as i64;
        note += sample_lfo(rt, event_tick) as i64;
        let note = note.clamp(0, 127) as i32;

        let mut pan = rt.pan;
        if rt.mask & 0x02 == 0 && ev.pan != 0 {
            pan = ev.pan;
        }
        let pan = (pan as i64 + sample_table(&ctx, rt, TableKind::Pan, 1, event_tick) as i64)
            .clamp(-64, 64) as i32;

        let mut program = ev.program;
        if program == 0 {
            program = rt.program;
        }
        // Pack module/channel (and the current cutoff) into the high
        // bits so composite engines can route without extra calls.
        // Each component is one byte wide on the wire.
        let mut program = (program & 0xFF) + ((rt.module & 0xFF) << 8) + ((rt.channel & 0xFF) << 16);

        let rt = &mut self.track_runtime[trk];
        let vel = apply_amp_controls(&ctx, rt, vel, event_tick);
        program += rt.filter_cut.clamp(0, 127) << 24;

        let phase = rt.phase;
        let portamento_frames = if rt.portamento > 0 && rt.last_voice >= 0 {
            (((rt.portamento as i64 * self.sample_rate as i64) / 1000).max(1)) as i32
        } else {
            0
        };
        let last_note = rt.last_note;
        self.engine.set_note_on_phase(phase);
        self.engine.set_portamento(last_note, portamento_frames);
        self.update_engine_lfo(trk);

        let voice_id = self.engine.note_on(note, vel, pan, program);
        let rt = &mut self.track_runtime[trk];
        rt.last_voice = voice_id;
        rt.last_note = note;

        let mut off_tick = event_tick + ev.duration;
        if ev.gate_tick >= 0 {
            off_tick = event_tick + ev.gate_tick;
        }
        if ev.delay > 0 {
            off_tick += ev.delay;
        }
        self.note_offs.push(NoteOff {
            tick: off_tick,
            voice: voice_id,
            fired: false,
        });
    }

    /// Push the current mp/ma/mf state to the engine.
    fn update_engine_lfo(&mut self, trk: usize) {
        let rt = &self.track_runtime[trk];
        let (mp_end, ma_end, mf_end) = (rt.mp_end, rt.ma_end, rt.mf_end);
        let (lfo_rate, lfo_wave) = (rt.lfo_rate, rt.lfo_wave);
        let rate_hz = self.lfo_rate_to_hz(lfo_rate);

        // Pitch depth arrives in 1/8-semitone units, amp in 1/16 units.
        if mp_end != 0 && lfo_rate > 0 {
            self.engine
                .set_pitch_lfo(mp_end as f64 / 8.0, rate_hz, lfo_wave);
        } else {
            self.engine.set_pitch_lfo(0.0, 0.0, 0);
        }
        if ma_end != 0 && lfo_rate > 0 {
            self.engine
                .set_amp_lfo(ma_end as f64 / 16.0, rate_hz, lfo_wave);
        } else {
            self.engine.set_amp_lfo(0.0, 0.0, 0);
        }
        if mf_end != 0 && lfo_rate > 0 {
            self.engine
                .set_filter_lfo(mf_end as f64 / 8.0, rate_hz, lfo_wave);
        } else {
            self.engine.set_filter_lfo(0.0, 0.0, 0);
        }
    }

    /// Convert the tick-based half-period rate to Hz at current tempo.
    fn lfo_rate_to_hz(&self, lfo_rate: i32) -> f64 {
        if lfo_rate <= 0 || self.ticks_per_samp <= 0.0 {
            return 0.0;
        }
        let ticks_per_sec = self.ticks_per_samp * self.sample_rate as f64;
        let period = (lfo_rate * 2) as f64 / ticks_per_sec;
        if period <= 0.0 {
            return 0.0;
        }
        1.0 / period
    }

    fn cancel_pending_note_off(&mut self, voice: i32) {
        for off in &mut self.note_offs {
            if off.voice == voice && !off.fired {
                off.fired = true;
            }
        }
    }

    /// Drop fired entries and keep the slice tick-sorted. New entries
    /// arrive nearly sorted, so an insertion sort beats a full sort.
    fn compact_note_offs(&mut self) {
        if self.note_offs.is_empty() {
            return;
        }
        self.note_offs.retain(|off| !off.fired);
        for i in 1..self.note_offs.len() {
            let key = self.note_offs[i];
            let mut k = i;
            while k > 0 && self.note_offs[k - 1].tick > key.tick {
                self.note_offs[k] = self.note_offs[k - 1];
                k -= 1;
            }
            self.note_offs[k] = key;
        }
    }
}

fn effective_tick(tc: &TrackCursor, source_tick: i64) -> i64 {
    if tc.loop_cycle == 0 || tc.loop_index < 0 || (tc.index as i64) < tc.loop_index {
        return source_tick;
    }
    source_tick + tc.loop_cycle * (tc.end_tick - tc.loop_tick)
}

// --- table envelopes -----------------------------------------------------

struct TableCtx<'a> {
    tables: &'a BTreeMap<i32, TableData>,
    resolution: i32,
    score_fps: i32,
}

fn apply_table_env(rt: &mut RuntimeState, command: &str, value: i32, delay: i32, tick: i64) {
    let cmd = command.trim().to_ascii_lowercase();
    let is_release = cmd.starts_with('_');
    let base = cmd.trim_start_matches('_').trim_start_matches('@');
    let kind = match (base, is_release) {
        ("na", false) => TableKind::Amp,
        ("nt", false) => TableKind::Pitch,
        ("np", false) => TableKind::Pan,
        ("nf", false) => TableKind::Filter,
        ("", false) | ("@", false) => TableKind::Timbre,
        ("na", true) => TableKind::RelAmp,
        ("nt", true) => TableKind::RelPitch,
        ("np", true) => TableKind::RelPan,
        ("nf", true) => TableKind::RelFilter,
        ("", true) | ("@", true) => TableKind::RelTimbre,
        _ => return,
    };
    rt.tables[kind as usize] = TableCursor {
        active: true,
        start: tick,
        rate: delay.max(1),
    };
    match base {
        "na" => rt.mod_amp = value,
        "nt" => rt.mod_pitch = value,
        "np" => rt.mod_pan = value,
        "nf" => rt.mod_filter = value,
        // The timbre table maps onto the generic modulation depth.
        _ => rt.mod_pitch = value,
    }
}

fn sample_table(ctx: &TableCtx, rt: &RuntimeState, kind: TableKind, scale: i32, tick: i64) -> i32 {
    let cursor = rt.tables[kind as usize];
    if !cursor.active {
        return 0;
    }
    let table_id = match kind {
        TableKind::Amp => rt.mod_amp,
        TableKind::Pitch => rt.mod_pitch,
        TableKind::Pan => rt.mod_pan,
        TableKind::Filter => rt.mod_filter,
        _ => 0,
    };
    let Some(td) = ctx.tables.get(&table_id) else {
        return 0;
    };
    if td.values.is_empty() {
        return 0;
    }
    let rate = cursor.rate.max(1) as i64;
    let fps = if rt.fps_rate > 0 {
        rt.fps_rate
    } else {
        ctx.score_fps
    };
    let ticks_per_frame = if fps > 0 {
        ((60.0 / fps as f64) * ctx.resolution as f64 / 4.0).max(1.0) as i64
    } else {
        (ctx.resolution / 4) as i64
    };
    let idx = if tick > cursor.start {
        (tick - cursor.start) / (ticks_per_frame * rate)
    } else {
        0
    };
    let len = td.values.len() as i64;
    let v = if idx < len {
        td.values[idx as usize]
    } else if td.loop_start >= 0 {
        let loop_start = td.loop_start as i64;
        let loop_len = len - loop_start;
        if loop_len <= 0 {
            td.values[td.values.len() - 1]
        } else {
            td.values[(loop_start + (idx - loop_start).rem_euclid(loop_len)) as usize]
        }
    } else {
        td.values[td.values.len() - 1]
    };
    if scale <= 0 {
        v
    } else {
        v / scale
    }
}

/// Continuous LFO waveform sampled at the tick clock for note-on pitch
/// offsets. Period = lfo_rate * 2 ticks.
fn sample_lfo(rt: &RuntimeState, tick: i64) -> i32 {
    if rt.lfo_depth == 0 || rt.lfo_rate <= 0 {
        return 0;
    }
    let mut depth = rt.lfo_depth;
    if rt.mp_change > 0 && tick > rt.mp_delay as i64 {
        let progress = (tick - rt.mp_delay as i64).clamp(0, rt.mp_change as i64) as i32;
        depth = lerp_step(rt.mod_pitch, rt.mp_end, progress, rt.mp_change);
    }
    let wave_val = tick_wave(rt.lfo_wave, rt.lfo_rate, tick);
    (wave_val * depth as f64 / 8.0) as i32
}

fn tick_wave(waveform: i32, lfo_rate: i32, tick: i64) -> f64 {
    let period = (lfo_rate * 2) as i64;
    let phase = (tick.rem_euclid(period)) as f64 / period as f64;
    match waveform {
        0 => 1.0 - 2.0 * phase,
        1 => {
            if phase < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        3 => {
            // Hash-based deterministic sample-and-hold per cycle.
            let cycle = tick / period;
            ((cycle * 16807 + 1) % 127) as f64 / 63.0 - 1.0
        }
        _ => {
            if phase < 0.5 {
                4.0 * phase - 1.0
            } else {
                3.0 - 4.0 * phase
            }
        }
    }
}

/// Scale velocity by the filter envelope/cutoff, the amp table, and
/// the ma-LFO bias. Always lands in 1..=127.
fn apply_amp_controls(ctx: &TableCtx, rt: &mut RuntimeState, vel: i32, tick: i64) -> i32 {
    let mut vel = vel.max(1);
    let filter_cut = if rt.filter_env_on {
        rt.filter_env.step()
    } else {
        rt.filter_cut
    };
    vel = (vel * filter_cut.clamp(1, 128)) / 128;
    vel = vel.max(1);
    let amp_table = sample_table(ctx, rt, TableKind::Amp, 1, tick);
    if amp_table != 0 {
        vel = (vel * amp_table.clamp(1, 128)) / 128;
        vel = vel.max(1);
    }
    if rt.mod_amp > 0 {
        let mut amp_depth = rt.mod_amp;
        if rt.ma_change > 0 && tick > rt.ma_delay as i64 {
            let progress = (tick - rt.ma_delay as i64).clamp(0, rt.ma_change as i64) as i32;
            amp_depth = lerp_step(rt.mod_amp, rt.ma_end, progress, rt.ma_change);
        }
        let wave_val = if rt.lfo_rate > 0 {
            tick_wave(rt.lfo_wave, rt.lfo_rate, tick)
        } else {
            0.0
        };
        vel += (wave_val * amp_depth as f64 / 16.0) as i32;
    }
    vel.clamp(1, 127)
}

// --- velocity ------------------------------------------------------------

fn scaled_velocity(
    volume: i32,
    expression: i32,
    fine_volume: i32,
    v_scale_mode: i32,
    v_scale_max: i32,
    x_scale_mode: i32,
) -> i32 {
    let vol_max = if v_scale_max > 0 { v_scale_max } else { 16 };
    let v = volume.clamp(0, 127);
    let x = expression.clamp(0, 128);
    let fv = fine_volume.clamp(0, 128);
    let mut vn = (v as f64 / vol_max as f64).clamp(0.0, 1.0);
    vn = match v_scale_mode {
        1 => db_scale(vn, 96.0),
        2 => db_scale(vn, 64.0),
        3 => db_scale(vn, 48.0),
        4 => db_scale(vn, 32.0),
        _ => vn,
    };
    let mut xn = x as f64 / 128.0;
    xn = match x_scale_mode {
        1 => xn.sqrt(),
        2 => xn * xn,
        3 => db_scale(xn, 48.0),
        4 => db_scale(xn, 32.0),
        // Modes above 4 are accepted but fall back to linear.
        _ => xn,
    };
    let out = vn * xn * (fv as f64 / 128.0) * 127.0;
    (out.round() as i32).clamp(0, 127)
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

fn parse_csv(src: &str) -> Vec<i32> {
    src.split(',')
        .filter_map(|p| p.trim().parse::<i32>().ok())
        .collect()
}

/// Pull `mp`/`ma`/`mf` argument sets out of the suffix that follows an
/// `#OPM@n{...}` body.
fn parse_patch_mods(defs: &Definitions) -> BTreeMap<i32, PatchMod> {
    let mut mods = BTreeMap::new();
    for (key, val) in defs {
        if !(key.starts_with("OPM@")
            || key.starts_with("OPL@")
            || key.starts_with("OPN@")
            || key.starts_with("OPX@"))
        {
            continue;
        }
        let Some(at) = key.find('@') else { continue };
        let Ok(prog) = key[at + 1..].parse::<i32>() else {
            continue;
        };
        let Some(close) = val.rfind('}') else { continue };
        let suffix = &val[close + 1..];
        if suffix.trim().is_empty() {
            continue;
        }
        let mut pm = PatchMod::default();
        for (prefix, dest) in [
            ("mp", &mut pm.mp_args),
            ("ma", &mut pm.ma_args),
            ("mf", &mut pm.mf_args),
        ] {
            let Some(idx) = suffix.find(prefix) else {
                continue;
            };
            let rest = &suffix[idx + prefix.len()..];
            let mut end = rest.len();
            for other in ["mp", "ma", "mf"] {
                if other == prefix {
                    continue;
                }
                if let Some(j) = rest.find(other) {
                    end = end.min(j);
                }
            }
            let arg_str = rest[..end].trim().trim_end_matches(';');
            *dest = parse_csv(arg_str);
        }
        if !pm.mp_args.is_empty() || !pm.ma_args.is_empty() || !pm.mf_args.is_empty() {
            mods.insert(prog, pm);
        }
    }
    mods
}

#[cfg(test)]
mod tests {
    use super::*;
    use mml_parse::Parser;
    use mml_ir::ParserConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::engines::fm::{FmEngine, FmParams};

    /// Call log shared between a [`CountingEngine`] and the test body.
    #[derive(Default)]
    struct Recorded {
        note_on_count: usize,
        note_offs: Vec<i32>,
        pans: Vec<i32>,
        notes: Vec<i32>,
        pitch_lfo: (f64, f64, i32),
    }

    /// Records engine calls so dispatch behaviour can be asserted
    /// without rendering audio.
    #[derive(Default)]
    struct CountingEngine {
        next_id: i32,
        log: Arc<std::sync::Mutex<Recorded>>,
    }

    impl CountingEngine {
        fn new() -> (Self, Arc<std::sync::Mutex<Recorded>>) {
            let e = Self::default();
            let log = e.log.clone();
            (e, log)
        }
    }

    impl VoiceEngine for CountingEngine {
        fn note_on(&mut self, note: i32, _velocity: i32, pan: i32, _program: i32) -> i32 {
            let mut log = self.log.lock().unwrap();
            log.note_on_count += 1;
            log.pans.push(pan);
            log.notes.push(note);
            let id = self.next_id;
            self.next_id += 1;
            id
        }
        fn note_off(&mut self, id: i32) {
            self.log.lock().unwrap().note_offs.push(id);
        }
        fn render_frame(&mut self) -> (f32, f32) {
            (0.0, 0.0)
        }
        fn set_master_gain(&mut self, _gain: f64) {}
        fn active_voice_count(&self) -> usize {
            0
        }
        fn set_filter_type(&mut self, _filter_type: i32) {}
        fn set_note_on_phase(&mut self, _phase: i32) {}
        fn set_portamento(&mut self, _from_note: i32, _frames: i32) {}
        fn set_pitch_lfo(&mut self, depth: f64, rate_hz: f64, waveform: i32) {
            if depth != 0.0 {
                self.log.lock().unwrap().pitch_lfo = (depth, rate_hz, waveform);
            }
        }
        fn set_amp_lfo(&mut self, _depth: f64, _rate_hz: f64, _waveform: i32) {}
        fn set_filter_lfo(&mut self, _depth: f64, _rate_hz: f64, _waveform: i32) {}
    }

    fn compile(src: &str) -> Arc<Score> {
        Arc::new(Parser::new(ParserConfig::default()).parse(src).unwrap())
    }

    fn run_counting(
        src: &str,
        opts: SequencerOptions,
        frames: usize,
    ) -> Arc<std::sync::Mutex<Recorded>> {
        let (engine, log) = CountingEngine::new();
        let mut seq = Sequencer::with_options(compile(src), Box::new(engine), 48000, opts);
        let mut buf = vec![0.0f32; frames * 2];
        seq.process(&mut buf);
        log
    }

    #[test]
    fn renders_audio_energy_with_fm_engine() {
        let score = compile("t120 o5 l8 cdefgab>c");
        let engine = Box::new(FmEngine::new(48000, FmParams::default()));
        let mut seq = Sequencer::new(score, engine, 48000);
        let mut buf = vec![0.0f32; 48000 / 4 * 2];
        seq.process(&mut buf);
        let energy: f64 = buf.iter().map(|s| s.abs() as f64).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn whole_score_loop_retriggers_notes() {
        let log = run_counting(
            "t120 o5 l4 c",
            SequencerOptions {
                loop_whole_score: true,
                ..SequencerOptions::default()
            },
            48000 * 2,
        );
        assert!(log.lock().unwrap().note_on_count >= 2);
    }

    #[test]
    fn loop_completed_event_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut seq = Sequencer::with_options(
            compile("t120 o5 l4 c"),
            Box::new(CountingEngine::default()),
            48000,
            SequencerOptions {
                loop_whole_score: true,
                on_event: Some(Box::new(move |kind| {
                    if kind == SequencerEvent::LoopCompleted {
                        count2.fetch_add(1, Ordering::Relaxed);
                    }
                })),
                ..SequencerOptions::default()
            },
        );
        let mut buf = vec![0.0f32; 48000 * 2 * 2];
        seq.process(&mut buf);
        assert!(count.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn playback_ended_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut seq = Sequencer::with_options(
            compile("t120 o5 l8 c"),
            Box::new(CountingEngine::default()),
            48000,
            SequencerOptions {
                on_event: Some(Box::new(move |kind| {
                    if kind == SequencerEvent::PlaybackEnded {
                        count2.fetch_add(1, Ordering::Relaxed);
                    }
                })),
                ..SequencerOptions::default()
            },
        );
        let mut buf = vec![0.0f32; 48000 * 2];
        seq.process(&mut buf);
        seq.process(&mut buf);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(seq.playback_ended());
    }

    #[test]
    fn slur_closes_previous_voice_at_boundary() {
        let log = run_counting("t120 o5 l8 q8 c&d", SequencerOptions::default(), 48000 * 2);
        let log = log.lock().unwrap();
        assert!(log.note_on_count >= 2);
        // Boundary close plus the final release.
        assert!(log.note_offs.len() >= 2);
        assert_eq!(log.note_offs[0], 0);
    }

    #[test]
    fn mask_bit1_discards_pan_updates() {
        let log = run_counting("@mask2 p8 c p0 c", SequencerOptions::default(), 48000);
        let log = log.lock().unwrap();
        assert!(log.pans.len() >= 2);
        assert_eq!(log.pans[0], 0);
        assert_eq!(log.pans[1], 0);
    }

    #[test]
    fn master_transpose_shifts_octaves() {
        let log = run_counting(
            "o5 l8 c",
            SequencerOptions {
                master_transpose: 1,
                ..SequencerOptions::default()
            },
            24000,
        );
        assert_eq!(log.lock().unwrap().notes[0], 72);
    }

    #[test]
    fn opm_patch_suffix_seeds_lfo_state() {
        let mut seq = Sequencer::with_options(
            compile("#OPM@0{0,0, 31,0,0,15,0,0,0,1,0,0,0, 31,0,0,15,0,0,0,1,0,0,0, 31,0,0,15,0,0,0,1,0,0,0, 31,0,0,15,0,0,0,1,0,0,0}mp8,16,32,64; @lfo4 @0 o5 l4 c"),
            Box::new(CountingEngine::default()),
            48000,
            SequencerOptions::default(),
        );
        let mut buf = vec![0.0f32; 48000 * 2];
        seq.process(&mut buf);
        let rt = &seq.track_runtime[0];
        assert_eq!(rt.mod_pitch, 8);
        assert_eq!(rt.mp_end, 16);
        assert_eq!(rt.mp_delay, 32);
        assert_eq!(rt.mp_change, 64);
    }

    #[test]
    fn dollar_loop_replays_from_marker() {
        let log = run_counting("t240 o5 l16 c $ d", SequencerOptions::default(), 48000 * 2);
        let log = log.lock().unwrap();
        // The d after $ repeats; the initial c fires once.
        assert!(log.note_on_count > 2);
        assert_eq!(log.notes[0], 60);
        assert!(log.notes[1..].iter().all(|n| *n == 62));
    }

    #[test]
    fn tempo_events_apply_once_inside_loops() {
        let mut seq = Sequencer::with_options(
            compile("t120 o5 l16 $ t60 c"),
            Box::new(CountingEngine::default()),
            48000,
            SequencerOptions::default(),
        );
        let mut buf = vec![0.0f32; 48000 * 2];
        seq.process(&mut buf);
        let expected = (60.0 * 1920.0) / (240.0 * 48000.0);
        assert!((seq.ticks_per_samp - expected).abs() < 1e-12);
    }

    #[test]
    fn note_off_queue_respects_gate_override() {
        // @q96 = 960 ticks: the note-off lands a full second in.
        let log = run_counting("l4 q8 @q96 c", SequencerOptions::default(), 72000);
        let log = log.lock().unwrap();
        assert_eq!(log.note_on_count, 1);
        assert_eq!(log.note_offs.len(), 1);
    }

    #[test]
    fn table_pitch_envelope_offsets_note() {
        let log = run_counting(
            "#TABLE1{32}; nt1 o5 l4 c",
            SequencerOptions::default(),
            24000,
        );
        // 32/16 = 2 semitones above c5.
        assert_eq!(log.lock().unwrap().notes[0], 62);
    }

    #[test]
    fn mp_command_pushes_pitch_lfo_to_engine() {
        let log = run_counting(
            "@lfo2,100 mp8,16,32,64 o5 l4 c",
            SequencerOptions::default(),
            24000,
        );
        let (depth, rate_hz, _wave) = log.lock().unwrap().pitch_lfo;
        assert!((depth - 2.0).abs() < 1e-9); // 16 / 8 semitones
        assert!(rate_hz > 0.0);
    }

    #[test]
    fn mask_bit5_discards_lfo_updates() {
        let log = run_counting(
            "@mask32 @lfo2,100 mp8,16,32,64 o5 l4 c",
            SequencerOptions::default(),
            24000,
        );
        assert_eq!(log.lock().unwrap().pitch_lfo, (0.0, 0.0, 0));
    }
}
