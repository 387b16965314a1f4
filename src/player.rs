//! Player facade: score compilation, engine assembly, and lifecycle.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info};

use mml_audio::{AudioError, CpalOutput, SampleSource};
use mml_engine::effects::{Chain, Effector, Eq5Band, Eq5Gains};
use mml_engine::{
    ChiptuneEngine, ChiptuneParams, FmEngine, FmParams, MasterGain, MultiEngine, NesApuEngine,
    NesApuParams, Sequencer, SequencerEvent, SequencerOptions, VoiceEngine, WavetableEngine,
    WavetableParams,
};
use mml_ir::{EventPayload, ParserConfig, Score};
use mml_parse::{ParseError, Parser};

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("parse failure: {0}")]
    Parse(#[from] ParseError),
    #[error("audio backend unavailable: {0}")]
    Audio(#[from] AudioError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SynthMode {
    #[default]
    Fm,
    Chiptune,
    NesApu,
    Wavetable,
}

impl std::str::FromStr for SynthMode {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fm" => Ok(SynthMode::Fm),
            "chiptune" => Ok(SynthMode::Chiptune),
            "nesapu" => Ok(SynthMode::NesApu),
            "wavetable" => Ok(SynthMode::Wavetable),
            other => Err(PlayerError::InvalidArgument(format!(
                "unknown synth mode '{other}'"
            ))),
        }
    }
}

/// Callback receiving each generated stereo buffer on the audio thread.
/// Keep work brief and non-blocking.
pub type SampleTap = Arc<dyn Fn(&[f32]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PlayerOptions {
    pub mode: SynthMode,
    pub loop_playback: Option<bool>,
    pub sample_tap: Option<SampleTap>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEventKind {
    LoopCompleted,
    PlaybackEnded,
    Trigger,
}

/// Playback and trigger notifications delivered by [`Player::watch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub kind: PlaybackEventKind,
    pub trigger_id: i32,
    pub note_on_type: i32,
    pub note_off_type: i32,
}

impl PlaybackEvent {
    fn kind_only(kind: PlaybackEventKind) -> Self {
        Self {
            kind,
            trigger_id: 0,
            note_on_type: 0,
            note_off_type: 0,
        }
    }
}

/// One-shot completion signal backing [`Player::wait`].
#[derive(Default)]
struct DoneSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl DoneSignal {
    fn signal(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Lifecycle state guarded by the player mutex. The mutex is held only
/// around transitions, never while audio renders.
struct Inner {
    audio: Option<CpalOutput>,
    done: Option<Arc<DoneSignal>>,
    volume: f64,
    transpose: i32,
    /// Per-engine (handle, base gain) pairs for the active playback.
    gain_handles: Vec<(MasterGain, f64)>,
}

pub struct Player {
    parser: Parser,
    sample_rate: u32,
    mode: SynthMode,
    loop_playback: bool,
    sample_tap: Option<SampleTap>,
    eq_gains: Eq5Gains,
    inner: Mutex<Inner>,
    event_tx: Mutex<Option<SyncSender<PlaybackEvent>>>,
}

impl Player {
    pub fn new(sample_rate: u32, options: PlayerOptions) -> Result<Self, PlayerError> {
        if sample_rate == 0 {
            return Err(PlayerError::InvalidArgument(
                "sample rate must be positive".into(),
            ));
        }
        Ok(Self {
            parser: Parser::new(ParserConfig::default()),
            sample_rate,
            mode: options.mode,
            loop_playback: options.loop_playback.unwrap_or(true),
            sample_tap: options.sample_tap,
            eq_gains: Eq5Gains::unity(),
            inner: Mutex::new(Inner {
                audio: None,
                done: None,
                volume: 1.0,
                transpose: 0,
                gain_handles: Vec::new(),
            }),
            event_tx: Mutex::new(None),
        })
    }

    pub fn compile(&self, mml_text: &str) -> Result<Score, PlayerError> {
        Ok(self.parser.parse(mml_text)?)
    }

    pub fn play_mml(&self, mml_text: &str) -> Result<(), PlayerError> {
        let score = self.compile(mml_text)?;
        self.play(score)
    }

    /// Start playing a compiled score, replacing any active playback.
    /// Engines are rebuilt per play so voice and envelope state never
    /// leaks between songs.
    pub fn play(&self, score: Score) -> Result<(), PlayerError> {
        let score = Arc::new(score);
        let mut inner = self.lock_inner();

        if let Some(done) = inner.done.take() {
            done.signal();
        }
        let done = Arc::new(DoneSignal::default());
        inner.done = Some(done.clone());

        let (engine, gain_handles) = build_engine(self.mode, self.sample_rate, &score);
        for (handle, base) in &gain_handles {
            handle.set(base * inner.volume);
        }
        inner.gain_handles = gain_handles;

        let finished = Arc::new(AtomicBool::new(false));
        let tx = self.event_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let on_event = {
            let tx = tx.clone();
            let done = done.clone();
            let finished = finished.clone();
            Box::new(move |kind: SequencerEvent| {
                let out = match kind {
                    SequencerEvent::LoopCompleted => {
                        PlaybackEvent::kind_only(PlaybackEventKind::LoopCompleted)
                    }
                    SequencerEvent::PlaybackEnded => {
                        finished.store(true, Ordering::Relaxed);
                        PlaybackEvent::kind_only(PlaybackEventKind::PlaybackEnded)
                    }
                };
                send_event(&tx, out);
                if kind == SequencerEvent::PlaybackEnded {
                    done.signal();
                }
            }) as Box<dyn FnMut(SequencerEvent) + Send>
        };
        let on_trigger = {
            let tx = tx.clone();
            Box::new(move |te: mml_engine::TriggerEvent| {
                send_event(
                    &tx,
                    PlaybackEvent {
                        kind: PlaybackEventKind::Trigger,
                        trigger_id: te.trigger_id,
                        note_on_type: te.note_on_type,
                        note_off_type: te.note_off_type,
                    },
                );
            }) as Box<dyn FnMut(mml_engine::TriggerEvent) + Send>
        };

        let seq = Sequencer::with_options(
            score.clone(),
            engine,
            self.sample_rate as i32,
            SequencerOptions {
                loop_whole_score: self.loop_playback,
                on_event: Some(on_event),
                on_trigger: Some(on_trigger),
                release_tail_frames: 0,
                master_transpose: inner.transpose,
            },
        );

        let source = RenderSource {
            seq,
            effects: Chain::from_definitions(&score.definitions, self.sample_rate),
            master_eq: Eq5Band::with_gains(self.sample_rate, self.eq_gains.clone()),
            sample_tap: self.sample_tap.clone(),
            finished,
        };

        info!(
            tracks = score.tracks.len(),
            resolution = score.resolution,
            mode = ?self.mode,
            looping = self.loop_playback,
            "starting playback"
        );

        let mut backend = CpalOutput::new(self.sample_rate, Box::new(source))?;
        if let Some(mut old) = inner.audio.take() {
            let _ = old.stop();
        }
        backend.play()?;
        inner.audio = Some(backend);
        Ok(())
    }

    pub fn pause(&self) {
        let mut inner = self.lock_inner();
        if let Some(audio) = inner.audio.as_mut() {
            let _ = audio.pause();
        }
    }

    pub fn resume(&self) {
        let mut inner = self.lock_inner();
        if let Some(audio) = inner.audio.as_mut() {
            let _ = audio.play();
        }
    }

    /// Stop playback, emit `PlaybackEnded`, and release the device.
    pub fn stop(&self) -> Result<(), PlayerError> {
        let (audio, done) = {
            let mut inner = self.lock_inner();
            (inner.audio.take(), inner.done.take())
        };
        if let Some(mut audio) = audio {
            audio.stop()?;
        }
        debug!("playback stopped");
        self.send(PlaybackEvent::kind_only(PlaybackEventKind::PlaybackEnded));
        if let Some(done) = done {
            done.signal();
        }
        Ok(())
    }

    /// Block until the current playback ends. With loop playback on,
    /// this blocks until `stop` is called; use `watch` for
    /// loop-counting instead. Returns immediately when idle.
    pub fn wait(&self) {
        let done = self.lock_inner().done.clone();
        if let Some(done) = done {
            done.wait();
        }
    }

    /// Subscribe to playback events. The channel is bounded (capacity
    /// 8); events are dropped rather than blocking the audio thread
    /// when the receiver lags. Only the latest `watch` channel receives
    /// events; call it before `play`.
    pub fn watch(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = std::sync::mpsc::sync_channel(8);
        *self.event_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Set the runtime volume scalar (1.0 = default). Takes effect
    /// immediately through the lock-free gain atomics.
    pub fn set_master_volume(&self, volume: f64) {
        let volume = volume.max(0.0);
        let mut inner = self.lock_inner();
        inner.volume = volume;
        for (handle, base) in &inner.gain_handles {
            handle.set(base * volume);
        }
    }

    pub fn master_volume(&self) -> f64 {
        self.lock_inner().volume
    }

    /// Set the master volume from a decibel value; 0 dB is unity and
    /// negative values attenuate (the linear result clamps at 0).
    pub fn set_master_volume_db(&self, db: f64) {
        self.set_master_volume(10f64.powf(db / 20.0));
    }

    /// Set the master octave shift applied to all notes. Takes effect
    /// on the next `play`.
    pub fn set_transpose(&self, octaves: i32) {
        self.lock_inner().transpose = octaves;
    }

    pub fn transpose(&self) -> i32 {
        self.lock_inner().transpose
    }

    /// Set a master EQ band gain (band 0-4, 1.0 = unity). Applies
    /// immediately on the audio thread, lock-free.
    /// Bands: 0 <200Hz, 1 200-800Hz, 2 800Hz-2.5kHz, 3 2.5-8kHz, 4 >8kHz.
    pub fn set_eq_band(&self, band: usize, gain: f32) {
        self.eq_gains.set(band, gain);
    }

    pub fn eq_band(&self, band: usize) -> f32 {
        self.eq_gains.get(band)
    }

    /// The output position of the audio driver in samples: what the
    /// listener actually hears right now. 0 when idle.
    pub fn playback_position(&self) -> u64 {
        self.lock_inner()
            .audio
            .as_ref()
            .map(|a| a.position_frames())
            .unwrap_or(0)
    }

    fn send(&self, ev: PlaybackEvent) {
        let tx = self.event_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        send_event(&tx, ev);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn send_event(tx: &Option<SyncSender<PlaybackEvent>>, ev: PlaybackEvent) {
    if let Some(tx) = tx {
        // Full or disconnected channels drop the event; the audio
        // thread never blocks on a slow subscriber.
        let _ = tx.try_send(ev);
    }
}

/// Sequencer plus master processing, pulled by the audio backend.
struct RenderSource {
    seq: Sequencer,
    effects: Option<Chain>,
    master_eq: Eq5Band,
    sample_tap: Option<SampleTap>,
    finished: Arc<AtomicBool>,
}

impl SampleSource for RenderSource {
    fn process(&mut self, dst: &mut [f32]) {
        self.seq.process(dst);
        if let Some(fx) = self.effects.as_mut() {
            for pair in dst.chunks_exact_mut(2) {
                (pair[0], pair[1]) = fx.process(pair[0], pair[1]);
            }
        }
        for pair in dst.chunks_exact_mut(2) {
            (pair[0], pair[1]) = self.master_eq.process(pair[0], pair[1]);
        }
        if let Some(tap) = &self.sample_tap {
            tap(dst);
        }
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Build the engine (or composite) for a score, returning it with the
/// gain handles of every constructed sub-engine.
fn build_engine(
    mode: SynthMode,
    sample_rate: u32,
    score: &Score,
) -> (Box<dyn VoiceEngine>, Vec<(MasterGain, f64)>) {
    let mut handles = Vec::new();
    let used = used_modules(score);
    if used.len() <= 1 {
        let (engine, handle, base) = engine_for_mode(mode, sample_rate, score);
        handles.push((handle, base));
        return (engine, handles);
    }

    let mut multi = MultiEngine::new(0);
    let (default_engine, handle, base) = engine_for_mode(mode, sample_rate, score);
    handles.push((handle, base));
    multi.add_engine(0, default_engine);
    for module in used {
        if module == 0 {
            continue;
        }
        let built = match module {
            1 | 8 => Some(engine_for_mode(SynthMode::Chiptune, sample_rate, score)),
            2 => Some(engine_for_mode(SynthMode::NesApu, sample_rate, score)),
            4 => Some(engine_for_mode(SynthMode::Wavetable, sample_rate, score)),
            6 => Some(engine_for_mode(SynthMode::Fm, sample_rate, score)),
            // Anything else routes back to the default engine.
            _ => None,
        };
        if let Some((engine, handle, base)) = built {
            handles.push((handle, base));
            multi.add_engine(module, engine);
        }
    }
    (Box::new(multi), handles)
}

fn engine_for_mode(
    mode: SynthMode,
    sample_rate: u32,
    score: &Score,
) -> (Box<dyn VoiceEngine>, MasterGain, f64) {
    match mode {
        SynthMode::Fm => {
            let params = FmParams::default();
            let mut e = FmEngine::new(sample_rate, params);
            e.load_opm_patches(&score.definitions);
            let handle = e.master_gain();
            (Box::new(e), handle, params.master_gain)
        }
        SynthMode::Chiptune => {
            let params = ChiptuneParams::default();
            let e = ChiptuneEngine::new(sample_rate, params);
            let handle = e.master_gain();
            (Box::new(e), handle, params.master_gain)
        }
        SynthMode::NesApu => {
            let params = NesApuParams::default();
            let e = NesApuEngine::new(sample_rate, params);
            let handle = e.master_gain();
            (Box::new(e), handle, params.master_gain)
        }
        SynthMode::Wavetable => {
            let params = WavetableParams::default();
            let mut e = WavetableEngine::new(sample_rate, params);
            e.load_wavb_definitions(&score.definitions);
            let handle = e.master_gain();
            (Box::new(e), handle, params.master_gain)
        }
    }
}

/// Module numbers a score actually selects (always includes 0).
fn used_modules(score: &Score) -> Vec<i32> {
    let mut out = vec![0];
    for tr in &score.tracks {
        for ev in &tr.events {
            if let EventPayload::Module { module, .. } = &ev.payload {
                if !out.contains(module) {
                    out.push(*module);
                }
            }
        }
    }
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_volume_runtime_api() {
        let player = Player::new(48000, PlayerOptions::default()).unwrap();
        assert_eq!(player.master_volume(), 1.0);
        player.set_master_volume(0.35);
        assert_eq!(player.master_volume(), 0.35);
        player.set_master_volume(-2.0);
        assert_eq!(player.master_volume(), 0.0);
    }

    #[test]
    fn master_volume_db_conversion() {
        let player = Player::new(48000, PlayerOptions::default()).unwrap();
        player.set_master_volume_db(0.0);
        assert!((player.master_volume() - 1.0).abs() < 1e-9);
        player.set_master_volume_db(-6.0);
        assert!((player.master_volume() - 0.501).abs() < 0.01);
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        assert!(matches!(
            Player::new(0, PlayerOptions::default()),
            Err(PlayerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_synth_mode_is_rejected() {
        assert!("theremin".parse::<SynthMode>().is_err());
        assert_eq!("nesapu".parse::<SynthMode>().unwrap(), SynthMode::NesApu);
    }

    #[test]
    fn transpose_round_trips() {
        let player = Player::new(48000, PlayerOptions::default()).unwrap();
        player.set_transpose(-2);
        assert_eq!(player.transpose(), -2);
    }

    #[test]
    fn eq_band_round_trips() {
        let player = Player::new(48000, PlayerOptions::default()).unwrap();
        assert_eq!(player.eq_band(0), 1.0);
        player.set_eq_band(0, 1.5);
        assert_eq!(player.eq_band(0), 1.5);
    }

    #[test]
    fn multi_module_scores_assemble_composites() {
        let score = crate::compile("%2 o5 c; %4 o5 c;").unwrap();
        let (engine, handles) = build_engine(SynthMode::Fm, 48000, &score);
        // Default FM plus NES-APU (module 2) plus wavetable (module 4).
        assert_eq!(handles.len(), 3);
        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn single_module_scores_stay_single_engine() {
        let score = crate::compile("o5 cde").unwrap();
        let (_, handles) = build_engine(SynthMode::Chiptune, 48000, &score);
        assert_eq!(handles.len(), 1);
    }
}
