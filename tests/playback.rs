//! End-to-end scenarios: compile real phrases and render them offline
//! through each engine at 48 kHz stereo.

use mmlbox::{
    compile, decode_wav_f32, encode_wav_f32, render_samples, render_samples_chiptune,
    render_samples_nesapu, render_samples_wavetable, EventPayload,
};

fn energy(samples: &[f32]) -> f64 {
    samples.iter().map(|s| s.abs() as f64).sum()
}

#[test]
fn short_phrase_compiles_to_expected_events() {
    let score = compile("t140 o5 l8 cdefgab>c<c").unwrap();
    let tr = &score.tracks[0];
    let notes: Vec<i32> = tr
        .events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Note(n) => Some(n.note),
            _ => None,
        })
        .collect();
    assert_eq!(notes.len(), 9);
    assert_eq!(tr.events[0].tick, 0);
    assert!(matches!(tr.events[0].payload, EventPayload::Tempo { bpm: 140 }));
    // >c<c round-trips back to the opening pitch.
    assert_eq!(notes.first(), notes.last());
}

#[test]
fn fm_render_is_deterministic_bounded_and_audible() {
    let score = compile("t140 o5 l8 cdefgab>c<c").unwrap();
    let a = render_samples(&score, 48000, 1.2);
    let b = render_samples(&score, 48000, 1.2);
    assert_eq!(a.len(), (48000.0 * 1.2) as usize * 2);
    assert_eq!(encode_wav_f32(&a, 48000, 2), encode_wav_f32(&b, 48000, 2));
    assert!(a.iter().all(|s| s.abs() <= 1.0));
    assert!(energy(&a) > 0.0);
}

#[test]
fn chiptune_render_is_deterministic_bounded_and_audible() {
    let score = compile("t140 o5 l8 cdefgab>c<c").unwrap();
    let a = render_samples_chiptune(&score, 48000, 1.2);
    let b = render_samples_chiptune(&score, 48000, 1.2);
    assert_eq!(a, b);
    assert!(a.iter().all(|s| s.abs() <= 1.0));
    assert!(energy(&a) > 0.0);
}

#[test]
fn nesapu_render_is_deterministic_bounded_and_audible() {
    let score = compile("t140 o5 l8 cdefgab>c<c").unwrap();
    let a = render_samples_nesapu(&score, 48000, 1.2);
    let b = render_samples_nesapu(&score, 48000, 1.2);
    assert_eq!(a, b);
    assert!(a.iter().all(|s| s.abs() <= 1.0));
    assert!(energy(&a) > 0.0);
}

#[test]
fn wavetable_render_is_deterministic_bounded_and_audible() {
    let score = compile("#WAVB1{7f5f3f1f00e0c0a0}; @1 t140 o5 l8 cdef").unwrap();
    let a = render_samples_wavetable(&score, 48000, 1.0);
    let b = render_samples_wavetable(&score, 48000, 1.0);
    assert_eq!(a, b);
    assert!(a.iter().all(|s| s.abs() <= 1.0));
    assert!(energy(&a) > 0.0);
}

#[test]
fn render_survives_release_tail_silence() {
    // One short note, long render: the tail after release decay must
    // stay silent and bounded.
    let score = compile("t120 o5 l8 c").unwrap();
    let samples = render_samples(&score, 48000, 3.0);
    assert!(samples.iter().all(|s| s.abs() <= 1.0));
    let tail = &samples[samples.len() - 48000..];
    assert!(energy(tail) < 1.0);
}

#[test]
fn sign_directive_applies_to_both_notes() {
    let score = compile("#SIGN{G}; o4 l4 f f+").unwrap();
    let notes: Vec<i32> = score.tracks[0]
        .events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Note(n) => Some(n.note),
            _ => None,
        })
        .collect();
    assert_eq!(notes, vec![54, 54]);
}

#[test]
fn wav_export_round_trips() {
    let score = compile("t160 o5 l16 ceg>c").unwrap();
    let samples = render_samples(&score, 48000, 0.5);
    let wav = encode_wav_f32(&samples, 48000, 2);
    let (decoded, rate, channels) = decode_wav_f32(&wav).unwrap();
    assert_eq!(decoded, samples);
    assert_eq!((rate, channels), (48000, 2));
    assert_eq!(encode_wav_f32(&decoded, rate, channels), wav);
}

#[test]
fn master_gain_updates_race_free_during_render() {
    use mml_engine::{FmEngine, FmParams, Sequencer, VoiceEngine};
    use std::sync::Arc;

    let score = Arc::new(compile("t150 o5 l8 $ cdefgab>c<").unwrap());
    let mut engine = FmEngine::new(48000, FmParams::default());
    let gain = engine.master_gain();
    engine.set_master_gain(0.45);
    let mut seq = Sequencer::new(score, Box::new(engine), 48000);

    let writer = std::thread::spawn(move || {
        for i in 0..5000 {
            gain.set(0.1 + (i % 9) as f64 * 0.05);
        }
    });

    let mut buf = vec![0.0f32; 1024 * 2];
    for _ in 0..64 {
        seq.process(&mut buf);
        assert!(buf.iter().all(|s| s.abs() <= 1.0));
    }
    writer.join().unwrap();
}

#[test]
fn effects_chain_processes_whole_render() {
    // A score with a master effect chain still renders bounded audio
    // through the offline path plus manual chain application.
    let score = compile("#EFFECT0{delay 120,0.4,0.1,0.3}; #EFFECT1{reverb}; t140 o5 l8 ceg").unwrap();
    let samples = render_samples(&score, 48000, 1.0);
    let mut chain =
        mml_engine::effects::Chain::from_definitions(&score.definitions, 48000).unwrap();
    let mut processed = samples.clone();
    for pair in processed.chunks_exact_mut(2) {
        (pair[0], pair[1]) = chain.process(pair[0], pair[1]);
    }
    assert!(energy(&processed) > 0.0);
    assert_ne!(processed, samples);
}
