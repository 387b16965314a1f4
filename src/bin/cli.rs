//! mmlbox CLI — headless playback and WAV export.
//!
//! Usage:
//!   mmlbox path/to/score.mml
//!   mmlbox path/to/score.mml --mode chiptune
//!   mmlbox path/to/score.mml --wav output.wav --seconds 10
//!   mmlbox path/to/score.mml --no-loop

use std::{env, fs};

use mmlbox::{
    compile, encode_wav_f32, render_samples, render_samples_chiptune, render_samples_nesapu,
    render_samples_wavetable, PlaybackEventKind, Player, PlayerOptions, SynthMode,
};

const SAMPLE_RATE: u32 = 48000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(path) = args.get(1).filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: mmlbox <score.mml> [--mode fm|chiptune|nesapu|wavetable] [--wav out.wav] [--seconds N] [--no-loop]");
        std::process::exit(1);
    };

    let mode: SynthMode = flag_value(&args, "--mode")
        .map(|m| {
            m.parse().unwrap_or_else(|e| {
                eprintln!("{e}");
                std::process::exit(1);
            })
        })
        .unwrap_or_default();
    let wav_path = flag_value(&args, "--wav");
    let seconds: f64 = flag_value(&args, "--seconds")
        .and_then(|s| s.parse().ok())
        .unwrap_or(30.0);
    let looping = !args.iter().any(|a| a == "--no-loop");

    let text = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        std::process::exit(1);
    });

    let score = compile(&text).unwrap_or_else(|e| {
        eprintln!("Failed to compile {}: {}", path, e);
        std::process::exit(1);
    });

    if let Some(title) = score.definitions.get("TITLE") {
        println!("Title:      {}", title);
    }
    println!("Tracks:     {}", score.tracks.len());
    println!("Resolution: {} ticks/whole note", score.resolution);
    let total_events: usize = score.tracks.iter().map(|t| t.events.len()).sum();
    println!("Events:     {}", total_events);
    println!();

    if let Some(wav) = wav_path {
        render_to_wav(&score, mode, &wav, seconds);
        return;
    }

    let player = Player::new(
        SAMPLE_RATE,
        PlayerOptions {
            mode,
            loop_playback: Some(looping),
            ..PlayerOptions::default()
        },
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to create player: {}", e);
        std::process::exit(1);
    });

    let events = player.watch();
    player.play(score).unwrap_or_else(|e| {
        eprintln!("Failed to start playback: {}", e);
        std::process::exit(1);
    });
    println!("Playing... (ctrl-c to stop)");

    for ev in events {
        match ev.kind {
            PlaybackEventKind::LoopCompleted => println!("Loop completed"),
            PlaybackEventKind::Trigger => println!("Trigger {}", ev.trigger_id),
            PlaybackEventKind::PlaybackEnded => {
                println!("Done.");
                break;
            }
        }
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn render_to_wav(score: &mmlbox::Score, mode: SynthMode, path: &str, seconds: f64) {
    println!("Rendering {}s to {} at {} Hz...", seconds, path, SAMPLE_RATE);
    let samples = match mode {
        SynthMode::Fm => render_samples(score, SAMPLE_RATE, seconds),
        SynthMode::Chiptune => render_samples_chiptune(score, SAMPLE_RATE, seconds),
        SynthMode::NesApu => render_samples_nesapu(score, SAMPLE_RATE, seconds),
        SynthMode::Wavetable => render_samples_wavetable(score, SAMPLE_RATE, seconds),
    };
    let wav = encode_wav_f32(&samples, SAMPLE_RATE, 2);
    println!("Rendered {} bytes", wav.len());
    fs::write(path, &wav).unwrap_or_else(|e| {
        eprintln!("Failed to write {}: {}", path, e);
        std::process::exit(1);
    });
    println!("Done.");
}
