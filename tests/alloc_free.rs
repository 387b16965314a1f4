//! Allocation-free render path test.
//!
//! After the initial setup events have fired, steady-state rendering
//! (including looped note dispatch and note-off scheduling) must not
//! touch the heap. Just run `cargo test` — no feature flags needed.

use assert_no_alloc::{assert_no_alloc, AllocDisabler};

#[cfg(debug_assertions)]
#[global_allocator]
static A: AllocDisabler = AllocDisabler;

use std::sync::Arc;

use mml_engine::{FmEngine, FmParams, Sequencer};
use mmlbox::compile;

#[test]
fn looped_note_rendering_is_alloc_free() {
    let score = Arc::new(compile("t150 o5 l8 $ cdefgab>c<").unwrap());
    let engine = Box::new(FmEngine::new(48000, FmParams::default()));
    let mut seq = Sequencer::new(score, engine, 48000);

    let mut buf = vec![0.0f32; 1024 * 2];
    // Warm up past the one-shot setup events and the first loop cycle.
    for _ in 0..96 {
        seq.process(&mut buf);
    }

    // Two seconds of steady-state looping.
    assert_no_alloc(|| {
        for _ in 0..94 {
            seq.process(&mut buf);
        }
    });
}
