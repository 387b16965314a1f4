//! Audio output for mmlbox.
//!
//! The engine side implements [`SampleSource`]; the backend pulls
//! fixed-size interleaved stereo buffers from it on a pump thread and
//! hands frames to the device callback through a lock-free ring buffer.

mod cpal_backend;
mod traits;

pub use cpal_backend::CpalOutput;
pub use traits::{AudioError, Frame, SampleSource};
