//! Core IR types for the mmlbox playback engine.
//!
//! This crate defines the compiled-score representation shared by the
//! MML parser and the playback engine. The parser emits IR, the engine
//! consumes IR read-only.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod event;
mod score;
mod table;

pub use event::{Event, EventPayload, NoteEvent, SlurMode};
pub use score::{Definitions, ParserConfig, Score, Track};
pub use table::{parse_table_definitions, TableData};
