//! Decoder ingestion.
//!
//! Frames come from an external decoder process (ffmpeg by default) that
//! writes a continuously updated JPEG to stdout. This module provides:
//! - `build_args`: the decoder command line for a `StreamConfig`
//! - the supervisor that spawns, watches and restarts the decoder
//! - reader threads that forward decoder output to the controller thread
//!
//! The ingestion layer MUST NOT:
//! - Decode or validate image data beyond the end-of-image marker
//! - Buffer more than the frame currently being accumulated
//! - Run more than one decoder per controller

mod reader;
pub(crate) mod supervisor;

pub use supervisor::build_args;
