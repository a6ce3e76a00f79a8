//! RTSP frame relay
//!
//! Extracts still JPEG frames from a live video stream by running an external
//! decoder, and re-emits each complete frame as an event.
//!
//! # Architecture
//!
//! ```text
//! decoder stdout --> reader thread --> controller thread --> FrameReassembler
//!                                             |                      |
//!                                    start/stop/restart            Frame
//!                                             |                      |
//!                                             +----> subscribers <---+
//! ```
//!
//! # Module Structure
//!
//! - `config`: `StreamOptions` and the validated, immutable `StreamConfig`
//! - `frame`: `Frame`, `FrameReassembler`, `FrameReader`
//! - `ingest`: decoder command line and process supervision
//! - `controller`: `StreamController`, `StreamEvent`, `StreamStats`
//! - `error`: `StreamError`, `StreamFault`

pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod ingest;

pub use config::{StderrPolicy, StreamConfig, StreamOptions};
pub use controller::{StreamController, StreamEvent, StreamStats};
pub use error::{StreamError, StreamFault};
pub use frame::{BoundaryMode, Frame, FrameReader, FrameReassembler, EOI_MARKER};
pub use ingest::build_args;
