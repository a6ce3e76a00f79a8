//! JPEG frame reassembly.
//!
//! The decoder writes a continuous series of JPEG images to stdout with no
//! length prefix, so frame boundaries are recovered from content: every image
//! ends with the end-of-image marker `FF D9`.
//!
//! - `Frame`: one complete image, immutable and cheap to clone.
//! - `FrameReassembler`: accumulates raw chunks and hands off completed frames.
//! - `FrameReader`: lazy iterator of frames over any `Read`.
//!
//! The reassembler never exposes its accumulation buffer. On completion the
//! accumulated bytes are split off and frozen, so the frame owns them and the
//! buffer starts empty.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{self, Read};

/// JPEG end-of-image marker.
pub const EOI_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Read size used when pulling decoder output.
pub const READ_CHUNK_BYTES: usize = 64 * 1024;

const INITIAL_BUFFER_BYTES: usize = 128 * 1024;

/// How the reassembler decides that a frame is complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// Every `FF D9` in the concatenated stream closes a frame, including a
    /// marker split across two chunks or several markers in one chunk.
    #[default]
    Scan,
    /// A frame closes only when an incoming chunk of two or more bytes ends
    /// with `FF D9`. Markers split across chunks or followed by more bytes in
    /// the same chunk are missed.
    ChunkTail,
}

impl std::str::FromStr for BoundaryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scan" => Ok(BoundaryMode::Scan),
            "chunk_tail" | "chunk-tail" => Ok(BoundaryMode::ChunkTail),
            other => Err(format!(
                "unknown boundary mode '{}'; expected scan or chunk_tail",
                other
            )),
        }
    }
}

/// One complete image extracted from the decoder output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    seq: u64,
    data: Bytes,
}

impl Frame {
    /// Sequence number, starting at 1 for the first frame of a reassembler.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Recovers frame boundaries from chunks delivered in stream order.
#[derive(Debug)]
pub struct FrameReassembler {
    mode: BoundaryMode,
    buffer: BytesMut,
    frames_emitted: u64,
}

impl FrameReassembler {
    pub fn new(mode: BoundaryMode) -> Self {
        Self {
            mode,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_BYTES),
            frames_emitted: 0,
        }
    }

    pub fn mode(&self) -> BoundaryMode {
        self.mode
    }

    /// Accumulate one chunk and return the frames it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        match self.mode {
            BoundaryMode::Scan => self.push_scan(chunk),
            BoundaryMode::ChunkTail => self.push_chunk_tail(chunk),
        }
    }

    /// Discard any partially accumulated frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes accumulated since the last completed frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Total frames handed off since construction.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    fn push_scan(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        // Only positions touched by this chunk can hold a new marker end.
        let mut from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        while let Some(end) = find_marker_end(&self.buffer, from) {
            let data = self.buffer.split_to(end).freeze();
            frames.push(self.complete(data));
            from = 0;
        }
        frames
    }

    fn push_chunk_tail(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        if chunk.len() > 1 && chunk.ends_with(&EOI_MARKER) {
            let data = self.buffer.split().freeze();
            vec![self.complete(data)]
        } else {
            Vec::new()
        }
    }

    fn complete(&mut self, data: Bytes) -> Frame {
        self.frames_emitted += 1;
        Frame {
            seq: self.frames_emitted,
            data,
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(BoundaryMode::default())
    }
}

/// Index one past the first marker whose second byte sits at or after `from`.
fn find_marker_end(buffer: &[u8], from: usize) -> Option<usize> {
    (from.max(1)..buffer.len())
        .find(|&i| buffer[i] == EOI_MARKER[1] && buffer[i - 1] == EOI_MARKER[0])
        .map(|i| i + 1)
}

/// Lazy frame sequence over a byte source.
///
/// Yields frames as soon as their marker has been read and ends at EOF; bytes
/// after the last marker are discarded. A new `FrameReader` over a fresh
/// source starts from an empty buffer.
pub struct FrameReader<R> {
    reader: R,
    reassembler: FrameReassembler,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, mode: BoundaryMode) -> Self {
        Self {
            reader,
            reassembler: FrameReassembler::new(mode),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            done: false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.reassembler.pending_len()
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = io::Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    self.reassembler.reset();
                }
                Ok(n) => {
                    let frames = self.reassembler.push(&self.chunk[..n]);
                    self.ready.extend(frames);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&EOI_MARKER);
        bytes
    }

    #[test]
    fn single_chunk_ending_in_marker_is_one_frame() {
        for mode in [BoundaryMode::Scan, BoundaryMode::ChunkTail] {
            let mut reassembler = FrameReassembler::new(mode);
            let chunk = [0x01, 0x02, 0x03, 0xFF, 0xD9];
            let frames = reassembler.push(&chunk);
            assert_eq!(frames.len(), 1, "mode {:?}", mode);
            assert_eq!(frames[0].as_slice(), &chunk);
            assert_eq!(frames[0].seq(), 1);
            assert_eq!(reassembler.pending_len(), 0);
        }
    }

    #[test]
    fn frame_spanning_chunks_is_accumulated() {
        let mut reassembler = FrameReassembler::default();
        assert!(reassembler.push(&[0xFF, 0xD8, 0x10]).is_empty());
        assert!(reassembler.push(&[0x11, 0x12]).is_empty());
        let frames = reassembler.push(&[0x13, 0xFF, 0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].as_slice(),
            &[0xFF, 0xD8, 0x10, 0x11, 0x12, 0x13, 0xFF, 0xD9]
        );
    }

    #[test]
    fn split_marker_is_found_when_scanning() {
        let mut reassembler = FrameReassembler::new(BoundaryMode::Scan);
        assert!(reassembler.push(&[0xAA, 0xFF]).is_empty());
        let frames = reassembler.push(&[0xD9, 0xBB, 0xCC]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_slice(), &[0xAA, 0xFF, 0xD9]);
        assert_eq!(reassembler.pending_len(), 2);
    }

    #[test]
    fn split_marker_is_missed_by_chunk_tail_check() {
        let mut reassembler = FrameReassembler::new(BoundaryMode::ChunkTail);
        assert!(reassembler.push(&[0xAA, 0xFF]).is_empty());
        assert!(reassembler.push(&[0xD9, 0xBB, 0xCC]).is_empty());
        assert_eq!(reassembler.pending_len(), 5);
    }

    #[test]
    fn chunk_tail_ignores_single_byte_chunks_but_keeps_them() {
        let mut reassembler = FrameReassembler::new(BoundaryMode::ChunkTail);
        assert!(reassembler.push(&[0xFF]).is_empty());
        assert!(reassembler.push(&[0xD9]).is_empty());
        assert!(reassembler.push(&[]).is_empty());
        assert_eq!(reassembler.pending_len(), 2);
        let frames = reassembler.push(&[0x00, 0xFF, 0xD9]);
        assert_eq!(frames[0].as_slice(), &[0xFF, 0xD9, 0x00, 0xFF, 0xD9]);
    }

    #[test]
    fn single_byte_chunk_can_close_a_frame_when_scanning() {
        let mut reassembler = FrameReassembler::new(BoundaryMode::Scan);
        assert!(reassembler.push(&[0x01, 0xFF]).is_empty());
        let frames = reassembler.push(&[0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_slice(), &[0x01, 0xFF, 0xD9]);
    }

    #[test]
    fn several_frames_in_one_chunk_are_emitted_in_order() {
        let mut reassembler = FrameReassembler::new(BoundaryMode::Scan);
        let mut chunk = jpeg(&[1]);
        chunk.extend(jpeg(&[2, 2]));
        chunk.extend([0xFF, 0xD8, 3]);
        let frames = reassembler.push(&chunk);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_slice(), jpeg(&[1]).as_slice());
        assert_eq!(frames[1].as_slice(), jpeg(&[2, 2]).as_slice());
        assert_eq!(frames[1].seq(), 2);
        assert_eq!(reassembler.pending_len(), 3);
    }

    #[test]
    fn no_bytes_leak_into_the_next_frame() {
        let mut reassembler = FrameReassembler::default();
        let first = reassembler.push(&jpeg(&[9, 9, 9]));
        assert_eq!(first.len(), 1);
        assert_eq!(reassembler.pending_len(), 0);
        let second = reassembler.push(&jpeg(&[7]));
        assert_eq!(second[0].as_slice(), jpeg(&[7]).as_slice());
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut reassembler = FrameReassembler::default();
        reassembler.push(&[0xFF, 0xD8, 0x01, 0x02]);
        reassembler.reset();
        assert_eq!(reassembler.pending_len(), 0);
        let frames = reassembler.push(&jpeg(&[]));
        assert_eq!(frames[0].as_slice(), &[0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn emitted_frame_is_independent_of_later_pushes() {
        let mut reassembler = FrameReassembler::default();
        let frame = reassembler.push(&jpeg(&[5])).remove(0);
        let snapshot = frame.as_slice().to_vec();
        reassembler.push(&[0xAB; 64]);
        reassembler.push(&jpeg(&[6]));
        assert_eq!(frame.as_slice(), snapshot.as_slice());
    }

    #[test]
    fn reader_yields_frames_lazily_and_drops_trailing_bytes() {
        let mut stream = jpeg(&[1, 2]);
        stream.extend(jpeg(&[3]));
        stream.extend([0xFF, 0xD8, 0x44]);
        let frames: Vec<Frame> = FrameReader::new(stream.as_slice(), BoundaryMode::Scan)
            .collect::<io::Result<_>>()
            .expect("read frames");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_slice(), jpeg(&[1, 2]).as_slice());
        assert_eq!(frames[1].as_slice(), jpeg(&[3]).as_slice());
    }

    #[test]
    fn boundary_mode_parses_from_text() {
        assert_eq!("scan".parse::<BoundaryMode>(), Ok(BoundaryMode::Scan));
        assert_eq!(
            "Chunk-Tail".parse::<BoundaryMode>(),
            Ok(BoundaryMode::ChunkTail)
        );
        assert!("tail".parse::<BoundaryMode>().is_err());
    }
}
