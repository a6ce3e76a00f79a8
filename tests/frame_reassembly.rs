//! Frame-count properties of the reassembler over arbitrary chunkings.

use proptest::prelude::*;

use rtsp_frame_relay::{BoundaryMode, FrameReassembler, EOI_MARKER};

fn marker_count(bytes: &[u8]) -> usize {
    bytes.windows(2).filter(|w| *w == EOI_MARKER).count()
}

/// Split `stream` into chunks of the given sizes; leftover bytes form the
/// last chunk.
fn chunked(stream: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut rest = stream;
    for &size in sizes {
        let take = size.min(rest.len());
        chunks.push(rest[..take].to_vec());
        rest = &rest[take..];
    }
    chunks.push(rest.to_vec());
    chunks
}

fn stream_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop_oneof![Just(0xFFu8), Just(0xD9u8), Just(0xD8u8), any::<u8>()],
        0..512,
    )
}

proptest! {
    #[test]
    fn scan_emits_one_frame_per_marker(
        stream in stream_bytes(),
        sizes in prop::collection::vec(0usize..48, 0..24),
    ) {
        let mut reassembler = FrameReassembler::new(BoundaryMode::Scan);
        let mut frames = Vec::new();
        for chunk in chunked(&stream, &sizes) {
            frames.extend(reassembler.push(&chunk));
        }

        prop_assert_eq!(frames.len(), marker_count(&stream));

        // Frames plus the pending tail reproduce the stream exactly.
        let emitted: usize = frames.iter().map(|f| f.len()).sum();
        prop_assert_eq!(emitted + reassembler.pending_len(), stream.len());
        let mut rebuilt = Vec::new();
        for frame in &frames {
            prop_assert!(frame.as_slice().ends_with(&EOI_MARKER));
            rebuilt.extend_from_slice(frame.as_slice());
        }
        prop_assert_eq!(&rebuilt[..], &stream[..emitted]);
    }

    #[test]
    fn chunk_tail_emits_one_frame_per_chunk_ending_in_marker(
        stream in stream_bytes(),
        sizes in prop::collection::vec(0usize..48, 0..24),
    ) {
        let chunks = chunked(&stream, &sizes);
        let expected = chunks
            .iter()
            .filter(|c| c.len() > 1 && c.ends_with(&EOI_MARKER))
            .count();

        let mut reassembler = FrameReassembler::new(BoundaryMode::ChunkTail);
        let mut frames = 0;
        for chunk in &chunks {
            let completed = reassembler.push(chunk);
            if !completed.is_empty() {
                prop_assert_eq!(reassembler.pending_len(), 0);
            }
            frames += completed.len();
        }
        prop_assert_eq!(frames, expected);
    }
}
