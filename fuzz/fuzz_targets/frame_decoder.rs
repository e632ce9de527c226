//! Fuzz target for the incremental frame decoder
//!
//! Feeds arbitrary bytes in arbitrary chunk sizes. The decoder must only
//! ever return frames, `None` or an error.

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use skein_core::FrameDecoder;

#[derive(Debug, Arbitrary)]
struct Input {
    chunk: u8,
    max_frame_length: u16,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let chunk = usize::from(input.chunk).max(1);
    let mut decoder = FrameDecoder::new(usize::from(input.max_frame_length));
    let mut buf = BytesMut::new();

    'feed: for piece in input.data.chunks(chunk) {
        buf.extend_from_slice(piece);
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => break 'feed,
            }
        }
    }
});
