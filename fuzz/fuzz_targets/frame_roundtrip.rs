//! Fuzz target for frame encode/decode
//!
//! Any frame the builder accepts and the codec encodes must decode back to
//! itself.

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use skein_core::{
    CodecId, Encryption, FrameBuilder, FrameCodec, FrameDecoder, HandleType, MessageType,
    ResponseStatus,
};
use std::collections::BTreeMap;

#[derive(Debug, Arbitrary)]
struct Input {
    handle: u8,
    ping: bool,
    request_id: u64,
    timeout_ms: u32,
    codec: u8,
    crc: bool,
    error_status: bool,
    action: Option<String>,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let message_type = if input.ping {
        MessageType::Ping
    } else {
        MessageType::Payload
    };
    let mut builder = match input.handle % 3 {
        0 => FrameBuilder::new(HandleType::Request, message_type).timeout_ms(input.timeout_ms),
        1 => FrameBuilder::new(HandleType::Response, message_type).status(if input.error_status {
            ResponseStatus::Error
        } else {
            ResponseStatus::Ok
        }),
        _ => FrameBuilder::new(HandleType::OneWay, message_type).timeout_ms(input.timeout_ms),
    };
    if let Some(action) = input.action {
        builder = builder.action(action);
    }
    let frame = builder
        .request_id(input.request_id)
        .codec(CodecId(input.codec))
        .encryption(if input.crc {
            Encryption::Crc
        } else {
            Encryption::None
        })
        .headers(input.headers)
        .payload(input.payload)
        .build();

    // Reserved or oversized headers are refused at encode time
    let Ok(encoded) = FrameCodec::default().encode(&frame) else {
        return;
    };

    let mut buf = BytesMut::from(&encoded[..]);
    let decoded = FrameDecoder::default()
        .decode(&mut buf)
        .expect("encoded frame decodes")
        .expect("encoded frame is complete");
    assert_eq!(decoded, frame);
    assert!(buf.is_empty());
});
