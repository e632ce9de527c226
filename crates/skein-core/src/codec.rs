//! Frame encoding and incremental decoding.
//!
//! [`FrameCodec`] turns a [`Frame`] into bytes. [`FrameDecoder`] consumes a
//! growing `BytesMut` and yields frames as soon as they are complete:
//!
//! ```text
//!  ┌──────────────┐  fixed header present   ┌──────────────────┐
//!  │ AwaitHeader  │ ──────────────────────▶ │ AwaitBody{total} │
//!  └──────────────┘                         └──────────────────┘
//!         ▲          all `total` bytes present       │
//!         └───────────── emit Frame ◀────────────────┘
//! ```
//!
//! Lengths are validated as soon as the fixed header is readable, so a
//! hostile peer cannot make the decoder buffer more than the configured
//! ceiling. A decoder that returned an error must not be reused.

use crate::error::FrameError;
use crate::frame::{CodecId, Encryption, Frame, HandleType, MessageType, ResponseStatus};
use crate::{
    ACTION_HEADER, CHECKSUM_SIZE, COMMON_HEADER_SIZE, DEFAULT_MAX_FRAME_LENGTH, PROTOCOL_ID,
    PROTOCOL_VERSION, RESPONSE_HEADER_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Encodes frames and creates matching decoders
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    /// Create a codec rejecting frames whose variable header plus payload
    /// exceeds `max_frame_length`
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Configured ceiling
    pub const fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// A fresh decoder sharing this codec's ceiling
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.max_frame_length)
    }

    /// Exact number of bytes `frame` occupies on the wire.
    ///
    /// # Errors
    /// Returns `FrameError::HeaderTooLong` if a header entry cannot be length
    /// prefixed.
    pub fn encoded_len(&self, frame: &Frame) -> Result<usize, FrameError> {
        let trailer = match frame.encryption {
            Encryption::Crc => CHECKSUM_SIZE,
            Encryption::None => 0,
        };
        Ok(frame.handle_type.header_size()
            + var_header_len(frame)?
            + frame.payload.len()
            + trailer)
    }

    /// Encode `frame` into a new buffer.
    ///
    /// # Errors
    /// See [`encode_into`](Self::encode_into).
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(frame)?);
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoding of `frame` to `dst`.
    ///
    /// # Errors
    /// Returns `FrameError::ReservedHeader` for application header keys
    /// starting with `:`, `FrameError::HeaderTooLong` for entries longer
    /// than 65535 bytes, and `FrameError::FrameTooLarge` if the body exceeds
    /// the configured ceiling. `dst` is left untouched on error.
    pub fn encode_into(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if let Some(key) = frame.headers.keys().find(|k| k.starts_with(':')) {
            return Err(FrameError::ReservedHeader(key.clone()));
        }

        let var_len = var_header_len(frame)?;
        let body = var_len + frame.payload.len();
        if body > self.max_frame_length || body > i32::MAX as usize {
            return Err(FrameError::FrameTooLarge {
                length: body,
                max: self.max_frame_length,
            });
        }

        let start = dst.len();
        dst.reserve(self.encoded_len(frame)?);

        dst.put_u8(PROTOCOL_ID);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(frame.handle_type as u8);
        dst.put_u8(frame.message_type as u8);
        dst.put_u8(frame.message_type_version);
        dst.put_u64(frame.request_id);
        dst.put_u8(frame.codec.0);
        dst.put_u8(frame.encryption as u8);
        match frame.handle_type {
            HandleType::Response => dst.put_u16(frame.status as u16),
            HandleType::Request | HandleType::OneWay => dst.put_u32(frame.timeout_ms),
        }
        dst.put_i32(var_len as i32);
        dst.put_i32(frame.payload.len() as i32);

        for (key, value) in frame.wire_headers() {
            dst.put_u16(key.len() as u16);
            dst.put_slice(key.as_bytes());
            dst.put_u16(value.len() as u16);
            dst.put_slice(value.as_bytes());
        }
        dst.put_slice(&frame.payload);

        if frame.encryption == Encryption::Crc {
            let crc = crc32c::crc32c(&dst[start..]);
            dst.put_u32(crc);
        }

        Ok(())
    }
}

fn var_header_len(frame: &Frame) -> Result<usize, FrameError> {
    let mut len = 0;
    for (key, value) in frame.wire_headers() {
        for part in [key, value] {
            if part.len() > u16::MAX as usize {
                return Err(FrameError::HeaderTooLong(part.len()));
            }
            len += 2 + part.len();
        }
    }
    Ok(len)
}

/// Fields parsed from the fixed header
#[derive(Debug, Clone, Copy)]
struct FixedHeader {
    handle_type: HandleType,
    message_type: MessageType,
    message_type_version: u8,
    request_id: u64,
    codec: CodecId,
    encryption: Encryption,
    timeout_ms: u32,
    status: ResponseStatus,
    header_size: usize,
    var_len: usize,
    payload_len: usize,
}

impl FixedHeader {
    fn total_len(&self) -> usize {
        let trailer = match self.encryption {
            Encryption::Crc => CHECKSUM_SIZE,
            Encryption::None => 0,
        };
        self.header_size + self.var_len + self.payload_len + trailer
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitHeader,
    AwaitBody(FixedHeader),
}

/// Incremental, resumable frame decoder for one byte stream
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_length: usize,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameDecoder {
    /// Create a decoder with the given body ceiling
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            state: DecodeState::AwaitHeader,
        }
    }

    /// Try to take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only once a whole frame is available.
    ///
    /// # Errors
    /// Returns `FrameError` for any malformed input. The stream cannot be
    /// resynchronized afterwards.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let header = match self.state {
            DecodeState::AwaitBody(header) => header,
            DecodeState::AwaitHeader => match self.parse_fixed_header(buf)? {
                Some(header) => {
                    self.state = DecodeState::AwaitBody(header);
                    header
                }
                None => return Ok(None),
            },
        };

        let total = header.total_len();
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        self.state = DecodeState::AwaitHeader;
        let raw = buf.split_to(total).freeze();
        decode_body(&header, raw).map(Some)
    }

    /// Whether a frame has been started but not completed
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::AwaitBody(_))
    }

    fn parse_fixed_header(&self, buf: &BytesMut) -> Result<Option<FixedHeader>, FrameError> {
        if let Some(&id) = buf.first() {
            if id != PROTOCOL_ID {
                return Err(FrameError::UnknownProtocol(id));
            }
        }
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Ok(None);
        }

        let handle_type = HandleType::try_from(buf[2])?;
        let header_size = handle_type.header_size();
        if buf.len() < header_size {
            return Ok(None);
        }

        let mut cur = &buf[1..header_size];
        let version = cur.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        cur.advance(1);
        let message_type = MessageType::try_from(cur.get_u8())?;
        let message_type_version = cur.get_u8();
        let request_id = cur.get_u64();
        let codec = CodecId(cur.get_u8());
        let encryption = Encryption::try_from(cur.get_u8())?;
        debug_assert_eq!(header_size - cur.len(), COMMON_HEADER_SIZE);

        let (timeout_ms, status) = match handle_type {
            HandleType::Response => (0, ResponseStatus::try_from(cur.get_u16())?),
            HandleType::Request | HandleType::OneWay => (cur.get_u32(), ResponseStatus::Ok),
        };

        let var_len = checked_len("variable header", cur.get_i32())?;
        let payload_len = checked_len("payload", cur.get_i32())?;
        let body = var_len + payload_len;
        if body > self.max_frame_length {
            return Err(FrameError::FrameTooLarge {
                length: body,
                max: self.max_frame_length,
            });
        }

        Ok(Some(FixedHeader {
            handle_type,
            message_type,
            message_type_version,
            request_id,
            codec,
            encryption,
            timeout_ms,
            status,
            header_size,
            var_len,
            payload_len,
        }))
    }
}

fn checked_len(field: &'static str, value: i32) -> Result<usize, FrameError> {
    usize::try_from(value).map_err(|_| FrameError::NegativeLength { field, value })
}

fn decode_body(header: &FixedHeader, raw: Bytes) -> Result<Frame, FrameError> {
    let body_end = header.header_size + header.var_len + header.payload_len;

    if header.encryption == Encryption::Crc {
        let expected = (&raw[body_end..]).get_u32();
        let actual = crc32c::crc32c(&raw[..body_end]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
    }

    let var_start = header.header_size;
    let payload_start = var_start + header.var_len;
    let (action, headers) = decode_var_header(&raw[var_start..payload_start])?;

    Ok(Frame {
        handle_type: header.handle_type,
        message_type: header.message_type,
        message_type_version: header.message_type_version,
        request_id: header.request_id,
        codec: header.codec,
        encryption: header.encryption,
        timeout_ms: header.timeout_ms,
        status: header.status,
        action,
        headers,
        payload: raw.slice(payload_start..body_end),
    })
}

fn decode_var_header(
    mut block: &[u8],
) -> Result<(Option<String>, BTreeMap<String, String>), FrameError> {
    let mut action = None;
    let mut headers = BTreeMap::new();

    while block.has_remaining() {
        let key = read_string(&mut block)?;
        let value = read_string(&mut block)?;

        if key == ACTION_HEADER {
            if action.replace(value).is_some() {
                return Err(FrameError::MalformedHeader("duplicate action"));
            }
        } else if key.starts_with(':') {
            return Err(FrameError::ReservedHeader(key));
        } else if headers.insert(key, value).is_some() {
            return Err(FrameError::MalformedHeader("duplicate key"));
        }
    }

    Ok((action, headers))
}

fn read_string(block: &mut &[u8]) -> Result<String, FrameError> {
    if block.remaining() < 2 {
        return Err(FrameError::MalformedHeader("truncated length prefix"));
    }
    let len = block.get_u16() as usize;
    if block.remaining() < len {
        return Err(FrameError::MalformedHeader("entry overruns block"));
    }
    let (text, rest) = block.split_at(len);
    *block = rest;
    String::from_utf8(text.to_vec()).map_err(|_| FrameError::MalformedHeader("invalid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::REQUEST_HEADER_SIZE;

    fn sample(encryption: Encryption) -> Frame {
        FrameBuilder::new(HandleType::Request, MessageType::Payload)
            .request_id(0x0102_0304_0506_0708)
            .message_type_version(3)
            .codec(CodecId::JSON)
            .encryption(encryption)
            .timeout_ms(1500)
            .action("echo")
            .header("trace-id", "t-1")
            .payload(Bytes::from_static(b"{\"x\":1}"))
            .build()
    }

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf)? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn test_fixed_header_layout() {
        let codec = FrameCodec::default();
        let frame = FrameBuilder::new(HandleType::Request, MessageType::Payload)
            .request_id(1)
            .timeout_ms(0x0A0B_0C0D)
            .build();
        let bytes = codec.encode(&frame).unwrap();

        assert_eq!(bytes.len(), REQUEST_HEADER_SIZE);
        assert_eq!(bytes[0], PROTOCOL_ID);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], 0);
        assert_eq!(&bytes[5..13], &1u64.to_be_bytes());
        assert_eq!(&bytes[15..19], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[19..27], &[0u8; 8]);
    }

    #[test]
    fn test_response_header_layout() {
        let codec = FrameCodec::default();
        let frame = FrameBuilder::new(HandleType::Response, MessageType::Payload)
            .request_id(5)
            .status(ResponseStatus::Error)
            .payload(Bytes::from_static(b"no"))
            .build();
        let bytes = codec.encode(&frame).unwrap();

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 2);
        assert_eq!(&bytes[15..17], &[0, 1]);
        assert_eq!(&bytes[21..25], &[0, 0, 0, 2]);
        assert_eq!(&bytes[25..], b"no");
    }

    #[test]
    fn test_roundtrip() {
        let codec = FrameCodec::default();
        for encryption in [Encryption::None, Encryption::Crc] {
            let frame = sample(encryption);
            let bytes = codec.encode(&frame).unwrap();
            assert_eq!(bytes.len(), codec.encoded_len(&frame).unwrap());
            assert_eq!(decode_all(&bytes).unwrap(), vec![frame]);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let codec = FrameCodec::default();
        let frame = sample(Encryption::Crc);
        let bytes = codec.encode(&frame).unwrap();

        let mut decoder = codec.decoder();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            match decoder.decode(&mut buf).unwrap() {
                Some(f) => {
                    assert_eq!(i, bytes.len() - 1);
                    decoded = Some(f);
                }
                None => assert!(i < bytes.len() - 1),
            }
        }
        assert_eq!(decoded, Some(frame));
        assert!(buf.is_empty());
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = FrameCodec::default();
        let ping = Frame::ping(1);
        let req = sample(Encryption::None);
        let mut buf = BytesMut::new();
        codec.encode_into(&ping, &mut buf).unwrap();
        codec.encode_into(&req, &mut buf).unwrap();

        assert_eq!(decode_all(&buf).unwrap(), vec![ping, req]);
    }

    #[test]
    fn test_ping_shape() {
        let codec = FrameCodec::default();
        let bytes = codec.encode(&Frame::ping(9)).unwrap();
        assert_eq!(bytes.len(), REQUEST_HEADER_SIZE);
        assert_eq!(bytes[3], MessageType::Ping as u8);

        let pong = Frame::pong(&Frame::ping(9));
        let bytes = codec.encode(&pong).unwrap();
        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let codec = FrameCodec::default();
        let mut bytes = BytesMut::from(&codec.encode(&sample(Encryption::Crc)).unwrap()[..]);
        let last_payload = bytes.len() - CHECKSUM_SIZE - 1;
        bytes[last_payload] ^= 0xFF;

        assert!(matches!(
            decode_all(&bytes),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_none_ignores_payload_corruption() {
        let codec = FrameCodec::default();
        let mut bytes = BytesMut::from(&codec.encode(&sample(Encryption::None)).unwrap()[..]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let frames = decode_all(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0].payload(), sample(Encryption::None).payload());
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        assert_eq!(decode_all(&[0x42]), Err(FrameError::UnknownProtocol(0x42)));
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = BytesMut::from(&FrameCodec::default().encode(&Frame::ping(1)).unwrap()[..]);
        bytes[1] = 9;
        assert_eq!(decode_all(&bytes), Err(FrameError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_rejects_negative_length() {
        let mut bytes = BytesMut::from(&FrameCodec::default().encode(&Frame::ping(1)).unwrap()[..]);
        bytes[23..27].copy_from_slice(&(-5i32).to_be_bytes());
        assert_eq!(
            decode_all(&bytes),
            Err(FrameError::NegativeLength {
                field: "payload",
                value: -5
            })
        );
    }

    #[test]
    fn test_rejects_oversize_before_buffering() {
        let mut bytes = BytesMut::from(&FrameCodec::default().encode(&Frame::ping(1)).unwrap()[..]);
        bytes[23..27].copy_from_slice(&4096i32.to_be_bytes());

        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            decoder.decode(&mut bytes),
            Err(FrameError::FrameTooLarge {
                length: 4096,
                max: 1024
            })
        );
    }

    #[test]
    fn test_encode_rejects_oversize_and_reserved() {
        let codec = FrameCodec::new(4);
        let frame = FrameBuilder::new(HandleType::OneWay, MessageType::Payload)
            .payload(Bytes::from_static(b"too long"))
            .build();
        assert!(matches!(
            codec.encode(&frame),
            Err(FrameError::FrameTooLarge { .. })
        ));

        let frame = FrameBuilder::new(HandleType::OneWay, MessageType::Payload)
            .header(":secret", "x")
            .build();
        assert_eq!(
            FrameCodec::default().encode(&frame),
            Err(FrameError::ReservedHeader(":secret".into()))
        );
    }

    #[test]
    fn test_rejects_malformed_var_header() {
        let codec = FrameCodec::default();
        let frame = FrameBuilder::new(HandleType::OneWay, MessageType::Payload)
            .header("k", "v")
            .build();
        let mut bytes = BytesMut::from(&codec.encode(&frame).unwrap()[..]);
        // Key length claims more bytes than the block holds
        bytes[27..29].copy_from_slice(&200u16.to_be_bytes());

        assert_eq!(
            decode_all(&bytes),
            Err(FrameError::MalformedHeader("entry overruns block"))
        );
    }
}
