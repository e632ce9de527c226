//! Frames of the Skein wire protocol.
//!
//! A [`Frame`] is the owned, decoded form of one unit on the wire. Fields
//! that do not apply to a frame's handle type are normalized (a RESPONSE has
//! no timeout, REQUEST and ONEWAY frames always carry status OK) so that
//! decoding an encoded frame yields an equal value.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//!  0      1      2      3      4      5             13     14     15
//!  +------+------+------+------+------+-------------+------+------+--------------+
//!  | 0x5C | ver  |handle| msg  |msgver| request id  |codec | enc  | timeout u32  |  REQUEST / ONEWAY
//!  +------+------+------+------+------+-------------+------+------+--------------+
//!                                                                 | status u16   |  RESPONSE
//!                                                                 +--------------+
//!  +----------------+----------------+---------------+-----------+-------------+
//!  | var len (i32)  | payload len    | var header    | payload   | CRC32C (opt)|
//!  +----------------+----------------+---------------+-----------+-------------+
//! ```

use crate::error::FrameError;
use crate::{ACTION_HEADER, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a frame expects, is, or never gets a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleType {
    /// Expects exactly one RESPONSE
    Request = 0,
    /// Answers a REQUEST with the same request id
    Response = 1,
    /// Fire-and-forget, never answered
    OneWay = 2,
}

impl TryFrom<u8> for HandleType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::OneWay),
            _ => Err(FrameError::InvalidHandleType(value)),
        }
    }
}

impl HandleType {
    /// Size of the fixed header for this handle type
    pub const fn header_size(self) -> usize {
        match self {
            HandleType::Response => RESPONSE_HEADER_SIZE,
            HandleType::Request | HandleType::OneWay => REQUEST_HEADER_SIZE,
        }
    }
}

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application payload addressed to an action
    Payload = 0,
    /// Liveness probe, empty payload
    Ping = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Payload),
            1 => Ok(Self::Ping),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Integrity protection applied to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Encryption {
    /// No trailer
    #[default]
    None = 0,
    /// CRC32C trailer over the whole frame
    Crc = 1,
}

impl TryFrom<u8> for Encryption {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc),
            _ => Err(FrameError::InvalidEncryption(value)),
        }
    }
}

/// Outcome carried by a RESPONSE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum ResponseStatus {
    /// Handler succeeded; payload is the result
    #[default]
    Ok = 0,
    /// Handler failed; payload is a serialized error
    Error = 1,
}

impl TryFrom<u16> for ResponseStatus {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            _ => Err(FrameError::InvalidStatus(value)),
        }
    }
}

/// Payload serialization identifier.
///
/// Unknown ids are carried through untouched; interpreting the payload is
/// the receiver's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodecId(pub u8);

impl CodecId {
    /// Opaque bytes
    pub const RAW: CodecId = CodecId(0);
    /// serde_json
    pub const JSON: CodecId = CodecId(1);
    /// bincode
    pub const BINCODE: CodecId = CodecId(2);
}

/// One decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) handle_type: HandleType,
    pub(crate) message_type: MessageType,
    pub(crate) message_type_version: u8,
    pub(crate) request_id: u64,
    pub(crate) codec: CodecId,
    pub(crate) encryption: Encryption,
    pub(crate) timeout_ms: u32,
    pub(crate) status: ResponseStatus,
    pub(crate) action: Option<String>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// REQUEST/PING with an empty payload
    pub fn ping(request_id: u64) -> Self {
        FrameBuilder::new(HandleType::Request, MessageType::Ping)
            .request_id(request_id)
            .build()
    }

    /// RESPONSE/PING answering `ping`, echoing its request id and integrity
    /// setting
    pub fn pong(ping: &Frame) -> Self {
        FrameBuilder::new(HandleType::Response, MessageType::Ping)
            .request_id(ping.request_id)
            .encryption(ping.encryption)
            .build()
    }

    /// RESPONSE to `request` with the given status and payload
    pub fn response_to(request: &Frame, status: ResponseStatus, payload: Bytes) -> Self {
        FrameBuilder::new(HandleType::Response, request.message_type)
            .request_id(request.request_id)
            .message_type_version(request.message_type_version)
            .codec(request.codec)
            .encryption(request.encryption)
            .status(status)
            .payload(payload)
            .build()
    }

    /// Handle type
    pub fn handle_type(&self) -> HandleType {
        self.handle_type
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Message-type version
    pub fn message_type_version(&self) -> u8 {
        self.message_type_version
    }

    /// Request id
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Payload codec
    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Integrity protection
    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    /// Requested deadline in milliseconds (0 = none); always 0 on RESPONSE
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Response status; always OK on REQUEST and ONEWAY
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Action name carried in the reserved `:action` header
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Application headers (without reserved keys)
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Look up one application header
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether this frame expects a response
    pub fn expects_response(&self) -> bool {
        self.handle_type == HandleType::Request
    }

    /// Iterate over every variable header entry in wire order, including the
    /// reserved `:action` entry
    pub(crate) fn wire_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.action
            .as_deref()
            .map(|a| (ACTION_HEADER, a))
            .into_iter()
            .chain(self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Builder for constructing frames
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    frame: Frame,
}

impl FrameBuilder {
    /// Start a frame of the given handle and message type
    pub fn new(handle_type: HandleType, message_type: MessageType) -> Self {
        Self {
            frame: Frame {
                handle_type,
                message_type,
                message_type_version: 0,
                request_id: 0,
                codec: CodecId::RAW,
                encryption: Encryption::None,
                timeout_ms: 0,
                status: ResponseStatus::Ok,
                action: None,
                headers: BTreeMap::new(),
                payload: Bytes::new(),
            },
        }
    }

    /// Set the request id
    pub fn request_id(mut self, id: u64) -> Self {
        self.frame.request_id = id;
        self
    }

    /// Set the message-type version
    pub fn message_type_version(mut self, version: u8) -> Self {
        self.frame.message_type_version = version;
        self
    }

    /// Set the payload codec
    pub fn codec(mut self, codec: CodecId) -> Self {
        self.frame.codec = codec;
        self
    }

    /// Set the integrity protection
    pub fn encryption(mut self, encryption: Encryption) -> Self {
        self.frame.encryption = encryption;
        self
    }

    /// Set the deadline (ignored on RESPONSE)
    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.frame.timeout_ms = timeout_ms;
        self
    }

    /// Set the response status (ignored on REQUEST and ONEWAY)
    pub fn status(mut self, status: ResponseStatus) -> Self {
        self.frame.status = status;
        self
    }

    /// Set the action name
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.frame.action = Some(action.into());
        self
    }

    /// Add an application header. Keys starting with `:` are rejected at
    /// encode time.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.frame.headers.insert(key.into(), value.into());
        self
    }

    /// Replace all application headers
    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.frame.headers = headers;
        self
    }

    /// Set the payload
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.frame.payload = payload.into();
        self
    }

    /// Finish the frame, normalizing fields that do not apply to its handle
    /// type
    pub fn build(self) -> Frame {
        let mut frame = self.frame;
        match frame.handle_type {
            HandleType::Response => frame.timeout_ms = 0,
            HandleType::Request | HandleType::OneWay => frame.status = ResponseStatus::Ok,
        }
        if frame.message_type == MessageType::Ping {
            frame.payload = Bytes::new();
        }
        frame
    }
}
