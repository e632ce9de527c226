//! Payload serializers.
//!
//! The frame header carries a codec id so the receiver knows how the payload
//! was produced. The header framing itself never depends on these.

use crate::frame::CodecId;
use crate::rpc::error::{RpcError, RpcResult};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;

/// Converts typed messages to and from payload bytes
pub trait Serializer: Send + Sync + 'static {
    /// Codec id written into the frame header
    fn codec_id(&self) -> CodecId;

    /// Serialize `value` into payload bytes
    ///
    /// # Errors
    /// Returns `RpcError::Serialization` if the value cannot be encoded.
    fn serialize<T: Serialize>(&self, value: &T) -> RpcResult<Bytes>;

    /// Deserialize payload bytes into `T`
    ///
    /// # Errors
    /// Returns `RpcError::Serialization` if the bytes are not a valid `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T>;
}

fn serialization_error(err: impl std::fmt::Display) -> RpcError {
    RpcError::Serialization(Cow::Owned(err.to_string()))
}

/// JSON payloads via `serde_json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn codec_id(&self) -> CodecId {
        CodecId::JSON
    }

    fn serialize<T: Serialize>(&self, value: &T) -> RpcResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(serialization_error)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T> {
        serde_json::from_slice(bytes).map_err(serialization_error)
    }
}

/// Compact binary payloads via `bincode`
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn codec_id(&self) -> CodecId {
        CodecId::BINCODE
    }

    fn serialize<T: Serialize>(&self, value: &T) -> RpcResult<Bytes> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(serialization_error)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T> {
        bincode::deserialize(bytes).map_err(serialization_error)
    }
}
