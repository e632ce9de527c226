//! # Skein Core
//!
//! Multiplexed request/response transport over pooled byte-stream channels.
//!
//! This crate provides:
//! - `AsyncResult`, a single-assignment result with listeners, blocking wait
//!   and cancellation
//! - Frame encoding and incremental decoding for the Skein wire format
//! - Node identity
//! - The `rpc` layer: connection pooling, request correlation and dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                               │
//! │   (send_request / send_oneway / on_frame_received)              │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │       RequestRegistry        │         ConnectionPool           │
//! │ (request id → AsyncResult)   │  (Node → Connection → channels)  │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │                      FrameCodec                                 │
//! │   (fixed header + variable header + payload [+ CRC32C])         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 skein-transport channels                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod node;
pub mod promise;
pub mod rpc;

pub use codec::{FrameCodec, FrameDecoder};
pub use error::{FrameError, PromiseError, SyncError};
pub use frame::{CodecId, Encryption, Frame, FrameBuilder, HandleType, MessageType, ResponseStatus};
pub use node::{Node, NodeBuilder};
pub use promise::{AsyncResult, Outcome, ProgressiveAsyncResult};

/// Wire format family identifier (first byte of every frame)
pub const PROTOCOL_ID: u8 = 0x5C;

/// Wire format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes shared by every fixed header, up to and including the encryption type
pub const COMMON_HEADER_SIZE: usize = 15;

/// Fixed header size of REQUEST and ONEWAY frames (carries a u32 timeout)
pub const REQUEST_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4 + 8;

/// Fixed header size of RESPONSE frames (carries a u16 status)
pub const RESPONSE_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 2 + 8;

/// Size of the CRC32C trailer
pub const CHECKSUM_SIZE: usize = 4;

/// Default ceiling on variable header plus payload bytes
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Reserved variable header carrying the action name
pub const ACTION_HEADER: &str = ":action";
