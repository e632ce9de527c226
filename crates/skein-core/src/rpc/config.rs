//! Dispatcher configuration

use crate::frame::Encryption;
use crate::rpc::error::{RpcError, RpcResult};
use crate::DEFAULT_MAX_FRAME_LENGTH;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Channel selection strategy for a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Uniformly random channel per send
    #[default]
    Random,
    /// Cycle through channels in order
    RoundRobin,
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Connection pool settings
    pub pool: PoolConfig,

    /// Wire format settings
    pub wire: WireConfig,

    /// Deadline applied when a caller does not specify one (0 = none)
    pub default_timeout_ms: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            wire: WireConfig::default(),
            default_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    /// Validate configuration
    ///
    /// # Errors
    /// Returns `RpcError::InvalidConfig` describing the first invalid field.
    pub fn validate(&self) -> RpcResult<()> {
        self.pool.validate()?;
        self.wire.validate()
    }

    /// Default deadline, `None` when disabled
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(u64::from(self.default_timeout_ms)))
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Channels per remote node
    pub channels_per_node: usize,

    /// How a channel is chosen for each send
    pub selection: SelectionStrategy,

    /// Open every channel when the connection is created instead of on
    /// first use
    pub eager_connect: bool,

    /// Maximum time to open one channel
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channels_per_node: 4,
            selection: SelectionStrategy::Random,
            eager_connect: false,
            connect_timeout_ms: 3_000,
        }
    }
}

impl PoolConfig {
    /// Maximum channels per node accepted by `validate`
    pub const MAX_CHANNELS_PER_NODE: usize = 64;

    fn validate(&self) -> RpcResult<()> {
        if self.channels_per_node == 0 || self.channels_per_node > Self::MAX_CHANNELS_PER_NODE {
            return Err(RpcError::invalid_config(
                "pool.channels_per_node must be between 1 and 64",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(RpcError::invalid_config(
                "pool.connect_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Wire format configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Ceiling on variable header plus payload bytes of one frame
    pub max_frame_length: usize,

    /// Integrity protection applied to outbound frames
    pub encryption: Encryption,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            encryption: Encryption::None,
        }
    }
}

impl WireConfig {
    /// Smallest ceiling accepted by `validate`
    pub const MIN_FRAME_LENGTH: usize = 1024;

    fn validate(&self) -> RpcResult<()> {
        if self.max_frame_length < Self::MIN_FRAME_LENGTH
            || self.max_frame_length > i32::MAX as usize
        {
            return Err(RpcError::invalid_config(
                "wire.max_frame_length must be between 1 KiB and 2 GiB",
            ));
        }
        Ok(())
    }
}
