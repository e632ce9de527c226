//! Configuration file for the `skein` CLI.

use serde::{Deserialize, Serialize};
use skein_core::rpc::DispatcherConfig;
use skein_transport::{TransportConfig, WorkerConfig};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Skein CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local node settings
    #[serde(default)]
    pub node: NodeConfig,
    /// Dispatcher, pool and wire settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Socket settings
    #[serde(default)]
    pub transport: TransportSection,
    /// Handler worker pool
    #[serde(default)]
    pub workers: WorkersSection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name advertised in logs
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Address `serve` binds when `--bind` is not given
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds (0 disables)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Per-channel read buffer size
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Handler worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSection {
    /// Worker threads (0 = one per CPU)
    #[serde(default)]
    pub threads: usize,
    /// Queued handler invocations per worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_node_name() -> String {
    "skein".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:7411".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive_secs: default_keepalive_secs(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("skein/config.toml")
    }

    /// Load config from the default path, or defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.node.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.dispatcher.validate()?;

        if self.workers.queue_capacity == 0 {
            anyhow::bail!("workers.queue_capacity must be greater than zero");
        }
        if self.transport.read_buffer_size < 1024 {
            anyhow::bail!("transport.read_buffer_size must be at least 1 KiB");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Socket options for the TCP connector and server
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            nodelay: self.transport.nodelay,
            keepalive: (self.transport.keepalive_secs > 0)
                .then(|| Duration::from_secs(self.transport.keepalive_secs)),
            connect_timeout: self.dispatcher.pool.connect_timeout(),
            read_buffer_size: self.transport.read_buffer_size,
            ..TransportConfig::default()
        }
    }

    /// Worker pool settings
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            num_workers: self.workers.threads,
            queue_capacity: self.workers.queue_capacity,
            ..WorkerConfig::default()
        }
    }
}

/// Split `host:port`
///
/// # Errors
///
/// Returns an error if the port is missing or invalid, or the host is empty.
pub fn parse_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("'{}' missing port (expected format: host:port)", addr);
    };
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' has invalid port: {}", addr, port))?;
    if port == 0 {
        anyhow::bail!("'{}' has invalid port: 0", addr);
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("'{}' has empty hostname", addr);
    }
    Ok((host.to_string(), port))
}
