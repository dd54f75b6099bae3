//! # Server Configuration
//!
//! Loaded once at startup from TOML. Every section and field has a default,
//! so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [server]
//! name = "Kiln Server"
//! max_sessions = 20
//!
//! [settings]
//! async_workers = "auto"        # or a number
//!
//! [memory]
//! async_worker_hard_limit_mb = 256   # negative = unlimited
//!
//! [network]
//! compression_algorithm = "deflate"  # or "lz4"
//! batch_threshold = 256              # negative = never compress
//! compression_level = 6
//! async_compression = true
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{
    CompressionThreshold, Compressor, DeflateCompressor, Lz4Compressor, PoolConfig,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_DECOMPRESSION_SIZE,
    DEFAULT_WORKER_MEMORY_LIMIT_MB,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default tick rate.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 20;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity and limits.
    pub server: ServerSection,
    /// Worker and shutdown settings.
    pub settings: SettingsSection,
    /// Memory limits.
    pub memory: MemorySection,
    /// Batch compression.
    pub network: NetworkSection,
    /// Console behaviour.
    pub console: ConsoleSection,
    /// Tick rate.
    pub tick: TickSection,
    /// Usage reporting.
    pub anonymous_statistics: StatisticsSection,
}

/// `[server]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Name shown in the status line and query info.
    pub name: String,
    /// Session cap advertised to clients.
    pub max_sessions: usize,
    /// Reason given to sessions closed at shutdown.
    pub shutdown_message: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "Kiln Server".into(),
            max_sessions: 20,
            shutdown_message: "Server closed".into(),
        }
    }
}

/// Worker count: derived from the core count, or fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WorkerCountRepr", into = "WorkerCountRepr")]
pub enum WorkerCount {
    /// Cores minus two, at least one.
    #[default]
    Auto,
    /// Exactly this many.
    Fixed(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WorkerCountRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<WorkerCountRepr> for WorkerCount {
    type Error = String;

    fn try_from(repr: WorkerCountRepr) -> Result<Self, Self::Error> {
        match repr {
            WorkerCountRepr::Count(count) => Ok(Self::Fixed(count)),
            WorkerCountRepr::Keyword(word) if word.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            WorkerCountRepr::Keyword(word) => {
                Err(format!("expected \"auto\" or a number, got {word:?}"))
            }
        }
    }
}

impl From<WorkerCount> for WorkerCountRepr {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Auto => Self::Keyword("auto".into()),
            WorkerCount::Fixed(count) => Self::Count(count),
        }
    }
}

impl WorkerCount {
    /// Resolves to a concrete count.
    #[must_use]
    pub fn resolve(self) -> usize {
        match self {
            Self::Auto => PoolConfig::default_worker_count(),
            Self::Fixed(count) => count,
        }
    }
}

/// `[settings]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSection {
    /// Async worker count.
    pub async_workers: WorkerCount,
    /// Seconds the shutdown watchdog waits before killing the process.
    pub shutdown_timeout_secs: u64,
    /// Milliseconds the pool waits for workers on shutdown.
    pub pool_shutdown_timeout_ms: u64,
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            async_workers: WorkerCount::Auto,
            shutdown_timeout_secs: 8,
            pool_shutdown_timeout_ms: 5000,
        }
    }
}

/// `[memory]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Per-worker limit in MiB before recycling. Negative disables it.
    pub async_worker_hard_limit_mb: i64,
    /// Total worker memory warning threshold in MiB. Negative disables it.
    pub global_soft_limit_mb: i64,
    /// Ticks between memory checks.
    pub check_rate_ticks: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            async_worker_hard_limit_mb: DEFAULT_WORKER_MEMORY_LIMIT_MB,
            global_soft_limit_mb: -1,
            check_rate_ticks: 20,
        }
    }
}

/// Batch compression codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Raw deflate.
    #[default]
    Deflate,
    /// LZ4 block with size prefix.
    Lz4,
}

/// `[network]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Codec for outgoing batches.
    pub compression_algorithm: CompressionAlgorithm,
    /// Minimum batch size to compress. Negative disables compression.
    pub batch_threshold: i64,
    /// Deflate level, 1 to 9.
    pub compression_level: u32,
    /// Allow compressing large batches on workers.
    pub async_compression: bool,
    /// Largest accepted decompressed batch.
    pub max_decompression_size: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            compression_algorithm: CompressionAlgorithm::Deflate,
            batch_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            async_compression: true,
            max_decompression_size: DEFAULT_MAX_DECOMPRESSION_SIZE,
        }
    }
}

/// `[console]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSection {
    /// Read commands from standard input.
    pub enabled: bool,
    /// Write the status line as a terminal title.
    pub title_tick: bool,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            title_tick: true,
        }
    }
}

/// `[tick]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickSection {
    /// Target tick rate.
    pub ticks_per_second: u32,
    /// TPS average below which the server warns about overload.
    pub overload_tps: f64,
}

impl Default for TickSection {
    fn default() -> Self {
        Self {
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            overload_tps: 12.0,
        }
    }
}

/// `[anonymous_statistics]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSection {
    /// Send usage reports.
    pub enabled: bool,
    /// Ticks between status reports.
    pub interval_ticks: u64,
}

impl Default for StatisticsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ticks: 6000,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Normalises out-of-range values, failing only when there is no
    /// sensible fallback.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server.max_sessions == 0 {
            return Err(ConfigError::Invalid("server.max_sessions must be at least 1".into()));
        }
        if let WorkerCount::Fixed(0) = self.settings.async_workers {
            return Err(ConfigError::Invalid("settings.async_workers must be at least 1".into()));
        }
        if !(1..=9).contains(&self.network.compression_level) {
            tracing::warn!(
                level = self.network.compression_level,
                "Invalid compression level, using {DEFAULT_COMPRESSION_LEVEL}"
            );
            self.network.compression_level = DEFAULT_COMPRESSION_LEVEL;
        }
        if self.tick.ticks_per_second == 0 {
            tracing::warn!("Tick rate of zero, using {DEFAULT_TICKS_PER_SECOND}");
            self.tick.ticks_per_second = DEFAULT_TICKS_PER_SECOND;
        }
        if self.memory.check_rate_ticks == 0 {
            tracing::warn!("Memory check rate of zero, checking every 20 ticks");
            self.memory.check_rate_ticks = 20;
        }
        if self.anonymous_statistics.interval_ticks == 0 {
            self.anonymous_statistics.interval_ticks = StatisticsSection::default().interval_ticks;
        }
        Ok(())
    }

    /// Worker pool settings.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from_limit_mb(
            self.settings.async_workers.resolve(),
            self.memory.async_worker_hard_limit_mb,
        )
    }

    /// Builds the configured batch compressor.
    #[must_use]
    pub fn compressor(&self) -> Arc<dyn Compressor> {
        let threshold = CompressionThreshold::from_setting(self.network.batch_threshold);
        let max = self.network.max_decompression_size;
        match self.network.compression_algorithm {
            CompressionAlgorithm::Deflate => {
                Arc::new(DeflateCompressor::new(self.network.compression_level, threshold, max))
            }
            CompressionAlgorithm::Lz4 => Arc::new(Lz4Compressor::new(threshold, max)),
        }
    }

    /// Global soft limit in bytes, if enabled.
    #[must_use]
    pub fn global_soft_limit(&self) -> Option<usize> {
        usize::try_from(self.memory.global_soft_limit_mb)
            .ok()
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Time the pool waits for workers on shutdown.
    #[must_use]
    pub const fn pool_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.pool_shutdown_timeout_ms)
    }

    /// Time the watchdog allows for the whole shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.shutdown_timeout_secs)
    }
}
