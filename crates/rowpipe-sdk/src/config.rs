//! Collector configuration
//!
//! Every field has a default so a partition config only needs to name what it
//! changes. `from_env` reads `ROWPIPE_*` overrides on top of the defaults.

use rowpipe_common::{Result, SdkError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::loader::LoaderKind;

/// Token bucket admission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub fill_rate: f64,
    /// Bucket size, i.e. how many downloads may start back to back
    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Settings for one collection of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Rows per output chunk (default: 10,000)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Simultaneous downloads (default: 10)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Optional download rate limit, combined with `max_concurrency`
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Minimum milliseconds between status events (default: 250)
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Capacity of the loader to extractor channel (default: 1,000)
    #[serde(default = "default_row_channel_capacity")]
    pub row_channel_capacity: usize,
    /// Drop the first row each artifact yields after extraction and mapping
    #[serde(default)]
    pub skip_header: bool,
    /// Decode each artifact as one value instead of line by line
    #[serde(default)]
    pub whole_object: bool,
    /// Force a loader instead of inferring it from the artifact name
    #[serde(default)]
    pub loader: Option<LoaderKind>,
    /// Fixed execution id; a UUID is generated per run when unset
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Directory for the JSONL chunk writer
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Collection state file; state is kept in memory when unset
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_max_concurrency() -> usize {
    10
}

fn default_status_interval_ms() -> u64 {
    250
}

fn default_row_channel_capacity() -> usize {
    1_000
}

fn default_burst() -> u32 {
    1
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("rowpipe")
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            rate_limit: None,
            status_interval_ms: default_status_interval_ms(),
            row_channel_capacity: default_row_channel_capacity(),
            skip_header: false,
            whole_object: false,
            loader: None,
            execution_id: None,
            output_dir: default_output_dir(),
            state_path: None,
        }
    }
}

impl CollectorConfig {
    /// Load configuration from `ROWPIPE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("ROWPIPE_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = env_parse("ROWPIPE_MAX_CONCURRENCY")? {
            config.max_concurrency = v;
        }
        if let Some(v) = env_parse("ROWPIPE_STATUS_INTERVAL_MS")? {
            config.status_interval_ms = v;
        }
        if let Some(v) = env_parse("ROWPIPE_ROW_CHANNEL_CAPACITY")? {
            config.row_channel_capacity = v;
        }
        if let Some(v) = env_parse("ROWPIPE_SKIP_HEADER")? {
            config.skip_header = v;
        }
        if let Some(v) = env_parse("ROWPIPE_WHOLE_OBJECT")? {
            config.whole_object = v;
        }
        if let Some(fill_rate) = env_parse::<f64>("ROWPIPE_RATE_LIMIT")? {
            config.rate_limit = Some(RateLimitConfig {
                fill_rate,
                burst: env_parse("ROWPIPE_RATE_BURST")?.unwrap_or_else(default_burst),
            });
        }
        if let Ok(dir) = std::env::var("ROWPIPE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("ROWPIPE_STATE_PATH") {
            config.state_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SdkError::config("chunk_size must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(SdkError::config("max_concurrency must be at least 1"));
        }
        if self.row_channel_capacity == 0 {
            return Err(SdkError::config("row_channel_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SdkError::config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
