use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration of a [`DataBackend`](crate::backend::DataBackend) and the
/// blob store behind it.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name of the container (bucket) the blobs are kept in.
    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,
    /// Root directory for the local filesystem store.
    pub path: Option<PathBuf>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Number of concurrent writer tasks.
    #[serde(default = "default_parallelism")]
    pub simultaneous_writes: usize,
    /// Number of concurrent reader tasks.
    #[serde(default = "default_parallelism")]
    pub simultaneous_reads: usize,
    /// Read bandwidth in bytes per second (0 = unlimited).
    #[serde(default)]
    pub bandwidth_read: u64,
    /// Write bandwidth in bytes per second (0 = unlimited).
    #[serde(default)]
    pub bandwidth_write: u64,
    /// Extra write queue capacity on top of `simultaneous_writes`.
    #[serde(default = "default_queue_slack")]
    pub write_queue_slack: usize,
    /// Extra read completion queue capacity on top of `simultaneous_reads`.
    #[serde(default = "default_queue_slack")]
    pub read_queue_slack: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry policy for reads failing with something other than "not found".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries; `None` retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_bucket_name() -> String {
    "blockvault".into()
}

fn default_parallelism() -> usize {
    1
}

fn default_queue_slack() -> usize {
    20
}

fn default_max_retries() -> Option<u32> {
    Some(8)
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bucket_name: default_bucket_name(),
            path: None,
            access_key_id: None,
            secret_access_key: None,
            simultaneous_writes: default_parallelism(),
            simultaneous_reads: default_parallelism(),
            bandwidth_read: 0,
            bandwidth_write: 0,
            write_queue_slack: default_queue_slack(),
            read_queue_slack: default_queue_slack(),
            retry: RetryConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.simultaneous_writes == 0 {
            return Err(Error::Config("simultaneous_writes must be at least 1".into()));
        }
        if self.simultaneous_reads == 0 {
            return Err(Error::Config("simultaneous_reads must be at least 1".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(Error::Config("bucket_name must not be empty".into()));
        }
        if self.retry.retry_delay_ms == 0 {
            return Err(Error::Config("retry.retry_delay_ms must be at least 1".into()));
        }
        if self.retry.retry_delay_ms > self.retry.retry_max_delay_ms {
            return Err(Error::Config(
                "retry.retry_delay_ms must not exceed retry.retry_max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn write_queue_len(&self) -> usize {
        self.simultaneous_writes + self.write_queue_slack
    }

    pub fn read_queue_len(&self) -> usize {
        self.simultaneous_reads + self.read_queue_slack
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("bucket_name", &self.bucket_name)
            .field("path", &self.path)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("simultaneous_writes", &self.simultaneous_writes)
            .field("simultaneous_reads", &self.simultaneous_reads)
            .field("bandwidth_read", &self.bandwidth_read)
            .field("bandwidth_write", &self.bandwidth_write)
            .field("write_queue_slack", &self.write_queue_slack)
            .field("read_queue_slack", &self.read_queue_slack)
            .field("retry", &self.retry)
            .finish()
    }
}
