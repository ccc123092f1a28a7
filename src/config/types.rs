use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default input: the bundled sample CDC dataset.
pub const DEFAULT_INPUT: &str = "samples/customers.jsonl";

/// Default output: a JSON-lines file in the working directory.
pub const DEFAULT_OUTPUT: &str = "output.txt";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub window: WindowConfig,
    pub watermark: WatermarkConfig,
    pub transform: TransformConfig,
    pub commit: CommitConfig,
    pub sink: SinkConfig,
    pub dead_letter: DeadLetterConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub topic: String,
    pub input: PathBuf,
    pub timestamp: Option<TimestampConfig>,
    pub pull_batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_unavailable_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            topic: "dbserver1.inventory.customers".to_string(),
            input: PathBuf::from(DEFAULT_INPUT),
            timestamp: Some(TimestampConfig::cdc_ts_ms()),
            pull_batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_unavailable_retries: 5,
            retry_backoff_base: Duration::from_millis(500),
            retry_backoff_cap: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    pub pattern: String,
    pub format: String,
}

impl TimestampConfig {
    /// Debezium-style envelopes carry the change time as `"ts_ms": <epoch millis>`.
    pub fn cdc_ts_ms() -> Self {
        Self {
            pattern: r#""ts_ms":\s*(?P<ts>\d+)"#.to_string(),
            format: "epoch_ms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(with = "humantime_serde")]
    pub allowed_lateness: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(2),
            allowed_lateness: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Fall back to wall-clock watermarks when the source gives no hint.
    pub degraded_mode: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub require_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
    pub max_concurrent: usize,
    pub backpressure_threshold: usize,
    pub on_exhausted: ExhaustedPolicy,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_base: Duration::from_millis(200),
            retry_backoff_cap: Duration::from_secs(10),
            max_concurrent: 4,
            backpressure_threshold: 2,
            on_exhausted: ExhaustedPolicy::Halt,
        }
    }
}

/// What to do with a window whose commit retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    Halt,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub output: PathBuf,
    pub table: String,
    pub create_disposition: CreateDisposition,
    pub max_rows_per_call: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            table: "customers_cdc".to_string(),
            create_disposition: CreateDisposition::CreateIfNeeded,
            max_rows_per_call: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// JSON-lines file for diverted messages; `None` drops them with a log line.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            poll_interval: Duration::from_millis(100),
        }
    }
}
