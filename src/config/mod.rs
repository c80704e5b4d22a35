//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single `Config`.
//! The three resource identifiers can also come from the plain `TOPIC_ID`,
//! `QUEUE_ID` and `DLQ_ID` variables.

use std::time::Duration;

use serde::Deserialize;

use crate::classifier::DEFAULT_FAILURE_MARKER;
use crate::consumer::ConsumerConfig;
use crate::dlq::DEFAULT_MAX_RECEIVE_COUNT;
use crate::gateway::{DEFAULT_MAX_MESSAGES, DEFAULT_WAIT_TIME_SECS};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FANOUT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FANOUT_LOG";

/// Environment variable for the topic identifier (SNS topic ARN).
pub const TOPIC_ID_ENV_VAR: &str = "TOPIC_ID";
/// Environment variable for the main queue identifier (SQS queue URL).
pub const QUEUE_ID_ENV_VAR: &str = "QUEUE_ID";
/// Environment variable for the dead-letter queue identifier.
pub const DLQ_ID_ENV_VAR: &str = "DLQ_ID";

/// Older names for the resource identifiers, checked when the primary is unset.
const LEGACY_TOPIC_ENV_VAR: &str = "TOPIC_ARN";
const LEGACY_QUEUE_ENV_VAR: &str = "QUEUE_URL";
const LEGACY_DLQ_ENV_VAR: &str = "DLQ_URL";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AWS connection settings.
    pub aws: AwsConfig,
    /// Topic and queue identifiers.
    pub resources: ResourcesConfig,
    /// Consumption loop settings.
    pub consumer: ConsumerSettings,
    /// Dead-letter settings.
    pub dead_letter: DeadLetterConfig,
    /// Process run settings.
    pub run: RunConfig,
}

/// AWS connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// AWS region. Falls back to the SDK provider chain.
    pub region: Option<String>,
    /// Custom endpoint (LocalStack).
    pub endpoint_url: Option<String>,
}

/// Topic and queue identifiers as configured (possibly incomplete).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub topic_id: Option<String>,
    pub queue_id: Option<String>,
    pub dlq_id: Option<String>,
}

/// Validated resource identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub topic_id: String,
    pub queue_id: String,
    pub dlq_id: String,
}

/// Consumption loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Messages per poll, 1 to 10.
    pub max_messages: i32,
    /// Long-poll wait, 0 to 20 seconds.
    pub wait_time_secs: i32,
    /// Pause after a failed poll.
    pub error_backoff_ms: u64,
    /// Substring that marks a message body as failed.
    pub failure_marker: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
            error_backoff_ms: 1000,
            failure_marker: DEFAULT_FAILURE_MARKER.to_string(),
        }
    }
}

/// Dead-letter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Expected redrive threshold of the main queue. Only compared against
    /// the queue's actual policy at startup.
    pub max_receive_count: u32,
    /// Messages to peek when reporting at shutdown.
    pub peek_max_messages: i32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            peek_max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

/// Process run settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after this many seconds. Runs until Ctrl+C when unset.
    pub window_secs: Option<u64>,
    /// Messages published to the topic before consuming starts. YAML only.
    pub startup_messages: Vec<String>,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fanout.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `FANOUT__CONSUMER__WAIT_TIME_SECS`
    /// 5. `TOPIC_ID`, `QUEUE_ID`, `DLQ_ID` (or `TOPIC_ARN`, `QUEUE_URL`, `DLQ_URL`)
    ///
    /// `run.startup_messages` is YAML-only: environment values are never split
    /// into lists, so message bodies keep their commas.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the plain resource identifier variables.
    fn apply_env_overrides(&mut self) {
        if let Some(topic) = env_with_fallback(TOPIC_ID_ENV_VAR, LEGACY_TOPIC_ENV_VAR) {
            self.resources.topic_id = Some(topic);
        }
        if let Some(queue) = env_with_fallback(QUEUE_ID_ENV_VAR, LEGACY_QUEUE_ENV_VAR) {
            self.resources.queue_id = Some(queue);
        }
        if let Some(dlq) = env_with_fallback(DLQ_ID_ENV_VAR, LEGACY_DLQ_ENV_VAR) {
            self.resources.dlq_id = Some(dlq);
        }
    }

    /// Resolve the three resource identifiers, failing on any that is missing.
    pub fn resources(&self) -> Result<Resources, ConfigError> {
        Ok(Resources {
            topic_id: required(&self.resources.topic_id, "resources.topic_id")?,
            queue_id: required(&self.resources.queue_id, "resources.queue_id")?,
            dlq_id: required(&self.resources.dlq_id, "resources.dlq_id")?,
        })
    }

    /// Check numeric ranges and the failure marker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.consumer.max_messages) {
            return Err(ConfigError::Invalid {
                field: "consumer.max_messages",
                reason: format!("{} is outside 1..=10", self.consumer.max_messages),
            });
        }
        if !(0..=20).contains(&self.consumer.wait_time_secs) {
            return Err(ConfigError::Invalid {
                field: "consumer.wait_time_secs",
                reason: format!("{} is outside 0..=20", self.consumer.wait_time_secs),
            });
        }
        if self.consumer.failure_marker.is_empty() {
            return Err(ConfigError::Invalid {
                field: "consumer.failure_marker",
                reason: "must not be empty".to_string(),
            });
        }
        if !(1..=10).contains(&self.dead_letter.peek_max_messages) {
            return Err(ConfigError::Invalid {
                field: "dead_letter.peek_max_messages",
                reason: format!("{} is outside 1..=10", self.dead_letter.peek_max_messages),
            });
        }
        if self.dead_letter.max_receive_count == 0 {
            return Err(ConfigError::Invalid {
                field: "dead_letter.max_receive_count",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Build the consumption loop settings for the main queue.
    pub fn consumer_config(&self, resources: &Resources) -> ConsumerConfig {
        ConsumerConfig::new(resources.queue_id.clone())
            .with_max_messages(self.consumer.max_messages)
            .with_wait_time(self.consumer.wait_time_secs)
            .with_error_backoff(Duration::from_millis(self.consumer.error_backoff_ms))
    }
}

fn env_with_fallback(primary: &str, legacy: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(legacy).ok())
        .filter(|v| !v.is_empty())
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(field))
}
