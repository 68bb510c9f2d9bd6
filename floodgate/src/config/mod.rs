use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Consumer offset reset policy applied when a partition has neither a
/// committed offset nor an explicit start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Mirror workloads default to replaying from the beginning.
    #[default]
    Earliest,
    Latest,
}

/// Task-level tuning knobs. Field names follow the wire form of the
/// connector configuration, so a JSON blob of
/// `{"offsetCommitInterval": "60s", ...}` deserializes directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    #[serde(with = "humantime_serde")]
    pub offset_commit_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_sleep: Duration,
    pub max_retry_count: u32,
    pub pause_partition_on_error: bool,
    #[serde(with = "humantime_serde")]
    pub pause_error_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub processing_delay_threshold: Duration,
    pub flushless_mode: bool,
    pub flow_control_enabled: bool,
    pub max_in_flight_messages_threshold: u64,
    pub min_in_flight_messages_threshold: u64,
    pub auto_offset_reset: OffsetReset,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            offset_commit_interval: Duration::from_secs(60),
            retry_sleep: Duration::from_secs(5),
            max_retry_count: 5,
            pause_partition_on_error: true,
            pause_error_duration: Duration::from_secs(10 * 60),
            processing_delay_threshold: Duration::from_secs(60),
            flushless_mode: false,
            flow_control_enabled: false,
            max_in_flight_messages_threshold: 5000,
            min_in_flight_messages_threshold: 1000,
            auto_offset_reset: OffsetReset::Earliest,
        }
    }
}

impl TaskConfig {
    /// Poll timeout for the consumer: half the commit interval, leaving the
    /// other half for processing.
    pub fn poll_timeout(&self) -> Duration {
        self.offset_commit_interval / 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_control_enabled && !self.flushless_mode {
            return Err(ConfigError::FlowControlRequiresFlushless);
        }

        if self.min_in_flight_messages_threshold > self.max_in_flight_messages_threshold {
            return Err(ConfigError::InFlightThresholdOrder {
                min: self.min_in_flight_messages_threshold,
                max: self.max_in_flight_messages_threshold,
            });
        }

        if self.offset_commit_interval.is_zero() {
            return Err(ConfigError::ZeroCommitInterval);
        }

        Ok(())
    }
}

/// Connector-level configuration: the per-task knobs plus the supervisor's
/// cadence and grace periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    #[serde(with = "humantime_serde")]
    pub daemon_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub non_good_state_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub cancel_task_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            daemon_interval: Duration::from_secs(5 * 60),
            non_good_state_threshold: Duration::from_secs(10 * 60),
            cancel_task_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.task.validate()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("flowControlEnabled requires flushlessMode")]
    FlowControlRequiresFlushless,
    #[error("minInFlightMessagesThreshold {min} exceeds maxInFlightMessagesThreshold {max}")]
    InFlightThresholdOrder { min: u64, max: u64 },
    #[error("offsetCommitInterval must be greater than zero")]
    ZeroCommitInterval,
}
