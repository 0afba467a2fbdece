/// Engine configuration
///
/// Defaults match the reference tuning of the detection pipeline. A config
/// can be loaded from a JSON file and adjusted through `SOUNDTRIGGER_*`
/// environment variables.

use crate::buffering::ShortWritePolicy;
use crate::ring_buffer::DEFAULT_RING_BUFFER_SIZE;
use crate::wakeup_config::{BufferingConfig, DownstreamSetupDuration, EventConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

pub const HIST_BUFFER_DURATION_MS: u32 = 1750;
pub const PRE_ROLL_DURATION_MS: u32 = 250;
pub const DOWNSTREAM_SETUP_DURATION_MS: u32 = 300;

/// Seconds of audio the engine-owned ring buffer holds
pub const RING_BUFFER_DURATION_SECS: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine_id: u32,

    pub stage_id: u32,

    /// Ring buffer length for input streams
    pub ring_buffer_duration_secs: u32,

    /// Ring buffer size when the stream is not an input
    pub default_ring_buffer_size: usize,

    pub hist_buffer_duration_ms: u32,

    pub pre_roll_duration_ms: u32,

    pub downstream_setup_duration_ms: u32,

    pub num_output_ports: u32,

    /// Event info flags, see `wakeup_config::EVENT_MODE_*`
    pub event_mode: u32,

    pub short_write_policy: ShortWritePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: 0,
            stage_id: 0,
            ring_buffer_duration_secs: RING_BUFFER_DURATION_SECS,
            default_ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            hist_buffer_duration_ms: HIST_BUFFER_DURATION_MS,
            pre_roll_duration_ms: PRE_ROLL_DURATION_MS,
            downstream_setup_duration_ms: DOWNSTREAM_SETUP_DURATION_MS,
            num_output_ports: 1,
            event_mode: EventConfig::default().event_mode,
            short_write_policy: ShortWritePolicy::Drop,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading engine config from {}", path.display());

        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve `SOUNDTRIGGER_*` variables
    ///
    /// `SOUNDTRIGGER_CONFIG` names a JSON file used as the base; individual
    /// variables override single fields on top of it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("SOUNDTRIGGER_CONFIG") {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        override_with(&lookup, "SOUNDTRIGGER_ENGINE_ID", &mut config.engine_id)?;
        override_with(&lookup, "SOUNDTRIGGER_STAGE_ID", &mut config.stage_id)?;
        override_with(
            &lookup,
            "SOUNDTRIGGER_RING_BUFFER_SECS",
            &mut config.ring_buffer_duration_secs,
        )?;
        override_with(
            &lookup,
            "SOUNDTRIGGER_HIST_BUFFER_MS",
            &mut config.hist_buffer_duration_ms,
        )?;
        override_with(&lookup, "SOUNDTRIGGER_PRE_ROLL_MS", &mut config.pre_roll_duration_ms)?;
        override_with(
            &lookup,
            "SOUNDTRIGGER_SHORT_WRITE_POLICY",
            &mut config.short_write_policy,
        )?;

        config.validate()?;
        info!("Engine config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_buffer_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "ring_buffer_duration_secs must be greater than 0".to_string(),
            ));
        }

        if self.default_ring_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "default_ring_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.num_output_ports == 0 {
            return Err(ConfigError::Invalid(
                "num_output_ports must be at least 1".to_string(),
            ));
        }

        if self.pre_roll_duration_ms > self.hist_buffer_duration_ms {
            return Err(ConfigError::Invalid(format!(
                "pre_roll_duration_ms ({}) exceeds hist_buffer_duration_ms ({})",
                self.pre_roll_duration_ms, self.hist_buffer_duration_ms
            )));
        }

        Ok(())
    }

    pub fn event_config(&self) -> EventConfig {
        EventConfig {
            event_mode: self.event_mode,
        }
    }

    pub fn buffering_config(&self) -> BufferingConfig {
        BufferingConfig {
            hist_buffer_duration_ms: self.hist_buffer_duration_ms,
            pre_roll_duration_ms: self.pre_roll_duration_ms,
        }
    }

    pub fn setup_duration(&self) -> DownstreamSetupDuration {
        DownstreamSetupDuration::uniform(self.num_output_ports, self.downstream_setup_duration_ms)
    }
}

fn override_with<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        let parsed: Option<T> = value.trim().parse().ok();
        *target = parsed.ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}
