/// Wakeup configuration builder
///
/// Turns a sparse recognition configuration (phrases, each with optional
/// per-user levels) into the dense confidence table the detection engine
/// expects, plus the fixed-layout parameter payloads staged alongside it.
///
/// The table has one slot per phrase followed by one slot per user level.
/// Phrase slots are filled in order; user slots are addressed directly by
/// the user id carried in the configuration.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Upper bound for any confidence level
pub const MAX_CONFIDENCE_LEVEL: u32 = 100;

/// Event info flags reported with a detection
pub const EVENT_MODE_CONFIDENCE_LEVELS: u32 = 0x1;
pub const EVENT_MODE_KEYWORD_INDICES: u32 = 0x2;
pub const EVENT_MODE_TIMESTAMP: u32 = 0x4;

/// Per-user level attached to a phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLevel {
    /// Slot in the confidence table this level is written to
    pub user_id: u32,

    /// Confidence level, clamped to 100
    pub level: u32,
}

/// One keyword phrase of a recognition request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phrase {
    pub id: u32,

    #[serde(default)]
    pub recognition_modes: u32,

    /// Keyword confidence level
    pub confidence_level: u8,

    #[serde(default)]
    pub levels: Vec<UserLevel>,
}

/// Recognition request supplied by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub phrases: Vec<Phrase>,

    /// Opaque vendor payload, only its size is forwarded
    #[serde(default)]
    pub custom_payload: Vec<u8>,
}

impl RecognitionConfig {
    /// Length of the confidence table this config produces
    pub fn table_len(&self) -> usize {
        self.phrases.len() + self.phrases.iter().map(|p| p.levels.len()).sum::<usize>()
    }
}

/// Dense confidence table pushed as the voice wakeup parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeupConfig {
    pub mode: u32,
    pub custom_payload_size: u32,
    pub confidence_levels: Vec<u8>,
    pub keyword_user_enables: Vec<u8>,
}

impl WakeupConfig {
    /// Build the table for `config` against a model declaring
    /// `model_phrases` phrases
    ///
    /// Any invalid user id aborts the build; no partial table is returned.
    pub fn build(config: &RecognitionConfig, model_phrases: u32) -> Result<Self> {
        let num_phrases = config.phrases.len();
        if num_phrases == 0 {
            return Err(EngineError::invalid("recognition config has no phrases"));
        }
        if num_phrases > model_phrases as usize {
            return Err(EngineError::invalid(format!(
                "recognition config has {} phrases, sound model declares {}",
                num_phrases, model_phrases
            )));
        }

        let table_len = config.table_len();
        let mut levels = vec![0u8; table_len];
        let mut consumed = vec![false; table_len];

        for (i, phrase) in config.phrases.iter().enumerate() {
            debug!("[{}] keyword level {}", i, phrase.confidence_level);
            levels[i] = phrase.confidence_level;

            for user in &phrase.levels {
                let slot = user.user_id as usize;
                if slot < num_phrases || slot >= table_len {
                    return Err(EngineError::invalid(format!(
                        "user id {} outside [{}, {})",
                        user.user_id, num_phrases, table_len
                    )));
                }
                if consumed[slot] {
                    return Err(EngineError::invalid(format!(
                        "duplicate user id {}",
                        user.user_id
                    )));
                }

                levels[slot] = user.level.min(MAX_CONFIDENCE_LEVEL) as u8;
                consumed[slot] = true;
                trace!("[{}] user {} level {}", i, user.user_id, levels[slot]);
            }
        }

        let custom_payload_size = u32::try_from(config.custom_payload.len())
            .map_err(|_| EngineError::invalid("custom payload too large"))?;

        debug!("Built wakeup config with {} active models", table_len);

        Ok(Self {
            mode: config.phrases[0].recognition_modes,
            custom_payload_size,
            keyword_user_enables: vec![1; table_len],
            confidence_levels: levels,
        })
    }

    pub fn num_active_models(&self) -> usize {
        self.confidence_levels.len()
    }

    /// `mode, custom_payload_size, num_active_models, reserved` as u32,
    /// then the levels, then the enable flags
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 2 * self.num_active_models());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.custom_payload_size.to_le_bytes());
        out.extend_from_slice(&(self.num_active_models() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.confidence_levels);
        out.extend_from_slice(&self.keyword_user_enables);
        out
    }
}

/// Which info the engine reports with a detection event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    pub event_mode: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            event_mode: EVENT_MODE_CONFIDENCE_LEVELS
                | EVENT_MODE_KEYWORD_INDICES
                | EVENT_MODE_TIMESTAMP,
        }
    }
}

impl EventConfig {
    pub fn encode(&self) -> Vec<u8> {
        self.event_mode.to_le_bytes().to_vec()
    }
}

/// History kept by the detection engine around a keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingConfig {
    pub hist_buffer_duration_ms: u32,
    pub pre_roll_duration_ms: u32,
}

impl BufferingConfig {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.hist_buffer_duration_ms.to_le_bytes());
        out.extend_from_slice(&self.pre_roll_duration_ms.to_le_bytes());
        out
    }
}

/// Setup time granted to one downstream output port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSetupDuration {
    pub output_port_id: u32,
    pub setup_duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamSetupDuration {
    pub ports: Vec<PortSetupDuration>,
}

impl DownstreamSetupDuration {
    /// `num_ports` ports numbered from 1, all with the same duration
    pub fn uniform(num_ports: u32, setup_duration_ms: u32) -> Self {
        Self {
            ports: (1..=num_ports)
                .map(|output_port_id| PortSetupDuration {
                    output_port_id,
                    setup_duration_ms,
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 8 * self.ports.len());
        out.extend_from_slice(&(self.ports.len() as u32).to_le_bytes());
        for port in &self.ports {
            out.extend_from_slice(&port.output_port_id.to_le_bytes());
            out.extend_from_slice(&port.setup_duration_ms.to_le_bytes());
        }
        out
    }
}
