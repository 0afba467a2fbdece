//! Sound trigger engine library
//!
//! Keyword-detection stage that sits between a capture session and a
//! second-stage recognizer:
//! - Ring buffering of keyword audio on a background thread
//! - Repacking of multi-model sound model containers
//! - Per-keyword / per-user confidence table construction

pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod ring_buffer;
pub mod session;
pub mod sound_model;
pub mod wakeup_config;

// Re-export main types
pub use buffering::{BufferingLoop, DetectionSignal, LoopPhase, ShortWritePolicy};
pub use config::{ConfigError, EngineConfig};
pub use engine::SoundTriggerEngine;
pub use error::{EngineError, Result};
pub use ring_buffer::{RingBuffer, RingBufferError, RingBufferReader};
pub use session::{
    BufferGeometry, CaptureSession, LoopbackSession, ParamId, SessionError, StreamAttributes,
    StreamAttributesProvider, StreamDirection,
};
pub use sound_model::{repack, KeyphraseModel, KeyphraseRecord, SoundModel, SoundModelKind};
pub use wakeup_config::{Phrase, RecognitionConfig, UserLevel, WakeupConfig};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
