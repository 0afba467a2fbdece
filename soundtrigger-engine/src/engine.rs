/// Sound trigger engine
///
/// Ties the pieces together for one detection stage: repacks and loads the
/// sound model, turns recognition configs into staged parameters, pushes
/// them on start, and runs the buffering thread that moves keyword audio
/// into the ring buffer once the detector raises the detection flag.

use crate::buffering::{BufferingLoop, DetectionSignal, LoopPhase};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ring_buffer::{RingBuffer, RingBufferReader};
use crate::session::{CaptureSession, ParamId, StreamAttributesProvider, StreamDirection};
use crate::sound_model::{self, SoundModel};
use crate::wakeup_config::{
    BufferingConfig, DownstreamSetupDuration, EventConfig, RecognitionConfig, WakeupConfig,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const BITS_PER_BYTE: u64 = 8;

/// Parameters built by `update_config`, pushed by `start_recognition`
#[derive(Debug, Clone)]
struct StagedConfig {
    wakeup: WakeupConfig,
    event: EventConfig,
    buffering: BufferingConfig,
    setup_duration: DownstreamSetupDuration,
}

/// Keyword detection engine for one stage
pub struct SoundTriggerEngine {
    config: EngineConfig,
    session: Arc<dyn CaptureSession>,
    /// Buffer this engine writes into, `None` when reading an external one
    ring: Option<Arc<RingBuffer>>,
    reader: Option<RingBufferReader>,
    signal: DetectionSignal,
    buffering: Option<BufferingLoop>,
    running: bool,
    model: Option<SoundModel>,
    staged: Option<StagedConfig>,
}

impl SoundTriggerEngine {
    /// Create an engine on `session`
    ///
    /// Without `external_buffer` the engine owns a ring buffer sized from the
    /// stream attributes and returns a reader on it for the downstream
    /// consumer. With one, the engine only keeps its own reader on it (see
    /// [`SoundTriggerEngine::reader`]) and never writes to it.
    pub fn new(
        config: EngineConfig,
        session: Arc<dyn CaptureSession>,
        attributes: &dyn StreamAttributesProvider,
        external_buffer: Option<Arc<RingBuffer>>,
    ) -> Result<(Self, Option<RingBufferReader>)> {
        config
            .validate()
            .map_err(|e| EngineError::invalid(e.to_string()))?;

        info!(
            "Initializing sound trigger engine {} (stage {})",
            config.engine_id, config.stage_id
        );

        let (ring, reader, consumer_reader) = match external_buffer {
            None => {
                let size = ring_buffer_size(&config, attributes)?;
                info!("Creating new ring buffer of {} bytes", size);
                let ring = Arc::new(
                    RingBuffer::with_capacity(size)
                        .map_err(|e| EngineError::invalid(e.to_string()))?,
                );
                let consumer_reader = ring.new_reader();
                (Some(ring), None, Some(consumer_reader))
            }
            Some(buffer) => {
                info!("Attaching to external ring buffer");
                (None, Some(buffer.new_reader()), None)
            }
        };

        let engine = Self {
            config,
            session,
            ring,
            reader,
            signal: DetectionSignal::new(),
            buffering: None,
            running: false,
            model: None,
            staged: None,
        };

        Ok((engine, consumer_reader))
    }

    /// Repack `raw` and hand the flattened model to the session
    ///
    /// A config staged for the previous model is discarded; call
    /// `update_config` again before starting.
    pub fn load_model(&mut self, raw: &[u8], sub_model_count: u32) -> Result<()> {
        let model = sound_model::repack(raw, sub_model_count).map_err(|e| {
            error!("Invalid sound model data: {}", e);
            e
        })?;

        self.push(ParamId::SoundModel, model.as_bytes())?;

        if self.model.is_some() {
            warn!("Replacing previously loaded sound model");
        }
        info!(
            "Loaded {:?} sound model ({} bytes, {} phrases)",
            model.kind(),
            model.len(),
            model.num_phrases()
        );
        self.model = Some(model);
        if self.staged.take().is_some() {
            debug!("Dropped recognition config staged for the previous model");
        }
        Ok(())
    }

    /// Release the loaded model
    pub fn unload_model(&mut self) -> Result<()> {
        match self.model.take() {
            Some(model) => {
                self.staged = None;
                info!("Unloaded sound model ({} bytes)", model.len());
                Ok(())
            }
            None => {
                error!("No sound model can be unloaded");
                Err(EngineError::NotLoaded)
            }
        }
    }

    /// Build and stage the parameters for `recognition`
    ///
    /// Nothing is staged when validation fails; a previously staged config
    /// stays in place.
    pub fn update_config(&mut self, recognition: &RecognitionConfig) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EngineError::invalid("no sound model loaded"))?;

        let wakeup = WakeupConfig::build(recognition, model.num_phrases()).map_err(|e| {
            error!("Failed to generate wakeup config: {}", e);
            e
        })?;

        self.staged = Some(StagedConfig {
            wakeup,
            event: self.config.event_config(),
            buffering: self.config.buffering_config(),
            setup_duration: self.config.setup_duration(),
        });

        debug!("Update config success");
        Ok(())
    }

    /// Push the staged parameters and start buffering
    ///
    /// Stops at the first rejected parameter; already pushed parameters are
    /// not rolled back.
    pub fn start_recognition(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Recognition already started");
            return Ok(());
        }

        if let Some(mut finished) = self.buffering.take() {
            if let Err(e) = finished.stop() {
                warn!("Previous buffering thread ended with: {}", e);
            }
            self.running = false;
        }

        if self.model.is_none() {
            return Err(EngineError::invalid("no sound model loaded"));
        }

        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| EngineError::invalid("no recognition config staged"))?;

        self.push(ParamId::VoiceWakeupConfig, &staged.wakeup.encode())?;
        self.push(ParamId::GenericEventConfig, &staged.event.encode())?;
        self.push(ParamId::BufferingConfig, &staged.buffering.encode())?;
        self.push(ParamId::DownstreamSetupDuration, &staged.setup_duration.encode())?;

        if let Some(ring) = &self.ring {
            let buffering = BufferingLoop::start(
                format!("st-buffer-{}-{}", self.config.engine_id, self.config.stage_id),
                self.signal.clone(),
                Arc::clone(&self.session),
                Arc::clone(ring),
                self.config.short_write_policy,
            )?;
            self.buffering = Some(buffering);
        }

        self.running = true;
        info!("Start recognition success");
        Ok(())
    }

    /// Reset the detection engine and stop buffering
    ///
    /// Returns once the buffering thread has exited. If the reset is
    /// rejected the thread keeps running. A capture failure that ended the
    /// thread early is reported here as [`EngineError::Capture`], after the
    /// engine has stopped.
    pub fn stop_recognition(&mut self) -> Result<()> {
        self.push(ParamId::DetectionEngineReset, &[])?;

        let stopped = match self.buffering.take() {
            Some(mut buffering) => buffering.stop(),
            None => Ok(()),
        };

        if !self.running {
            warn!("Recognition was not started");
        }
        self.running = false;

        if let Err(e) = &stopped {
            error!("Buffering stopped on a capture failure: {}", e);
        } else {
            info!("Stop recognition success");
        }
        stopped
    }

    /// Detector callback entry point
    pub fn set_detected(&self, detected: bool) {
        self.signal.set_detected(detected);
    }

    /// Handle for raising detections from another thread
    pub fn detection_signal(&self) -> DetectionSignal {
        self.signal.clone()
    }

    /// Ask the buffering thread to skip its next drain
    pub fn skip_buffering_cycle(&self) {
        if let Some(buffering) = &self.buffering {
            buffering.request_skip();
        }
    }

    pub fn buffering_phase(&self) -> LoopPhase {
        self.signal.phase()
    }

    /// True while started and, for an engine owning its buffer, while the
    /// buffering thread is alive
    pub fn is_running(&self) -> bool {
        self.running
            && self
                .buffering
                .as_ref()
                .map_or(true, |buffering| !buffering.is_finished())
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn sound_model(&self) -> Option<&SoundModel> {
        self.model.as_ref()
    }

    /// Wakeup table staged by the last successful `update_config`
    pub fn wakeup_config(&self) -> Option<&WakeupConfig> {
        self.staged.as_ref().map(|staged| &staged.wakeup)
    }

    /// Buffer owned by this engine
    pub fn ring_buffer(&self) -> Option<&Arc<RingBuffer>> {
        self.ring.as_ref()
    }

    /// Reader on an external buffer
    pub fn reader(&mut self) -> Option<&mut RingBufferReader> {
        self.reader.as_mut()
    }

    pub fn engine_id(&self) -> u32 {
        self.config.engine_id
    }

    pub fn stage_id(&self) -> u32 {
        self.config.stage_id
    }

    fn push(&self, param: ParamId, payload: &[u8]) -> Result<()> {
        self.session.set_parameter(param, payload).map_err(|source| {
            error!("Failed to set {:?}: {}", param, source);
            EngineError::ParameterRejected { param, source }
        })
    }
}

impl Drop for SoundTriggerEngine {
    fn drop(&mut self) {
        if let Some(mut buffering) = self.buffering.take() {
            if let Err(e) = buffering.stop() {
                warn!("Buffering thread ended with an error: {}", e);
            }
        }
        debug!("Sound trigger engine {} dropped", self.config.engine_id);
    }
}

/// Bytes needed for `ring_buffer_duration_secs` of audio
fn ring_buffer_size(config: &EngineConfig, attributes: &dyn StreamAttributesProvider) -> Result<usize> {
    let attrs = attributes.stream_attributes();
    if attrs.direction != StreamDirection::Input {
        return Ok(config.default_ring_buffer_size);
    }

    let bytes = u64::from(attrs.sample_rate)
        .checked_mul(u64::from(attrs.bit_width))
        .and_then(|v| v.checked_mul(u64::from(attrs.channels)))
        .and_then(|v| v.checked_mul(u64::from(config.ring_buffer_duration_secs)))
        .map(|bits| bits / BITS_PER_BYTE)
        .ok_or_else(|| {
            EngineError::invalid(format!(
                "stream attributes {:?} overflow the ring buffer size",
                attrs
            ))
        })?;

    if bytes == 0 {
        return Err(EngineError::invalid(format!(
            "stream attributes {:?} give an empty ring buffer",
            attrs
        )));
    }

    usize::try_from(bytes).map_err(|_| EngineError::invalid(format!("ring buffer of {} bytes", bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        BufferGeometry, LoopbackSession, MockCaptureSession, SessionError, StreamAttributes,
    };
    use crate::sound_model::{KeyphraseModel, KeyphraseRecord, encode_generic_model};
    use crate::wakeup_config::{Phrase, UserLevel};
    use std::time::Duration;

    fn loopback() -> Arc<LoopbackSession> {
        Arc::new(
            LoopbackSession::new(
                StreamAttributes::default(),
                BufferGeometry {
                    frame_size: 320,
                    frame_count: 2,
                },
                16 * 1024,
            )
            .with_read_timeout(Duration::from_millis(5)),
        )
    }

    fn engine_on(session: Arc<dyn CaptureSession>) -> SoundTriggerEngine {
        let (engine, _reader) =
            SoundTriggerEngine::new(EngineConfig::default(), session, &StreamAttributes::default(), None)
                .unwrap();
        engine
    }

    fn keyphrase_blob(phrases: u32) -> Vec<u8> {
        KeyphraseModel {
            uuid: [1; 16],
            vendor_uuid: [2; 16],
            phrases: (0..phrases)
                .map(|id| KeyphraseRecord {
                    id,
                    recognition_mode: 1,
                    ..Default::default()
                })
                .collect(),
        }
        .encode(&[0x5A; 32])
        .unwrap()
    }

    fn recognition(phrases: u32) -> RecognitionConfig {
        RecognitionConfig {
            phrases: (0..phrases)
                .map(|id| Phrase {
                    id,
                    recognition_modes: 1,
                    confidence_level: 60,
                    levels: vec![UserLevel {
                        user_id: phrases + id,
                        level: 70,
                    }],
                })
                .collect(),
            custom_payload: vec![],
        }
    }

    fn accepting_mock() -> MockCaptureSession {
        let mut session = MockCaptureSession::new();
        session.expect_buffer_geometry().return_const(BufferGeometry {
            frame_size: 4,
            frame_count: 4,
        });
        session.expect_read_chunk().returning(|_| Ok(Vec::new()));
        session
    }

    #[test]
    fn test_owned_buffer_sized_from_attributes() {
        let (engine, reader) = SoundTriggerEngine::new(
            EngineConfig::default(),
            loopback(),
            &StreamAttributes::default(),
            None,
        )
        .unwrap();

        // 16 kHz * 16 bit * mono * 3 s
        let ring = engine.ring_buffer().unwrap();
        assert_eq!(ring.capacity(), 96_000);
        assert_eq!(ring.reader_count(), 1);
        assert!(reader.is_some());
    }

    #[test]
    fn test_output_stream_uses_default_size() {
        let attributes = StreamAttributes {
            direction: StreamDirection::Output,
            ..StreamAttributes::default()
        };
        let (engine, _reader) =
            SoundTriggerEngine::new(EngineConfig::default(), loopback(), &attributes, None).unwrap();

        assert_eq!(
            engine.ring_buffer().unwrap().capacity(),
            EngineConfig::default().default_ring_buffer_size
        );
    }

    #[test]
    fn test_external_buffer_only_reads() {
        let external = Arc::new(RingBuffer::with_capacity(1024).unwrap());
        let (mut engine, reader) = SoundTriggerEngine::new(
            EngineConfig::default(),
            loopback(),
            &StreamAttributes::default(),
            Some(external.clone()),
        )
        .unwrap();

        assert!(reader.is_none());
        assert!(engine.ring_buffer().is_none());
        assert_eq!(external.reader_count(), 1);

        external.write(b"keyword");
        assert_eq!(engine.reader().unwrap().read_available(), b"keyword".to_vec());
    }

    #[test]
    fn test_load_model_pushes_repacked_blob() {
        let session = loopback();
        let mut engine = engine_on(session.clone());

        engine.load_model(&keyphrase_blob(2), 1).unwrap();
        assert!(engine.is_model_loaded());

        let model = engine.sound_model().unwrap();
        assert_eq!(model.num_phrases(), 2);
        assert_eq!(
            session.last_parameter(ParamId::SoundModel),
            Some(model.as_bytes().to_vec())
        );
    }

    #[test]
    fn test_load_model_rejections() {
        let session = loopback();
        let mut engine = engine_on(session.clone());

        assert!(matches!(
            engine.load_model(&[], 1),
            Err(EngineError::InvalidArgument(_))
        ));

        session.reject(ParamId::SoundModel);
        assert!(matches!(
            engine.load_model(&keyphrase_blob(1), 1),
            Err(EngineError::ParameterRejected {
                param: ParamId::SoundModel,
                ..
            })
        ));
        assert!(!engine.is_model_loaded());
    }

    #[test]
    fn test_unload_model() {
        let mut engine = engine_on(loopback());
        assert!(matches!(engine.unload_model(), Err(EngineError::NotLoaded)));

        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.unload_model().unwrap();
        assert!(!engine.is_model_loaded());
        assert!(matches!(engine.unload_model(), Err(EngineError::NotLoaded)));
    }

    #[test]
    fn test_update_config_requires_phrase_model() {
        let mut engine = engine_on(loopback());
        assert!(matches!(
            engine.update_config(&recognition(1)),
            Err(EngineError::InvalidArgument(_))
        ));

        let generic = encode_generic_model([0; 16], [0; 16], &[1, 2, 3]).unwrap();
        engine.load_model(&generic, 1).unwrap();
        assert!(matches!(
            engine.update_config(&recognition(1)),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(engine.wakeup_config().is_none());
    }

    #[test]
    fn test_failed_update_keeps_previous_config() {
        let mut engine = engine_on(loopback());
        engine.load_model(&keyphrase_blob(2), 1).unwrap();
        engine.update_config(&recognition(2)).unwrap();

        let mut broken = recognition(2);
        broken.phrases[1].levels[0].user_id = 0;
        assert!(engine.update_config(&broken).is_err());

        assert_eq!(
            engine.wakeup_config().unwrap().confidence_levels,
            vec![60, 60, 70, 70]
        );
    }

    #[test]
    fn test_start_requires_staged_config() {
        let mut engine = engine_on(loopback());
        assert!(matches!(
            engine.start_recognition(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_start_and_stop_push_parameters() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();

        engine.start_recognition().unwrap();
        assert!(engine.is_running());

        // Second start is a no-op
        engine.start_recognition().unwrap();

        engine.stop_recognition().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.buffering_phase(), LoopPhase::Exiting);

        let pushed: Vec<ParamId> = session.parameters().into_iter().map(|(id, _)| id).collect();
        assert_eq!(
            pushed,
            vec![
                ParamId::SoundModel,
                ParamId::VoiceWakeupConfig,
                ParamId::GenericEventConfig,
                ParamId::BufferingConfig,
                ParamId::DownstreamSetupDuration,
                ParamId::DetectionEngineReset,
            ]
        );
        assert_eq!(
            session.last_parameter(ParamId::BufferingConfig),
            Some(engine.config.buffering_config().encode())
        );
    }

    #[test]
    fn test_start_is_fail_fast() {
        let mut session = accepting_mock();
        session
            .expect_set_parameter()
            .withf(|param, _| *param == ParamId::SoundModel)
            .returning(|_, _| Ok(()));
        session
            .expect_set_parameter()
            .withf(|param, _| *param == ParamId::VoiceWakeupConfig)
            .times(1)
            .returning(|_, _| Ok(()));
        session
            .expect_set_parameter()
            .withf(|param, _| *param == ParamId::GenericEventConfig)
            .times(1)
            .returning(|param, _| Err(SessionError::Rejected { param, status: -19 }));
        session
            .expect_set_parameter()
            .withf(|param, _| {
                *param == ParamId::BufferingConfig || *param == ParamId::DownstreamSetupDuration
            })
            .never();

        let mut engine = engine_on(Arc::new(session));
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();

        let err = engine.start_recognition().unwrap_err();
        assert_eq!(err.status_code(), -19);
        assert!(!engine.is_running());
        assert!(engine.buffering.is_none());
    }

    #[test]
    fn test_rejected_reset_keeps_buffering() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();
        engine.start_recognition().unwrap();

        session.reject(ParamId::DetectionEngineReset);
        assert!(matches!(
            engine.stop_recognition(),
            Err(EngineError::ParameterRejected {
                param: ParamId::DetectionEngineReset,
                ..
            })
        ));
        assert!(engine.is_running());

        session.accept(ParamId::DetectionEngineReset);
        engine.stop_recognition().unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_set_detected_through_engine() {
        let engine = engine_on(loopback());
        let signal = engine.detection_signal();

        engine.set_detected(true);
        engine.set_detected(true);
        assert!(signal.is_detected());
        assert_eq!(signal.wake_notifications(), 1);
    }

    #[test]
    fn test_drop_stops_buffering() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();
        engine.start_recognition().unwrap();

        let signal = engine.detection_signal();
        signal.set_detected(true);
        drop(engine);

        assert_eq!(signal.phase(), LoopPhase::Exiting);
    }

    #[test]
    fn test_model_swap_discards_staged_config() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(3), 1).unwrap();
        engine.update_config(&recognition(3)).unwrap();

        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        assert!(engine.wakeup_config().is_none());
        assert!(matches!(
            engine.start_recognition(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(session.last_parameter(ParamId::VoiceWakeupConfig).is_none());

        // A config built for the new model starts normally
        engine.update_config(&recognition(1)).unwrap();
        engine.start_recognition().unwrap();
        assert_eq!(
            session.last_parameter(ParamId::VoiceWakeupConfig),
            Some(engine.wakeup_config().unwrap().encode())
        );
        engine.stop_recognition().unwrap();
    }

    #[test]
    fn test_start_after_unload_rejected() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(2), 1).unwrap();
        engine.update_config(&recognition(2)).unwrap();
        engine.unload_model().unwrap();

        assert!(engine.wakeup_config().is_none());
        assert!(matches!(
            engine.start_recognition(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(!engine.is_running());
        assert!(session.last_parameter(ParamId::VoiceWakeupConfig).is_none());
    }

    #[test]
    fn test_capture_failure_reported_on_stop() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();
        engine.start_recognition().unwrap();

        session.close();
        engine.set_detected(true);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!engine.is_running());
        assert_eq!(engine.buffering_phase(), LoopPhase::Exiting);

        let err = engine.stop_recognition().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Capture(SessionError::ReadFailed(_))
        ));
        assert_eq!(err.status_code(), -5);

        // Engine is stopped and can be started again
        assert!(!engine.is_running());
        engine.stop_recognition().unwrap();
    }

    #[test]
    fn test_restart_after_capture_failure() {
        let session = loopback();
        let mut engine = engine_on(session.clone());
        engine.load_model(&keyphrase_blob(1), 1).unwrap();
        engine.update_config(&recognition(1)).unwrap();
        engine.start_recognition().unwrap();

        session.close();
        engine.set_detected(true);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }

        // Start reaps the dead thread instead of treating it as running
        engine.start_recognition().unwrap();
        assert!(engine.buffering.is_some());
        let _ = engine.stop_recognition();
    }

    #[test]
    fn test_oversized_stream_rejected() {
        let attributes = StreamAttributes {
            sample_rate: u32::MAX,
            bit_width: u32::MAX,
            channels: u32::MAX,
            ..StreamAttributes::default()
        };
        let result = SoundTriggerEngine::new(EngineConfig::default(), loopback(), &attributes, None);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_stream_rejected() {
        let attributes = StreamAttributes {
            sample_rate: 0,
            ..StreamAttributes::default()
        };
        let result = SoundTriggerEngine::new(EngineConfig::default(), loopback(), &attributes, None);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }
}
