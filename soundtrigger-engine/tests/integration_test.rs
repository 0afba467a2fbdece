/// Integration tests for the sound trigger engine
///
/// Drives full engines against the loopback capture session: model loading,
/// configuration, buffering after a detection and shutdown.

use soundtrigger_engine::sound_model::{encode_bundle, SUB_MODEL_KEYWORD_GMM};
use soundtrigger_engine::{
    BufferGeometry, EngineConfig, EngineError, KeyphraseModel, KeyphraseRecord, LoopbackSession,
    ParamId, Phrase, RecognitionConfig, RingBuffer, ShortWritePolicy, SoundTriggerEngine,
    StreamAttributes, UserLevel,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn loopback() -> Arc<LoopbackSession> {
    Arc::new(
        LoopbackSession::new(
            StreamAttributes::default(),
            BufferGeometry {
                frame_size: 320,
                frame_count: 2,
            },
            64 * 1024,
        )
        .with_read_timeout(Duration::from_millis(5)),
    )
}

/// Three-phrase container with the keyword model inside a bundle
fn three_phrase_model() -> Vec<u8> {
    let gmm = vec![0x42u8; 300];
    let other = vec![0x17u8; 120];
    let bundle = encode_bundle(&[
        (0x0002, other.as_slice()),
        (SUB_MODEL_KEYWORD_GMM, gmm.as_slice()),
    ])
    .expect("Failed to encode bundle");

    KeyphraseModel {
        uuid: [9; 16],
        vendor_uuid: [8; 16],
        phrases: (0..3)
            .map(|id| KeyphraseRecord {
                id,
                recognition_mode: 1,
                users: vec![],
                locale: "en_US".to_string(),
                text: format!("keyword {}", id),
            })
            .collect(),
    }
    .encode(&bundle)
    .expect("Failed to encode model")
}

/// k1 {u1, u2, u3}, k2 {u2, u3}, k3 {u4}
fn canonical_config() -> RecognitionConfig {
    let phrase = |id: u32, confidence_level: u8, users: &[(u32, u32)]| Phrase {
        id,
        recognition_modes: 1,
        confidence_level,
        levels: users
            .iter()
            .map(|&(user_id, level)| UserLevel { user_id, level })
            .collect(),
    };

    RecognitionConfig {
        phrases: vec![
            phrase(0, 10, &[(3, 31), (4, 41), (6, 61)]),
            phrase(1, 20, &[(5, 52), (7, 72)]),
            phrase(2, 30, &[(8, 83)]),
        ],
        custom_payload: vec![],
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn started_engine(session: Arc<LoopbackSession>) -> (SoundTriggerEngine, soundtrigger_engine::RingBufferReader) {
    let (mut engine, reader) = SoundTriggerEngine::new(
        EngineConfig::default(),
        session,
        &StreamAttributes::default(),
        None,
    )
    .expect("Failed to create engine");

    engine.load_model(&three_phrase_model(), 2).expect("Failed to load model");
    engine.update_config(&canonical_config()).expect("Failed to update config");
    engine.start_recognition().expect("Failed to start recognition");

    (engine, reader.expect("Engine should own its buffer"))
}

#[test]
fn test_end_to_end_buffering() {
    let session = loopback();
    let (mut engine, mut reader) = started_engine(session.clone());

    // Keyword audio arrives before the detection event
    let audio: Vec<u8> = (0..6400u32).map(|i| (i % 256) as u8).collect();
    session.push(&audio);

    // Detector callback fires on another thread
    let signal = engine.detection_signal();
    std::thread::spawn(move || signal.set_detected(true))
        .join()
        .unwrap();

    let mut received = Vec::new();
    assert!(wait_until(|| {
        received.extend(reader.read_available());
        received.len() == audio.len()
    }));
    assert_eq!(received, audio);

    engine.stop_recognition().expect("Failed to stop recognition");
}

#[test]
fn test_wakeup_table_reaches_session() {
    let session = loopback();
    let (mut engine, _reader) = started_engine(session.clone());

    let payload = session
        .last_parameter(ParamId::VoiceWakeupConfig)
        .expect("Wakeup config was not pushed");

    // Header: mode, custom payload size, active models, reserved
    assert_eq!(&payload[8..12], &9u32.to_le_bytes());
    assert_eq!(&payload[16..25], &[10, 20, 30, 31, 41, 52, 61, 72, 83]);
    assert_eq!(&payload[25..], &[1; 9]);

    engine.stop_recognition().unwrap();
}

#[test]
fn test_loaded_model_is_flattened() {
    let session = loopback();
    let (mut engine, _reader) = started_engine(session.clone());

    let model = engine.sound_model().expect("Model should be loaded");
    assert_eq!(model.num_phrases(), 3);
    assert_eq!(model.payload(), vec![0x42u8; 300].as_slice());
    assert_eq!(
        session.last_parameter(ParamId::SoundModel).unwrap(),
        model.as_bytes().to_vec()
    );

    engine.stop_recognition().unwrap();
    engine.unload_model().unwrap();
    assert!(matches!(engine.unload_model(), Err(EngineError::NotLoaded)));
}

#[test]
fn test_stop_returns_after_thread_exit() {
    let session = loopback();
    let (mut engine, mut reader) = started_engine(session.clone());
    let ring = engine.ring_buffer().unwrap().clone();

    engine.set_detected(true);
    session.push(&[5; 2560]);
    assert!(wait_until(|| ring.bytes_written() > 0));

    engine.stop_recognition().unwrap();
    let written = ring.bytes_written();

    session.push(&[6; 2560]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ring.bytes_written(), written, "ring buffer written after stop");
    assert!(reader.read_available().iter().all(|&b| b == 5));
}

#[test]
fn test_independent_engines() {
    let first_session = loopback();
    let second_session = loopback();
    let (mut first, mut first_reader) = started_engine(first_session.clone());
    let (mut second, mut second_reader) = started_engine(second_session.clone());

    first_session.push(&[1; 1280]);
    second_session.push(&[2; 1280]);

    // Only the first engine sees a detection
    first.set_detected(true);
    assert!(wait_until(|| first_reader.available() == 1280));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(second_reader.available(), 0);
    assert_eq!(second_session.queued(), 1280);

    assert!(first_reader.read_available().iter().all(|&b| b == 1));

    first.stop_recognition().unwrap();
    second.stop_recognition().unwrap();
    let _ = second_reader.read_available();
}

#[test]
fn test_slow_reader_applies_backpressure() {
    let session = loopback();
    let config = EngineConfig {
        short_write_policy: ShortWritePolicy::Retry,
        ..EngineConfig::default()
    };
    // 640 bytes/s for 3 s: room for exactly three chunks
    let attributes = StreamAttributes {
        sample_rate: 640,
        bit_width: 8,
        channels: 1,
        ..StreamAttributes::default()
    };

    let (mut engine, reader) =
        SoundTriggerEngine::new(config, session.clone(), &attributes, None).unwrap();
    let mut reader = reader.unwrap();
    engine.load_model(&three_phrase_model(), 2).unwrap();
    engine.update_config(&canonical_config()).unwrap();
    engine.start_recognition().unwrap();

    let ring = engine.ring_buffer().unwrap().clone();
    assert_eq!(ring.capacity(), 1920);

    session.push(&[3; 6400]);
    engine.set_detected(true);

    // Three 640 byte chunks fit, then the writer waits on the reader
    assert!(wait_until(|| ring.free_size() == 0));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ring.bytes_written(), 1920);
    assert_eq!(session.queued(), 6400 - 1920);

    let mut consumed = reader.read_available().len();
    assert!(wait_until(|| {
        consumed += reader.read_available().len();
        consumed == 6400
    }));

    engine.stop_recognition().unwrap();
}

#[test]
fn test_engine_on_external_buffer() {
    let shared = Arc::new(RingBuffer::with_capacity(4096).unwrap());
    let session = loopback();

    let (mut engine, reader) = SoundTriggerEngine::new(
        EngineConfig::default(),
        session.clone(),
        &StreamAttributes::default(),
        Some(shared.clone()),
    )
    .unwrap();
    assert!(reader.is_none());

    engine.load_model(&three_phrase_model(), 2).unwrap();
    engine.update_config(&canonical_config()).unwrap();
    engine.start_recognition().unwrap();

    // Detection does not make this engine write into the shared buffer
    session.push(&[4; 640]);
    engine.set_detected(true);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(shared.bytes_written(), 0);

    shared.write(b"first stage audio");
    assert_eq!(
        engine.reader().unwrap().read_available(),
        b"first stage audio".to_vec()
    );

    engine.stop_recognition().unwrap();
}

#[test]
fn test_invalid_config_leaves_engine_startable() {
    let session = loopback();
    let (mut engine, _reader) = SoundTriggerEngine::new(
        EngineConfig::default(),
        session.clone(),
        &StreamAttributes::default(),
        None,
    )
    .unwrap();
    engine.load_model(&three_phrase_model(), 2).unwrap();

    let mut duplicate = canonical_config();
    duplicate.phrases[2].levels[0].user_id = 3;
    let err = engine.update_config(&duplicate).unwrap_err();
    assert_eq!(err.status_code(), -22);

    // Nothing staged, so start is refused rather than pushing a stale table
    assert!(matches!(
        engine.start_recognition(),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(session.last_parameter(ParamId::VoiceWakeupConfig).is_none());
}
