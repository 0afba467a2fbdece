/// Sound trigger service binary
///
/// Runs one engine against an in-memory capture session: loads a bundled
/// keyword model, starts recognition, streams audio (a WAV file or a
/// synthetic tone) and raises a detection partway through, then reports how
/// much keyword audio reached the ring buffer.

use anyhow::Context;
use soundtrigger_engine::sound_model::{encode_bundle, SUB_MODEL_KEYWORD_GMM};
use soundtrigger_engine::{
    BufferGeometry, EngineConfig, KeyphraseModel, KeyphraseRecord, LoopbackSession, Phrase,
    RecognitionConfig, SoundTriggerEngine, StreamAttributes, UserLevel,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Audio pushed per tick (20 ms at 16 kHz mono 16-bit)
const TICK_BYTES: usize = 640;
const TICK: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("soundtrigger_engine=debug")),
        )
        .init();

    info!("Starting sound trigger service v{}", soundtrigger_engine::VERSION);

    if let Err(e) = run().await {
        error!("Sound trigger service failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Sound trigger service stopped");
}

async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("loading engine config")?;

    let attributes = StreamAttributes::default();
    let session = Arc::new(LoopbackSession::new(
        attributes,
        BufferGeometry {
            frame_size: 320,
            frame_count: 2,
        },
        64 * 1024,
    ));

    let (mut engine, reader) = SoundTriggerEngine::new(config, session.clone(), &attributes, None)?;
    let mut reader = reader.context("engine did not create its own ring buffer")?;

    engine.load_model(&bundled_model()?, 2)?;
    engine.update_config(&load_recognition_config()?)?;
    engine.start_recognition()?;

    let audio = load_audio()?;
    info!("Streaming {} bytes of audio", audio.len());

    // Detector callback stand-in: raise the flag a quarter of the way in
    let signal = engine.detection_signal();
    let detect_at = audio.len() / 4;
    let feeder = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            for (i, chunk) in audio.chunks(TICK_BYTES).enumerate() {
                ticker.tick().await;
                session.push(chunk);
                if i * TICK_BYTES >= detect_at && !signal.is_detected() {
                    info!("Keyword detected at byte {}", i * TICK_BYTES);
                    signal.set_detected(true);
                }
            }
        })
    };

    let mut received = 0usize;
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    while !feeder.is_finished() {
        poll.tick().await;
        received += reader.read_available().len();
    }
    feeder.await.context("audio feeder panicked")?;

    // Let the last chunks drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    received += reader.read_available().len();

    engine.set_detected(false);
    engine.stop_recognition()?;
    engine.unload_model()?;

    info!("Second stage received {} bytes of keyword audio", received);
    if session.queued() > 0 {
        warn!("{} bytes left undrained in the session", session.queued());
    }
    Ok(())
}

/// Keyphrase container carrying a two-entry bundle
fn bundled_model() -> anyhow::Result<Vec<u8>> {
    let gmm: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    let verifier = vec![0u8; 256];
    let bundle = encode_bundle(&[(0x0004, verifier.as_slice()), (SUB_MODEL_KEYWORD_GMM, gmm.as_slice())])?;

    let model = KeyphraseModel {
        uuid: *b"soundtrigger-kw1",
        vendor_uuid: *b"aetheros-vendor0",
        phrases: vec![KeyphraseRecord {
            id: 0,
            recognition_mode: 1,
            users: vec![1],
            locale: "en_US".to_string(),
            text: "hey aether".to_string(),
        }],
    };
    Ok(model.encode(&bundle)?)
}

fn load_recognition_config() -> anyhow::Result<RecognitionConfig> {
    match std::env::var("SOUNDTRIGGER_RECOGNITION_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            Ok(serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?)
        }
        Err(_) => Ok(RecognitionConfig {
            phrases: vec![Phrase {
                id: 0,
                recognition_modes: 1,
                confidence_level: 60,
                levels: vec![UserLevel {
                    user_id: 1,
                    level: 70,
                }],
            }],
            custom_payload: Vec::new(),
        }),
    }
}

/// 16-bit little-endian PCM from `SOUNDTRIGGER_WAV`, or two seconds of tone
fn load_audio() -> anyhow::Result<Vec<u8>> {
    let samples: Vec<i16> = match std::env::var("SOUNDTRIGGER_WAV") {
        Ok(path) => {
            let mut wav = hound::WavReader::open(&path).with_context(|| format!("opening {}", path))?;
            let spec = wav.spec();
            if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
                anyhow::bail!("{} is not 16-bit PCM", path);
            }
            wav.samples::<i16>().collect::<Result<_, _>>()?
        }
        Err(_) => (0..32_000)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 8_000.0) as i16
            })
            .collect(),
    };

    Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
}
