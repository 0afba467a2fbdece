/// Capture session interfaces
///
/// The engine does not talk to audio hardware itself. It pushes parameters
/// to, and pulls buffered keyword audio from, a [`CaptureSession`] supplied
/// by the owner. [`LoopbackSession`] is an in-memory implementation used by
/// the service binary and the tests.

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Parameters the engine pushes to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamId {
    SoundModel,
    VoiceWakeupConfig,
    GenericEventConfig,
    BufferingConfig,
    DownstreamSetupDuration,
    DetectionEngineReset,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Parameter {param:?} rejected with status {status}")]
    Rejected { param: ParamId, status: i32 },

    #[error("Read failed: {0}")]
    ReadFailed(String),
}

/// Chunking the session uses for buffered capture data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Bytes per frame
    pub frame_size: usize,

    /// Frames per read
    pub frame_count: usize,
}

impl BufferGeometry {
    /// Bytes requested per drain cycle
    pub fn chunk_size(&self) -> usize {
        self.frame_size * self.frame_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    Input,
    Output,
}

/// Media attributes of the stream the engine is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAttributes {
    pub sample_rate: u32,
    pub bit_width: u32,
    pub channels: u32,
    pub direction: StreamDirection,
}

impl Default for StreamAttributes {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bit_width: 16,
            channels: 1,
            direction: StreamDirection::Input,
        }
    }
}

/// Audio session the engine drives
#[cfg_attr(test, mockall::automock)]
pub trait CaptureSession: Send + Sync {
    /// Frame size and frame count of one buffered read
    fn buffer_geometry(&self) -> BufferGeometry;

    /// Read up to `len` bytes of buffered capture data
    ///
    /// May return fewer bytes than requested (including none) and must not
    /// block indefinitely.
    fn read_chunk(&self, len: usize) -> Result<Vec<u8>, SessionError>;

    /// Push an encoded parameter payload
    fn set_parameter(&self, param: ParamId, payload: &[u8]) -> Result<(), SessionError>;
}

/// Source of stream attributes, consulted once when an engine is built
pub trait StreamAttributesProvider {
    fn stream_attributes(&self) -> StreamAttributes;
}

impl StreamAttributesProvider for StreamAttributes {
    fn stream_attributes(&self) -> StreamAttributes {
        *self
    }
}

type CaptureRing = HeapRb<u8>;
type CaptureProducer = <CaptureRing as Split>::Prod;
type CaptureConsumer = <CaptureRing as Split>::Cons;

/// In-memory capture session
///
/// Audio pushed with [`LoopbackSession::push`] is served by `read_chunk`.
/// Parameter pushes are recorded and can be made to fail per parameter.
pub struct LoopbackSession {
    attributes: StreamAttributes,
    geometry: BufferGeometry,
    read_timeout: Duration,
    producer: Mutex<CaptureProducer>,
    consumer: Mutex<CaptureConsumer>,
    data_ready: Condvar,
    closed: AtomicBool,
    parameters: Mutex<Vec<(ParamId, Vec<u8>)>>,
    rejected: Mutex<HashSet<ParamId>>,
}

impl LoopbackSession {
    /// Create a session queueing at most `capacity` bytes of capture data
    pub fn new(attributes: StreamAttributes, geometry: BufferGeometry, capacity: usize) -> Self {
        debug!(
            "Creating loopback session: {:?}, geometry {:?}, capacity {} bytes",
            attributes, geometry, capacity
        );

        let (producer, consumer) = CaptureRing::new(capacity.max(1)).split();

        Self {
            attributes,
            geometry,
            read_timeout: Duration::from_millis(20),
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            data_ready: Condvar::new(),
            closed: AtomicBool::new(false),
            parameters: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Maximum time `read_chunk` waits for data
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Queue capture data, returning the number of bytes accepted
    pub fn push(&self, data: &[u8]) -> usize {
        let pushed = self.producer.lock().push_slice(data);
        if pushed < data.len() {
            warn!(
                "Loopback queue full, dropped {} of {} bytes",
                data.len() - pushed,
                data.len()
            );
        }

        // Taking the consumer lock orders this notify after any pending
        // emptiness check in `read_chunk`.
        let _consumer = self.consumer.lock();
        self.data_ready.notify_all();

        pushed
    }

    /// Bytes queued and not yet read
    pub fn queued(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    /// Make every later read fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _consumer = self.consumer.lock();
        self.data_ready.notify_all();
    }

    /// Make pushes of `param` fail
    pub fn reject(&self, param: ParamId) {
        self.rejected.lock().insert(param);
    }

    /// Accept pushes of `param` again
    pub fn accept(&self, param: ParamId) {
        self.rejected.lock().remove(&param);
    }

    /// Every accepted parameter push, in order
    pub fn parameters(&self) -> Vec<(ParamId, Vec<u8>)> {
        self.parameters.lock().clone()
    }

    /// Payload of the most recent accepted push of `param`
    pub fn last_parameter(&self, param: ParamId) -> Option<Vec<u8>> {
        self.parameters
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == param)
            .map(|(_, payload)| payload.clone())
    }
}

impl CaptureSession for LoopbackSession {
    fn buffer_geometry(&self) -> BufferGeometry {
        self.geometry
    }

    fn read_chunk(&self, len: usize) -> Result<Vec<u8>, SessionError> {
        let mut consumer = self.consumer.lock();

        if consumer.occupied_len() == 0 && !self.closed.load(Ordering::SeqCst) {
            self.data_ready.wait_for(&mut consumer, self.read_timeout);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ReadFailed("session closed".to_string()));
        }

        let mut chunk = vec![0u8; len.min(consumer.occupied_len())];
        let read = consumer.pop_slice(&mut chunk);
        chunk.truncate(read);

        trace!("Loopback read {} of {} bytes", read, len);
        Ok(chunk)
    }

    fn set_parameter(&self, param: ParamId, payload: &[u8]) -> Result<(), SessionError> {
        if self.rejected.lock().contains(&param) {
            return Err(SessionError::Rejected { param, status: -22 });
        }

        debug!("Loopback accepted {:?} ({} bytes)", param, payload.len());
        self.parameters.lock().push((param, payload.to_vec()));
        Ok(())
    }
}

impl StreamAttributesProvider for LoopbackSession {
    fn stream_attributes(&self) -> StreamAttributes {
        self.attributes
    }
}
