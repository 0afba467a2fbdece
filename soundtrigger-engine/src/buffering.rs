/// Buffering thread
///
/// After a keyword is detected the capture session holds the keyword audio
/// (plus history) for the second stage. A dedicated thread drains it into
/// the engine's ring buffer, one chunk per cycle, for as long as the
/// detection flag stays raised.
///
/// State machine, all transitions under the [`DetectionSignal`] mutex:
///
/// ```text
///   Idle --(event_detected)--> Draining --(one chunk)--> Idle
///     \                                                   /
///      +------------------(exit_requested)--> Exiting <--+
/// ```
///
/// The mutex is released while the drain talks to the session, so the
/// detector callback never waits on capture I/O.

use crate::error::{EngineError, Result};
use crate::ring_buffer::RingBuffer;
use crate::session::{CaptureSession, SessionError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after a cycle that moved no data
const DRAIN_BACKOFF: Duration = Duration::from_millis(2);

/// What to do with bytes the ring buffer could not accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortWritePolicy {
    /// Discard the remainder
    #[default]
    Drop,

    /// Keep the remainder and write it before the next read
    Retry,
}

impl FromStr for ShortWritePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(ShortWritePolicy::Drop),
            "retry" => Ok(ShortWritePolicy::Retry),
            other => Err(format!("unknown short write policy: {}", other)),
        }
    }
}

/// Buffering thread phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Waiting for a detection or an exit request
    Idle,

    /// Moving one chunk from the session into the ring buffer
    Draining,

    /// Thread body has returned (or never started)
    Exiting,
}

#[derive(Debug)]
struct EngineState {
    event_detected: bool,
    exit_requested: bool,
    /// Skip the next drain without exiting
    exit_buffering: bool,
    phase: LoopPhase,
    wake_notifications: u64,
}

struct Signal {
    state: Mutex<EngineState>,
    wake: Condvar,
}

/// Detection flag shared by the engine, its buffering thread and the
/// detector callback
///
/// Cloning yields another handle to the same flag.
#[derive(Clone)]
pub struct DetectionSignal {
    shared: Arc<Signal>,
}

impl DetectionSignal {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Signal {
                state: Mutex::new(EngineState {
                    event_detected: false,
                    exit_requested: false,
                    exit_buffering: false,
                    phase: LoopPhase::Exiting,
                    wake_notifications: 0,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Raise or clear the detection flag
    ///
    /// Only a real change wakes the buffering thread; repeating the current
    /// value is a no-op. Returns whether the thread was notified.
    pub fn set_detected(&self, detected: bool) -> bool {
        debug!("set_detected {}", detected);
        let mut state = self.shared.state.lock();

        if state.event_detected == detected {
            trace!("event_detected unchanged");
            return false;
        }

        state.event_detected = detected;
        state.wake_notifications += 1;
        info!("event_detected set to {}", detected);
        self.shared.wake.notify_one();
        true
    }

    pub fn is_detected(&self) -> bool {
        self.shared.state.lock().event_detected
    }

    /// Number of times the buffering thread has been woken by `set_detected`
    pub fn wake_notifications(&self) -> u64 {
        self.shared.state.lock().wake_notifications
    }

    pub fn phase(&self) -> LoopPhase {
        self.shared.state.lock().phase
    }

    fn request_skip(&self) {
        let mut state = self.shared.state.lock();
        state.exit_buffering = true;
        self.shared.wake.notify_one();
    }

    fn request_exit(&self) {
        let mut state = self.shared.state.lock();
        state.exit_requested = true;
        state.exit_buffering = true;
        self.shared.wake.notify_one();
    }

    fn arm(&self) {
        let mut state = self.shared.state.lock();
        state.exit_requested = false;
        state.exit_buffering = false;
        state.phase = LoopPhase::Idle;
    }
}

impl Default for DetectionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves capture data into the ring buffer, one chunk per call
struct Drainer {
    session: Arc<dyn CaptureSession>,
    ring: Arc<RingBuffer>,
    policy: ShortWritePolicy,
    pending: Vec<u8>,
    bytes_buffered: u64,
    bytes_dropped: u64,
}

impl Drainer {
    fn new(session: Arc<dyn CaptureSession>, ring: Arc<RingBuffer>, policy: ShortWritePolicy) -> Self {
        Self {
            session,
            ring,
            policy,
            pending: Vec::new(),
            bytes_buffered: 0,
            bytes_dropped: 0,
        }
    }

    /// One drain cycle, returning the bytes written to the ring buffer
    fn drain_once(&mut self) -> std::result::Result<usize, SessionError> {
        let mut written = 0;

        if !self.pending.is_empty() {
            written = self.ring.write(&self.pending);
            self.pending.drain(..written);
            self.bytes_buffered += written as u64;
            if !self.pending.is_empty() {
                trace!("{} bytes still pending", self.pending.len());
                return Ok(written);
            }
        }

        let chunk_size = self.session.buffer_geometry().chunk_size();
        if chunk_size == 0 || self.ring.free_size() < chunk_size {
            trace!(
                "Not reading: chunk {} bytes, ring free {} bytes",
                chunk_size,
                self.ring.free_size()
            );
            return Ok(written);
        }

        let chunk = self.session.read_chunk(chunk_size)?;
        trace!("{} of {} bytes read from session", chunk.len(), chunk_size);
        if chunk.is_empty() {
            return Ok(written);
        }

        let accepted = self.ring.write(&chunk);
        self.bytes_buffered += accepted as u64;
        written += accepted;

        let remainder = &chunk[accepted..];
        if !remainder.is_empty() {
            match self.policy {
                ShortWritePolicy::Drop => {
                    warn!("Ring buffer full, dropped {} bytes", remainder.len());
                    self.bytes_dropped += remainder.len() as u64;
                }
                ShortWritePolicy::Retry => {
                    debug!("Ring buffer full, keeping {} bytes for next cycle", remainder.len());
                    self.pending.extend_from_slice(remainder);
                }
            }
        }

        Ok(written)
    }
}

fn run(signal: DetectionSignal, mut drainer: Drainer) -> std::result::Result<(), SessionError> {
    info!("Buffering thread started");
    let shared = Arc::clone(&signal.shared);
    let mut state = shared.state.lock();

    let result = loop {
        state.exit_buffering = false;
        while !state.event_detected && !state.exit_requested {
            state.phase = LoopPhase::Idle;
            trace!("Waiting for detection");
            shared.wake.wait(&mut state);
        }

        if state.exit_requested {
            break Ok(());
        }

        if state.exit_buffering {
            debug!("Skipping buffering cycle");
            continue;
        }

        state.phase = LoopPhase::Draining;
        match MutexGuard::unlocked(&mut state, || drainer.drain_once()) {
            Ok(0) if !state.exit_requested => {
                // Ring full or session empty; a flag change ends the wait early
                shared.wake.wait_for(&mut state, DRAIN_BACKOFF);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Buffering read failed, stopping thread: {}", e);
                break Err(e);
            }
        }
    };

    state.phase = LoopPhase::Exiting;
    info!(
        "Buffering thread exiting: {} bytes buffered, {} dropped",
        drainer.bytes_buffered, drainer.bytes_dropped
    );
    result
}

/// Handle to a running buffering thread
///
/// Dropping the handle stops and joins the thread.
pub struct BufferingLoop {
    signal: DetectionSignal,
    handle: Option<JoinHandle<std::result::Result<(), SessionError>>>,
}

impl BufferingLoop {
    /// Spawn the buffering thread
    pub fn start(
        name: String,
        signal: DetectionSignal,
        session: Arc<dyn CaptureSession>,
        ring: Arc<RingBuffer>,
        policy: ShortWritePolicy,
    ) -> Result<Self> {
        signal.arm();

        let drainer = Drainer::new(session, ring, policy);
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(thread_signal, drainer))
            .map_err(|e| {
                error!("Failed to create buffering thread: {}", e);
                signal.shared.state.lock().phase = LoopPhase::Exiting;
                EngineError::SpawnFailure(e)
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Ask the thread to skip its next drain
    pub fn request_skip(&self) {
        self.signal.request_skip();
    }

    /// True once the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the thread and wait for it to exit
    ///
    /// The exit request is made under the lock; the join happens after the
    /// lock is released. A capture failure that ended the thread early is
    /// returned as [`EngineError::Capture`].
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.signal.request_exit();
        let outcome = handle.join();
        debug!("Buffering thread joined");

        match outcome {
            Ok(result) => result.map_err(EngineError::Capture),
            Err(_) => {
                error!("Buffering thread panicked");
                Ok(())
            }
        }
    }
}

impl Drop for BufferingLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Buffering thread ended with an error: {}", e);
        }
    }
}
