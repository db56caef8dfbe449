//! Detection engine
//!
//! Owns the capture -> frame -> classify -> threshold -> sink pipeline and
//! its single processing thread. The caller thread only ever starts, stops
//! and observes; all per-window state lives on the worker.

use crate::classifier::{Classifier, ClassifyError, PredictionResult};
use crate::config::{ConfigError, EngineConfig};
use crate::debounce::Debouncer;
use crate::frame::{AudioFrame, DetectionWindow};
use crate::framer::Framer;
use crate::sink::{DetectionEvent, ErrorKind, EventSink};
use crate::source::{AudioSource, CaptureStream, DeviceError, ReadError};
use cache_padded::CachePadded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_read: u64,
    pub windows_classified: u64,
    pub classify_failures: u64,
    pub detections: u64,
    pub read_failures: u64,
    pub samples_dropped: u64,
    pub is_running: bool,
}

#[derive(Default)]
struct Counters {
    frames_read: AtomicU64,
    windows_classified: AtomicU64,
    classify_failures: AtomicU64,
    detections: AtomicU64,
    read_failures: AtomicU64,
    samples_dropped: AtomicU64,
}

/// State visible to both the caller and the worker
struct Shared {
    state: CachePadded<AtomicU8>,
    cancel: CachePadded<AtomicBool>,
    counters: Counters,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(EngineState::Stopped as u8)),
            cancel: CachePadded::new(AtomicBool::new(false)),
            counters: Counters::default(),
        }
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Wake-word detection engine
pub struct DetectionEngine {
    config: Arc<EngineConfig>,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn EventSink>,
    retention_samples: usize,
    /// Present while no worker owns it
    source: Option<Box<dyn AudioSource>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Box<dyn AudioSource>>>,
}

impl DetectionEngine {
    /// Create an engine. Nothing is opened until `start`.
    pub fn new<S>(
        config: EngineConfig,
        source: S,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError>
    where
        S: AudioSource + 'static,
    {
        config.validate()?;
        let retention_samples = config.retention_samples()?;

        info!("Initializing wake-word engine");
        info!(
            "Window: {} samples, hop: {}, sample rate: {} Hz",
            config.window_size, config.hop_size, config.sample_rate
        );
        info!(
            "Debounce: {}ms, retention: {}ms",
            config.debounce_interval_ms, config.retention_horizon_ms
        );

        Ok(Self {
            config: Arc::new(config),
            classifier,
            sink,
            retention_samples,
            source: Some(Box::new(source)),
            shared: Arc::new(Shared::new()),
            worker: None,
        })
    }

    /// Open the audio source and spawn the processing thread
    ///
    /// Blocks until the source is open. On failure the engine stays stopped.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.is_running() {
            warn!("Engine already running");
            return Ok(());
        }

        // A worker that stopped itself still has to be joined
        if self.worker.is_some() {
            self.stop();
        }

        let source = self.source.take().ok_or_else(|| {
            DeviceError::Unavailable("audio source was lost with a panicked worker".to_string())
        })?;

        info!("Starting wake-word engine");
        self.shared.cancel.store(false, Ordering::Release);
        self.shared.set_state(EngineState::Starting);

        let worker = Worker {
            config: Arc::clone(&self.config),
            classifier: Arc::clone(&self.classifier),
            sink: Arc::clone(&self.sink),
            shared: Arc::clone(&self.shared),
            retention_samples: self.retention_samples,
        };
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("wakeword-worker".to_string())
            .spawn(move || worker.run(source, ready_tx))
            .map_err(|e| {
                self.shared.set_state(EngineState::Stopped);
                DeviceError::Unavailable(format!("failed to spawn worker: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(handle);
                info!("Wake-word engine running");
                Ok(())
            }
            Ok(Err(e)) => {
                self.source = handle.join().ok();
                self.shared.set_state(EngineState::Stopped);
                error!("Failed to open audio source: {}", e);
                Err(e)
            }
            Err(_) => {
                self.source = handle.join().ok();
                self.shared.set_state(EngineState::Stopped);
                error!("Worker exited before opening the audio source");
                Err(DeviceError::Open(
                    "worker exited before opening the audio source".to_string(),
                ))
            }
        }
    }

    /// Stop the processing thread and release the audio source
    ///
    /// Waits for the in-flight read and classification to finish.
    /// Calling this on a stopped engine does nothing.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            debug!("Engine not running");
            self.shared.set_state(EngineState::Stopped);
            return;
        };

        if self.shared.transition(EngineState::Running, EngineState::Stopping) {
            info!("Stopping wake-word engine");
        }
        self.shared.cancel.store(true, Ordering::Release);

        match handle.join() {
            Ok(source) => self.source = Some(source),
            Err(payload) => error!(
                "Worker panicked, audio source lost: {}",
                panic_message(payload.as_ref())
            ),
        }

        self.shared.set_state(EngineState::Stopped);
        info!("Wake-word engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == EngineState::Running
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get current statistics
    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            frames_read: counters.frames_read.load(Ordering::Relaxed),
            windows_classified: counters.windows_classified.load(Ordering::Relaxed),
            classify_failures: counters.classify_failures.load(Ordering::Relaxed),
            detections: counters.detections.load(Ordering::Relaxed),
            read_failures: counters.read_failures.load(Ordering::Relaxed),
            samples_dropped: counters.samples_dropped.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the processing thread needs
struct Worker {
    config: Arc<EngineConfig>,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn EventSink>,
    shared: Arc<Shared>,
    retention_samples: usize,
}

impl Worker {
    /// Thread body; hands the source back when done
    fn run(
        self,
        mut source: Box<dyn AudioSource>,
        ready: SyncSender<Result<(), DeviceError>>,
    ) -> Box<dyn AudioSource> {
        let mut stream = match source.open(&self.config.capture_params()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return source;
            }
        };

        self.shared
            .transition(EngineState::Starting, EngineState::Running);
        let _ = ready.send(Ok(()));
        drop(ready);

        let fault = self.process(stream.as_mut());
        if fault.is_some() {
            self.shared
                .transition(EngineState::Running, EngineState::Stopping);
        }

        stream.close();

        // Stopped is only published once the sink has heard why
        if let Some((kind, message)) = fault {
            self.sink.on_error(kind, &message);
            self.shared.set_state(EngineState::Stopped);
        }
        source
    }

    /// Read and classify until cancelled; returns the reason if the worker
    /// has to stop on its own
    fn process(&self, stream: &mut dyn CaptureStream) -> Option<(ErrorKind, String)> {
        let counters = &self.shared.counters;
        let mut framer = Framer::new(
            self.config.window_size,
            self.config.hop_size,
            self.retention_samples,
        );
        let mut debouncer = Debouncer::new(self.config.debounce_interval());
        let mut buf = vec![0i16; self.config.frame_size];
        let mut sequence = 0u64;
        let mut consecutive_failures = 0u32;
        let timeout = self.config.read_timeout();

        while !self.shared.cancelled() {
            match stream.read(&mut buf, timeout) {
                Ok(0) => {
                    trace!("No audio within {:?}", timeout);
                }
                Ok(n) => {
                    consecutive_failures = 0;
                    Shared::bump(&counters.frames_read, 1);

                    if n > buf.len() {
                        warn!(
                            "Capture stream reported {} samples for a {} sample buffer",
                            n,
                            buf.len()
                        );
                    }
                    let n = n.min(buf.len());
                    let frame = AudioFrame::new(sequence, Instant::now(), buf[..n].to_vec());
                    sequence += 1;

                    match framer.push(&frame) {
                        Ok(dropped) => Shared::bump(&counters.samples_dropped, dropped as u64),
                        Err(e) => warn!("Discarding frame: {}", e),
                    }

                    while let Some(window) = framer.try_pop_window() {
                        self.handle_window(&window, &mut debouncer);
                    }
                }
                Err(ReadError::EndOfStream) => {
                    info!("Audio source reached end of stream");
                    return Some((
                        ErrorKind::EndOfStream,
                        "audio source reached end of stream".to_string(),
                    ));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    Shared::bump(&counters.read_failures, 1);

                    if consecutive_failures >= self.config.read_retry_budget {
                        let message = format!(
                            "{} consecutive capture reads failed, last error: {}",
                            consecutive_failures, e
                        );
                        error!("{}", message);
                        return Some((ErrorKind::CaptureFailure, message));
                    }

                    warn!(
                        "Capture read failed ({}/{}): {}",
                        consecutive_failures, self.config.read_retry_budget, e
                    );
                    thread::sleep(self.config.read_retry_backoff());
                }
            }
        }

        debug!("Worker cancelled after {} frames", sequence);
        None
    }

    fn handle_window(&self, window: &DetectionWindow, debouncer: &mut Debouncer) {
        let counters = &self.shared.counters;
        let now = Instant::now();
        debouncer.expire(now);

        let prediction = match self.classify(window) {
            Ok(prediction) => prediction,
            Err(e) => {
                Shared::bump(&counters.classify_failures, 1);
                warn!("Skipping window {}: {}", window.sequence(), e);
                return;
            }
        };
        Shared::bump(&counters.windows_classified, 1);
        debug!("Prediction for window {}: {:?}", window.sequence(), prediction);

        for (label, confidence) in prediction.iter() {
            let Some(threshold) = self.config.threshold_for(label) else {
                trace!("No threshold for label '{}'", label);
                continue;
            };

            if !confidence.is_finite() {
                warn!("Ignoring non-finite score for '{}'", label);
                continue;
            }

            if confidence < threshold {
                continue;
            }

            if !debouncer.try_fire(label, now) {
                trace!("'{}' suppressed during cooldown", label);
                continue;
            }

            info!("Detected wake word: {} (confidence={:.3})", label, confidence);
            Shared::bump(&counters.detections, 1);

            self.sink.on_detection(&DetectionEvent {
                label: label.to_string(),
                confidence,
                timestamp: current_timestamp_micros(),
                window_sequence: window.sequence(),
            });
        }
    }

    /// Run the classifier, turning a panic into a per-window failure
    fn classify(&self, window: &DetectionWindow) -> Result<PredictionResult, ClassifyError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.classifier.classify(window)))
            .unwrap_or_else(|payload| {
                Err(ClassifyError::Panicked(panic_message(payload.as_ref())))
            })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Get current timestamp in microseconds
fn current_timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureParams;
    use crate::sink::EngineEvent;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Endless tone at a fixed level
    struct ToneSource {
        level: i16,
        fail_open: bool,
    }

    struct ToneStream {
        level: i16,
    }

    impl AudioSource for ToneSource {
        fn open(&mut self, _: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
            if self.fail_open {
                return Err(DeviceError::NoDevice);
            }
            Ok(Box::new(ToneStream { level: self.level }))
        }
    }

    impl CaptureStream for ToneStream {
        fn read(&mut self, buf: &mut [i16], _: Duration) -> Result<usize, ReadError> {
            thread::sleep(Duration::from_millis(1));
            buf.fill(self.level);
            Ok(buf.len())
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EngineEvent>>,
    }

    impl EventSink for RecordingSink {
        fn on_detection(&self, event: &DetectionEvent) {
            self.events
                .lock()
                .unwrap()
                .push(EngineEvent::Detection(event.clone()));
        }

        fn on_error(&self, kind: ErrorKind, message: &str) {
            self.events.lock().unwrap().push(EngineEvent::Error {
                kind,
                message: message.to_string(),
            });
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            frame_size: 160,
            window_size: 800,
            hop_size: 400,
            retention_horizon_ms: 200,
            read_timeout_ms: 20,
            ..Default::default()
        }
    }

    fn engine(source: ToneSource, sink: Arc<RecordingSink>) -> DetectionEngine {
        let classifier: Arc<dyn Classifier> =
            Arc::new(crate::classifier::EnergyClassifier::new("hey_aether"));
        DetectionEngine::new(test_config(), source, classifier, sink).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(ToneSource { level: 0, fail_open: false }, sink);

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.stats().is_running);
        assert_eq!(engine.stats().frames_read, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            hop_size: 0,
            ..test_config()
        };
        let classifier: Arc<dyn Classifier> =
            Arc::new(crate::classifier::EnergyClassifier::new("x"));
        let result = DetectionEngine::new(
            config,
            ToneSource { level: 0, fail_open: false },
            classifier,
            Arc::new(RecordingSink::default()),
        );
        assert!(matches!(result, Err(ConfigError::Zero("hop_size"))));
    }

    #[test]
    fn test_start_stop() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = engine(ToneSource { level: 0, fail_open: false }, sink);

        engine.start().unwrap();
        assert!(engine.is_running());

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_restart_after_stop() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = engine(ToneSource { level: 0, fail_open: false }, sink);

        engine.start().unwrap();
        engine.stop();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn test_start_twice_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = engine(ToneSource { level: 0, fail_open: false }, sink);

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn test_open_failure_leaves_engine_stopped() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = engine(ToneSource { level: 0, fail_open: true }, Arc::clone(&sink));

        assert_eq!(engine.start(), Err(DeviceError::NoDevice));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(sink.events.lock().unwrap().is_empty());

        // The source is handed back, so a retry reaches it again
        assert_eq!(engine.start(), Err(DeviceError::NoDevice));
    }

    #[test]
    fn test_loud_tone_detected_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = engine(
            ToneSource { level: i16::MAX / 2, fail_open: false },
            Arc::clone(&sink),
        );

        engine.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.stats().windows_classified < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        let stats = engine.stats();
        assert!(stats.windows_classified >= 5);
        assert_eq!(stats.detections, 1);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::Detection(event) => {
                assert_eq!(event.label, "hey_aether");
                assert_eq!(event.window_sequence, 0);
                assert!(event.timestamp > 0);
            }
            other => panic!("Expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_overreported_read_is_clamped() {
        struct Overreporting {
            reads: usize,
        }

        impl CaptureStream for Overreporting {
            fn read(&mut self, buf: &mut [i16], _: Duration) -> Result<usize, ReadError> {
                self.reads += 1;
                if self.reads > 1 {
                    return Err(ReadError::EndOfStream);
                }
                buf.fill(0);
                Ok(buf.len() + 100)
            }

            fn close(&mut self) {}
        }

        struct OverreportingSource;

        impl AudioSource for OverreportingSource {
            fn open(&mut self, _: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
                Ok(Box::new(Overreporting { reads: 0 }))
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let classifier: Arc<dyn Classifier> =
            Arc::new(crate::classifier::EnergyClassifier::new("hey_aether"));
        let mut engine = DetectionEngine::new(
            test_config(),
            OverreportingSource,
            classifier,
            Arc::<RecordingSink>::clone(&sink),
        )
        .unwrap();

        engine.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.state() != EngineState::Stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        engine.stop();
        assert_eq!(engine.stats().frames_read, 1);
        assert!(matches!(
            sink.events.lock().unwrap().as_slice(),
            [EngineEvent::Error { kind: ErrorKind::EndOfStream, .. }]
        ));

        // The worker survived, so the source came back
        assert!(engine.start().is_ok());
        engine.stop();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
