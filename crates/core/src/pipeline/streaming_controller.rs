use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::detection::domain::face_detector::{DetectorFactory, FaceDetector};
use crate::estimation::domain::estimation_adapter::EstimationAdapter;
use crate::estimation::domain::estimation_backend::{BackendFactory, Credentials};
use crate::shared::error::{Result, VitalsError};
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::video_decoder::{MediaSource, VideoDecoder};
use crate::video::infrastructure::decoded_frame_source::DecodedFrameSource;
use crate::windowing::domain::window_buffer::FlushPolicy;

use super::events::{Event, EventBus, EventHandler, EventKind, ListenerId};
use super::frame_queue::FrameQueue;
use super::infrastructure::frame_pump::spawn_pump;
use super::pipeline_logger::LogPipelineLogger;
use super::session_config::SessionConfig;
use super::session_result::{AggregatedResult, SessionRecorder};
use super::session_state::SessionState;
use super::vitals_pipeline::{Control, PipelineParts, VitalsPipeline};

/// Where a live session reads its frames from.
pub enum StreamSource {
    /// Decoded media played as a live element.
    Media(MediaSource),
    /// Frames produced by the application, e.g. a camera capture loop.
    Live(Box<dyn FrameSource>),
}

impl StreamSource {
    fn validate(&self) -> Result<()> {
        match self {
            StreamSource::Media(media) => media.validate(),
            StreamSource::Live(source) => {
                let (w, h) = source.dimensions();
                if w == 0 || h == 0 {
                    return Err(VitalsError::InvalidSource(format!(
                        "live source has zero dimensions {w}x{h}"
                    )));
                }
                let fps = source.fps();
                if !fps.is_finite() || fps <= 0.0 {
                    return Err(VitalsError::InvalidSource(format!(
                        "live source reports frame rate {fps}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Threads and switches of a running live session.
struct LiveSession {
    control: Sender<Control>,
    paused: Arc<AtomicBool>,
    /// Stops the pump; the pipeline still drains and flushes.
    pump_stop: Arc<AtomicBool>,
    /// Stops everything without flushing.
    cancelled: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    pipeline: Option<JoinHandle<()>>,
}

impl LiveSession {
    fn join(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.pipeline.take() {
            if handle.join().is_err() {
                log::error!("pipeline thread panicked");
            }
        }
        if let Some(handle) = self.pump.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::debug!("frame source still blocked, detaching pump thread");
            }
        }
    }
}

/// One vitals session: owns the state machine, the event bus and the
/// workers of the running pipeline.
///
/// States run `Idle → Streaming ⇄ Paused → Stopped → Disposed`. File
/// processing goes straight from `Idle` to `Stopped`.
pub struct StreamingController {
    config: SessionConfig,
    decoder: Arc<dyn VideoDecoder>,
    detectors: Arc<dyn DetectorFactory>,
    backends: Arc<dyn BackendFactory>,
    credentials: Credentials,
    state: Arc<Mutex<SessionState>>,
    events: Arc<EventBus>,
    recorder: Arc<Mutex<SessionRecorder>>,
    source: Option<StreamSource>,
    live: Option<LiveSession>,
}

impl StreamingController {
    pub fn new(
        config: SessionConfig,
        decoder: Arc<dyn VideoDecoder>,
        detectors: Arc<dyn DetectorFactory>,
        backends: Arc<dyn BackendFactory>,
        credentials: Credentials,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            decoder,
            detectors,
            backends,
            credentials,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            events: Arc::new(EventBus::new()),
            recorder: Arc::new(Mutex::new(SessionRecorder::new(None))),
            source: None,
            live: None,
        })
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_video_stream(&mut self, source: StreamSource) -> Result<()> {
        self.expect_state(&[SessionState::Idle], "set_video_stream")?;
        source.validate()?;
        self.source = Some(source);
        Ok(())
    }

    /// Starts the session, or resumes it when paused. Starting a running
    /// session does nothing.
    pub fn start_video_stream(&mut self) -> Result<()> {
        match self.state_checked()? {
            SessionState::Streaming => Ok(()),
            SessionState::Paused => {
                if let Some(live) = &self.live {
                    live.paused.store(false, Ordering::Relaxed);
                    let _ = live.control.send(Control::Resume);
                }
                self.set_state_if_running(SessionState::Streaming);
                log::info!("session resumed");
                Ok(())
            }
            SessionState::Idle => self.launch(),
            from => Err(VitalsError::InvalidState {
                from,
                operation: "start",
            }),
        }
    }

    /// Stops frame intake. Workers and buffers stay alive.
    pub fn pause_video_stream(&mut self) -> Result<()> {
        match self.state_checked()? {
            SessionState::Paused => Ok(()),
            SessionState::Streaming => {
                if let Some(live) = &self.live {
                    live.paused.store(true, Ordering::Relaxed);
                    let _ = live.control.send(Control::Pause);
                }
                self.set_state_if_running(SessionState::Paused);
                log::info!("session paused");
                Ok(())
            }
            from => Err(VitalsError::InvalidState {
                from,
                operation: "pause",
            }),
        }
    }

    /// Ends the session: flushes the window buffer under the live policy,
    /// waits for pending estimates and joins the workers.
    pub fn stop_video_stream(&mut self) -> Result<()> {
        self.expect_state(&[SessionState::Streaming, SessionState::Paused], "stop")?;
        if let Some(mut live) = self.live.take() {
            live.pump_stop.store(true, Ordering::Relaxed);
            live.paused.store(false, Ordering::Relaxed);
            live.join();
        }
        *lock(&self.state) = SessionState::Stopped;
        log::info!("session stopped");
        Ok(())
    }

    /// Runs the whole file through the pipeline on the calling thread.
    /// Frames are never dropped; decoding waits for the detector.
    pub fn process_video_file(&mut self, media: MediaSource) -> Result<AggregatedResult> {
        self.expect_state(&[SessionState::Idle], "process_video_file")?;
        media.validate()?;

        let detector = self.detectors.create()?;
        let adapter = self.build_adapter()?;
        log::info!("processing {}", media.describe());

        let outcome = self.run_file(&media, detector, adapter);
        *lock(&self.state) = SessionState::Stopped;
        match outcome {
            Ok(()) => Ok(lock(&self.recorder).result()),
            Err(e) => {
                log::error!("processing {} failed: {e}", media.describe());
                self.events.emit(&Event::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Releases every resource. Later calls return `SessionDisposed`;
    /// disposing again does nothing.
    pub fn dispose(&mut self) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Disposed {
                return;
            }
            *state = SessionState::Disposed;
        }
        self.events.close();
        if let Some(mut live) = self.live.take() {
            live.cancelled.store(true, Ordering::Relaxed);
            live.pump_stop.store(true, Ordering::Relaxed);
            live.join();
        }
        self.source = None;
        *lock(&self.recorder) = SessionRecorder::default();
        log::debug!("session disposed");
    }

    pub fn add_event_listener(&self, kind: EventKind, handler: EventHandler) -> Result<ListenerId> {
        self.state_checked()?;
        self.events
            .subscribe(kind, handler)
            .ok_or(VitalsError::SessionDisposed)
    }

    /// Returns whether the listener was registered.
    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> Result<bool> {
        self.state_checked()?;
        Ok(self.events.unsubscribe(kind, id))
    }

    /// Everything recorded so far; final once the session is stopped.
    pub fn session_result(&self) -> Result<AggregatedResult> {
        self.state_checked()?;
        Ok(lock(&self.recorder).result())
    }

    fn launch(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(VitalsError::InvalidSource("no video stream set".into()));
        }
        let detector = self.detectors.create()?;
        let adapter = self.build_adapter()?;
        let (source, metadata) = self.open_source()?;

        let fps = source.fps();
        *lock(&self.recorder) = SessionRecorder::new(metadata);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut pipeline = VitalsPipeline::new(self.parts(
            detector,
            adapter,
            fps,
            self.config.live_flush_policy,
            cancelled.clone(),
        ))?;

        let queue = FrameQueue::new(self.config.max_queued_frames);
        let (pump_tx, pump_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let paused = Arc::new(AtomicBool::new(false));
        let pump_stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(source, queue.clone(), pump_tx, paused.clone(), pump_stop.clone());

        let state = self.state.clone();
        let events = self.events.clone();
        let handle = std::thread::spawn(move || {
            let outcome = pipeline.run_live(&queue, &pump_rx, &control_rx);
            pipeline.shutdown();
            queue.clear();
            let mut current = lock(&state);
            if current.is_running() {
                *current = SessionState::Stopped;
            }
            drop(current);
            if let Err(e) = outcome {
                log::error!("session failed: {e}");
                events.emit(&Event::Error(e));
            }
        });

        self.live = Some(LiveSession {
            control: control_tx,
            paused,
            pump_stop,
            cancelled,
            pump: Some(pump),
            pipeline: Some(handle),
        });
        *lock(&self.state) = SessionState::Streaming;
        log::info!("session started at {fps:.2} fps");
        Ok(())
    }

    /// Takes the configured source and turns it into frames. Media that
    /// fails to open is put back so the caller can retry.
    fn open_source(&mut self) -> Result<(Box<dyn FrameSource>, Option<VideoMetadata>)> {
        match self.source.take() {
            Some(StreamSource::Live(source)) => Ok((source, None)),
            Some(StreamSource::Media(media)) => {
                match DecodedFrameSource::open(
                    self.decoder.as_ref(),
                    &media,
                    &self.config.decode,
                    self.config.realtime_playback,
                ) {
                    Ok(source) => {
                        let metadata = source.metadata().clone();
                        Ok((Box::new(source), Some(metadata)))
                    }
                    Err(e) => {
                        self.source = Some(StreamSource::Media(media));
                        Err(e)
                    }
                }
            }
            None => Err(VitalsError::InvalidSource("no video stream set".into())),
        }
    }

    fn run_file(
        &mut self,
        media: &MediaSource,
        detector: Box<dyn FaceDetector>,
        adapter: EstimationAdapter,
    ) -> Result<()> {
        let metadata = self.decoder.probe(media)?;
        if metadata.issues {
            log::warn!("{}: stream metadata is incomplete", media.describe());
        }
        *lock(&self.recorder) = SessionRecorder::new(Some(metadata.clone()));

        let mut pipeline = VitalsPipeline::new(self.parts(
            detector,
            adapter,
            metadata.fps,
            self.config.file_flush_policy,
            Arc::new(AtomicBool::new(false)),
        ))?;
        pipeline.set_total_frames(metadata.total_frames);

        let outcome = self
            .decoder
            .decode(media, &self.config.decode, &metadata)
            .and_then(|frames| pipeline.run_file(frames));
        pipeline.shutdown();
        outcome
    }

    fn build_adapter(&self) -> Result<EstimationAdapter> {
        let backend = self
            .backends
            .create()
            .map_err(|e| VitalsError::InvalidConfig(format!("estimation backend: {e}")))?;
        log::debug!("estimation backend: {}", backend.name());
        Ok(EstimationAdapter::new(
            backend,
            self.credentials.clone(),
            self.config.retry,
            self.config.min_confidence,
        ))
    }

    fn parts(
        &self,
        detector: Box<dyn FaceDetector>,
        adapter: EstimationAdapter,
        fps: f64,
        flush_policy: FlushPolicy,
        cancelled: Arc<AtomicBool>,
    ) -> PipelineParts {
        PipelineParts {
            config: self.config.clone(),
            detector,
            adapter,
            events: self.events.clone(),
            recorder: self.recorder.clone(),
            logger: Box::new(LogPipelineLogger::default()),
            fps,
            flush_policy,
            cancelled,
        }
    }

    /// Current state, or `SessionDisposed`.
    fn state_checked(&self) -> Result<SessionState> {
        match self.state() {
            SessionState::Disposed => Err(VitalsError::SessionDisposed),
            state => Ok(state),
        }
    }

    fn expect_state(&self, allowed: &[SessionState], operation: &'static str) -> Result<()> {
        let from = self.state_checked()?;
        if allowed.contains(&from) {
            Ok(())
        } else {
            Err(VitalsError::InvalidState { from, operation })
        }
    }

    /// The pipeline thread may have stopped the session on its own.
    fn set_state_if_running(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if state.is_running() {
            *state = next;
        }
    }
}

impl Drop for StreamingController {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::domain::estimation_backend::{EstimationBackend, EstimationError};
    use crate::estimation::domain::retry_policy::RetryPolicy;
    use crate::estimation::domain::vitals_estimate::{QualityFlags, VitalsEstimate};
    use crate::pipeline::session_config::FaceLostPolicy;
    use crate::shared::error::Warning;
    use crate::shared::frame::{PixelFormat, RawFrame};
    use crate::shared::region::FaceBox;
    use crate::video::domain::decode_options::DecodeOptions;
    use crate::video::domain::video_decoder::FrameIter;
    use crate::windowing::domain::window::Window;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const SIZE: u32 = 32;

    fn frame(index: usize) -> RawFrame {
        let level = 100 + (index % 7) as u8;
        RawFrame::new(
            vec![level; (SIZE * SIZE * 3) as usize],
            SIZE,
            SIZE,
            PixelFormat::Rgb24,
            index,
            index as f64 * 1000.0 / 30.0,
        )
    }

    struct StubDecoder {
        frames: usize,
        decoded: Arc<AtomicUsize>,
    }

    impl StubDecoder {
        fn new(frames: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
            let decoded = Arc::new(AtomicUsize::new(0));
            let decoder = Arc::new(Self {
                frames,
                decoded: decoded.clone(),
            });
            (decoder, decoded)
        }
    }

    impl VideoDecoder for StubDecoder {
        fn probe(&self, _source: &MediaSource) -> Result<VideoMetadata> {
            Ok(VideoMetadata {
                fps: 30.0,
                total_frames: self.frames,
                width: SIZE,
                height: SIZE,
                codec: "stub".into(),
                bitrate: 0,
                rotation: 0,
                issues: false,
            })
        }

        fn decode(
            &self,
            _source: &MediaSource,
            _options: &DecodeOptions,
            _metadata: &VideoMetadata,
        ) -> Result<FrameIter> {
            let decoded = self.decoded.clone();
            Ok(Box::new((0..self.frames).map(move |i| {
                decoded.fetch_add(1, Ordering::Relaxed);
                Ok(frame(i))
            })))
        }
    }

    struct FixedDetector {
        delay: Duration,
        face: bool,
    }

    impl FaceDetector for FixedDetector {
        fn detect(
            &mut self,
            frame: &RawFrame,
        ) -> std::result::Result<Option<FaceBox>, Box<dyn std::error::Error>> {
            std::thread::sleep(self.delay);
            Ok(self.face.then_some(FaceBox {
                frame_index: frame.index(),
                x0: 8.0,
                y0: 8.0,
                x1: 24.0,
                y1: 24.0,
                confidence: 0.9,
            }))
        }
    }

    fn detectors(delay: Duration, face: bool, created: Arc<AtomicUsize>) -> Arc<dyn DetectorFactory> {
        Arc::new(
            move || -> std::result::Result<Box<dyn FaceDetector>, VitalsError> {
                created.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(FixedDetector { delay, face }))
            },
        )
    }

    fn broken_detectors() -> Arc<dyn DetectorFactory> {
        Arc::new(|| -> std::result::Result<Box<dyn FaceDetector>, VitalsError> {
            Err(VitalsError::DetectorInit("model missing".into()))
        })
    }

    /// Fails the first `failures` calls, then finds a face every time.
    struct FlakyDetector {
        failures: usize,
    }

    impl FaceDetector for FlakyDetector {
        fn detect(
            &mut self,
            frame: &RawFrame,
        ) -> std::result::Result<Option<FaceBox>, Box<dyn std::error::Error>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err("inference failed".into());
            }
            FixedDetector {
                delay: Duration::ZERO,
                face: true,
            }
            .detect(frame)
        }
    }

    fn flaky_detectors(failures: usize) -> Arc<dyn DetectorFactory> {
        Arc::new(
            move || -> std::result::Result<Box<dyn FaceDetector>, VitalsError> {
                Ok(Box::new(FlakyDetector { failures }))
            },
        )
    }

    struct EchoBackend;

    impl EstimationBackend for EchoBackend {
        fn estimate(
            &mut self,
            window: &Window,
            _credentials: &Credentials,
        ) -> std::result::Result<VitalsEstimate, EstimationError> {
            Ok(VitalsEstimate {
                window_start_index: window.start_index,
                window_end_index: window.end_index(),
                pulse: vec![1.0; window.valid_frames],
                pulse_rate_bpm: Some(72.0),
                respiration_rate_bpm: None,
                confidence: 0.9,
                quality: QualityFlags::default(),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct UnavailableBackend;

    impl EstimationBackend for UnavailableBackend {
        fn estimate(
            &mut self,
            _window: &Window,
            _credentials: &Credentials,
        ) -> std::result::Result<VitalsEstimate, EstimationError> {
            Err(EstimationError::Transient("503".into()))
        }

        fn name(&self) -> &str {
            "unavailable"
        }
    }

    /// Echoes after `delay`, counting calls as they start.
    struct SlowBackend {
        delay: Duration,
        started: Arc<AtomicUsize>,
    }

    impl EstimationBackend for SlowBackend {
        fn estimate(
            &mut self,
            window: &Window,
            credentials: &Credentials,
        ) -> std::result::Result<VitalsEstimate, EstimationError> {
            self.started.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(self.delay);
            EchoBackend.estimate(window, credentials)
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn echo_backends() -> Arc<dyn BackendFactory> {
        Arc::new(
            || -> std::result::Result<Box<dyn EstimationBackend>, EstimationError> {
                Ok(Box::new(EchoBackend))
            },
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            window_frames: 30,
            window_stride: 10,
            crop_width: 8,
            crop_height: 8,
            detect_every: 2,
            realtime_playback: false,
            ..SessionConfig::default()
        }
    }

    fn controller(
        config: SessionConfig,
        decoder: Arc<dyn VideoDecoder>,
        detectors: Arc<dyn DetectorFactory>,
        backends: Arc<dyn BackendFactory>,
    ) -> StreamingController {
        StreamingController::new(config, decoder, detectors, backends, Credentials::default()).unwrap()
    }

    fn media() -> MediaSource {
        MediaSource::from(vec![0u8; 16])
    }

    /// Live source producing `frames` frames, `delay` apart.
    struct VecSource {
        next: usize,
        frames: usize,
        delay: Duration,
    }

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Option<Result<RawFrame>> {
            if self.next >= self.frames {
                return None;
            }
            std::thread::sleep(self.delay);
            self.next += 1;
            Some(Ok(frame(self.next - 1)))
        }

        fn fps(&self) -> f64 {
            30.0
        }

        fn dimensions(&self) -> (u32, u32) {
            (SIZE, SIZE)
        }
    }

    fn live(frames: usize, delay: Duration) -> StreamSource {
        StreamSource::Live(Box::new(VecSource {
            next: 0,
            frames,
            delay,
        }))
    }

    /// Counts every event delivered to `controller`'s listeners.
    fn count_all_events(controller: &StreamingController) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        for kind in [EventKind::Vitals, EventKind::Warning, EventKind::Error] {
            let count = count.clone();
            controller
                .add_event_listener(
                    kind,
                    Arc::new(move |_: &Event| {
                        count.fetch_add(1, Ordering::Relaxed);
                    }),
                )
                .unwrap();
        }
        count
    }

    fn wait_for_state(controller: &StreamingController, state: SessionState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.state() != state {
            assert!(Instant::now() < deadline, "still {}", controller.state());
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_file_run_produces_every_window() {
        let (decoder, decoded) = StubDecoder::new(105);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());

        let result = c.process_video_file(media()).unwrap();

        assert_eq!(c.state(), SessionState::Stopped);
        assert_eq!(decoded.load(Ordering::Relaxed), 105);
        assert_eq!(result.frames_processed, 105);
        assert_eq!(result.frames_dropped, 0);
        let starts: Vec<usize> = result.estimates.iter().map(|e| e.window_start_index).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40, 50, 60, 70, 80]);
        let last = result.estimates.last().unwrap();
        assert!(last.quality.partial);
        assert_eq!(last.pulse.len(), 25);
        assert_eq!(result.series.len(), 105);
        approx::assert_relative_eq!(result.pulse_rate_bpm.unwrap(), 72.0, epsilon = 1e-9);
        assert_eq!(result.metadata.unwrap().total_frames, 105);
    }

    #[test]
    fn test_detector_init_failure_decodes_nothing() {
        let (decoder, decoded) = StubDecoder::new(30);
        let mut c = controller(config(), decoder, broken_detectors(), echo_backends());

        let err = c.process_video_file(media()).unwrap_err();
        assert!(matches!(err, VitalsError::DetectorInit(_)));
        assert_eq!(c.state(), SessionState::Idle);

        c.set_video_stream(live(10, Duration::ZERO)).unwrap();
        let err = c.start_video_stream().unwrap_err();
        assert!(matches!(err, VitalsError::DetectorInit(_)));
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(decoded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_backend_failure_is_config_error() {
        let (decoder, _) = StubDecoder::new(30);
        let backends: Arc<dyn BackendFactory> = Arc::new(
            || -> std::result::Result<Box<dyn EstimationBackend>, EstimationError> {
                Err(EstimationError::Permanent("no endpoint".into()))
            },
        );
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), backends);
        let err = c.process_video_file(media()).unwrap_err();
        assert!(matches!(err, VitalsError::InvalidConfig(_)));
    }

    #[test]
    fn test_start_twice_builds_one_pipeline() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(
            config(),
            decoder,
            detectors(Duration::ZERO, true, created.clone()),
            echo_backends(),
        );
        c.set_video_stream(live(10_000, Duration::from_millis(2))).unwrap();

        c.start_video_stream().unwrap();
        c.start_video_stream().unwrap();
        assert_eq!(c.state(), SessionState::Streaming);
        assert_eq!(created.load(Ordering::Relaxed), 1);

        c.stop_video_stream().unwrap();
        assert_eq!(c.state(), SessionState::Stopped);
    }

    #[test]
    fn test_start_without_source_is_invalid() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());
        assert!(matches!(
            c.start_video_stream(),
            Err(VitalsError::InvalidSource(_))
        ));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_invalid_sources_rejected() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());

        let empty = StreamSource::Media(MediaSource::from(Vec::new()));
        assert!(matches!(c.set_video_stream(empty), Err(VitalsError::InvalidSource(_))));

        let (_tx, zero) =
            crate::video::infrastructure::channel_frame_source::ChannelFrameSource::new(30.0, 0, 0, 1);
        assert!(matches!(
            c.set_video_stream(StreamSource::Live(Box::new(zero))),
            Err(VitalsError::InvalidSource(_))
        ));
        assert!(matches!(
            c.process_video_file(MediaSource::Url(" ".into())),
            Err(VitalsError::InvalidSource(_))
        ));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let (decoder, _) = StubDecoder::new(40);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());

        assert!(matches!(
            c.pause_video_stream(),
            Err(VitalsError::InvalidState { from: SessionState::Idle, operation: "pause" })
        ));
        assert!(matches!(
            c.stop_video_stream(),
            Err(VitalsError::InvalidState { from: SessionState::Idle, operation: "stop" })
        ));

        c.process_video_file(media()).unwrap();
        assert!(matches!(
            c.stop_video_stream(),
            Err(VitalsError::InvalidState { from: SessionState::Stopped, .. })
        ));
        assert!(matches!(
            c.start_video_stream(),
            Err(VitalsError::InvalidState { from: SessionState::Stopped, operation: "start" })
        ));
        assert!(matches!(
            c.process_video_file(media()),
            Err(VitalsError::InvalidState { operation: "process_video_file", .. })
        ));
        assert!(matches!(
            c.set_video_stream(live(1, Duration::ZERO)),
            Err(VitalsError::InvalidState { operation: "set_video_stream", .. })
        ));
    }

    #[test]
    fn test_everything_fails_after_dispose() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());
        c.set_video_stream(live(10_000, Duration::from_millis(2))).unwrap();
        c.start_video_stream().unwrap();

        c.dispose();
        c.dispose();
        assert_eq!(c.state(), SessionState::Disposed);

        let disposed = |r: Result<()>| matches!(r, Err(VitalsError::SessionDisposed));
        assert!(disposed(c.start_video_stream()));
        assert!(disposed(c.pause_video_stream()));
        assert!(disposed(c.stop_video_stream()));
        assert!(disposed(c.set_video_stream(live(1, Duration::ZERO))));
        assert!(matches!(c.process_video_file(media()), Err(VitalsError::SessionDisposed)));
        assert!(matches!(
            c.add_event_listener(EventKind::Vitals, Arc::new(|_: &Event| {})),
            Err(VitalsError::SessionDisposed)
        ));
        assert!(matches!(c.session_result(), Err(VitalsError::SessionDisposed)));
    }

    #[test]
    fn test_no_events_after_dispose_mid_estimation() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let backends: Arc<dyn BackendFactory> = {
            let started = started.clone();
            Arc::new(
                move || -> std::result::Result<Box<dyn EstimationBackend>, EstimationError> {
                    Ok(Box::new(SlowBackend {
                        delay: Duration::from_millis(300),
                        started: started.clone(),
                    }))
                },
            )
        };
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), backends);
        let events = count_all_events(&c);
        c.set_video_stream(live(10_000, Duration::from_millis(2))).unwrap();
        c.start_video_stream().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while started.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "no window reached the backend");
            std::thread::sleep(Duration::from_millis(5));
        }
        c.dispose();
        let seen = events.load(Ordering::Relaxed);

        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(events.load(Ordering::Relaxed), seen);
        assert_eq!(c.state(), SessionState::Disposed);
    }

    #[test]
    fn test_detector_failures_up_to_limit_are_tolerated() {
        let (decoder, _) = StubDecoder::new(40);
        let config = SessionConfig {
            max_consecutive_detector_failures: 3,
            ..config()
        };
        let mut c = controller(config, decoder, flaky_detectors(3), echo_backends());
        let events = count_all_events(&c);

        let result = c.process_video_file(media()).unwrap();

        assert_eq!(c.state(), SessionState::Stopped);
        assert_eq!(result.frames_processed, 40);
        let failures = result
            .warnings
            .iter()
            .filter(|w| w.starts_with("detection failed"))
            .count();
        assert_eq!(failures, 3);
        assert_eq!(
            events.load(Ordering::Relaxed),
            result.warnings.len() + result.estimates.len()
        );
    }

    #[test]
    fn test_detector_failures_past_limit_are_fatal() {
        let (decoder, _) = StubDecoder::new(40);
        let config = SessionConfig {
            max_consecutive_detector_failures: 3,
            ..config()
        };
        let mut c = controller(config, decoder, flaky_detectors(usize::MAX), echo_backends());
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            c.add_event_listener(
                EventKind::Error,
                Arc::new(move |e: &Event| {
                    if let Event::Error(err) = e {
                        errors.lock().unwrap().push(err.clone());
                    }
                }),
            )
            .unwrap();
        }

        let err = c.process_video_file(media()).unwrap_err();

        assert_eq!(err, VitalsError::DetectorFailure { consecutive: 4 });
        assert!(err.is_fatal());
        assert_eq!(c.state(), SessionState::Stopped);
        assert_eq!(*errors.lock().unwrap(), vec![err]);
        let result = c.session_result().unwrap();
        assert!(result.estimates.is_empty());
    }

    #[test]
    fn test_live_detector_failures_past_limit_stop_session() {
        let (decoder, _) = StubDecoder::new(0);
        let config = SessionConfig {
            max_consecutive_detector_failures: 2,
            ..config()
        };
        let mut c = controller(config, decoder, flaky_detectors(usize::MAX), echo_backends());
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let errors = errors.clone();
            c.add_event_listener(
                EventKind::Error,
                Arc::new(move |e: &Event| {
                    if matches!(e, Event::Error(VitalsError::DetectorFailure { consecutive: 3 })) {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            )
            .unwrap();
        }

        c.set_video_stream(live(10_000, Duration::from_millis(2))).unwrap();
        c.start_video_stream().unwrap();
        wait_for_state(&c, SessionState::Stopped);

        // The state moves before the error is published.
        let deadline = Instant::now() + Duration::from_secs(5);
        while errors.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "no detector failure reported");
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_live_source_end_stops_session() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            c.add_event_listener(
                EventKind::Vitals,
                Arc::new(move |_: &Event| {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
        }

        c.set_video_stream(live(60, Duration::ZERO)).unwrap();
        c.start_video_stream().unwrap();
        wait_for_state(&c, SessionState::Stopped);

        let result = c.session_result().unwrap();
        assert_eq!(result.frames_processed + result.frames_dropped, 60);
        assert_eq!(count.load(Ordering::Relaxed), result.estimates.len());
    }

    #[test]
    fn test_backpressure_drops_oldest_frames() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let config = SessionConfig {
            max_queued_frames: 4,
            max_in_flight_detections: 1,
            detect_every: 1,
            ..config()
        };
        let mut c = controller(
            config,
            decoder,
            detectors(Duration::from_millis(20), true, created),
            echo_backends(),
        );
        c.set_video_stream(live(60, Duration::ZERO)).unwrap();
        c.start_video_stream().unwrap();
        wait_for_state(&c, SessionState::Stopped);

        let result = c.session_result().unwrap();
        assert!(result.frames_dropped > 0);
        assert_eq!(result.frames_processed + result.frames_dropped, 60);
        assert!(result.warnings.iter().any(|w| w.contains("frames dropped")));
    }

    #[test]
    fn test_pause_holds_frames_until_resume() {
        let (decoder, _) = StubDecoder::new(0);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());
        c.set_video_stream(live(10_000, Duration::from_millis(2))).unwrap();
        c.start_video_stream().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        c.pause_video_stream().unwrap();
        c.pause_video_stream().unwrap();
        assert_eq!(c.state(), SessionState::Paused);
        std::thread::sleep(Duration::from_millis(100));
        let held = c.session_result().unwrap().frames_processed;
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(c.session_result().unwrap().frames_processed, held);

        c.start_video_stream().unwrap();
        assert_eq!(c.state(), SessionState::Streaming);
        std::thread::sleep(Duration::from_millis(100));
        c.stop_video_stream().unwrap();
        assert!(c.session_result().unwrap().frames_processed > held);
    }

    #[test]
    fn test_face_lost_fail_policy_is_fatal() {
        let (decoder, _) = StubDecoder::new(40);
        let created = Arc::new(AtomicUsize::new(0));
        let config = SessionConfig {
            face_lost_policy: FaceLostPolicy::Fail,
            ..config()
        };
        let mut c = controller(config, decoder, detectors(Duration::ZERO, false, created), echo_backends());
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            c.add_event_listener(
                EventKind::Error,
                Arc::new(move |e: &Event| {
                    if let Event::Error(err) = e {
                        errors.lock().unwrap().push(err.clone());
                    }
                }),
            )
            .unwrap();
        }

        let err = c.process_video_file(media()).unwrap_err();
        assert_eq!(err, VitalsError::FaceLost { frame_index: 0 });
        assert_eq!(c.state(), SessionState::Stopped);
        assert_eq!(*errors.lock().unwrap(), vec![err]);
    }

    #[test]
    fn test_face_lost_pause_policy_warns_once() {
        let (decoder, _) = StubDecoder::new(40);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, false, created), echo_backends());
        let warnings = Arc::new(Mutex::new(Vec::new()));
        {
            let warnings = warnings.clone();
            c.add_event_listener(
                EventKind::Warning,
                Arc::new(move |e: &Event| {
                    if let Event::Warning(w) = e {
                        warnings.lock().unwrap().push(w.clone());
                    }
                }),
            )
            .unwrap();
        }

        let result = c.process_video_file(media()).unwrap();
        assert!(result.estimates.is_empty());
        assert_eq!(result.frames_processed, 40);
        assert_eq!(
            *warnings.lock().unwrap(),
            vec![Warning::FaceLost { frame_index: 0 }]
        );
    }

    #[test]
    fn test_exhausted_retries_end_session() {
        let (decoder, _) = StubDecoder::new(40);
        let created = Arc::new(AtomicUsize::new(0));
        let backends: Arc<dyn BackendFactory> = Arc::new(
            || -> std::result::Result<Box<dyn EstimationBackend>, EstimationError> {
                Ok(Box::new(UnavailableBackend))
            },
        );
        let config = SessionConfig {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff_ms: 1,
                multiplier: 1.0,
                max_backoff_ms: 1,
            },
            ..config()
        };
        let mut c = controller(config, decoder, detectors(Duration::ZERO, true, created), backends);

        let err = c.process_video_file(media()).unwrap_err();
        assert!(matches!(err, VitalsError::TransientEstimation { attempts: 3, .. }));
        let result = c.session_result().unwrap();
        assert_eq!(
            result
                .warnings
                .iter()
                .filter(|w| w.contains("retr"))
                .count(),
            2
        );
    }

    #[test]
    fn test_listener_removal() {
        let (decoder, _) = StubDecoder::new(40);
        let created = Arc::new(AtomicUsize::new(0));
        let mut c = controller(config(), decoder, detectors(Duration::ZERO, true, created), echo_backends());
        let count = Arc::new(AtomicUsize::new(0));
        let id = {
            let count = count.clone();
            c.add_event_listener(
                EventKind::Vitals,
                Arc::new(move |_: &Event| {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap()
        };
        assert!(c.remove_event_listener(EventKind::Vitals, id).unwrap());
        assert!(!c.remove_event_listener(EventKind::Vitals, id).unwrap());

        let result = c.process_video_file(media()).unwrap();
        assert!(!result.estimates.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
