use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{select, Receiver, TrySendError};

use crate::detection::domain::face_detector::FaceDetector;
use crate::detection::domain::face_tracker::{FaceTracker, TrackerConfig};
use crate::detection::infrastructure::detector_worker::{
    DetectOutcome, DetectResponse, DetectorWorker,
};
use crate::estimation::domain::estimation_adapter::EstimationAdapter;
use crate::shared::error::{Result, VitalsError, Warning};
use crate::shared::frame::RawFrame;
use crate::video::domain::video_decoder::FrameIter;
use crate::windowing::domain::region_cropper::RegionCropper;
use crate::windowing::domain::window::Window;
use crate::windowing::domain::window_buffer::{FlushPolicy, FrameWindowBuffer};

use super::events::{Event, EventBus};
use super::frame_aligner::{Alignment, FrameAligner};
use super::frame_queue::FrameQueue;
use super::infrastructure::estimation_worker::{EstimationMessage, EstimationWorker};
use super::infrastructure::frame_pump::PumpEvent;
use super::pipeline_logger::PipelineLogger;
use super::session_config::{FaceLostPolicy, SessionConfig};
use super::session_result::SessionRecorder;

const ESTIMATION_QUEUE: usize = 2;
/// Live windows waiting for an estimation slot; beyond this the oldest
/// is dropped.
const ESTIMATION_BACKLOG: usize = 2;

/// Commands from the controller to a live pipeline loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Stop,
}

/// Everything a pipeline run needs, assembled by the controller.
pub struct PipelineParts {
    pub config: SessionConfig,
    pub detector: Box<dyn FaceDetector>,
    pub adapter: EstimationAdapter,
    pub events: Arc<EventBus>,
    pub recorder: Arc<Mutex<SessionRecorder>>,
    pub logger: Box<dyn PipelineLogger>,
    pub fps: f64,
    pub flush_policy: FlushPolicy,
    pub cancelled: Arc<AtomicBool>,
}

/// Frame → detect → track → crop → window → estimate.
///
/// Detection and estimation run on worker threads; this type owns the
/// ordering. Frames leave the aligner strictly in index order, windows
/// are estimated in emission order, and results are published as they
/// arrive.
pub struct VitalsPipeline {
    config: SessionConfig,
    detector: DetectorWorker,
    estimator: EstimationWorker,
    aligner: FrameAligner,
    tracker: Option<FaceTracker>,
    tracker_config: TrackerConfig,
    cropper: RegionCropper,
    windows: FrameWindowBuffer,
    flush_policy: FlushPolicy,
    events: Arc<EventBus>,
    recorder: Arc<Mutex<SessionRecorder>>,
    logger: Box<dyn PipelineLogger>,
    cancelled: Arc<AtomicBool>,
    face_lost: bool,
    consecutive_detector_failures: usize,
    backlog: VecDeque<Window>,
    lossless: bool,
    windows_pending: usize,
    total_frames: usize,
}

impl VitalsPipeline {
    pub fn new(parts: PipelineParts) -> Result<Self> {
        let config = parts.config;
        let windows = FrameWindowBuffer::new(config.window_frames, config.window_stride)?;
        let detector = DetectorWorker::spawn(
            parts.detector,
            config.max_in_flight_detections,
            config.detection_confidence,
        );
        let estimator =
            EstimationWorker::spawn(parts.adapter, ESTIMATION_QUEUE, parts.cancelled.clone());
        Ok(Self {
            tracker_config: config.tracker_config(parts.fps),
            cropper: RegionCropper::new(config.crop_width, config.crop_height),
            config,
            detector,
            estimator,
            aligner: FrameAligner::new(),
            tracker: None,
            windows,
            flush_policy: parts.flush_policy,
            events: parts.events,
            recorder: parts.recorder,
            logger: parts.logger,
            cancelled: parts.cancelled,
            face_lost: false,
            consecutive_detector_failures: 0,
            backlog: VecDeque::new(),
            lossless: true,
            windows_pending: 0,
            total_frames: 0,
        })
    }

    /// Known frame count for progress reporting; 0 when unknown.
    pub fn set_total_frames(&mut self, total: usize) {
        self.total_frames = total;
    }

    /// Runs a whole file. Every frame is processed; the decoder waits for
    /// detection capacity instead of dropping.
    pub fn run_file(&mut self, frames: FrameIter) -> Result<()> {
        self.lossless = true;
        for item in frames {
            if self.is_cancelled() {
                return Ok(());
            }
            self.accept_blocking(item?)?;
            self.poll_workers()?;
        }
        self.finish()
    }

    /// Runs a live session until stopped, the source ends, or a fatal
    /// error occurs.
    pub fn run_live(
        &mut self,
        queue: &FrameQueue,
        pump: &Receiver<PumpEvent>,
        control: &Receiver<Control>,
    ) -> Result<()> {
        let detections = self.detector.responses().clone();
        let results = self.estimator.results().clone();
        let never = crossbeam_channel::never::<RawFrame>();
        let mut paused = false;
        self.lossless = false;

        loop {
            self.report_drops(queue);
            self.drain_backlog()?;
            let frames = if !paused && self.can_accept() {
                queue.receiver()
            } else {
                &never
            };

            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::Pause) => {
                        log::info!("pipeline paused");
                        paused = true;
                    }
                    Ok(Control::Resume) => {
                        log::info!("pipeline resumed");
                        paused = false;
                    }
                    Ok(Control::Stop) | Err(_) => {
                        log::info!("pipeline stopping");
                        return self.finish();
                    }
                },
                recv(frames) -> msg => {
                    if let Ok(frame) = msg {
                        self.accept(frame)?;
                    }
                }
                recv(detections) -> msg => match msg {
                    Ok(response) => self.on_detection(response)?,
                    Err(_) => return Err(self.detector_gone()),
                },
                recv(results) -> msg => match msg {
                    Ok(message) => self.on_estimation(message)?,
                    Err(_) => return Err(estimator_gone()),
                },
                recv(pump) -> msg => match msg {
                    Ok(PumpEvent::Skipped { index, reason }) => {
                        self.warn(Warning::FrameSkipped { index, reason });
                    }
                    Ok(PumpEvent::Failed(e)) => return Err(e),
                    Ok(PumpEvent::Ended) | Err(_) => {
                        log::info!("frame source ended");
                        let remaining: Vec<RawFrame> = queue.receiver().try_iter().collect();
                        for frame in remaining {
                            self.accept_blocking(frame)?;
                        }
                        self.report_drops(queue);
                        return self.finish();
                    }
                },
            }
        }
    }

    /// Stops both workers and drops buffered frames. Idempotent.
    pub fn shutdown(&mut self) {
        self.detector.shutdown();
        self.estimator.shutdown();
        self.aligner.clear();
        self.windows.reset();
        self.backlog.clear();
        self.logger.summary();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn can_accept(&self) -> bool {
        self.aligner.in_flight() < self.config.max_in_flight_detections
    }

    fn accept_blocking(&mut self, frame: RawFrame) -> Result<()> {
        while !self.can_accept() {
            let response = self
                .detector
                .responses()
                .recv()
                .map_err(|_| self.detector_gone())?;
            self.on_detection(response)?;
        }
        self.accept(frame)
    }

    /// Takes a frame from the source. Sampled frames go to the detector;
    /// the rest wait in the aligner.
    fn accept(&mut self, frame: RawFrame) -> Result<()> {
        let index = frame.index();
        if index % self.config.detect_every == 0 {
            match self.detector.submit(frame) {
                Ok(()) => self.aligner.mark_pending(index),
                Err(frame) => {
                    log::error!("detector worker is gone, frame {index} not sampled");
                    self.aligner.push_unsampled(frame);
                }
            }
        } else {
            self.aligner.push_unsampled(frame);
        }
        self.logger.metric("aligner_depth", self.aligner.len() as f64);
        self.release(false)
    }

    /// Drains whatever the workers have already produced.
    fn poll_workers(&mut self) -> Result<()> {
        while let Ok(response) = self.detector.responses().try_recv() {
            self.on_detection(response)?;
        }
        while let Ok(message) = self.estimator.results().try_recv() {
            self.on_estimation(message)?;
        }
        Ok(())
    }

    fn on_detection(&mut self, response: DetectResponse) -> Result<()> {
        let DetectResponse { frame, outcome } = response;
        let face = match outcome {
            DetectOutcome::Face(face) => {
                self.consecutive_detector_failures = 0;
                Some(face)
            }
            DetectOutcome::NoFace => {
                self.consecutive_detector_failures = 0;
                None
            }
            DetectOutcome::Failed(reason) => {
                self.consecutive_detector_failures += 1;
                self.warn(Warning::DetectionFailed {
                    frame_index: frame.index(),
                    reason,
                });
                if self.consecutive_detector_failures
                    > self.config.max_consecutive_detector_failures
                {
                    return Err(VitalsError::DetectorFailure {
                        consecutive: self.consecutive_detector_failures,
                    });
                }
                None
            }
        };
        self.aligner.resolve(frame, face);
        self.release(false)
    }

    fn release(&mut self, finishing: bool) -> Result<()> {
        while let Some((frame, alignment)) = self.aligner.pop_ready(finishing) {
            self.track(frame, alignment)?;
        }
        Ok(())
    }

    fn track(&mut self, frame: RawFrame, alignment: Alignment) -> Result<()> {
        let started = Instant::now();
        let index = frame.index();
        let config = self.tracker_config;
        let tracker = self
            .tracker
            .get_or_insert_with(|| FaceTracker::new(config, frame.width(), frame.height()));
        let region = match alignment {
            Alignment::Detected(face) => tracker.update(index, face),
            Alignment::Unsampled {
                upcoming: Some(upcoming),
            } => tracker.update_bridged(index, &upcoming),
            Alignment::Unsampled { upcoming: None } => tracker.update(index, None),
        };
        self.logger
            .timing("track", started.elapsed().as_secs_f64() * 1000.0);

        let processed = {
            let mut recorder = self.recorder.lock().unwrap_or_else(|e| e.into_inner());
            recorder.record_frame();
            recorder.frames_processed()
        };
        self.logger.progress(processed, self.total_frames);

        if region.lost() {
            return self.on_face_lost(index);
        }
        if self.face_lost {
            log::info!("face reacquired at frame {index}");
            self.face_lost = false;
        }

        let started = Instant::now();
        match self.cropper.crop(&frame, &region) {
            Ok(crop) => {
                self.logger
                    .timing("crop", started.elapsed().as_secs_f64() * 1000.0);
                if let Some(window) = self.windows.push(crop) {
                    self.submit_window(window)?;
                }
            }
            Err(e) => self.warn(Warning::FrameSkipped {
                index,
                reason: e.to_string(),
            }),
        }
        Ok(())
    }

    fn on_face_lost(&mut self, frame_index: usize) -> Result<()> {
        if self.face_lost {
            return Ok(());
        }
        self.face_lost = true;
        match self.config.face_lost_policy {
            FaceLostPolicy::Fail => Err(VitalsError::FaceLost { frame_index }),
            FaceLostPolicy::Pause => {
                self.warn(Warning::FaceLost { frame_index });
                match self.windows.flush(self.flush_policy) {
                    Some(window) => self.submit_window(window),
                    None => Ok(()),
                }
            }
        }
    }

    fn submit_window(&mut self, window: Window) -> Result<()> {
        log::debug!(
            "window {}..={} ({} valid) ready",
            window.start_index,
            window.end_index(),
            window.valid_frames
        );
        if self.lossless {
            return self.send_window(window);
        }

        // Live runs never block on the estimator; control must stay responsive.
        self.backlog.push_back(window);
        self.drain_backlog()?;
        while self.backlog.len() > ESTIMATION_BACKLOG {
            if let Some(dropped) = self.backlog.pop_front() {
                self.warn(Warning::WindowDropped {
                    window_start: dropped.start_index,
                });
            }
        }
        Ok(())
    }

    /// Hands backlogged windows to the estimator while it has room.
    fn drain_backlog(&mut self) -> Result<()> {
        while let Some(window) = self.backlog.pop_front() {
            match self.estimator.try_submit(window) {
                Ok(()) => self.windows_pending += 1,
                Err(TrySendError::Full(window)) => {
                    self.backlog.push_front(window);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => return Err(estimator_gone()),
            }
        }
        Ok(())
    }

    fn send_window(&mut self, window: Window) -> Result<()> {
        self.estimator.submit(window).map_err(|_| estimator_gone())?;
        self.windows_pending += 1;
        Ok(())
    }

    fn on_estimation(&mut self, message: EstimationMessage) -> Result<()> {
        match message {
            EstimationMessage::Retried(warning) => {
                self.warn(warning);
                Ok(())
            }
            EstimationMessage::Finished {
                window_start,
                result,
                elapsed_ms,
            } => {
                self.windows_pending = self.windows_pending.saturating_sub(1);
                self.logger.timing("estimate", elapsed_ms);
                let estimate = result?;
                log::debug!(
                    "window {window_start}: pulse {:?} bpm, confidence {:.2}",
                    estimate.pulse_rate_bpm,
                    estimate.confidence
                );
                self.recorder
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_estimate(&estimate);
                self.events.emit(&Event::Vitals(estimate));
                Ok(())
            }
        }
    }

    /// Resolves outstanding detections, flushes the window buffer under
    /// the session's policy and waits for every pending estimate.
    fn finish(&mut self) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        while self.aligner.in_flight() > 0 {
            let response = self
                .detector
                .responses()
                .recv()
                .map_err(|_| self.detector_gone())?;
            self.on_detection(response)?;
        }
        self.release(true)?;

        if !self.face_lost {
            if let Some(window) = self.windows.flush(self.flush_policy) {
                self.submit_window(window)?;
            }
        }
        while let Some(window) = self.backlog.pop_front() {
            self.send_window(window)?;
        }

        while self.windows_pending > 0 {
            let message = self
                .estimator
                .results()
                .recv()
                .map_err(|_| estimator_gone())?;
            self.on_estimation(message)?;
        }
        Ok(())
    }

    fn report_drops(&mut self, queue: &FrameQueue) {
        let count = queue.take_dropped();
        if count > 0 {
            self.warn(Warning::FramesDropped { count });
        }
    }

    fn warn(&mut self, warning: Warning) {
        log::warn!("{warning}");
        self.recorder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_warning(&warning);
        self.events.emit(&Event::Warning(warning));
    }

    fn detector_gone(&self) -> VitalsError {
        VitalsError::DetectorFailure {
            consecutive: self.consecutive_detector_failures,
        }
    }
}

fn estimator_gone() -> VitalsError {
    VitalsError::PermanentEstimation("estimation worker stopped".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::domain::estimation_backend::{
        Credentials, EstimationBackend, EstimationError,
    };
    use crate::estimation::domain::retry_policy::RetryPolicy;
    use crate::estimation::domain::vitals_estimate::{QualityFlags, VitalsEstimate};
    use crate::pipeline::events::EventKind;
    use crate::pipeline::pipeline_logger::NullPipelineLogger;
    use crate::shared::frame::PixelFormat;
    use crate::shared::region::FaceBox;

    struct FixedDetector;

    impl FaceDetector for FixedDetector {
        fn detect(
            &mut self,
            frame: &RawFrame,
        ) -> std::result::Result<Option<FaceBox>, Box<dyn std::error::Error>> {
            Ok(Some(FaceBox {
                frame_index: frame.index(),
                x0: 8.0,
                y0: 8.0,
                x1: 24.0,
                y1: 24.0,
                confidence: 0.9,
            }))
        }
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
                pulse: window.valid().iter().map(|f| f.index() as f64).collect(),
                pulse_rate_bpm: Some(60.0),
                respiration_rate_bpm: None,
                confidence: 0.8,
                quality: QualityFlags::default(),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    /// Echoes after `delay`, standing in for a slow service.
    struct SlowBackend {
        delay: std::time::Duration,
    }

    impl EstimationBackend for SlowBackend {
        fn estimate(
            &mut self,
            window: &Window,
            credentials: &Credentials,
        ) -> std::result::Result<VitalsEstimate, EstimationError> {
            std::thread::sleep(self.delay);
            EchoBackend.estimate(window, credentials)
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn frames(n: usize) -> FrameIter {
        Box::new((0..n).map(|i| {
            Ok(RawFrame::new(
                vec![100; 32 * 32 * 3],
                32,
                32,
                PixelFormat::Rgb24,
                i,
                i as f64 * 1000.0 / 30.0,
            ))
        }))
    }

    type Harness = (VitalsPipeline, Arc<EventBus>, Arc<Mutex<SessionRecorder>>);

    fn pipeline(config: SessionConfig, flush: FlushPolicy) -> Harness {
        pipeline_with(config, flush, Box::new(EchoBackend))
    }

    fn pipeline_with(
        config: SessionConfig,
        flush: FlushPolicy,
        backend: Box<dyn EstimationBackend>,
    ) -> Harness {
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(Mutex::new(SessionRecorder::new(None)));
        let adapter = EstimationAdapter::new(
            backend,
            Credentials::default(),
            RetryPolicy::default(),
            config.min_confidence,
        );
        let pipeline = VitalsPipeline::new(PipelineParts {
            config,
            detector: Box::new(FixedDetector),
            adapter,
            events: events.clone(),
            recorder: recorder.clone(),
            logger: Box::new(NullPipelineLogger),
            fps: 30.0,
            flush_policy: flush,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
        .unwrap();
        (pipeline, events, recorder)
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            window_frames: 10,
            window_stride: 5,
            crop_width: 4,
            crop_height: 4,
            detect_every: 3,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_file_run_emits_windows_in_order() {
        let (mut pipeline, events, recorder) = pipeline(small_config(), FlushPolicy::PadAndFlag);
        let starts = Arc::new(Mutex::new(Vec::new()));
        {
            let starts = starts.clone();
            events.subscribe(
                EventKind::Vitals,
                Arc::new(move |e: &Event| {
                    if let Event::Vitals(v) = e {
                        starts.lock().unwrap().push(v.window_start_index);
                    }
                }),
            );
        }

        pipeline.run_file(frames(27)).unwrap();
        pipeline.shutdown();

        // Full windows at 0, 5, 10, 15; the tail 20..26 is padded.
        assert_eq!(*starts.lock().unwrap(), vec![0, 5, 10, 15, 20]);
        let result = recorder.lock().unwrap().result();
        assert_eq!(result.frames_processed, 27);
        assert!(result.estimates.last().unwrap().quality.partial);
        assert_eq!(result.series.len(), 27);
        assert_eq!(result.series.value_at(13).map(f64::round), Some(13.0));
    }

    #[test]
    fn test_discard_policy_drops_tail() {
        let (mut pipeline, _events, recorder) = pipeline(small_config(), FlushPolicy::Discard);
        pipeline.run_file(frames(27)).unwrap();
        pipeline.shutdown();
        let result = recorder.lock().unwrap().result();
        assert_eq!(result.estimates.len(), 4);
        assert!(result.estimates.iter().all(|e| !e.quality.partial));
    }

    #[test]
    fn test_live_stop_finishes_cleanly() {
        let (mut pipeline, _events, recorder) = pipeline(small_config(), FlushPolicy::Discard);
        let queue = FrameQueue::new(64);
        for frame in frames(12) {
            queue.push(frame.unwrap());
        }
        let (_pump_tx, pump_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let handle = std::thread::spawn(move || {
            let outcome = pipeline.run_live(&queue, &pump_rx, &control_rx);
            pipeline.shutdown();
            outcome
        });
        std::thread::sleep(std::time::Duration::from_millis(200));
        control_tx.send(Control::Stop).unwrap();
        handle.join().unwrap().unwrap();

        let result = recorder.lock().unwrap().result();
        assert_eq!(result.frames_processed, 12);
        assert_eq!(result.estimates.len(), 1);
    }

    #[test]
    fn test_live_source_end_drains_queue() {
        let (mut pipeline, _events, recorder) = pipeline(small_config(), FlushPolicy::Discard);
        let queue = FrameQueue::new(64);
        for frame in frames(20) {
            queue.push(frame.unwrap());
        }
        let (pump_tx, pump_rx) = crossbeam_channel::unbounded();
        let (_control_tx, control_rx) = crossbeam_channel::unbounded();
        pump_tx.send(PumpEvent::Ended).unwrap();

        pipeline.run_live(&queue, &pump_rx, &control_rx).unwrap();
        pipeline.shutdown();
        assert_eq!(recorder.lock().unwrap().result().frames_processed, 20);
    }

    #[test]
    fn test_live_slow_estimation_drops_oldest_windows() {
        let config = SessionConfig {
            window_frames: 4,
            window_stride: 4,
            crop_width: 4,
            crop_height: 4,
            detect_every: 1,
            ..SessionConfig::default()
        };
        let backend = Box::new(SlowBackend {
            delay: std::time::Duration::from_millis(100),
        });
        let (mut pipeline, _events, recorder) =
            pipeline_with(config, FlushPolicy::Discard, backend);
        let queue = FrameQueue::new(64);
        for frame in frames(40) {
            queue.push(frame.unwrap());
        }
        let (_pump_tx, pump_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let handle = std::thread::spawn(move || {
            let outcome = pipeline.run_live(&queue, &pump_rx, &control_rx);
            pipeline.shutdown();
            outcome
        });
        std::thread::sleep(std::time::Duration::from_millis(150));
        let stop_sent = Instant::now();
        control_tx.send(Control::Stop).unwrap();
        handle.join().unwrap().unwrap();

        // At most one running, two queued and two backlogged windows are
        // waited for after the stop.
        assert!(stop_sent.elapsed() < std::time::Duration::from_millis(1500));
        let result = recorder.lock().unwrap().result();
        assert_eq!(result.frames_processed, 40);
        let dropped = result
            .warnings
            .iter()
            .filter(|w| w.contains("dropped, estimation is behind"))
            .count();
        assert!(dropped >= 5, "{dropped} windows dropped");
        assert_eq!(result.estimates.len() + dropped, 10);
        let starts: Vec<usize> = result.estimates.iter().map(|e| e.window_start_index).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]), "{starts:?}");
    }

    #[test]
    fn test_file_run_never_drops_windows_behind_slow_estimation() {
        let config = SessionConfig {
            window_frames: 4,
            window_stride: 4,
            crop_width: 4,
            crop_height: 4,
            detect_every: 1,
            ..SessionConfig::default()
        };
        let backend = Box::new(SlowBackend {
            delay: std::time::Duration::from_millis(10),
        });
        let (mut pipeline, _events, recorder) =
            pipeline_with(config, FlushPolicy::Discard, backend);
        pipeline.run_file(frames(40)).unwrap();
        pipeline.shutdown();
        assert_eq!(recorder.lock().unwrap().result().estimates.len(), 10);
    }
}
