use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::detection::domain::face_detector::FaceDetector;
use crate::shared::frame::RawFrame;
use crate::shared::region::FaceBox;

/// A frame handed to the detector thread. Ownership moves with it.
pub struct DetectRequest {
    pub frame: RawFrame,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DetectOutcome {
    Face(FaceBox),
    NoFace,
    /// Inference failed on this frame; treated as "no face" by callers.
    Failed(String),
}

/// The frame handed back together with its detection result.
pub struct DetectResponse {
    pub frame: RawFrame,
    pub outcome: DetectOutcome,
}

/// Runs a [`FaceDetector`] on a dedicated thread.
///
/// Requests and responses travel over crossbeam channels; responses come
/// back in request order. Dropping the worker stops and joins the thread,
/// which drops the detector (and its model lease) there.
pub struct DetectorWorker {
    requests: Option<Sender<DetectRequest>>,
    responses: Receiver<DetectResponse>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DetectorWorker {
    /// Spawns the worker. At most `capacity` requests are queued; faces
    /// scoring below `min_confidence` are reported as [`DetectOutcome::NoFace`].
    pub fn spawn(detector: Box<dyn FaceDetector>, capacity: usize, min_confidence: f64) -> Self {
        let (req_tx, req_rx) = crossbeam_channel::bounded::<DetectRequest>(capacity.max(1));
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded::<DetectResponse>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = spawn_detector(detector, req_rx, resp_tx, cancelled.clone(), min_confidence);
        Self {
            requests: Some(req_tx),
            responses: resp_rx,
            cancelled,
            handle: Some(handle),
        }
    }

    /// Queues a frame for detection, blocking while the queue is full.
    /// Hands the frame back if the worker has stopped.
    pub fn submit(&self, frame: RawFrame) -> Result<(), RawFrame> {
        match &self.requests {
            Some(tx) => tx
                .send(DetectRequest { frame })
                .map_err(|e| e.into_inner().frame),
            None => Err(frame),
        }
    }

    pub fn responses(&self) -> &Receiver<DetectResponse> {
        &self.responses
    }

    /// Stops the thread and waits for it. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.requests = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("detector thread panicked");
            }
        }
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_detector(
    mut detector: Box<dyn FaceDetector>,
    req_rx: Receiver<DetectRequest>,
    resp_tx: Sender<DetectResponse>,
    cancelled: Arc<AtomicBool>,
    min_confidence: f64,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for DetectRequest { frame } in req_rx {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }

            let outcome = match detector.detect(&frame) {
                Ok(Some(face)) if face.confidence >= min_confidence => DetectOutcome::Face(face),
                Ok(_) => DetectOutcome::NoFace,
                Err(e) => {
                    log::debug!("detection failed on frame {}: {e}", frame.index());
                    DetectOutcome::Failed(e.to_string())
                }
            };

            if resp_tx.send(DetectResponse { frame, outcome }).is_err() {
                break;
            }
        }
    })
}
