use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::estimation::domain::estimation_adapter::EstimationAdapter;
use crate::estimation::domain::vitals_estimate::VitalsEstimate;
use crate::shared::error::{Result, Warning};
use crate::windowing::domain::window::Window;

/// Message from the estimation thread.
#[derive(Debug)]
pub enum EstimationMessage {
    Retried(Warning),
    Finished {
        window_start: usize,
        result: Result<VitalsEstimate>,
        elapsed_ms: f64,
    },
}

/// Runs an [`EstimationAdapter`] on its own thread, one window at a time.
///
/// Results come back in submission order. Dropping the worker cancels any
/// backoff wait and joins the thread, releasing the backend there.
pub struct EstimationWorker {
    windows: Option<Sender<Window>>,
    results: Receiver<EstimationMessage>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EstimationWorker {
    pub fn spawn(adapter: EstimationAdapter, capacity: usize, cancelled: Arc<AtomicBool>) -> Self {
        let (win_tx, win_rx) = crossbeam_channel::bounded::<Window>(capacity.max(1));
        let (res_tx, res_rx) = crossbeam_channel::unbounded::<EstimationMessage>();
        let adapter = adapter.with_cancel_flag(cancelled.clone());
        let handle = spawn_estimator(adapter, win_rx, res_tx, cancelled.clone());
        Self {
            windows: Some(win_tx),
            results: res_rx,
            cancelled,
            handle: Some(handle),
        }
    }

    /// Queues a window, blocking while the queue is full. Hands the window
    /// back if the worker has stopped.
    pub fn submit(&self, window: Window) -> std::result::Result<(), Window> {
        match &self.windows {
            Some(tx) => tx.send(window).map_err(|e| e.into_inner()),
            None => Err(window),
        }
    }

    /// Queues a window only if there is room.
    pub fn try_submit(&self, window: Window) -> std::result::Result<(), TrySendError<Window>> {
        match &self.windows {
            Some(tx) => tx.try_send(window),
            None => Err(TrySendError::Disconnected(window)),
        }
    }

    pub fn results(&self) -> &Receiver<EstimationMessage> {
        &self.results
    }

    /// Cancels, stops and joins the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.windows = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("estimation thread panicked");
            }
        }
    }
}

impl Drop for EstimationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_estimator(
    mut adapter: EstimationAdapter,
    win_rx: Receiver<Window>,
    res_tx: Sender<EstimationMessage>,
    cancelled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        log::debug!("estimation worker started ({})", adapter.backend_name());
        for window in win_rx {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }

            let started = Instant::now();
            let retry_tx = res_tx.clone();
            let result = adapter.estimate(&window, &mut |warning| {
                let _ = retry_tx.send(EstimationMessage::Retried(warning));
            });
            let message = EstimationMessage::Finished {
                window_start: window.start_index,
                result,
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            };
            // Frames of the window are released here, not by the receiver.
            drop(window);

            if res_tx.send(message).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::domain::estimation_backend::{
        Credentials, EstimationBackend, EstimationError,
    };
    use crate::estimation::domain::retry_policy::RetryPolicy;
    use crate::estimation::domain::vitals_estimate::QualityFlags;
    use crate::shared::error::VitalsError;
    use crate::shared::frame::{PixelFormat, RawFrame};
    use std::time::Duration;

    /// Fails the first call on every window starting at 0, then succeeds.
    struct FlakyBackend {
        failed_once: bool,
    }

    impl EstimationBackend for FlakyBackend {
        fn estimate(
            &mut self,
            window: &Window,
            _credentials: &Credentials,
        ) -> std::result::Result<VitalsEstimate, EstimationError> {
            if window.start_index == 0 && !self.failed_once {
                self.failed_once = true;
                return Err(EstimationError::Transient("busy".into()));
            }
            Ok(VitalsEstimate {
                window_start_index: window.start_index,
                window_end_index: window.end_index(),
                pulse: vec![1.0; window.valid_frames],
                pulse_rate_bpm: Some(60.0),
                respiration_rate_bpm: None,
                confidence: 0.9,
                quality: QualityFlags::default(),
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn window(start: usize) -> Window {
        Window {
            start_index: start,
            frames: (start..start + 2)
                .map(|i| Arc::new(RawFrame::new(vec![0; 3], 1, 1, PixelFormat::Rgb24, i, 0.0)))
                .collect(),
            stride: 2,
            valid_frames: 2,
            partial: false,
        }
    }

    fn worker() -> EstimationWorker {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            multiplier: 1.0,
            max_backoff_ms: 1,
        };
        let adapter = EstimationAdapter::new(
            Box::new(FlakyBackend { failed_once: false }),
            Credentials::default(),
            policy,
            0.3,
        );
        EstimationWorker::spawn(adapter, 2, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_results_in_submission_order_with_retry_notice() {
        let worker = worker();
        worker.submit(window(0)).unwrap();
        worker.submit(window(2)).unwrap();

        let timeout = Duration::from_secs(5);
        let first = worker.results().recv_timeout(timeout).unwrap();
        assert!(matches!(
            first,
            EstimationMessage::Retried(Warning::EstimationRetried { attempt: 1, .. })
        ));

        let starts: Vec<usize> = (0..2)
            .map(|_| match worker.results().recv_timeout(timeout).unwrap() {
                EstimationMessage::Finished {
                    window_start,
                    result,
                    ..
                } => {
                    assert!(result.is_ok());
                    window_start
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(starts, vec![0, 2]);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_windows() {
        let mut worker = worker();
        worker.shutdown();
        worker.shutdown();
        assert!(worker.submit(window(4)).is_err());
        assert!(matches!(
            worker.try_submit(window(6)),
            Err(TrySendError::Disconnected(_))
        ));
    }

    #[test]
    fn test_error_result_is_forwarded() {
        struct Rejecting;
        impl EstimationBackend for Rejecting {
            fn estimate(
                &mut self,
                _window: &Window,
                _credentials: &Credentials,
            ) -> std::result::Result<VitalsEstimate, EstimationError> {
                Err(EstimationError::Permanent("403".into()))
            }
            fn name(&self) -> &str {
                "rejecting"
            }
        }

        let adapter = EstimationAdapter::new(
            Box::new(Rejecting),
            Credentials::default(),
            RetryPolicy::default(),
            0.3,
        );
        let worker = EstimationWorker::spawn(adapter, 1, Arc::new(AtomicBool::new(false)));
        worker.submit(window(0)).unwrap();
        match worker.results().recv_timeout(Duration::from_secs(5)).unwrap() {
            EstimationMessage::Finished { result, .. } => {
                assert_eq!(result.unwrap_err(), VitalsError::PermanentEstimation("403".into()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
