use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shared::error::{Result, VitalsError, Warning};
use crate::windowing::domain::window::Window;

use super::estimation_backend::{Credentials, EstimationBackend, EstimationError};
use super::retry_policy::RetryPolicy;
use super::vitals_estimate::VitalsEstimate;

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Wraps an [`EstimationBackend`] with the retry contract and quality
/// flagging.
pub struct EstimationAdapter {
    backend: Box<dyn EstimationBackend>,
    credentials: Credentials,
    policy: RetryPolicy,
    min_confidence: f64,
    cancelled: Arc<AtomicBool>,
}

impl EstimationAdapter {
    pub fn new(
        backend: Box<dyn EstimationBackend>,
        credentials: Credentials,
        policy: RetryPolicy,
        min_confidence: f64,
    ) -> Self {
        Self {
            backend,
            credentials,
            policy,
            min_confidence,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares the cancellation flag; setting it interrupts a backoff wait.
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Runs the backend on `window`, retrying transient failures.
    ///
    /// Each retry is reported through `on_retry` before the backoff wait.
    /// A cancelled wait ends with the last transient error.
    pub fn estimate(
        &mut self,
        window: &Window,
        on_retry: &mut dyn FnMut(Warning),
    ) -> Result<VitalsEstimate> {
        let mut attempt: u32 = 0;
        loop {
            let message = match self.backend.estimate(window, &self.credentials) {
                Ok(estimate) => return Ok(self.finish(window, estimate)),
                Err(EstimationError::Permanent(message)) => {
                    log::error!(
                        "{} rejected window {}: {message}",
                        self.backend.name(),
                        window.start_index
                    );
                    return Err(VitalsError::PermanentEstimation(message));
                }
                Err(EstimationError::Transient(message)) => message,
            };

            if attempt >= self.policy.max_retries {
                return Err(VitalsError::TransientEstimation {
                    attempts: attempt + 1,
                    message,
                });
            }

            let delay = self.policy.backoff(attempt);
            attempt += 1;
            log::warn!(
                "{} failed on window {} ({message}), retry {attempt} in {delay:?}",
                self.backend.name(),
                window.start_index
            );
            on_retry(Warning::EstimationRetried {
                attempt,
                reason: message.clone(),
            });

            if !self.wait(delay) {
                return Err(VitalsError::TransientEstimation {
                    attempts: attempt,
                    message,
                });
            }
        }
    }

    fn finish(&self, window: &Window, mut estimate: VitalsEstimate) -> VitalsEstimate {
        estimate.window_start_index = window.start_index;
        estimate.window_end_index = window.end_index();
        estimate.pulse.truncate(window.valid_frames);
        estimate.confidence = estimate.confidence.clamp(0.0, 1.0);
        estimate.quality.partial = window.partial;
        estimate.quality.low_confidence = estimate.confidence < self.min_confidence;
        estimate
    }

    /// Sleeps for `delay` unless cancelled first. Returns false on cancel.
    fn wait(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}
