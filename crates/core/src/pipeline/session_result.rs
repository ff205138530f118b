use serde::Serialize;

use crate::estimation::domain::reconciler::{SeriesReconciler, VitalsSeries};
use crate::estimation::domain::vitals_estimate::VitalsEstimate;
use crate::shared::error::Warning;
use crate::shared::video_metadata::VideoMetadata;

/// Everything a session produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub metadata: Option<VideoMetadata>,
    pub estimates: Vec<VitalsEstimate>,
    pub series: VitalsSeries,
    /// Confidence-weighted mean over the session's estimates.
    pub pulse_rate_bpm: Option<f64>,
    pub respiration_rate_bpm: Option<f64>,
    pub frames_processed: usize,
    pub frames_dropped: usize,
    pub warnings: Vec<String>,
}

/// Accumulates estimates and counters while a session runs.
#[derive(Default)]
pub struct SessionRecorder {
    metadata: Option<VideoMetadata>,
    estimates: Vec<VitalsEstimate>,
    reconciler: SeriesReconciler,
    frames_processed: usize,
    frames_dropped: usize,
    warnings: Vec<String>,
}

impl SessionRecorder {
    pub fn new(metadata: Option<VideoMetadata>) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn record_estimate(&mut self, estimate: &VitalsEstimate) {
        self.reconciler.add(estimate);
        self.estimates.push(estimate.clone());
    }

    pub fn record_warning(&mut self, warning: &Warning) {
        if let Warning::FramesDropped { count } = warning {
            self.frames_dropped += count;
        }
        self.warnings.push(warning.to_string());
    }

    pub fn record_frame(&mut self) {
        self.frames_processed += 1;
    }

    pub fn frames_processed(&self) -> usize {
        self.frames_processed
    }

    pub fn result(&self) -> AggregatedResult {
        AggregatedResult {
            metadata: self.metadata.clone(),
            estimates: self.estimates.clone(),
            series: self.reconciler.series().clone(),
            pulse_rate_bpm: weighted_rate(&self.estimates, |e| e.pulse_rate_bpm),
            respiration_rate_bpm: weighted_rate(&self.estimates, |e| e.respiration_rate_bpm),
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            warnings: self.warnings.clone(),
        }
    }
}

/// Confidence-weighted mean of `rate` over estimates that report one.
/// Low-confidence estimates count only when nothing better exists.
fn weighted_rate(estimates: &[VitalsEstimate], rate: impl Fn(&VitalsEstimate) -> Option<f64>) -> Option<f64> {
    let mean = |trusted_only: bool| {
        let (sum, weight) = estimates
            .iter()
            .filter(|e| !trusted_only || !e.quality.low_confidence)
            .filter_map(|e| rate(e).map(|r| (r, e.confidence.max(1e-6))))
            .fold((0.0, 0.0), |(s, w), (r, c)| (s + r * c, w + c));
        (weight > 0.0).then(|| sum / weight)
    };
    mean(true).or_else(|| mean(false))
}
