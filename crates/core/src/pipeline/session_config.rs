use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::detection::domain::face_tracker::TrackerConfig;
use crate::detection::domain::region_smoother::DEFAULT_ALPHA;
use crate::estimation::domain::retry_policy::RetryPolicy;
use crate::shared::constants::{
    DEFAULT_CROP_SIZE, DEFAULT_DETECT_EVERY, DEFAULT_MAX_HOLD_MS, DEFAULT_WINDOW_FRAMES,
    DEFAULT_WINDOW_STRIDE,
};
use crate::shared::error::{Result, VitalsError};
use crate::video::domain::decode_options::DecodeOptions;
use crate::windowing::domain::window_buffer::FlushPolicy;

/// What happens when the tracked face is lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceLostPolicy {
    /// Warn, flush the window buffer and wait for the face to return.
    #[default]
    Pause,
    /// End the session with a fatal `FaceLost` error.
    Fail,
}

/// Every tunable of a session. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub window_frames: usize,
    pub window_stride: usize,
    pub crop_width: u32,
    pub crop_height: u32,
    pub padding: f64,
    pub smoothing_alpha: f64,
    pub detect_every: usize,
    pub detection_confidence: f64,
    pub max_hold_ms: u64,
    pub face_lost_policy: FaceLostPolicy,
    pub live_flush_policy: FlushPolicy,
    pub file_flush_policy: FlushPolicy,
    pub max_queued_frames: usize,
    pub max_in_flight_detections: usize,
    pub max_consecutive_decode_errors: usize,
    pub max_consecutive_detector_failures: usize,
    pub retry: RetryPolicy,
    pub min_confidence: f64,
    pub decode: DecodeOptions,
    pub realtime_playback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_frames: DEFAULT_WINDOW_FRAMES,
            window_stride: DEFAULT_WINDOW_STRIDE,
            crop_width: DEFAULT_CROP_SIZE,
            crop_height: DEFAULT_CROP_SIZE,
            padding: 0.1,
            smoothing_alpha: DEFAULT_ALPHA,
            detect_every: DEFAULT_DETECT_EVERY,
            detection_confidence: 0.5,
            max_hold_ms: DEFAULT_MAX_HOLD_MS,
            face_lost_policy: FaceLostPolicy::Pause,
            live_flush_policy: FlushPolicy::Discard,
            file_flush_policy: FlushPolicy::PadAndFlag,
            max_queued_frames: 8,
            max_in_flight_detections: 4,
            max_consecutive_decode_errors: 10,
            max_consecutive_detector_failures: 30,
            retry: RetryPolicy::default(),
            min_confidence: 0.3,
            decode: DecodeOptions::default(),
            realtime_playback: true,
        }
    }
}

impl SessionConfig {
    /// `<config dir>/Vitals/session.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Vitals").join("session.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&json)
            .map_err(|e| VitalsError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at [`default_path`](Self::default_path) when it
    /// exists, defaults otherwise.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(VitalsError::InvalidConfig(msg));

        if self.window_frames == 0 {
            return fail("window_frames must be at least 1".into());
        }
        if self.window_stride == 0 || self.window_stride > self.window_frames {
            return fail(format!(
                "window_stride must be within 1..={}",
                self.window_frames
            ));
        }
        if self.crop_width == 0 || self.crop_height == 0 {
            return fail("crop size must be non-zero".into());
        }
        if !(self.padding.is_finite() && self.padding >= 0.0) {
            return fail(format!("padding {} must be >= 0", self.padding));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return fail(format!(
                "smoothing_alpha {} must be within (0, 1]",
                self.smoothing_alpha
            ));
        }
        if self.detect_every == 0 {
            return fail("detect_every must be at least 1".into());
        }
        for (name, value) in [
            ("detection_confidence", self.detection_confidence),
            ("min_confidence", self.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} {value} must be within [0, 1]"));
            }
        }
        if self.max_queued_frames == 0 || self.max_in_flight_detections == 0 {
            return fail("queue bounds must be at least 1".into());
        }
        if self.retry.multiplier < 1.0 {
            return fail(format!(
                "retry multiplier {} must be >= 1",
                self.retry.multiplier
            ));
        }
        self.decode.validate()
    }

    pub fn tracker_config(&self, fps: f64) -> TrackerConfig {
        TrackerConfig {
            padding: self.padding,
            smoothing_alpha: self.smoothing_alpha,
            max_hold_frames: TrackerConfig::max_hold_frames_for(self.max_hold_ms, fps),
        }
    }
}
