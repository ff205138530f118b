use serde::{Deserialize, Serialize};

/// Stream properties reported by a probe. Immutable once produced.
///
/// `issues` flags recoverable anomalies (missing duration, estimated
/// frame count, odd frame rate); callers decide whether to proceed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub fps: f64,
    pub total_frames: usize,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bitrate: u64,
    pub rotation: u32,
    pub issues: bool,
}

impl VideoMetadata {
    /// Frame dimensions after applying `rotation`.
    pub fn display_size(&self) -> (u32, u32) {
        if self.rotation == 90 || self.rotation == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Presentation time of frame `index`, derived from the nominal rate
    /// so timestamps are strictly increasing.
    pub fn timestamp_ms(&self, index: usize) -> f64 {
        if self.fps > 0.0 {
            index as f64 * 1000.0 / self.fps
        } else {
            0.0
        }
    }

    /// Number of whole frames covering `duration_ms` at the nominal rate.
    pub fn frames_for_ms(&self, duration_ms: u64) -> usize {
        (duration_ms as f64 * self.fps / 1000.0).round() as usize
    }
}
