use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFlags {
    /// Estimated from a zero-padded trailing window.
    pub partial: bool,
    /// Confidence fell below the session's minimum.
    pub low_confidence: bool,
}

/// Backend output for one window.
///
/// `pulse` holds one sample per valid frame, starting at
/// `window_start_index`. `window_end_index` is inclusive and counts
/// padding, so `window_end_index - window_start_index + 1` is the
/// window length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsEstimate {
    pub window_start_index: usize,
    pub window_end_index: usize,
    pub pulse: Vec<f64>,
    pub pulse_rate_bpm: Option<f64>,
    pub respiration_rate_bpm: Option<f64>,
    pub confidence: f64,
    #[serde(default)]
    pub quality: QualityFlags,
}

impl VitalsEstimate {
    pub fn window_len(&self) -> usize {
        self.window_end_index + 1 - self.window_start_index
    }
}
