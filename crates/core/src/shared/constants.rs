pub const BLAZEFACE_MODEL_NAME: &str = "blazeface_short_range.onnx";

/// Frames per estimation window (~3 s at 30 fps).
pub const DEFAULT_WINDOW_FRAMES: usize = 90;
pub const DEFAULT_WINDOW_STRIDE: usize = 30;

pub const DEFAULT_CROP_SIZE: u32 = 40;

/// How long a face may go undetected before its region is declared lost.
pub const DEFAULT_MAX_HOLD_MS: u64 = 1000;

pub const DEFAULT_DETECT_EVERY: usize = 2;

/// Physiological bands used by the local estimator, in Hz.
pub const PULSE_BAND_HZ: (f64, f64) = (0.7, 3.0);
pub const RESPIRATION_BAND_HZ: (f64, f64) = (0.1, 0.5);
