use std::sync::Arc;

use crate::shared::frame::RawFrame;

/// A fixed-length run of consecutive frames handed to estimation.
///
/// Frames are shared with neighbouring windows through `Arc`, so overlap
/// costs no pixel copies. In a `partial` window only the first
/// `valid_frames` frames are real; the rest are zero padding.
#[derive(Clone, Debug)]
pub struct Window {
    pub start_index: usize,
    pub frames: Vec<Arc<RawFrame>>,
    pub stride: usize,
    pub valid_frames: usize,
    pub partial: bool,
}

impl Window {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index of the last frame (padding included).
    pub fn end_index(&self) -> usize {
        self.start_index + self.frames.len().saturating_sub(1)
    }

    pub fn valid(&self) -> &[Arc<RawFrame>] {
        &self.frames[..self.valid_frames.min(self.frames.len())]
    }

    /// Nominal frame rate recovered from valid-frame timestamps.
    pub fn fps(&self) -> Option<f64> {
        let valid = self.valid();
        let (first, last) = (valid.first()?, valid.last()?);
        let span_ms = last.timestamp_ms() - first.timestamp_ms();
        if valid.len() < 2 || span_ms <= 0.0 {
            return None;
        }
        Some((valid.len() - 1) as f64 * 1000.0 / span_ms)
    }

    /// Per-frame spatial mean colour of the valid frames, in RGB order.
    pub fn mean_rgb_trace(&self) -> Vec<[f64; 3]> {
        self.valid().iter().map(|f| f.mean_rgb()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::frame::PixelFormat;
    use approx::assert_relative_eq;

    fn window(n: usize, valid: usize) -> Window {
        Window {
            start_index: 10,
            frames: (0..n)
                .map(|i| {
                    Arc::new(RawFrame::new(
                        vec![i as u8; 3],
                        1,
                        1,
                        PixelFormat::Rgb24,
                        10 + i,
                        (10 + i) as f64 * 40.0,
                    ))
                })
                .collect(),
            stride: 2,
            valid_frames: valid,
            partial: valid < n,
        }
    }

    #[test]
    fn test_indices() {
        let w = window(4, 4);
        assert_eq!(w.len(), 4);
        assert_eq!(w.end_index(), 13);
    }

    #[test]
    fn test_fps_from_timestamps() {
        assert_relative_eq!(window(5, 5).fps().unwrap(), 25.0);
        assert!(window(5, 1).fps().is_none());
    }

    #[test]
    fn test_trace_only_covers_valid_frames() {
        let trace = window(5, 3).mean_rgb_trace();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[2], [2.0, 2.0, 2.0]);
    }
}
