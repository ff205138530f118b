use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::RawFrame;

use super::window::Window;

/// What to do with an incomplete trailing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    #[default]
    Discard,
    /// Zero-pad to full length and mark the window `partial`.
    PadAndFlag,
}

/// Accumulates consecutive frames into overlapping windows of `length`
/// frames, emitting one every `stride` frames.
///
/// Holds at most `length` frames. A frame whose index does not follow
/// the previous one restarts accumulation.
pub struct FrameWindowBuffer {
    length: usize,
    stride: usize,
    frames: VecDeque<Arc<RawFrame>>,
    /// Frames pushed since the last emitted window.
    fresh: usize,
}

impl FrameWindowBuffer {
    pub fn new(length: usize, stride: usize) -> Result<Self> {
        if length == 0 || stride == 0 || stride > length {
            return Err(VitalsError::InvalidConfig(format!(
                "window stride {stride} must be within 1..={length}"
            )));
        }
        Ok(Self {
            length,
            stride,
            frames: VecDeque::with_capacity(length),
            fresh: 0,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: RawFrame) -> Option<Window> {
        if let Some(last) = self.frames.back() {
            if frame.index() != last.index() + 1 {
                log::debug!(
                    "frame gap {} -> {}, restarting window",
                    last.index(),
                    frame.index()
                );
                self.reset();
            }
        }

        self.frames.push_back(Arc::new(frame));
        self.fresh += 1;

        if self.frames.len() < self.length {
            return None;
        }

        let window = Window {
            start_index: self.frames[0].index(),
            frames: self.frames.iter().cloned().collect(),
            stride: self.stride,
            valid_frames: self.length,
            partial: false,
        };
        self.frames.drain(..self.stride);
        self.fresh = 0;
        Some(window)
    }

    /// Ends accumulation. Under [`FlushPolicy::PadAndFlag`] a tail holding
    /// frames not yet covered by any window is padded and returned.
    pub fn flush(&mut self, policy: FlushPolicy) -> Option<Window> {
        let has_fresh = self.fresh > 0 && !self.frames.is_empty();
        let window = match policy {
            FlushPolicy::PadAndFlag if has_fresh => Some(self.padded_tail()),
            _ => {
                if has_fresh {
                    log::debug!("discarding {} unwindowed frames", self.fresh);
                }
                None
            }
        };
        self.reset();
        window
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.fresh = 0;
    }

    fn padded_tail(&self) -> Window {
        let mut frames: Vec<Arc<RawFrame>> = self.frames.iter().cloned().collect();
        let valid_frames = frames.len();
        let (first, last) = (&self.frames[0], &self.frames[valid_frames - 1]);
        let frame_ms = if valid_frames > 1 {
            (last.timestamp_ms() - first.timestamp_ms()) / (valid_frames - 1) as f64
        } else {
            0.0
        };

        for k in 1..=(self.length - valid_frames) {
            frames.push(Arc::new(RawFrame::blank(
                last.width(),
                last.height(),
                last.format(),
                last.index() + k,
                last.timestamp_ms() + frame_ms * k as f64,
            )));
        }

        Window {
            start_index: first.index(),
            frames,
            stride: self.stride,
            valid_frames,
            partial: true,
        }
    }
}
