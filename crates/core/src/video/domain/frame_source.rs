use crate::shared::error::Result;
use crate::shared::frame::RawFrame;

/// A live producer of frames (camera pump, decoded element, test feed).
///
/// `next_frame` blocks until a frame is available and returns `None` once
/// the source is exhausted or closed. Frames carry monotonically
/// increasing indices.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<Result<RawFrame>>;

    /// Nominal frame rate, used for hold/timing conversions.
    fn fps(&self) -> f64;

    /// Frame dimensions, `(0, 0)` when unknown.
    fn dimensions(&self) -> (u32, u32);
}
