use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::{PixelFormat, RawFrame};
use crate::video::domain::frame_source::FrameSource;

/// Live source fed by application code (camera callbacks, capture loops).
///
/// The paired [`FrameSender`] assigns indices and timestamps; the source
/// ends once every sender is dropped.
pub struct ChannelFrameSource {
    rx: Receiver<RawFrame>,
    fps: f64,
    width: u32,
    height: u32,
}

/// Producer half of a [`ChannelFrameSource`].
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<RawFrame>,
    next_index: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    fps: f64,
    width: u32,
    height: u32,
}

impl ChannelFrameSource {
    pub fn new(fps: f64, width: u32, height: u32, capacity: usize) -> (FrameSender, Self) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let sender = FrameSender {
            tx,
            next_index: Default::default(),
            fps,
            width,
            height,
        };
        (
            sender,
            Self {
                rx,
                fps,
                width,
                height,
            },
        )
    }
}

impl FrameSender {
    fn build(&self, pixels: Vec<u8>, format: PixelFormat) -> Result<RawFrame> {
        let expected = self.width as usize * self.height as usize * format.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(VitalsError::InvalidSource(format!(
                "frame has {} bytes, expected {expected} for {}x{} {format:?}",
                pixels.len(),
                self.width,
                self.height
            )));
        }
        let index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let timestamp_ms = if self.fps > 0.0 {
            index as f64 * 1000.0 / self.fps
        } else {
            0.0
        };
        Ok(RawFrame::new(
            pixels,
            self.width,
            self.height,
            format,
            index,
            timestamp_ms,
        ))
    }

    /// Blocks until the source has room. Fails once the source is gone.
    pub fn push(&self, pixels: Vec<u8>, format: PixelFormat) -> Result<()> {
        let frame = self.build(pixels, format)?;
        self.tx
            .send(frame)
            .map_err(|_| VitalsError::InvalidSource("frame source closed".into()))
    }

    /// Non-blocking push; returns `Ok(false)` when the source is full.
    pub fn try_push(&self, pixels: Vec<u8>, format: PixelFormat) -> Result<bool> {
        let frame = self.build(pixels, format)?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => {
                Err(VitalsError::InvalidSource("frame source closed".into()))
            }
        }
    }
}

impl FrameSource for ChannelFrameSource {
    fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        self.rx.recv().ok().map(Ok)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
