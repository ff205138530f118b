use std::time::{Duration, Instant};

use crate::shared::error::Result;
use crate::shared::frame::RawFrame;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::decode_options::DecodeOptions;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::video_decoder::{FrameIter, MediaSource, VideoDecoder};

const RESYNC_AFTER: Duration = Duration::from_millis(250);

/// Plays decoded media as a live source, optionally paced at the
/// media's own frame rate.
pub struct DecodedFrameSource {
    frames: FrameIter,
    metadata: VideoMetadata,
    dimensions: (u32, u32),
    realtime: bool,
    /// Wall-clock instant and media timestamp of the last paced frame.
    clock: Option<(Instant, f64)>,
}

impl DecodedFrameSource {
    pub fn open(
        decoder: &dyn VideoDecoder,
        source: &MediaSource,
        options: &DecodeOptions,
        realtime: bool,
    ) -> Result<Self> {
        let metadata = decoder.probe(source)?;
        let (display_w, display_h) = metadata.display_size();
        let dimensions = options.output_size(display_w, display_h)?;
        let frames = decoder.decode(source, options, &metadata)?;
        Ok(Self {
            frames,
            metadata,
            dimensions,
            realtime,
            clock: None,
        })
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    /// Sleeps until `timestamp_ms` is due relative to the previous frame.
    /// After a stall longer than [`RESYNC_AFTER`] (a paused consumer) the
    /// clock restarts instead of bursting to catch up.
    fn pace(&mut self, timestamp_ms: f64) {
        let now = Instant::now();
        let Some((at, prev_ms)) = self.clock else {
            self.clock = Some((now, timestamp_ms));
            return;
        };
        let due = at + Duration::from_secs_f64((timestamp_ms - prev_ms).max(0.0) / 1000.0);
        if due > now {
            std::thread::sleep(due - now);
            self.clock = Some((due, timestamp_ms));
        } else if now - due > RESYNC_AFTER {
            self.clock = Some((now, timestamp_ms));
        } else {
            self.clock = Some((due, timestamp_ms));
        }
    }
}

impl FrameSource for DecodedFrameSource {
    fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        let item = self.frames.next()?;
        if self.realtime {
            if let Ok(frame) = &item {
                self.pace(frame.timestamp_ms());
            }
        }
        Some(item)
    }

    fn fps(&self) -> f64 {
        self.metadata.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}
