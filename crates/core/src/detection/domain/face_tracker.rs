use crate::shared::region::{FaceBox, RegionSource, TrackedRegion};

use super::region_smoother::RegionSmoother;

/// Tracking parameters for one session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Fraction of the face size added on every side of the region.
    pub padding: f64,
    pub smoothing_alpha: f64,
    /// Frames a region is held without a fresh detection before it is lost.
    pub max_hold_frames: usize,
}

impl TrackerConfig {
    /// Converts a hold duration into whole frames at `fps`.
    pub fn max_hold_frames_for(max_hold_ms: u64, fps: f64) -> usize {
        (max_hold_ms as f64 * fps / 1000.0).round().max(0.0) as usize
    }
}

/// Turns sparse per-frame detections into a dense, smoothed region
/// sequence for the primary face.
///
/// Causal: a region, once returned, is never revised.
pub struct FaceTracker {
    config: TrackerConfig,
    frame_w: u32,
    frame_h: u32,
    smoother: RegionSmoother,
    /// Last smoothed (unpadded) detection and its frame.
    last: Option<FaceBox>,
    lost: bool,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig, frame_w: u32, frame_h: u32) -> Self {
        Self {
            smoother: RegionSmoother::new(config.smoothing_alpha),
            config,
            frame_w,
            frame_h,
            last: None,
            lost: false,
        }
    }

    pub fn update(&mut self, frame_index: usize, face: Option<FaceBox>) -> TrackedRegion {
        match face {
            Some(face) => self.observe(frame_index, face),
            None => self.hold(frame_index),
        }
    }

    /// Region for a frame without a detection whose next detection,
    /// `upcoming`, is already known.
    ///
    /// Interpolates between the last and the upcoming box when both lie
    /// within the hold horizon; otherwise behaves like `update(_, None)`.
    pub fn update_bridged(&mut self, frame_index: usize, upcoming: &FaceBox) -> TrackedRegion {
        let Some(last) = self.last.filter(|_| !self.lost) else {
            return self.hold(frame_index);
        };
        let gap = upcoming.frame_index.saturating_sub(last.frame_index);
        let within = last.frame_index < frame_index && frame_index < upcoming.frame_index;
        if !within || gap > self.config.max_hold_frames {
            return self.hold(frame_index);
        }

        let t = (frame_index - last.frame_index) as f64 / gap as f64;
        let bridged = last.lerp(upcoming, t, frame_index);
        self.region(&bridged, frame_index, RegionSource::Interpolated)
    }

    /// Whether the face is currently declared lost.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Drops all tracking history.
    pub fn reset(&mut self) {
        self.smoother.reset();
        self.last = None;
        self.lost = false;
    }

    fn observe(&mut self, frame_index: usize, face: FaceBox) -> TrackedRegion {
        if self.lost {
            self.smoother.reset();
            self.lost = false;
        }
        let params = self.smoother.smooth(face.center_params());
        let smoothed = FaceBox::from_center_params(frame_index, params, face.confidence);
        self.last = Some(smoothed);
        self.region(&smoothed, frame_index, RegionSource::Detected)
    }

    fn hold(&mut self, frame_index: usize) -> TrackedRegion {
        match self.last {
            Some(last)
                if !self.lost
                    && frame_index.saturating_sub(last.frame_index) <= self.config.max_hold_frames =>
            {
                self.region(&last, frame_index, RegionSource::Held)
            }
            Some(last) => {
                if !self.lost {
                    log::debug!(
                        "face lost at frame {frame_index}, last seen at {}",
                        last.frame_index
                    );
                }
                self.lost = true;
                self.region(&last, frame_index, RegionSource::Lost)
            }
            None => {
                self.lost = true;
                TrackedRegion::full_frame(self.frame_w, self.frame_h, frame_index, RegionSource::Lost)
            }
        }
    }

    fn region(&self, face: &FaceBox, frame_index: usize, source: RegionSource) -> TrackedRegion {
        TrackedRegion::clamped(
            &face.expand(self.config.padding),
            self.frame_w,
            self.frame_h,
            frame_index,
            source,
        )
    }
}
