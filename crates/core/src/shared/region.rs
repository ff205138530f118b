use serde::{Deserialize, Serialize};

/// A single face detection in pixel coordinates of the decoded frame.
///
/// `(x0, y0)` is the top-left corner and `(x1, y1)` the bottom-right,
/// exclusive. Detections are correlated with frames by `frame_index`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub frame_index: usize,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    pub confidence: f64,
}

impl FaceBox {
    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).max(0.0)
    }

    /// Intersection over union with `other`; 0 for disjoint boxes.
    pub fn iou(&self, other: &FaceBox) -> f64 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        let inter = w * h;
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.width() * self.height() + other.width() * other.height() - inter)
    }

    /// `[cx, cy, half_w, half_h]`, the parameterisation used for smoothing.
    pub fn center_params(&self) -> [f64; 4] {
        [
            (self.x0 + self.x1) / 2.0,
            (self.y0 + self.y1) / 2.0,
            self.width() / 2.0,
            self.height() / 2.0,
        ]
    }

    pub fn from_center_params(frame_index: usize, params: [f64; 4], confidence: f64) -> Self {
        let [cx, cy, hw, hh] = params;
        Self {
            frame_index,
            x0: cx - hw,
            y0: cy - hh,
            x1: cx + hw,
            y1: cy + hh,
            confidence,
        }
    }

    /// Linear interpolation on coordinates; `t = 0` gives `self`.
    pub fn lerp(&self, other: &FaceBox, t: f64, frame_index: usize) -> FaceBox {
        let mix = |a: f64, b: f64| a + (b - a) * t;
        FaceBox {
            frame_index,
            x0: mix(self.x0, other.x0),
            y0: mix(self.y0, other.y0),
            x1: mix(self.x1, other.x1),
            y1: mix(self.y1, other.y1),
            confidence: mix(self.confidence, other.confidence),
        }
    }

    /// Grows the box by `padding` of its size on every side.
    pub fn expand(&self, padding: f64) -> FaceBox {
        let dx = self.width() * padding;
        let dy = self.height() * padding;
        FaceBox {
            x0: self.x0 - dx,
            y0: self.y0 - dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            ..*self
        }
    }
}

/// How a tracked region was derived for its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionSource {
    Detected,
    Interpolated,
    Held,
    Lost,
}

/// Dense per-frame crop region, always inside the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRegion {
    pub frame_index: usize,
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub source: RegionSource,
}

impl TrackedRegion {
    /// Clamps a box into a `frame_w × frame_h` frame.
    ///
    /// The result always covers at least one pixel, so degenerate or fully
    /// off-frame boxes collapse onto the nearest edge instead of vanishing.
    pub fn clamped(
        face: &FaceBox,
        frame_w: u32,
        frame_h: u32,
        frame_index: usize,
        source: RegionSource,
    ) -> Self {
        let fw = frame_w.max(1);
        let fh = frame_h.max(1);
        let clamp_axis = |lo: f64, hi: f64, limit: u32| -> (u32, u32) {
            let lo = if lo.is_finite() { lo } else { 0.0 };
            let hi = if hi.is_finite() { hi } else { limit as f64 };
            let a = lo.floor().clamp(0.0, (limit - 1) as f64) as u32;
            let b = hi.ceil().clamp(0.0, limit as f64) as u32;
            if b <= a {
                (a, a + 1)
            } else {
                (a, b)
            }
        };
        let (x0, x1) = clamp_axis(face.x0, face.x1, fw);
        let (y0, y1) = clamp_axis(face.y0, face.y1, fh);
        Self {
            frame_index,
            x0,
            y0,
            x1,
            y1,
            source,
        }
    }

    /// Whole-frame region, used when no face has ever been seen.
    pub fn full_frame(
        frame_w: u32,
        frame_h: u32,
        frame_index: usize,
        source: RegionSource,
    ) -> Self {
        Self {
            frame_index,
            x0: 0,
            y0: 0,
            x1: frame_w.max(1),
            y1: frame_h.max(1),
            source,
        }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn lost(&self) -> bool {
        self.source == RegionSource::Lost
    }

    pub fn within(&self, frame_w: u32, frame_h: u32) -> bool {
        self.x0 < self.x1 && self.y0 < self.y1 && self.x1 <= frame_w && self.y1 <= frame_h
    }
}
