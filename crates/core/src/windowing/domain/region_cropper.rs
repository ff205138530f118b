use crate::shared::error::Result;
use crate::shared::frame::RawFrame;
use crate::shared::region::TrackedRegion;
use crate::video::domain::decode_options::CropBox;
use crate::video::domain::frame_transform;

/// Cuts the tracked face out of a frame and resizes it to the window
/// frame size, so every window frame has the same geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionCropper {
    width: u32,
    height: u32,
}

impl RegionCropper {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn crop(&self, frame: &RawFrame, region: &TrackedRegion) -> Result<RawFrame> {
        let crop = CropBox {
            x0: region.x0,
            y0: region.y0,
            x1: region.x1,
            y1: region.y1,
        };
        frame_transform::crop_resize(frame, crop, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::frame::PixelFormat;
    use crate::shared::region::RegionSource;

    #[test]
    fn test_crop_outputs_fixed_size() {
        // Left half black, right half white.
        let mut pixels = vec![0u8; 20 * 10 * 3];
        for row in 0..10 {
            for col in 10..20 {
                let o = (row * 20 + col) * 3;
                pixels[o..o + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let frame = RawFrame::new(pixels, 20, 10, PixelFormat::Rgb24, 3, 100.0);
        let region = TrackedRegion {
            frame_index: 3,
            x0: 12,
            y0: 2,
            x1: 18,
            y1: 8,
            source: RegionSource::Detected,
        };

        let out = RegionCropper::new(4, 4).crop(&frame, &region).unwrap();
        assert_eq!((out.width(), out.height()), (4, 4));
        assert_eq!(out.index(), 3);
        assert_eq!(out.mean_rgb(), [255.0, 255.0, 255.0]);
    }
}
