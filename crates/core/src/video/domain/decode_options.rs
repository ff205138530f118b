use serde::{Deserialize, Serialize};

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::PixelFormat;

/// Crop rectangle in pixels of the (rotated) source frame; `x1`/`y1` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl CropBox {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    /// Intersects the crop with a `frame_w × frame_h` frame.
    pub fn clamp_to(&self, frame_w: u32, frame_h: u32) -> Result<CropBox> {
        let clamped = CropBox {
            x0: self.x0.min(frame_w),
            y0: self.y0.min(frame_h),
            x1: self.x1.min(frame_w),
            y1: self.y1.min(frame_h),
        };
        if clamped.width() == 0 || clamped.height() == 0 {
            return Err(VitalsError::InvalidDecodeOptions(format!(
                "crop {self:?} does not intersect a {frame_w}x{frame_h} frame"
            )));
        }
        Ok(clamped)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSize {
    pub width: u32,
    pub height: u32,
}

/// Geometry and format applied to every decoded frame.
///
/// Order is fixed: rotate (from metadata), crop, scale, convert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecodeOptions {
    pub crop: Option<CropBox>,
    pub scale: Option<ScaleSize>,
    pub pixel_format: PixelFormat,
}

impl DecodeOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(crop) = self.crop {
            if crop.width() == 0 || crop.height() == 0 {
                return Err(VitalsError::InvalidDecodeOptions(format!(
                    "crop {crop:?} is empty"
                )));
            }
        }
        if let Some(scale) = self.scale {
            if scale.width == 0 || scale.height == 0 {
                return Err(VitalsError::InvalidDecodeOptions(format!(
                    "scale {}x{} must be non-zero",
                    scale.width, scale.height
                )));
            }
        }
        Ok(())
    }

    /// Output dimensions for a source whose rotated size is `display_w × display_h`.
    pub fn output_size(&self, display_w: u32, display_h: u32) -> Result<(u32, u32)> {
        if let Some(scale) = self.scale {
            return Ok((scale.width, scale.height));
        }
        match self.crop {
            Some(crop) => {
                let c = crop.clamp_to(display_w, display_h)?;
                Ok((c.width(), c.height()))
            }
            None => Ok((display_w, display_h)),
        }
    }
}
