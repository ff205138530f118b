//! Deterministic pixel geometry: rotation, crop, bilinear scale and
//! pixel-format conversion on packed buffers.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::{PixelFormat, RawFrame};

use super::decode_options::{CropBox, DecodeOptions};

/// Applies rotation, then crop, then scale, then format conversion to a
/// tightly packed RGB24 buffer. Returns `(pixels, width, height)`.
pub fn apply(
    rgb: Vec<u8>,
    width: u32,
    height: u32,
    rotation: u32,
    options: &DecodeOptions,
) -> Result<(Vec<u8>, u32, u32)> {
    let img = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
        VitalsError::UnreadableMedia(format!("decoded buffer does not match {width}x{height}"))
    })?;

    let img = rotate(img, rotation);

    let img = match options.crop {
        Some(crop) => {
            let c = crop.clamp_to(img.width(), img.height())?;
            imageops::crop_imm(&img, c.x0, c.y0, c.width(), c.height()).to_image()
        }
        None => img,
    };

    let img = match options.scale {
        Some(s) if (s.width, s.height) != img.dimensions() => {
            imageops::resize(&img, s.width, s.height, FilterType::Triangle)
        }
        _ => img,
    };

    let (w, h) = img.dimensions();
    Ok((convert_rgb(img.into_raw(), options.pixel_format), w, h))
}

fn rotate(img: RgbImage, rotation: u32) -> RgbImage {
    match rotation {
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        _ => img,
    }
}

/// Converts packed RGB24 to `format`.
pub fn convert_rgb(rgb: Vec<u8>, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgb24 => rgb,
        PixelFormat::Bgr24 => {
            let mut out = rgb;
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            out
        }
        // BT.601 luma in fixed point so results are bit-exact across platforms.
        PixelFormat::Gray8 => rgb
            .chunks_exact(3)
            .map(|px| ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8)
            .collect(),
    }
}

/// Crops `region` out of `frame` and resizes it to `out_w × out_h`,
/// keeping the frame's pixel format, index and timestamp.
pub fn crop_resize(frame: &RawFrame, region: CropBox, out_w: u32, out_h: u32) -> Result<RawFrame> {
    let c = region.clamp_to(frame.width(), frame.height())?;
    let (w, h) = (frame.width(), frame.height());
    let pixels = frame.pixels().to_vec();
    let mismatch = || {
        VitalsError::InvalidDecodeOptions(format!(
            "frame {} buffer does not match {w}x{h}",
            frame.index()
        ))
    };

    let out = match frame.format() {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let img = RgbImage::from_raw(w, h, pixels).ok_or_else(mismatch)?;
            let cropped = imageops::crop_imm(&img, c.x0, c.y0, c.width(), c.height()).to_image();
            imageops::resize(&cropped, out_w, out_h, FilterType::Triangle).into_raw()
        }
        PixelFormat::Gray8 => {
            let img = GrayImage::from_raw(w, h, pixels).ok_or_else(mismatch)?;
            let cropped = imageops::crop_imm(&img, c.x0, c.y0, c.width(), c.height()).to_image();
            imageops::resize(&cropped, out_w, out_h, FilterType::Triangle).into_raw()
        }
    };

    Ok(RawFrame::new(
        out,
        out_w,
        out_h,
        frame.format(),
        frame.index(),
        frame.timestamp_ms(),
    ))
}
