use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

/// Packed pixel layouts a decoded frame can carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgb24,
    Bgr24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" => Ok(PixelFormat::Rgb24),
            "bgr24" => Ok(PixelFormat::Bgr24),
            "gray8" => Ok(PixelFormat::Gray8),
            other => Err(format!("unknown pixel format '{other}'")),
        }
    }
}

/// A single decoded frame: contiguous pixels in row-major order.
///
/// Frames move between pipeline stages by value; stages that need to
/// share one (overlapping windows) wrap it in an `Arc` instead of
/// copying the pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    index: usize,
    timestamp_ms: f64,
}

impl RawFrame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        index: usize,
        timestamp_ms: f64,
    ) -> Self {
        debug_assert_eq!(
            pixels.len(),
            (width as usize) * (height as usize) * format.bytes_per_pixel(),
            "pixel length must equal width * height * bytes_per_pixel"
        );
        Self {
            pixels,
            width,
            height,
            format,
            index,
            timestamp_ms,
        }
    }

    /// All-zero frame, used to pad trailing partial windows.
    pub fn blank(
        width: u32,
        height: u32,
        format: PixelFormat,
        index: usize,
        timestamp_ms: f64,
    ) -> Self {
        let len = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self::new(vec![0u8; len], width, height, format, index, timestamp_ms)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.pixels)
            .expect("Frame data length must match dimensions")
    }

    /// Mean of each channel, reported in RGB order regardless of layout.
    /// Gray frames report the same value for all three channels.
    pub fn mean_rgb(&self) -> [f64; 3] {
        let pixel_count = (self.width as usize) * (self.height as usize);
        if pixel_count == 0 {
            return [0.0; 3];
        }
        let bpp = self.format.bytes_per_pixel();
        let mut sums = [0u64; 3];
        for px in self.pixels.chunks_exact(bpp) {
            match self.format {
                PixelFormat::Rgb24 => {
                    sums[0] += px[0] as u64;
                    sums[1] += px[1] as u64;
                    sums[2] += px[2] as u64;
                }
                PixelFormat::Bgr24 => {
                    sums[0] += px[2] as u64;
                    sums[1] += px[1] as u64;
                    sums[2] += px[0] as u64;
                }
                PixelFormat::Gray8 => {
                    sums[0] += px[0] as u64;
                    sums[1] += px[0] as u64;
                    sums[2] += px[0] as u64;
                }
            }
        }
        let n = pixel_count as f64;
        [sums[0] as f64 / n, sums[1] as f64 / n, sums[2] as f64 / n]
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.format.bytes_per_pixel(),
        )
    }
}
