use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::RawFrame;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::decode_options::DecodeOptions;
use crate::video::domain::frame_transform;
use crate::video::domain::video_decoder::{FrameIter, MediaSource, VideoDecoder};

const DEFAULT_MAX_CONSECUTIVE_ERRORS: usize = 10;

/// Probes and decodes media via ffmpeg-next (libavformat + libavcodec).
///
/// Byte sources are spooled to a temporary file; URLs are handed to
/// libavformat as-is. Nothing is kept open between calls.
pub struct FfmpegDecoder {
    max_consecutive_errors: usize,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }

    pub fn with_max_consecutive_errors(max_consecutive_errors: usize) -> Self {
        Self {
            max_consecutive_errors,
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn unreadable(e: impl std::fmt::Display) -> VitalsError {
    VitalsError::UnreadableMedia(e.to_string())
}

/// An opened container plus the temp file backing it, if any.
struct OpenedInput {
    ictx: ffmpeg_next::format::context::Input,
    _spool: Option<NamedTempFile>,
}

fn open_input(source: &MediaSource) -> Result<OpenedInput> {
    ffmpeg_next::init().map_err(unreadable)?;

    let (path, spool): (PathBuf, Option<NamedTempFile>) = match source {
        MediaSource::Path(path) => (path.clone(), None),
        MediaSource::Url(url) => (PathBuf::from(url), None),
        MediaSource::Bytes(bytes) => {
            let mut tmp = NamedTempFile::new()?;
            tmp.write_all(bytes)?;
            tmp.flush()?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let ictx = ffmpeg_next::format::input(&path)
        .map_err(|e| unreadable(format!("{}: {e}", source.describe())))?;

    Ok(OpenedInput {
        ictx,
        _spool: spool,
    })
}

fn rational_to_f64(r: ffmpeg_next::Rational) -> Option<f64> {
    if r.numerator() > 0 && r.denominator() > 0 {
        Some(r.numerator() as f64 / r.denominator() as f64)
    } else {
        None
    }
}

fn round_fps(fps: f64) -> f64 {
    (fps * 100.0).round() / 100.0
}

/// Whether two frame rates disagree by more than 10%.
fn rates_inconsistent(a: f64, b: f64) -> bool {
    (a - b).abs() / a.max(b) > 0.1
}

impl VideoDecoder for FfmpegDecoder {
    fn probe(&self, source: &MediaSource) -> Result<VideoMetadata> {
        let input = open_input(source)?;
        let ictx = &input.ictx;

        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| unreadable("no video stream found"))?;

        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(unreadable)?;
        let decoder = codec_ctx.decoder().video().map_err(unreadable)?;

        let mut issues = false;

        let avg = rational_to_f64(stream.avg_frame_rate());
        let base = rational_to_f64(stream.rate());
        let raw_fps = avg
            .or(base)
            .ok_or_else(|| unreadable("stream reports no frame rate"))?;
        if let (Some(a), Some(b)) = (avg, base) {
            if rates_inconsistent(a, b) {
                log::warn!("average frame rate {a:.3} disagrees with base rate {b:.3}");
                issues = true;
            }
        }
        if !(1.0..=240.0).contains(&raw_fps) {
            log::warn!("non-standard frame rate {raw_fps:.3}");
            issues = true;
        }
        let fps = round_fps(raw_fps);

        let duration_s = if stream.duration() > 0 {
            Some(stream.duration() as f64 * f64::from(stream.time_base()))
        } else if ictx.duration() > 0 {
            Some(ictx.duration() as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64)
        } else {
            None
        };
        if duration_s.is_none() {
            log::warn!("container reports no duration");
            issues = true;
        }

        let total_frames = if stream.frames() > 0 {
            stream.frames() as usize
        } else {
            issues = true;
            let estimated = duration_s.map(|d| (d * fps).round() as usize).unwrap_or(0);
            log::warn!("frame count missing, estimated {estimated} from duration");
            estimated
        };

        let rotation = match extract_rotation(&stream) {
            Some(angle) => {
                if angle.rem_euclid(90) != 0 {
                    log::warn!("rotation {angle} is not a multiple of 90");
                    issues = true;
                }
                normalize_rotation(angle)
            }
            None => 0,
        };

        let metadata = VideoMetadata {
            fps,
            total_frames,
            width: decoder.width(),
            height: decoder.height(),
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            bitrate: ictx.bit_rate().max(0) as u64,
            rotation,
            issues,
        };

        if metadata.width == 0 || metadata.height == 0 {
            return Err(unreadable("video stream has zero dimensions"));
        }

        log::debug!(
            "probed {}: {}x{} @ {} fps, {} frames, codec {}",
            source.describe(),
            metadata.width,
            metadata.height,
            metadata.fps,
            metadata.total_frames,
            metadata.codec
        );

        Ok(metadata)
    }

    fn decode(
        &self,
        source: &MediaSource,
        options: &DecodeOptions,
        metadata: &VideoMetadata,
    ) -> Result<FrameIter> {
        options.validate()?;
        let (display_w, display_h) = metadata.display_size();
        options.output_size(display_w, display_h)?;

        let input = open_input(source)?;

        let stream = input
            .ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| unreadable("no video stream found"))?;
        let video_stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(unreadable)?;
        let decoder = codec_ctx.decoder().video().map_err(unreadable)?;

        let width = decoder.width();
        let height = decoder.height();

        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(unreadable)?;

        Ok(Box::new(FfmpegFrameIter {
            input,
            decoder,
            scaler,
            width,
            height,
            video_stream_index,
            options: *options,
            metadata: metadata.clone(),
            errors: ErrorBudget::new(self.max_consecutive_errors),
            frame_index: 0,
            flushing: false,
            done: false,
        }))
    }
}

/// Tolerates up to `max` consecutive frame-local failures.
#[derive(Debug)]
struct ErrorBudget {
    max: usize,
    consecutive: usize,
}

impl ErrorBudget {
    fn new(max: usize) -> Self {
        Self {
            max,
            consecutive: 0,
        }
    }

    fn succeed(&mut self) {
        self.consecutive = 0;
    }

    /// Counts a failure. Returns the run length once it exceeds `max`.
    fn fail(&mut self) -> Option<usize> {
        self.consecutive += 1;
        (self.consecutive > self.max).then_some(self.consecutive)
    }
}

/// Lazy iterator that decodes one frame at a time and owns its input.
struct FfmpegFrameIter {
    input: OpenedInput,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    video_stream_index: usize,
    options: DecodeOptions,
    metadata: VideoMetadata,
    errors: ErrorBudget,
    frame_index: usize,
    flushing: bool,
    done: bool,
}

// Safety: the iterator is moved into a single pump thread and only used
// there. The raw pointers inside ffmpeg types are never shared.
unsafe impl Send for FfmpegFrameIter {}

impl FfmpegFrameIter {
    fn try_receive(&mut self) -> Option<Result<RawFrame>> {
        loop {
            let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
            if self.decoder.receive_frame(&mut decoded).is_err() {
                return None;
            }

            match self.convert(&decoded) {
                Ok(frame) => {
                    self.errors.succeed();
                    return Some(Ok(frame));
                }
                Err(e) => {
                    if let Some(fatal) = self.record_error(&e) {
                        return Some(Err(fatal));
                    }
                }
            }
        }
    }

    fn convert(&mut self, decoded: &ffmpeg_next::util::frame::video::Video) -> Result<RawFrame> {
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(unreadable)?;

        let rgb = extract_rgb_pixels(&rgb_frame, self.width, self.height);
        let (pixels, w, h) = frame_transform::apply(
            rgb,
            self.width,
            self.height,
            self.metadata.rotation,
            &self.options,
        )?;

        let index = self.frame_index;
        self.frame_index += 1;
        Ok(RawFrame::new(
            pixels,
            w,
            h,
            self.options.pixel_format,
            index,
            self.metadata.timestamp_ms(index),
        ))
    }

    /// Counts a frame-local failure; returns the fatal error once the
    /// consecutive threshold is exceeded.
    fn record_error(&mut self, e: &dyn std::fmt::Display) -> Option<VitalsError> {
        log::warn!(
            "skipping undecodable data near frame {}: {e}",
            self.frame_index
        );
        let consecutive = self.errors.fail()?;
        self.done = true;
        Some(unreadable(format!("{consecutive} consecutive decode failures")))
    }

    fn finish(&mut self) {
        self.done = true;
        let expected = self.metadata.total_frames;
        if expected == 0 {
            return;
        }
        match self.frame_index.abs_diff(expected) {
            0 => {}
            1 => log::debug!(
                "decoded {} frames, container reported {expected}",
                self.frame_index
            ),
            _ => log::warn!(
                "decoded {} frames, container reported {expected}",
                self.frame_index
            ),
        }
    }
}

impl Iterator for FfmpegFrameIter {
    type Item = Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(result) = self.try_receive() {
            return Some(result);
        }

        if self.flushing {
            self.finish();
            return None;
        }

        loop {
            let Some((stream, packet)) = self.input.ictx.packets().next() else {
                let _ = self.decoder.send_eof();
                self.flushing = true;
                if let Some(result) = self.try_receive() {
                    return Some(result);
                }
                self.finish();
                return None;
            };

            if stream.index() != self.video_stream_index {
                continue;
            }

            if let Err(e) = self.decoder.send_packet(&packet) {
                if let Some(fatal) = self.record_error(&e) {
                    return Some(Err(fatal));
                }
                continue;
            }

            if let Some(result) = self.try_receive() {
                return Some(result);
            }
        }
    }
}

/// Reads the raw rotation angle of a video stream, in degrees.
///
/// Tries stream side data (DisplayMatrix) first, then falls back to the
/// `"rotate"` metadata tag.
fn extract_rotation(stream: &ffmpeg_next::format::stream::Stream) -> Option<i32> {
    for side_data in stream.side_data() {
        if side_data.kind() == ffmpeg_next::codec::packet::side_data::Type::DisplayMatrix {
            if let Some(angle) = parse_display_matrix(side_data.data()) {
                return Some(angle);
            }
        }
    }

    stream
        .metadata()
        .get("rotate")
        .and_then(|s| s.parse::<i32>().ok())
}

/// Parses a 3x3 display matrix (9 x i32, 16.16 fixed-point, little-endian)
/// and returns the rotation in degrees.
///
/// The matrix describes the transform needed for display, so the angle of
/// its first row vector is negated.
fn parse_display_matrix(data: &[u8]) -> Option<i32> {
    if data.len() < 36 {
        return None;
    }

    let m00 = i32::from_le_bytes(data[0..4].try_into().ok()?) as f64 / 65536.0;
    let m10 = i32::from_le_bytes(data[4..8].try_into().ok()?) as f64 / 65536.0;

    let angle_rad = m10.atan2(m00);
    Some(-angle_rad.to_degrees().round() as i32)
}

/// Snaps an angle to the nearest of 0, 90, 180 or 270.
fn normalize_rotation(angle: i32) -> u32 {
    match angle.rem_euclid(360) {
        0..=44 | 316..=359 => 0,
        45..=134 => 90,
        135..=224 => 180,
        _ => 270,
    }
}

/// Copies pixel data from an ffmpeg frame into a tightly packed RGB buffer,
/// dropping per-row stride padding.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let w = width as usize;
    let h = height as usize;

    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}

/// Writes a synthetic MPEG-4 clip whose frame `i` is a flat gray of
/// `(i * 40) % 256`. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn create_test_video(
    path: &std::path::Path,
    num_frames: usize,
    width: u32,
    height: u32,
    frame_rate: ffmpeg_next::Rational,
) {
    ffmpeg_next::init().unwrap();

    let time_base = frame_rate.invert();
    let mut octx = ffmpeg_next::format::output(path).unwrap();

    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

    let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4).unwrap();
    let mut ost = octx.add_stream(Some(codec)).unwrap();

    let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .unwrap();

    encoder_ctx.set_width(width);
    encoder_ctx.set_height(height);
    encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
    encoder_ctx.set_time_base(time_base);
    encoder_ctx.set_frame_rate(Some(frame_rate));
    encoder_ctx.set_max_b_frames(0);

    if global_header {
        encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }

    let mut encoder = encoder_ctx
        .open_with(ffmpeg_next::Dictionary::new())
        .unwrap();
    ost.set_parameters(&encoder);
    ost.set_avg_frame_rate(frame_rate);
    ost.set_rate(frame_rate);

    octx.write_header().unwrap();

    let ost_time_base = octx.stream(0).unwrap().time_base();

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        ffmpeg_next::format::Pixel::RGB24,
        width,
        height,
        ffmpeg_next::format::Pixel::YUV420P,
        width,
        height,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )
    .unwrap();

    for i in 0..num_frames {
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
        );
        let stride = rgb_frame.stride(0);
        let data = rgb_frame.data_mut(0);
        let value = ((i * 40) % 256) as u8;
        for row in 0..height as usize {
            for col in 0..width as usize {
                let offset = row * stride + col * 3;
                data[offset] = value;
                data[offset + 1] = value;
                data[offset + 2] = value;
            }
        }

        let mut yuv_frame = ffmpeg_next::util::frame::video::Video::empty();
        scaler.run(&rgb_frame, &mut yuv_frame).unwrap();
        yuv_frame.set_pts(Some(i as i64));

        encoder.send_frame(&yuv_frame).unwrap();
        write_packets(&mut encoder, &mut octx, time_base, ost_time_base);
    }

    encoder.send_eof().unwrap();
    write_packets(&mut encoder, &mut octx, time_base, ost_time_base);

    octx.write_trailer().unwrap();
}

#[cfg(test)]
fn write_packets(
    encoder: &mut ffmpeg_next::encoder::Video,
    octx: &mut ffmpeg_next::format::context::Output,
    from: ffmpeg_next::Rational,
    to: ffmpeg_next::Rational,
) {
    let mut encoded = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(0);
        encoded.rescale_ts(from, to);
        encoded.write_interleaved(octx).unwrap();
    }
}
