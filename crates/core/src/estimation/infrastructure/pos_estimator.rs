use std::f64::consts::PI;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::estimation::domain::estimation_backend::{
    Credentials, EstimationBackend, EstimationError,
};
use crate::estimation::domain::vitals_estimate::{QualityFlags, VitalsEstimate};
use crate::shared::constants::{PULSE_BAND_HZ, RESPIRATION_BAND_HZ};
use crate::windowing::domain::window::Window;

/// POS sub-window length in seconds (about one cardiac cycle at 40 bpm).
const POS_WINDOW_S: f64 = 1.6;
/// Minimum FFT size; shorter traces are zero-padded for finer bins.
const MIN_FFT_LEN: usize = 1024;
/// Respiration needs at least two slow cycles in view.
const MIN_RESPIRATION_SPAN_S: f64 = 8.0;
const MIN_FRAMES: usize = 8;

/// Local backend: plane-orthogonal-to-skin projection of the mean crop
/// colour, with rates read off FFT peaks.
pub struct PosEstimator {
    fallback_fps: f64,
    planner: FftPlanner<f64>,
}

impl PosEstimator {
    pub fn new(fallback_fps: f64) -> Self {
        Self {
            fallback_fps: if fallback_fps > 0.0 { fallback_fps } else { 30.0 },
            planner: FftPlanner::new(),
        }
    }

    fn analyze(&mut self, window: &Window) -> VitalsEstimate {
        let fps = window.fps().unwrap_or(self.fallback_fps);
        let rgb = window.mean_rgb_trace();
        let mut estimate = VitalsEstimate {
            window_start_index: window.start_index,
            window_end_index: window.end_index(),
            pulse: vec![f64::NAN; rgb.len()],
            pulse_rate_bpm: None,
            respiration_rate_bpm: None,
            confidence: 0.0,
            quality: QualityFlags::default(),
        };
        if rgb.len() < MIN_FRAMES {
            log::debug!(
                "window {} has {} valid frames, skipping analysis",
                window.start_index,
                rgb.len()
            );
            return estimate;
        }

        let mut pulse = pos_projection(&rgb, fps);
        detrend(&mut pulse);
        self.band_limit(&mut pulse, fps, PULSE_BAND_HZ);
        normalize(&mut pulse);

        // Without a peak the waveform is noise; NaN samples stay out of the series.
        if let Some(peak) = self.spectral_peak(&pulse, fps, PULSE_BAND_HZ) {
            estimate.pulse_rate_bpm = Some(peak.freq_hz * 60.0);
            estimate.confidence = peak.confidence();
            estimate.pulse = pulse;
        }

        let span_s = rgb.len() as f64 / fps;
        if span_s >= MIN_RESPIRATION_SPAN_S {
            let mut intensity: Vec<f64> = rgb.iter().map(|c| (c[0] + c[1] + c[2]) / 3.0).collect();
            detrend(&mut intensity);
            normalize(&mut intensity);
            estimate.respiration_rate_bpm = self
                .spectral_peak(&intensity, fps, RESPIRATION_BAND_HZ)
                .map(|p| p.freq_hz * 60.0);
        }

        estimate
    }

    /// Zeroes every frequency bin outside `band`.
    fn band_limit(&mut self, signal: &mut [f64], fps: f64, band: (f64, f64)) {
        let n = signal.len();
        let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&s| Complex::new(s, 0.0)).collect();
        self.planner.plan_fft_forward(n).process(&mut buffer);

        let bin_hz = fps / n as f64;
        for (k, c) in buffer.iter_mut().enumerate() {
            let freq = k.min(n - k) as f64 * bin_hz;
            if freq < band.0 || freq > band.1 {
                *c = Complex::new(0.0, 0.0);
            }
        }

        self.planner.plan_fft_inverse(n).process(&mut buffer);
        for (s, c) in signal.iter_mut().zip(&buffer) {
            *s = c.re / n as f64;
        }
    }

    /// Hamming-windowed power spectrum peak inside `band`, refined by
    /// parabolic interpolation.
    fn spectral_peak(&mut self, signal: &[f64], fps: f64, band: (f64, f64)) -> Option<SpectralPeak> {
        let n = signal.len();
        if n < 2 {
            return None;
        }
        let fft_len = n.max(MIN_FFT_LEN).next_power_of_two();
        let mut buffer = vec![Complex::new(0.0, 0.0); fft_len];
        for (i, (&s, slot)) in signal.iter().zip(buffer.iter_mut()).enumerate() {
            let hamming = 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos();
            *slot = Complex::new(s * hamming, 0.0);
        }
        self.planner.plan_fft_forward(fft_len).process(&mut buffer);

        let power: Vec<f64> = buffer[..fft_len / 2].iter().map(|c| c.norm_sqr()).collect();
        let bin_hz = fps / fft_len as f64;
        let lo = (band.0 / bin_hz).ceil() as usize;
        let hi = ((band.1 / bin_hz).floor() as usize).min(power.len().saturating_sub(1));
        if lo > hi {
            return None;
        }

        let (peak_bin, &peak_power) = power[lo..=hi]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, p)| (i + lo, p))?;
        if peak_power <= 0.0 {
            return None;
        }

        let band_power: f64 = power[lo..=hi].iter().sum();
        // Peak energy counts the main lobe, not just the top bin.
        let lobe = 2 * fft_len.div_ceil(n);
        let lobe_power: f64 = power[peak_bin.saturating_sub(lobe).max(lo)..=(peak_bin + lobe).min(hi)]
            .iter()
            .sum();

        let refined = if peak_bin > 0 && peak_bin + 1 < power.len() {
            let (y_m1, y_0, y_p1) = (power[peak_bin - 1], power[peak_bin], power[peak_bin + 1]);
            let denom = y_m1 - 2.0 * y_0 + y_p1;
            let delta = if denom.abs() > 1e-12 {
                0.5 * (y_m1 - y_p1) / denom
            } else {
                0.0
            };
            if delta.is_finite() && delta.abs() <= 1.0 {
                peak_bin as f64 + delta
            } else {
                peak_bin as f64
            }
        } else {
            peak_bin as f64
        };

        Some(SpectralPeak {
            freq_hz: refined * bin_hz,
            peak_ratio: lobe_power / band_power,
        })
    }
}

impl Default for PosEstimator {
    fn default() -> Self {
        Self::new(30.0)
    }
}

impl EstimationBackend for PosEstimator {
    fn estimate(
        &mut self,
        window: &Window,
        _credentials: &Credentials,
    ) -> Result<VitalsEstimate, EstimationError> {
        Ok(self.analyze(window))
    }

    fn name(&self) -> &str {
        "pos"
    }
}

struct SpectralPeak {
    freq_hz: f64,
    /// Share of in-band power around the peak, in (0, 1].
    peak_ratio: f64,
}

impl SpectralPeak {
    /// Maps the in-band SNR (dB) onto [0, 1]: -5 dB and below is 0,
    /// 10 dB and above is 1.
    fn confidence(&self) -> f64 {
        let noise = (1.0 - self.peak_ratio).max(1e-9);
        let snr_db = 10.0 * (self.peak_ratio / noise).log10();
        ((snr_db + 5.0) / 15.0).clamp(0.0, 1.0)
    }
}

/// Overlap-added POS pulse signal over `fps * 1.6 s` sub-windows.
fn pos_projection(rgb: &[[f64; 3]], fps: f64) -> Vec<f64> {
    let n = rgb.len();
    let l = ((POS_WINDOW_S * fps).round() as usize).clamp(2, n);
    let mut h = vec![0.0; n];

    for start in 0..=(n - l) {
        let slice = &rgb[start..start + l];
        let mut mean = [0.0; 3];
        for c in slice {
            for ch in 0..3 {
                mean[ch] += c[ch] / l as f64;
            }
        }
        if mean.iter().any(|&m| m <= f64::EPSILON) {
            continue;
        }

        let (s1, s2): (Vec<f64>, Vec<f64>) = slice
            .iter()
            .map(|c| {
                let (r, g, b) = (c[0] / mean[0], c[1] / mean[1], c[2] / mean[2]);
                (g - b, -2.0 * r + g + b)
            })
            .unzip();
        let sd2 = std(&s2);
        let alpha = if sd2 > f64::EPSILON { std(&s1) / sd2 } else { 0.0 };

        let segment: Vec<f64> = s1.iter().zip(&s2).map(|(a, b)| a + alpha * b).collect();
        let seg_mean = segment.iter().sum::<f64>() / l as f64;
        for (k, v) in segment.iter().enumerate() {
            h[start + k] += v - seg_mean;
        }
    }
    h
}

/// Removes the least-squares linear trend.
fn detrend(signal: &mut [f64]) {
    let n = signal.len();
    if n < 2 {
        return;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = signal.iter().sum::<f64>() / n as f64;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, &y) in signal.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };
    for (i, y) in signal.iter_mut().enumerate() {
        *y -= y_mean + slope * (i as f64 - x_mean);
    }
}

/// Zero mean, unit variance. Flat signals become all zeros.
fn normalize(signal: &mut [f64]) {
    if signal.is_empty() {
        return;
    }
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    let sd = std(signal);
    for s in signal.iter_mut() {
        *s = if sd > 1e-12 { (*s - mean) / sd } else { 0.0 };
    }
}

fn std(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let n = signal.len() as f64;
    let mean = signal.iter().sum::<f64>() / n;
    (signal.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt()
}
