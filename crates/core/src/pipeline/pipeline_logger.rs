use std::collections::BTreeMap;
use std::time::Instant;

/// Observer for pipeline progress, stage timings and metrics.
///
/// Keeps the pipeline loop free of any particular output mechanism.
pub trait PipelineLogger: Send {
    /// `total` is 0 when the frame count is unknown (live sources).
    fn progress(&mut self, current: usize, total: usize);

    /// How long a named stage took for one frame or window.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// Point-in-time value such as queue depth.
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    /// End-of-run report. Default: no-op.
    fn summary(&self) {}
}

/// Discards everything.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn progress(&mut self, _current: usize, _total: usize) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

#[derive(Default)]
struct Series {
    count: usize,
    sum: f64,
    max: f64,
}

impl Series {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.max = self.max.max(value);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Forwards to the `log` facade, throttling progress to every
/// `throttle_frames` frames, and keeps running stage statistics for the
/// summary.
pub struct LogPipelineLogger {
    throttle_frames: usize,
    timings: BTreeMap<String, Series>,
    metrics: BTreeMap<String, Series>,
    start_time: Instant,
    frames: usize,
}

impl LogPipelineLogger {
    pub fn new(throttle_frames: usize) -> Self {
        Self {
            throttle_frames: throttle_frames.max(1),
            timings: BTreeMap::new(),
            metrics: BTreeMap::new(),
            start_time: Instant::now(),
            frames: 0,
        }
    }

    /// The formatted summary, or `None` before anything was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.timings.is_empty() && self.metrics.is_empty() {
            return None;
        }

        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let mut lines = vec![format!(
            "Session summary ({} frames, {:.1}s):",
            self.frames,
            elapsed_ms / 1000.0
        )];

        for (stage, s) in &self.timings {
            lines.push(format!(
                "  {stage:10}: {:5} calls  avg {:6.1}ms  max {:6.1}ms  total {:7.0}ms",
                s.count,
                s.mean(),
                s.max,
                s.sum
            ));
        }
        for (name, s) in &self.metrics {
            lines.push(format!("  {name}: avg {:.1}  max {:.0}", s.mean(), s.max));
        }
        if self.frames > 0 && elapsed_ms > 0.0 {
            lines.push(format!(
                "  Throughput: {:.1} fps",
                self.frames as f64 / (elapsed_ms / 1000.0)
            ));
        }

        Some(lines.join("\n"))
    }

    pub fn mean_timing(&self, stage: &str) -> Option<f64> {
        self.timings.get(stage).map(Series::mean)
    }

    pub fn mean_metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).map(Series::mean)
    }
}

impl Default for LogPipelineLogger {
    fn default() -> Self {
        Self::new(30)
    }
}

impl PipelineLogger for LogPipelineLogger {
    fn progress(&mut self, current: usize, total: usize) {
        self.frames = current;
        if current % self.throttle_frames != 0 && current != total {
            return;
        }
        if total > 0 {
            let pct = current as f64 / total as f64 * 100.0;
            log::info!("Processing: {current}/{total} frames ({pct:.1}%)");
        } else {
            log::debug!("Processed {current} frames");
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .record(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics.entry(name.to_string()).or_default().record(value);
    }

    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
