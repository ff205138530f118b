use serde::{Serialize, Serializer};

use super::vitals_estimate::VitalsEstimate;

/// Continuous per-frame pulse trace built from overlapping estimates.
///
/// Indices never covered by a valid frame (face lost, dropped frames)
/// stay empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VitalsSeries {
    start_index: usize,
    sums: Vec<f64>,
    weights: Vec<f64>,
}

impl VitalsSeries {
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn value_at(&self, frame_index: usize) -> Option<f64> {
        let i = frame_index.checked_sub(self.start_index)?;
        let weight = *self.weights.get(i)?;
        (weight > 0.0).then(|| self.sums[i] / weight)
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.sums
            .iter()
            .zip(&self.weights)
            .map(|(s, &w)| (w > 0.0).then(|| s / w))
            .collect()
    }

    /// Grows storage so `[start, end)` is addressable.
    fn cover(&mut self, start: usize, end: usize) {
        if self.weights.is_empty() {
            self.start_index = start;
        } else if start < self.start_index {
            let shift = self.start_index - start;
            self.sums.splice(0..0, std::iter::repeat(0.0).take(shift));
            self.weights.splice(0..0, std::iter::repeat(0.0).take(shift));
            self.start_index = start;
        }
        let needed = end - self.start_index;
        if needed > self.weights.len() {
            self.sums.resize(needed, 0.0);
            self.weights.resize(needed, 0.0);
        }
    }
}

impl Serialize for VitalsSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("VitalsSeries", 2)?;
        s.serialize_field("startIndex", &self.start_index)?;
        s.serialize_field("values", &self.values())?;
        s.end()
    }
}

/// Blends window estimates into a [`VitalsSeries`] with triangular
/// weights, so overlaps cross-fade linearly.
#[derive(Debug, Default)]
pub struct SeriesReconciler {
    series: VitalsSeries,
}

impl SeriesReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, estimate: &VitalsEstimate) {
        let n = estimate.window_len();
        let valid = estimate.pulse.len().min(n);
        if valid == 0 {
            return;
        }
        let start = estimate.window_start_index;
        self.series.cover(start, start + valid);

        let center = (n as f64 - 1.0) / 2.0;
        let half = n as f64 / 2.0 + 1.0;
        let offset = start - self.series.start_index;
        for (i, &sample) in estimate.pulse[..valid].iter().enumerate() {
            if !sample.is_finite() {
                continue;
            }
            let w = 1.0 - (i as f64 - center).abs() / half;
            self.series.sums[offset + i] += w * sample;
            self.series.weights[offset + i] += w;
        }
    }

    pub fn series(&self) -> &VitalsSeries {
        &self.series
    }

    pub fn into_series(self) -> VitalsSeries {
        self.series
    }
}
