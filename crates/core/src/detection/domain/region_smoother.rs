/// Smoothing parameters: [cx, cy, half_w, half_h].
pub type SmoothParams = [f64; 4];

/// EMA (Exponential Moving Average) smoother for the primary face.
///
/// Formula: `ema[t] = alpha * current + (1 - alpha) * ema[t-1]`
/// Default alpha: 0.6. An alpha of 1.0 disables smoothing.
pub struct RegionSmoother {
    alpha: f64,
    state: Option<SmoothParams>,
}

pub const DEFAULT_ALPHA: f64 = 0.6;

impl RegionSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            state: None,
        }
    }

    pub fn smooth(&mut self, params: SmoothParams) -> SmoothParams {
        let smoothed = match self.state {
            None => params,
            Some(prev) => {
                let mut result = [0.0; 4];
                for i in 0..4 {
                    result[i] = self.alpha * params[i] + (1.0 - self.alpha) * prev[i];
                }
                result
            }
        };

        self.state = Some(smoothed);
        smoothed
    }

    /// Forgets the running average; the next observation is taken as-is.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

impl Default for RegionSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_alpha() {
        assert_relative_eq!(DEFAULT_ALPHA, 0.6);
    }

    #[test]
    fn test_first_observation_returns_unchanged() {
        let mut smoother = RegionSmoother::default();
        let params = [100.0, 200.0, 50.0, 60.0];
        assert_eq!(smoother.smooth(params), params);
    }

    #[test]
    fn test_second_observation_applies_ema() {
        let mut smoother = RegionSmoother::new(0.6);
        smoother.smooth([100.0, 200.0, 50.0, 60.0]);

        let result = smoother.smooth([110.0, 210.0, 55.0, 65.0]);

        assert_relative_eq!(result[0], 0.6 * 110.0 + 0.4 * 100.0);
        assert_relative_eq!(result[1], 0.6 * 210.0 + 0.4 * 200.0);
        assert_relative_eq!(result[2], 0.6 * 55.0 + 0.4 * 50.0);
        assert_relative_eq!(result[3], 0.6 * 65.0 + 0.4 * 60.0);
    }

    #[test]
    fn test_convergence() {
        let mut smoother = RegionSmoother::new(0.6);
        let target = [500.0, 500.0, 100.0, 100.0];
        smoother.smooth([0.0, 0.0, 0.0, 0.0]);

        let mut result = [0.0; 4];
        for _ in 0..50 {
            result = smoother.smooth(target);
        }

        for i in 0..4 {
            assert_relative_eq!(result[i], target[i], epsilon = 0.01);
        }
    }

    #[test]
    fn test_alpha_one_disables_smoothing() {
        let mut smoother = RegionSmoother::new(1.0);
        smoother.smooth([100.0, 200.0, 50.0, 60.0]);

        let second = [999.0, 888.0, 777.0, 666.0];
        assert_eq!(smoother.smooth(second), second);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut smoother = RegionSmoother::new(0.5);
        smoother.smooth([0.0; 4]);
        smoother.reset();

        let params = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(smoother.smooth(params), params);
    }
}
