//! Soft-filter sampling for noisy instrument readings.
//!
//! Instead of averaging a fixed number of readings, the soft filter keeps
//! sampling until the recent readings settle: it maintains a sliding window
//! of the last few primary values and accepts the latest reading once the
//! relative sample standard deviation drops below a threshold. This is a
//! best-effort stabilization: if the sample budget runs out the last reading
//! is returned anyway and a warning is logged, so callers always get a usable
//! value.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::warn;

use crate::error::AppResult;

/// Soft filter tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SoftFilter {
    /// Maximum number of readings before giving up on convergence.
    pub max_samples: usize,
    /// Relative threshold: accept once stddev / |mean| falls below this.
    pub threshold: f64,
    /// Number of recent primary values the criterion is computed over.
    pub window: usize,
}

impl Default for SoftFilter {
    fn default() -> Self {
        // Defaults match the LCR soft filter in the original procedures.
        Self {
            max_samples: 64,
            threshold: 0.005,
            window: 2,
        }
    }
}

/// A source of `(primary, secondary)` reading pairs the filter can sample.
#[async_trait]
pub trait PairSource: Send {
    async fn read_pair(&mut self) -> AppResult<(f64, f64)>;
}

/// Sample standard deviation over `values` divided by |mean|, evaluated
/// against `threshold`. A zero mean converges only when the deviation is
/// also zero.
pub fn std_mean_converged(values: &[f64], threshold: f64) -> bool {
    let n = values.len();
    if n < 2 {
        return false;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let sdev = var.sqrt();
    if mean == 0.0 {
        return sdev == 0.0;
    }
    sdev / mean.abs() < threshold
}

/// Repeatedly sample `source` until the primary value stabilizes or the
/// sample budget is exhausted.
///
/// Read errors propagate immediately; the filter never retries a failed read.
pub async fn acquire_filtered<S: PairSource + ?Sized>(
    source: &mut S,
    filter: SoftFilter,
) -> AppResult<(f64, f64)> {
    let window_size = filter.window.max(1);
    let mut window: VecDeque<f64> = VecDeque::with_capacity(window_size);
    let mut last = (0.0, 0.0);
    for _ in 0..filter.max_samples.max(1) {
        last = source.read_pair().await?;
        if window.len() == window_size {
            window.pop_front();
        }
        window.push_back(last.0);
        if window.len() >= window_size {
            window.make_contiguous();
            if std_mean_converged(window.as_slices().0, filter.threshold) {
                return Ok(last);
            }
        }
    }
    warn!(
        max_samples = filter.max_samples,
        "soft filter: maximum sample count reached"
    );
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::MeasureError;

    /// Serves scripted pairs; the last one repeats when exhausted.
    struct Scripted {
        calls: usize,
        readings: Vec<(f64, f64)>,
    }

    impl Scripted {
        fn new(readings: &[(f64, f64)]) -> Self {
            Self {
                calls: 0,
                readings: readings.to_vec(),
            }
        }
    }

    #[async_trait]
    impl PairSource for Scripted {
        async fn read_pair(&mut self) -> AppResult<(f64, f64)> {
            let index = self.calls.min(self.readings.len() - 1);
            self.calls += 1;
            Ok(self.readings[index])
        }
    }

    struct Failing;

    #[async_trait]
    impl PairSource for Failing {
        async fn read_pair(&mut self) -> AppResult<(f64, f64)> {
            Err(MeasureError::Instrument {
                code: 42,
                message: "bad fetch".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_constant_source_converges_at_window_fill() {
        let mut source = Scripted::new(&[(4.7e-12, 1.0e9)]);
        let filter = SoftFilter {
            max_samples: 64,
            threshold: 0.005,
            window: 3,
        };
        let (prim, sec) = acquire_filtered(&mut source, filter).await.unwrap();
        assert_eq!(prim, 4.7e-12);
        assert_eq!(sec, 1.0e9);
        // Converged on the first call where the window was full.
        assert_eq!(source.calls, 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_reading() {
        // Alternating values never converge under this threshold.
        let mut source = Scripted::new(&[
            (1.0, 0.0),
            (2.0, 0.0),
            (1.0, 0.0),
            (2.0, 0.0),
            (1.0, 0.0),
        ]);
        let filter = SoftFilter {
            max_samples: 5,
            threshold: 1e-12,
            window: 2,
        };
        let (prim, _) = acquire_filtered(&mut source, filter).await.unwrap();
        assert_eq!(source.calls, 5);
        assert_eq!(prim, 1.0);
    }

    #[tokio::test]
    async fn test_read_error_propagates_immediately() {
        let result = acquire_filtered(&mut Failing, SoftFilter::default()).await;
        assert!(matches!(result, Err(MeasureError::Instrument { code: 42, .. })));
    }

    #[test]
    fn test_zero_mean_requires_zero_deviation() {
        assert!(std_mean_converged(&[0.0, 0.0, 0.0], 0.01));
        assert!(!std_mean_converged(&[-1.0, 1.0], 0.01));
    }

    #[test]
    fn test_window_too_small_never_converges() {
        assert!(!std_mean_converged(&[1.0], 0.5));
    }
}
