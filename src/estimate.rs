//! Ramp progress and remaining-time estimation.
//!
//! One [`Estimate`] is created per ramp with the total step count and
//! advanced once per completed step. Remaining time is derived from the
//! running average step duration, so it tightens as the ramp proceeds.

use std::time::{Duration, Instant};

/// Tracks completed steps against a fixed total and derives time estimates.
#[derive(Clone, Debug)]
pub struct Estimate {
    total: usize,
    completed: usize,
    start: Instant,
}

impl Estimate {
    /// Create an estimator for `total` steps, starting the clock now.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            start: Instant::now(),
        }
    }

    /// Record one completed step. Saturates at `total`.
    pub fn advance(&mut self) {
        if self.completed < self.total {
            self.completed += 1;
        }
    }

    /// `(completed, total)` pair for progress reporting.
    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.total)
    }

    /// Wall time since construction.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Projected remaining time from the average step duration so far.
    ///
    /// Zero until at least one step has completed (no average exists yet).
    pub fn remaining(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        let per_step = self.elapsed().as_secs_f64() / self.completed as f64;
        Duration::from_secs_f64(per_step * (self.total - self.completed) as f64)
    }
}

/// Render an estimate as `Elapsed H:MM:SS | Remaining H:MM:SS` for operator
/// status messages.
pub fn format_estimate(est: &Estimate) -> String {
    let fmt = |d: Duration| {
        let secs = d.as_secs();
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    };
    format!(
        "Elapsed {} | Remaining {}",
        fmt(est.elapsed()),
        fmt(est.remaining())
    )
}
