//! Linear ramp set-point generator.
//!
//! A [`Range`] describes a monotonic ramp between two levels with a fixed
//! step magnitude. Direction is inferred from the bounds; the produced
//! sequence always terminates exactly on `end`, with the final partial step
//! clamped rather than overshot. The descriptor is a pure value: iterating it
//! twice yields the same sequence, which is what lets the engine re-use one
//! descriptor for ramp-up, logging and progress estimation.

use crate::error::{AppResult, MeasureError};

/// Immutable ramp descriptor: begin, end and a positive step magnitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range {
    begin: f64,
    end: f64,
    step: f64,
}

impl Range {
    /// Create a ramp descriptor.
    ///
    /// `step` is a magnitude and must be finite and > 0; the effective signed
    /// step is `+step` when `end >= begin` and `-step` otherwise.
    pub fn new(begin: f64, end: f64, step: f64) -> AppResult<Self> {
        if !step.is_finite() || step <= 0.0 {
            return Err(MeasureError::InvalidParameter(format!(
                "ramp step must be > 0, got {step}"
            )));
        }
        if !begin.is_finite() || !end.is_finite() {
            return Err(MeasureError::InvalidParameter(format!(
                "ramp bounds must be finite, got {begin}..{end}"
            )));
        }
        Ok(Self { begin, end, step })
    }

    /// First level of the ramp.
    pub fn begin(&self) -> f64 {
        self.begin
    }

    /// Last level of the ramp (always emitted exactly).
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Signed step, matching the direction from `begin` to `end`.
    pub fn step(&self) -> f64 {
        if self.end >= self.begin {
            self.step
        } else {
            -self.step
        }
    }

    /// Number of set-points the ramp produces, including both endpoints.
    ///
    /// `begin == end` counts as a single point. The relative epsilon keeps an
    /// exact multiple of the step from gaining a spurious extra point through
    /// floating point noise.
    pub fn count(&self) -> usize {
        let span = (self.end - self.begin).abs();
        if span == 0.0 {
            return 1;
        }
        let steps = (span / self.step * (1.0 - 1e-9)).ceil() as usize;
        steps + 1
    }

    /// Iterator over the set-points.
    pub fn iter(&self) -> RangeIter {
        RangeIter {
            range: *self,
            index: 0,
            count: self.count(),
        }
    }
}

impl IntoIterator for &Range {
    type Item = f64;
    type IntoIter = RangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator state for [`Range`].
#[derive(Clone, Debug)]
pub struct RangeIter {
    range: Range,
    index: usize,
    count: usize,
}

impl Iterator for RangeIter {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index >= self.count {
            return None;
        }
        let i = self.index;
        self.index += 1;
        if i + 1 == self.count {
            return Some(self.range.end);
        }
        let value = self.range.begin + self.range.step() * i as f64;
        // Clamp toward `end` so float drift can never overshoot the bound.
        if self.range.step() > 0.0 {
            Some(value.min(self.range.end))
        } else {
            Some(value.max(self.range.end))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for RangeIter {}
