//! Shared ramp segments used by every procedure.
//!
//! All source level changes go through these helpers so the stepwise rule
//! holds everywhere: a source never jumps, it walks a [`Range`] with a settle
//! delay per step. The guarded variant additionally polls compliance after
//! every step and observes the stop flag; the finalize variant does neither,
//! because ramp-down must complete even when the run is being torn down.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::{AppResult, MeasureError};
use crate::instrument::SourceMeter;
use crate::process::ProcessHandle;
use crate::range::Range;

/// How a guarded ramp segment ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentEnd {
    /// The target level was reached.
    Reached,
    /// The stop flag was observed; the source rests at the last set level.
    Stopped,
}

/// Walk the source from its present level to `target`, checking compliance
/// after every step and the stop flag before every step.
pub async fn ramp_guarded<S: SourceMeter + ?Sized>(
    source: &mut S,
    role: &str,
    target: f64,
    step: f64,
    delay: Duration,
    process: &ProcessHandle,
) -> AppResult<SegmentEnd> {
    let level = source.level().await?;
    let range = Range::new(level, target, step)?;
    debug!(role, level, target, "ramping source");
    for value in range.iter() {
        if !process.running() {
            return Ok(SegmentEnd::Stopped);
        }
        source.set_level(value).await?;
        sleep(delay).await;
        if source.compliance_tripped().await? {
            return Err(MeasureError::ComplianceTripped(role.to_string()));
        }
    }
    Ok(SegmentEnd::Reached)
}

/// Walk the source back to zero and disable its output.
///
/// Runs during finalize: no compliance poll and no cancellation point, the
/// segment always runs to completion.
pub async fn ramp_to_zero<S: SourceMeter + ?Sized>(
    source: &mut S,
    role: &str,
    step: f64,
    delay: Duration,
) -> AppResult<()> {
    let level = source.level().await?;
    debug!(role, level, "ramping source to zero");
    for value in Range::new(level, 0.0, step)?.iter() {
        source.set_level(value).await?;
        sleep(delay).await;
    }
    source.set_output_enabled(false).await?;
    Ok(())
}

/// X coordinate for reading events: plots of downward ramps use the voltage
/// magnitude so the curve still runs left to right.
pub fn reading_x(voltage: f64, signed_step: f64) -> f64 {
    if signed_step < 0.0 {
        voltage.abs()
    } else {
        voltage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockSourceMeter;
    use crate::process::ProcessHandle;

    #[tokio::test]
    async fn test_guarded_ramp_walks_stepwise() {
        let (process, _rx) = ProcessHandle::new();
        let mut smu = MockSourceMeter::new();
        let handle = smu.handle();
        ramp_guarded(&mut smu, "SMU", 10.0, 3.0, Duration::ZERO, &process)
            .await
            .unwrap();
        let state = handle.lock().unwrap();
        assert_eq!(state.levels_seen, vec![0.0, 3.0, 6.0, 9.0, 10.0]);
    }

    #[tokio::test]
    async fn test_guarded_ramp_reports_compliance() {
        let (process, _rx) = ProcessHandle::new();
        let mut smu = MockSourceMeter::new();
        smu.handle().lock().unwrap().trip_at_level = Some(6.0);
        let err = ramp_guarded(&mut smu, "HV Source", 10.0, 3.0, Duration::ZERO, &process)
            .await
            .unwrap_err();
        match err {
            MeasureError::ComplianceTripped(role) => assert_eq!(role, "HV Source"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guarded_ramp_observes_stop() {
        let (process, _rx) = ProcessHandle::new();
        process.stop();
        let mut smu = MockSourceMeter::new();
        let handle = smu.handle();
        let end = ramp_guarded(&mut smu, "SMU", 10.0, 1.0, Duration::ZERO, &process)
            .await
            .unwrap();
        assert_eq!(end, SegmentEnd::Stopped);
        // Stop was observed before the first step.
        assert!(handle.lock().unwrap().levels_seen.is_empty());
    }

    #[tokio::test]
    async fn test_ramp_to_zero_disables_output() {
        let mut smu = MockSourceMeter::new();
        let handle = smu.handle();
        {
            let mut state = handle.lock().unwrap();
            state.level = -10.0;
            state.output = true;
        }
        ramp_to_zero(&mut smu, "SMU", 4.0, Duration::ZERO).await.unwrap();
        let state = handle.lock().unwrap();
        assert_eq!(state.level, 0.0);
        assert!(!state.output);
        // Stepwise, not a single jump.
        assert_eq!(state.levels_seen, vec![-10.0, -6.0, -2.0, 0.0]);
    }

    #[test]
    fn test_reading_x_uses_magnitude_for_downward_ramps() {
        assert_eq!(reading_x(-60.0, -1.0), 60.0);
        assert_eq!(reading_x(60.0, 1.0), 60.0);
        assert_eq!(reading_x(-60.0, 1.0), -60.0);
    }
}
