//! Relay matrix safety wrapper.
//!
//! A measurement never talks to the switching matrix directly; it hands its
//! channel list and body to [`with_closed_channels`], which enforces the
//! interlock discipline around it:
//!
//! 1. Any relay already closed before the run is an interlock violation;
//!    nothing is switched and `open_all` is NOT sent, leaving the device
//!    untouched for inspection.
//! 2. After closing, the relay set is read back and compared to the request
//!    (order-independent). A mismatch aborts the body and opens everything.
//! 3. `open_all` runs on every exit path once relays were switched. A body
//!    error takes precedence over an `open_all` failure, which is logged.

use std::collections::BTreeSet;
use std::future::Future;

use tracing::{debug, error};

use crate::error::{AppResult, MeasureError};
use crate::instrument::SwitchingMatrix;

fn channel_set(channels: &[String]) -> BTreeSet<&str> {
    channels.iter().map(String::as_str).collect()
}

/// Close `channels`, run `body`, and open all relays afterwards.
pub async fn with_closed_channels<M, F, Fut, T>(
    matrix: &mut M,
    channels: &[String],
    body: F,
) -> AppResult<T>
where
    M: SwitchingMatrix + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let closed = matrix.closed_channels().await?;
    if !closed.is_empty() {
        return Err(MeasureError::InterlockViolation(format!(
            "relays already closed before switching: {}",
            closed.join(", ")
        )));
    }

    matrix.close_channels(channels).await?;
    let closed = matrix.closed_channels().await?;
    if channel_set(&closed) != channel_set(channels) {
        let violation = MeasureError::InterlockViolation(format!(
            "relay readback mismatch: requested [{}], closed [{}]",
            channels.join(", "),
            closed.join(", ")
        ));
        if let Err(err) = matrix.open_all().await {
            error!(%err, "failed to open relays after readback mismatch");
        }
        return Err(violation);
    }
    debug!(channels = %channels.join(", "), "matrix channels closed");

    let result = body().await;

    match matrix.open_all().await {
        Ok(()) => result,
        Err(open_err) => match result {
            // The measurement failure is the primary fault to report.
            Err(body_err) => {
                error!(%open_err, "failed to open relays after measurement error");
                Err(body_err)
            }
            Ok(_) => Err(open_err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockSwitchingMatrix;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_closes_runs_and_opens() {
        let mut matrix = MockSwitchingMatrix::new();
        let handle = matrix.handle();
        let result =
            with_closed_channels(&mut matrix, &channels(&["1A01", "1B02"]), || async {
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        let state = handle.lock().unwrap();
        assert!(state.closed.is_empty());
        assert_eq!(state.open_all_calls, 1);
    }

    #[tokio::test]
    async fn test_preexisting_closed_relays_abort_untouched() {
        let mut matrix = MockSwitchingMatrix::new();
        let handle = matrix.handle();
        handle.lock().unwrap().closed = channels(&["2C03"]);
        let result = with_closed_channels(&mut matrix, &channels(&["1A01"]), || async {
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(MeasureError::InterlockViolation(_))));
        let state = handle.lock().unwrap();
        // No switching happened, relays left for inspection.
        assert_eq!(state.close_calls, 0);
        assert_eq!(state.open_all_calls, 0);
    }

    #[tokio::test]
    async fn test_readback_mismatch_opens_all() {
        let mut matrix = MockSwitchingMatrix::new();
        let handle = matrix.handle();
        handle.lock().unwrap().phantom_after_close = channels(&["2C03"]);
        let mut body_ran = false;
        let result = with_closed_channels(&mut matrix, &channels(&["1A01"]), || {
            body_ran = true;
            async { Ok(()) }
        })
        .await;
        assert!(matches!(result, Err(MeasureError::InterlockViolation(_))));
        assert!(!body_ran);
        assert_eq!(handle.lock().unwrap().open_all_calls, 1);
    }

    #[tokio::test]
    async fn test_readback_is_order_independent() {
        let mut matrix = MockSwitchingMatrix::new();
        // The mock appends in request order; request a permuted set.
        with_closed_channels(&mut matrix, &channels(&["1B02", "1A01"]), || async {
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_body_error_opens_all_and_wins() {
        let mut matrix = MockSwitchingMatrix::new();
        let handle = matrix.handle();
        handle.lock().unwrap().fail_open_all = true;
        let result: AppResult<()> =
            with_closed_channels(&mut matrix, &channels(&["1A01"]), || async {
                Err(MeasureError::ComplianceTripped("HV Source".to_string()))
            })
            .await;
        // open_all also failed; the body error is the one reported.
        assert!(matches!(result, Err(MeasureError::ComplianceTripped(_))));
        assert_eq!(handle.lock().unwrap().open_all_calls, 1);
    }

    #[tokio::test]
    async fn test_open_failure_after_success_surfaces() {
        let mut matrix = MockSwitchingMatrix::new();
        matrix.handle().lock().unwrap().fail_open_all = true;
        let result = with_closed_channels(&mut matrix, &channels(&["1A01"]), || async {
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(MeasureError::Instrument { .. })));
    }
}
