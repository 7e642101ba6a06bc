//! Custom error types for the measurement engine.
//!
//! This module defines the primary error type, `MeasureError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent taxonomy for everything that can go wrong between a test-plan
//! item and the hardware:
//!
//! - **`MissingParameter` / `InvalidParameter`**: pre-flight failures raised
//!   during parameter validation, before any instrument is touched.
//! - **`InterlockViolation`**: the switching matrix reported a channel state
//!   inconsistent with what the measurement requested. The measurement never
//!   starts.
//! - **`Instrument`**: the device error register reported a nonzero code on a
//!   write/verify cycle. Carries the device code and message verbatim.
//! - **`ComplianceTripped`**: a source's protection limit engaged; the source
//!   is no longer at its commanded setpoint and the ramp must unwind.
//! - **`Timeout`**: a bounded polling loop (electrometer reads) expired.
//! - **`Protocol`**: the device answered, but not in a shape we can parse.
//!
//! Cancellation is deliberately *not* an error: a stop request produces
//! [`Outcome::Aborted`](crate::measurement::Outcome) through the normal
//! return path.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, MeasureError>;

/// Errors raised by the measurement engine and its instrument adapters.
#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("Missing required parameter: '{0}'")]
    MissingParameter(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Matrix interlock violation: {0}")]
    InterlockViolation(String),

    #[error("Instrument error {code}: {message}")]
    Instrument { code: i32, message: String },

    #[error("{0} in compliance")]
    ComplianceTripped(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MeasureError {
    /// True for the two conditions that are fatal to a running ramp and
    /// unwind directly to finalize.
    pub fn is_fatal_to_ramp(&self) -> bool {
        matches!(
            self,
            MeasureError::Instrument { .. } | MeasureError::ComplianceTripped(_)
        )
    }
}
