//! Parametric measurement engine for semiconductor test structures.
//!
//! The crate automates voltage/current ramp measurements on probe stations:
//! it configures source-measure units, LCR meters and electrometers through
//! capability traits, executes a monotonic ramp while sampling at each step,
//! and guarantees the hardware ends in a safe zero-output state on every
//! exit path, including operator aborts and instrument faults.
//!
//! The main pieces:
//!
//! - [`measurement`]: the ramp lifecycle (initialize, ramp to start,
//!   measure, analyze, finalize) and the concrete procedures.
//! - [`instrument`]: capability traits plus SCPI/TSP adapters and mocks.
//! - [`matrix`]: the relay interlock wrapper around a measurement body.
//! - [`range`], [`estimate`], [`filter`]: ramp set-points, progress and
//!   remaining-time estimation, convergence-based sampling.
//! - [`process`]: cooperative cancellation and the event stream consumed by
//!   panels and file writers.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod estimate;
pub mod filter;
pub mod instrument;
pub mod matrix;
pub mod measurement;
pub mod params;
pub mod process;
pub mod range;

pub use error::{AppResult, MeasureError};
pub use measurement::{run, MeasurementPhase, Outcome, RampProcedure, RunReport};
pub use process::{Event, ProcessHandle};
