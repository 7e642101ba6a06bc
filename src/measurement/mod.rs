//! Ramp measurement lifecycle.
//!
//! A procedure implements [`RampProcedure`]; the [`run`] driver owns the
//! lifecycle around it: parameter validation before anything touches
//! hardware, the optional matrix interlock around the whole run, the phase
//! transitions, and the finalize-always guarantee. Finalize executes exactly
//! once per `run()` on every exit path, and a fault during the body is
//! reported to the caller only after finalize has ramped the sources down.
//!
//! Cancellation is not an error: a stop request observed at a loop boundary
//! produces [`Outcome::Aborted`] through the normal return path.

mod cv_ramp;
mod iv_ramp;
mod iv_ramp_4_wire;
mod iv_ramp_bias;
mod iv_ramp_elm;
pub mod ramp;

pub use cv_ramp::CvRamp;
pub use iv_ramp::IvRamp;
pub use iv_ramp_4_wire::IvRamp4Wire;
pub use iv_ramp_bias::IvRampBias;
pub use iv_ramp_elm::IvRampElm;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::AppResult;
use crate::instrument::SwitchingMatrix;
use crate::matrix::with_closed_channels;
use crate::params::Parameters;
use crate::process::{Event, ProcessHandle};

/// Lifecycle phase of one measurement run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeasurementPhase {
    Idle,
    Initializing,
    RampingToStart,
    Measuring,
    Analyzing,
    Finalizing,
    Done,
    Failed,
    Aborted,
}

impl fmt::Display for MeasurementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementPhase::Idle => "Idle",
            MeasurementPhase::Initializing => "Initializing",
            MeasurementPhase::RampingToStart => "Ramping to start",
            MeasurementPhase::Measuring => "Measuring",
            MeasurementPhase::Analyzing => "Analyzing",
            MeasurementPhase::Finalizing => "Finalizing",
            MeasurementPhase::Done => "Done",
            MeasurementPhase::Failed => "Failed",
            MeasurementPhase::Aborted => "Aborted",
        };
        write!(f, "{name}")
    }
}

/// How a run ended when no error was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The stop flag was observed at a loop boundary.
    Aborted,
}

/// Summary returned to the caller after finalize has completed.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Data rows appended during the measure phase.
    pub rows: usize,
    pub elapsed: Duration,
}

/// One concrete ramp procedure (IV ramp, CV ramp, ...).
///
/// The driver calls the phase hooks in order; `measure` contains the main
/// ramp loop and reports `Aborted` instead of erroring when the stop flag is
/// observed. `finalize` must be safe to call after any partially completed
/// phase, including a failed `initialize`.
#[async_trait]
pub trait RampProcedure: Send {
    /// Human-readable procedure name used in messages and logs.
    fn name(&self) -> &str;

    /// Declared parameters; validated by the driver before `initialize`.
    fn parameters(&self) -> &Parameters;

    /// Rows appended so far, for the run report.
    fn rows(&self) -> usize;

    /// Detach the switching matrix and its channel list for the interlock
    /// wrapper, when matrix switching is enabled for this procedure.
    fn take_matrix(&mut self) -> Option<(Box<dyn SwitchingMatrix>, Vec<String>)> {
        None
    }

    /// Re-attach the matrix after the run.
    fn restore_matrix(&mut self, _matrix: Box<dyn SwitchingMatrix>) {}

    /// Reset and configure every attached instrument.
    async fn initialize(&mut self, process: &ProcessHandle) -> AppResult<()>;

    /// Drive the source from its present level to the ramp start.
    async fn ramp_to_start(&mut self, process: &ProcessHandle) -> AppResult<()>;

    /// Main ramp loop; returns `Aborted` on a clean stop.
    async fn measure(&mut self, process: &ProcessHandle) -> AppResult<Outcome>;

    /// Post-measurement fits. Failures are logged by the driver and never
    /// block finalize.
    async fn analyze(&mut self, process: &ProcessHandle) -> AppResult<()> {
        let _ = process;
        Ok(())
    }

    /// Ramp every active source back to zero and disable outputs.
    async fn finalize(&mut self, process: &ProcessHandle) -> AppResult<()>;
}

fn set_phase(process: &ProcessHandle, phase: MeasurementPhase) {
    process.emit(Event::Phase(phase));
}

/// Execute all phases of one run with the finalize-always guarantee.
async fn execute<P: RampProcedure + ?Sized>(
    procedure: &mut P,
    process: &ProcessHandle,
) -> AppResult<RunReport> {
    let started = Instant::now();

    let body = async {
        set_phase(process, MeasurementPhase::Initializing);
        procedure.initialize(process).await?;
        if !process.running() {
            return Ok(Outcome::Aborted);
        }

        set_phase(process, MeasurementPhase::RampingToStart);
        procedure.ramp_to_start(process).await?;
        if !process.running() {
            return Ok(Outcome::Aborted);
        }

        set_phase(process, MeasurementPhase::Measuring);
        let outcome = procedure.measure(process).await?;

        if outcome == Outcome::Completed {
            set_phase(process, MeasurementPhase::Analyzing);
            if let Err(err) = procedure.analyze(process).await {
                warn!(procedure = procedure.name(), %err, "analysis failed");
            }
        }
        Ok(outcome)
    }
    .await;

    set_phase(process, MeasurementPhase::Finalizing);
    let finalize = procedure.finalize(process).await;

    match body {
        Err(err) => {
            // The body fault is the primary cause; a finalize failure on top
            // of it is logged but never masks it.
            if let Err(fin_err) = finalize {
                error!(procedure = procedure.name(), %fin_err, "finalize failed");
            }
            set_phase(process, MeasurementPhase::Failed);
            Err(err)
        }
        Ok(outcome) => {
            if let Err(fin_err) = finalize {
                set_phase(process, MeasurementPhase::Failed);
                return Err(fin_err);
            }
            let phase = match outcome {
                Outcome::Completed => MeasurementPhase::Done,
                Outcome::Aborted => MeasurementPhase::Aborted,
            };
            set_phase(process, phase);
            Ok(RunReport {
                outcome,
                rows: procedure.rows(),
                elapsed: started.elapsed(),
            })
        }
    }
}

/// Run one procedure to completion.
///
/// Parameter validation happens first; nothing reaches hardware when it
/// fails. When the procedure uses the switching matrix, the interlock wrapper
/// encloses every phase including finalize, so relays open only after the
/// sources are back at zero.
pub async fn run<P: RampProcedure + ?Sized>(
    procedure: &mut P,
    process: &ProcessHandle,
) -> AppResult<RunReport> {
    procedure.parameters().validate()?;
    info!(procedure = procedure.name(), "starting measurement");

    let report = match procedure.take_matrix() {
        Some((mut matrix, channels)) => {
            let result = with_closed_channels(matrix.as_mut(), &channels, || {
                execute(&mut *procedure, process)
            })
            .await;
            procedure.restore_matrix(matrix);
            result
        }
        None => execute(procedure, process).await,
    }?;

    info!(
        procedure = procedure.name(),
        outcome = ?report.outcome,
        rows = report.rows,
        "measurement finished"
    );
    Ok(report)
}
