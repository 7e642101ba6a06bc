//! Demo runner: executes a ramp procedure against mock instruments.
//!
//! Useful for exercising the engine end to end without hardware attached:
//!
//! ```text
//! pqc_daq --procedure iv-ramp --start 0 --stop -100 --step 10
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pqc_daq::analysis::{AnalysisFunction, AnalysisKind};
use pqc_daq::config::Settings;
use pqc_daq::instrument::mock::{
    MockElectrometer, MockEnvironmentSensor, MockLcrMeter, MockSourceMeter, MockSwitchingMatrix,
};
use pqc_daq::measurement::{CvRamp, IvRamp, IvRamp4Wire, IvRampBias, IvRampElm};
use pqc_daq::process::{Event, ProcessHandle};
use pqc_daq::{run, RampProcedure};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Procedure {
    IvRamp,
    IvRamp4Wire,
    IvRampElm,
    IvRampBias,
    CvRamp,
}

#[derive(Parser, Debug)]
#[command(name = "pqc_daq", about = "Run a ramp measurement against mock instruments")]
struct Args {
    /// Procedure to execute.
    #[arg(long, value_enum, default_value = "iv-ramp")]
    procedure: Procedure,

    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ramp start voltage in volts.
    #[arg(long, default_value_t = 0.0)]
    start: f64,

    /// Ramp stop voltage in volts.
    #[arg(long, default_value_t = -100.0)]
    stop: f64,

    /// Ramp step magnitude in volts.
    #[arg(long, default_value_t = 10.0)]
    step: f64,

    /// Settle time per step in seconds.
    #[arg(long, default_value_t = 0.1)]
    waiting_time: f64,

    /// Current compliance in amperes.
    #[arg(long, default_value_t = 1e-6)]
    compliance: f64,
}

fn consume_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<Event>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Progress(completed, total) => {
                    info!(completed, total, "progress");
                }
                Event::Message(text) => info!("{text}"),
                Event::Reading { series, x, y } => {
                    info!(series, x, y, "reading");
                }
                Event::Phase(phase) => info!(%phase, "phase"),
                Event::AppendAnalysis { key, values } => {
                    info!(key, ?values, "analysis");
                }
                Event::State(_) | Event::Update => {}
            }
        }
    });
}

async fn execute(mut procedure: impl RampProcedure, process: ProcessHandle) -> Result<()> {
    let stopper = process.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            stopper.stop();
        }
    });
    let report = run(&mut procedure, &process).await?;
    info!(outcome = ?report.outcome, rows = report.rows, elapsed = ?report.elapsed, "done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    let (process, rx) = ProcessHandle::new();
    consume_events(rx);

    let smu = || {
        let smu = MockSourceMeter::new();
        {
            let handle = smu.handle();
            let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
            state.resistance = 1e9;
            state.noise = 0.01;
        }
        Box::new(smu)
    };
    let env = Box::new(MockEnvironmentSensor::default());
    let matrix = Box::new(MockSwitchingMatrix::new());
    let channels = vec!["1A01".to_string(), "1B02".to_string()];

    match args.procedure {
        Procedure::IvRamp => {
            let mut procedure =
                IvRamp::new(smu(), env, settings.general.clone()).with_matrix(matrix);
            procedure.bind("voltage_start", args.start)?;
            procedure.bind("voltage_stop", args.stop)?;
            procedure.bind("voltage_step", args.step)?;
            procedure.bind("waiting_time", args.waiting_time)?;
            procedure.bind("hvsrc_current_compliance", args.compliance)?;
            procedure.bind("matrix_channels", channels)?;
            procedure.add_analysis(AnalysisFunction {
                kind: AnalysisKind::LinearFit,
                x: "voltage".to_string(),
                y: "current".to_string(),
            });
            execute(procedure, process).await
        }
        Procedure::IvRamp4Wire => {
            // Sources current, so the sweep flags are read in microamperes
            // against a low-ohmic mock device.
            let source = MockSourceMeter::new();
            source
                .handle()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .resistance = 100.0;
            let mut procedure = IvRamp4Wire::new(Box::new(source), env, settings.general.clone())
                .with_matrix(matrix);
            procedure.bind("current_start", args.start * 1e-6)?;
            procedure.bind("current_stop", args.stop * 1e-6)?;
            procedure.bind("current_step", args.step * 1e-6)?;
            procedure.bind("waiting_time", args.waiting_time)?;
            procedure.bind("vsrc_voltage_compliance", 20.0)?;
            procedure.bind("matrix_channels", channels)?;
            execute(procedure, process).await
        }
        Procedure::IvRampElm => {
            let elm = MockElectrometer::new();
            elm.handle()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .readings = std::collections::VecDeque::from([4.2e-12]);
            let mut procedure =
                IvRampElm::new(smu(), Box::new(elm), env, settings.general.clone())
                    .with_matrix(matrix);
            procedure.bind("voltage_start", args.start)?;
            procedure.bind("voltage_stop", args.stop)?;
            procedure.bind("voltage_step", args.step)?;
            procedure.bind("waiting_time", args.waiting_time)?;
            procedure.bind("hvsrc_current_compliance", args.compliance)?;
            procedure.bind("matrix_channels", channels)?;
            execute(procedure, process).await
        }
        Procedure::IvRampBias => {
            let mut procedure =
                IvRampBias::new(smu(), smu(), env, settings.general.clone()).with_matrix(matrix);
            procedure.bind("voltage_start", args.start)?;
            procedure.bind("voltage_stop", args.stop)?;
            procedure.bind("voltage_step", args.step)?;
            procedure.bind("waiting_time", args.waiting_time)?;
            procedure.bind("bias_voltage", -5.0)?;
            procedure.bind("vsrc_current_compliance", args.compliance)?;
            procedure.bind("hvsrc_current_compliance", args.compliance)?;
            procedure.bind("matrix_channels", channels)?;
            execute(procedure, process).await
        }
        Procedure::CvRamp => {
            let mut procedure = CvRamp::new(
                smu(),
                Box::new(MockLcrMeter::new()),
                env,
                settings.general.clone(),
                settings.filter,
            )
            .with_matrix(matrix);
            procedure.bind("bias_voltage_start", args.start)?;
            procedure.bind("bias_voltage_stop", args.stop)?;
            procedure.bind("bias_voltage_step", args.step)?;
            procedure.bind("waiting_time", args.waiting_time)?;
            procedure.bind("vsrc_current_compliance", args.compliance)?;
            procedure.bind("matrix_channels", channels)?;
            execute(procedure, process).await
        }
    }
}
