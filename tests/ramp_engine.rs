//! End-to-end engine tests against mock instruments: the finalize-always
//! guarantee, cooperative cancellation, compliance unwinding and the matrix
//! interlock around a whole run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pqc_daq::analysis::{AnalysisFunction, AnalysisKind};
use pqc_daq::config::{FilterConfig, GeneralConfig};
use pqc_daq::instrument::mock::{
    MockElectrometer, MockEnvironmentSensor, MockLcrMeter, MockSourceMeter,
    MockSwitchingMatrix, SourceMeterState, SwitchingMatrixState,
};
use pqc_daq::instrument::SourceFunction;
use pqc_daq::measurement::{CvRamp, IvRamp, IvRamp4Wire, IvRampBias, IvRampElm};
use pqc_daq::process::{Event, ProcessHandle};
use pqc_daq::{run, MeasureError, MeasurementPhase, Outcome};

fn fast_general() -> GeneralConfig {
    GeneralConfig {
        quick_ramp_delay: std::time::Duration::ZERO,
        ..GeneralConfig::default()
    }
}

struct IvFixture {
    procedure: IvRamp,
    smu: Arc<Mutex<SourceMeterState>>,
}

fn iv_fixture(stop: f64, step: f64) -> IvFixture {
    let smu = MockSourceMeter::new();
    let handle = smu.handle();
    handle.lock().unwrap().resistance = 1e9;
    let mut procedure = IvRamp::new(
        Box::new(smu),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    procedure.bind("voltage_start", 0.0).unwrap();
    procedure.bind("voltage_stop", stop).unwrap();
    procedure.bind("voltage_step", step).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("hvsrc_current_compliance", 1e-6).unwrap();
    IvFixture {
        procedure,
        smu: handle,
    }
}

fn drain_phases(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<MeasurementPhase> {
    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Phase(phase) = event {
            phases.push(phase);
        }
    }
    phases
}

#[tokio::test]
async fn test_completed_run_produces_all_rows() {
    let IvFixture { mut procedure, smu } = iv_fixture(-30.0, 10.0);
    procedure.add_analysis(AnalysisFunction {
        kind: AnalysisKind::LinearFit,
        x: "voltage".to_string(),
        y: "current".to_string(),
    });
    let (process, mut rx) = ProcessHandle::new();

    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    // 0, -10, -20, -30
    assert_eq!(report.rows, 4);
    assert_eq!(procedure.store().series("voltage"), &[0.0, -10.0, -20.0, -30.0]);
    assert_eq!(procedure.store().series("current").len(), 4);

    // Finalize left the hardware safe.
    let state = smu.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
    drop(state);

    let phases = drain_phases(&mut rx);
    assert_eq!(phases.first(), Some(&MeasurementPhase::Initializing));
    assert_eq!(phases.last(), Some(&MeasurementPhase::Done));
    assert_eq!(
        phases
            .iter()
            .filter(|p| **p == MeasurementPhase::Finalizing)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_analysis_results_are_emitted() {
    let IvFixture { mut procedure, .. } = iv_fixture(-30.0, 10.0);
    procedure.add_analysis(AnalysisFunction {
        kind: AnalysisKind::LinearFit,
        x: "voltage".to_string(),
        y: "current".to_string(),
    });
    let (process, mut rx) = ProcessHandle::new();
    run(&mut procedure, &process).await.unwrap();

    let mut slope = None;
    while let Ok(event) = rx.try_recv() {
        if let Event::AppendAnalysis { key, values } = event {
            assert_eq!(key, "linear_fit");
            slope = values.iter().find(|(n, _)| n == "a").map(|(_, v)| *v);
        }
    }
    // Mock device is a 1 GOhm resistor, so dI/dV = 1e-9.
    let slope = slope.expect("no analysis event");
    assert!((slope - 1e-9).abs() < 1e-15, "slope {slope}");
}

#[tokio::test]
async fn test_instrument_fault_still_finalizes_with_ramp_down() {
    let IvFixture { mut procedure, smu } = iv_fixture(-30.0, 5.0);
    // Calls 1..2 are initialize and ramp-to-start; the measure loop starts
    // at call 3, so call 5 fails on its third iteration with the source
    // resting at -5 V.
    smu.lock().unwrap().fail_set_level_at = Some(5);
    let (process, mut rx) = ProcessHandle::new();

    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::Instrument { code: -330, .. }));

    let state = smu.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
    // The ramp-down walked stepwise from -5 V, not a single jump to zero.
    let n = state.levels_seen.len();
    assert_eq!(&state.levels_seen[n - 2..], &[-5.0, 0.0]);
    drop(state);

    let phases = drain_phases(&mut rx);
    assert_eq!(
        phases
            .iter()
            .filter(|p| **p == MeasurementPhase::Finalizing)
            .count(),
        1
    );
    assert_eq!(phases.last(), Some(&MeasurementPhase::Failed));
}

#[tokio::test]
async fn test_compliance_trip_unwinds_to_finalize() {
    let IvFixture { mut procedure, smu } = iv_fixture(-100.0, 10.0);
    smu.lock().unwrap().trip_at_level = Some(30.0);
    let (process, mut rx) = ProcessHandle::new();

    let err = run(&mut procedure, &process).await.unwrap_err();
    match err {
        MeasureError::ComplianceTripped(role) => assert_eq!(role, "HV Source"),
        other => panic!("unexpected: {other:?}"),
    }

    let state = smu.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
    drop(state);
    assert_eq!(drain_phases(&mut rx).last(), Some(&MeasurementPhase::Failed));
}

#[tokio::test]
async fn test_stop_mid_ramp_aborts_cleanly() {
    let smu = MockSourceMeter::new();
    let handle = smu.handle();
    let mut procedure = IvRamp::new(
        Box::new(smu),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    procedure.bind("voltage_start", 0.0).unwrap();
    procedure.bind("voltage_stop", -100.0).unwrap();
    procedure.bind("voltage_step", 1.0).unwrap();
    procedure.bind("waiting_time", 0.01).unwrap();
    procedure.bind("hvsrc_current_compliance", 1e-6).unwrap();

    let (process, mut rx) = ProcessHandle::new();
    let controller = process.clone();
    let worker = tokio::spawn(async move {
        let report = run(&mut procedure, &process).await;
        (report, procedure)
    });

    // Stop after the first reading arrives.
    loop {
        match rx.recv().await {
            Some(Event::Reading { .. }) => break,
            Some(_) => continue,
            None => panic!("event stream ended early"),
        }
    }
    controller.stop();

    let (report, procedure) = worker.await.unwrap();
    let report = report.unwrap();
    assert_eq!(report.outcome, Outcome::Aborted);
    // Exited within one iteration of the stop request.
    assert!(procedure.store().row_count() < 10);

    let state = handle.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
}

struct MatrixFixture {
    procedure: IvRamp,
    smu: Arc<Mutex<SourceMeterState>>,
    matrix: Arc<Mutex<SwitchingMatrixState>>,
}

fn matrix_fixture() -> MatrixFixture {
    let matrix = MockSwitchingMatrix::new();
    let matrix_handle = matrix.handle();
    let IvFixture { procedure, smu } = iv_fixture(-20.0, 10.0);
    let mut procedure = procedure.with_matrix(Box::new(matrix));
    procedure
        .bind("matrix_channels", vec!["1A01".to_string(), "1B02".to_string()])
        .unwrap();
    MatrixFixture {
        procedure,
        smu,
        matrix: matrix_handle,
    }
}

#[tokio::test]
async fn test_matrix_run_opens_relays_after_completion() {
    let MatrixFixture {
        mut procedure,
        matrix,
        ..
    } = matrix_fixture();
    let (process, _rx) = ProcessHandle::new();
    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    let state = matrix.lock().unwrap();
    assert!(state.closed.is_empty());
    assert_eq!(state.open_all_calls, 1);
}

#[tokio::test]
async fn test_stale_relays_block_the_run_entirely() {
    let MatrixFixture {
        mut procedure,
        smu,
        matrix,
    } = matrix_fixture();
    matrix.lock().unwrap().closed = vec!["2C03".to_string()];
    let (process, _rx) = ProcessHandle::new();

    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::InterlockViolation(_)));
    // No instrument was driven and the stale relays were left untouched.
    assert!(smu.lock().unwrap().levels_seen.is_empty());
    let state = matrix.lock().unwrap();
    assert_eq!(state.open_all_calls, 0);
    assert_eq!(state.closed, ["2C03"]);
}

#[tokio::test]
async fn test_relay_readback_mismatch_opens_all() {
    let MatrixFixture {
        mut procedure,
        smu,
        matrix,
    } = matrix_fixture();
    matrix.lock().unwrap().phantom_after_close = vec!["2C03".to_string()];
    let (process, _rx) = ProcessHandle::new();

    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::InterlockViolation(_)));
    assert!(smu.lock().unwrap().levels_seen.is_empty());
    let state = matrix.lock().unwrap();
    assert_eq!(state.open_all_calls, 1);
    assert!(state.closed.is_empty());
}

#[tokio::test]
async fn test_cv_ramp_records_capacitance_pair() {
    let vsrc = MockSourceMeter::new();
    let lcr = MockLcrMeter::new();
    let mut procedure = CvRamp::new(
        Box::new(vsrc),
        Box::new(lcr),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
        FilterConfig::default(),
    );
    procedure.bind("bias_voltage_start", 0.0).unwrap();
    procedure.bind("bias_voltage_stop", -8.0).unwrap();
    procedure.bind("bias_voltage_step", 2.0).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("vsrc_current_compliance", 25e-6).unwrap();
    procedure.bind("lcr_soft_filter", false).unwrap();

    let (process, _rx) = ProcessHandle::new();
    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.rows, 5);

    let capacitance = procedure.store().series("capacitance");
    let capacitance2 = procedure.store().series("capacitance2");
    assert_eq!(capacitance.len(), 5);
    for (c, c2) in capacitance.iter().zip(capacitance2) {
        assert!((c2 - 1.0 / (c * c)).abs() < 1e-3 * c2.abs());
    }
}

#[tokio::test]
async fn test_current_ramp_measures_voltage_four_wire() {
    let smu = MockSourceMeter::new();
    let handle = smu.handle();
    handle.lock().unwrap().resistance = 100.0;
    let mut procedure = IvRamp4Wire::new(
        Box::new(smu),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    procedure.bind("current_start", 0.0).unwrap();
    procedure.bind("current_stop", 1e-5).unwrap();
    procedure.bind("current_step", 2.5e-6).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("vsrc_voltage_compliance", 10.0).unwrap();

    let (process, _rx) = ProcessHandle::new();
    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.rows, 5);

    let state = handle.lock().unwrap();
    assert_eq!(state.function, SourceFunction::Current);
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
    drop(state);

    // 100 Ohm device: V = 100 * I at every step.
    let current = procedure.store().series("current");
    let voltage = procedure.store().series("voltage_vsrc");
    assert_eq!(current.first(), Some(&0.0));
    assert_eq!(current.last(), Some(&1e-5));
    for (n, i) in current.iter().enumerate() {
        assert!((i - n as f64 * 2.5e-6).abs() < 1e-15, "point {n}: {i}");
    }
    for (i, v) in current.iter().zip(voltage) {
        assert!((v - 100.0 * i).abs() < 1e-12);
    }
}

struct BiasFixture {
    procedure: IvRampBias,
    vsrc: Arc<Mutex<SourceMeterState>>,
    hvsrc: Arc<Mutex<SourceMeterState>>,
}

fn bias_fixture(stop: f64, step: f64, bias: f64) -> BiasFixture {
    let vsrc = MockSourceMeter::new();
    let hvsrc = MockSourceMeter::new();
    let vsrc_handle = vsrc.handle();
    let hvsrc_handle = hvsrc.handle();
    let mut procedure = IvRampBias::new(
        Box::new(vsrc),
        Box::new(hvsrc),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    procedure.bind("voltage_start", 0.0).unwrap();
    procedure.bind("voltage_stop", stop).unwrap();
    procedure.bind("voltage_step", step).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("bias_voltage", bias).unwrap();
    procedure.bind("vsrc_current_compliance", 1e-6).unwrap();
    procedure.bind("hvsrc_current_compliance", 1e-6).unwrap();
    BiasFixture {
        procedure,
        vsrc: vsrc_handle,
        hvsrc: hvsrc_handle,
    }
}

#[tokio::test]
async fn test_bias_source_comes_down_when_sweep_ramp_down_fails() {
    let BiasFixture {
        mut procedure,
        vsrc,
        hvsrc,
    } = bias_fixture(-20.0, 10.0, -5.0);
    // Sweep source set_level calls: 1 initialize, 2 ramp-to-start, 3..=5 the
    // measure loop; call 7 fails midway through the finalize ramp-down.
    vsrc.lock().unwrap().fail_set_level_at = Some(7);
    let (process, mut rx) = ProcessHandle::new();

    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::Instrument { code: -330, .. }));

    // The sweep source is stranded, but the bias still walked to zero in
    // 1 V steps and its output is off.
    assert!(vsrc.lock().unwrap().output);
    let state = hvsrc.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
    let n = state.levels_seen.len();
    assert_eq!(&state.levels_seen[n - 3..], &[-2.0, -1.0, 0.0]);
    drop(state);

    assert_eq!(drain_phases(&mut rx).last(), Some(&MeasurementPhase::Failed));
}

#[tokio::test]
async fn test_offset_bias_tracks_the_sweep() {
    let BiasFixture {
        mut procedure,
        hvsrc,
        ..
    } = bias_fixture(-20.0, 10.0, -5.0);
    procedure.bind("bias_mode", "offset").unwrap();
    let (process, _rx) = ProcessHandle::new();

    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    // Each sweep step shifts the bias by the signed sweep step.
    assert_eq!(
        procedure.store().series("bias_voltage"),
        &[-15.0, -25.0, -35.0]
    );

    let state = hvsrc.lock().unwrap();
    assert!(state.levels_seen.contains(&-35.0));
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
}

fn elm_fixture(elm: MockElectrometer) -> (IvRampElm, Arc<Mutex<SourceMeterState>>) {
    let smu = MockSourceMeter::new();
    let handle = smu.handle();
    let mut procedure = IvRampElm::new(
        Box::new(smu),
        Box::new(elm),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    procedure.bind("voltage_start", 0.0).unwrap();
    procedure.bind("voltage_stop", -2.0).unwrap();
    procedure.bind("voltage_step", 1.0).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("hvsrc_current_compliance", 1e-6).unwrap();
    (procedure, handle)
}

#[tokio::test]
async fn test_electrometer_zero_check_discipline() {
    let elm = MockElectrometer::new();
    let elm_handle = elm.handle();
    elm_handle.lock().unwrap().readings = VecDeque::from([1e-12, 2e-12, 3e-12]);
    let (mut procedure, _smu) = elm_fixture(elm);

    let (process, _rx) = ProcessHandle::new();
    let report = run(&mut procedure, &process).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(
        procedure.store().series("current_elm"),
        &[1e-12, 2e-12, 3e-12]
    );

    let state = elm_handle.lock().unwrap();
    // Configured while parked, released for the sweep, parked again by
    // finalize before the source moved.
    assert!(state.zero_check);
    let setup = state.setup.as_ref().expect("electrometer was never configured");
    // elm_integration_rate defaults to 50, and NPLC is rate / 10.
    assert_eq!(setup.nplc, 5.0);
}

#[tokio::test]
async fn test_wedged_zero_check_fails_the_run_before_the_sweep() {
    let elm = MockElectrometer::new();
    {
        let handle = elm.handle();
        let mut state = handle.lock().unwrap();
        state.zero_check = false;
        state.zero_check_stuck = true;
    }
    let (mut procedure, smu) = elm_fixture(elm);

    let (process, _rx) = ProcessHandle::new();
    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::Protocol(_)));

    // The sweep never started and finalize parked the source.
    let state = smu.lock().unwrap();
    assert_eq!(state.levels_seen, vec![0.0]);
    assert!(!state.output);
}

#[tokio::test]
async fn test_stuck_lcr_bias_blocks_the_run() {
    let vsrc = MockSourceMeter::new();
    let vsrc_handle = vsrc.handle();
    let lcr = MockLcrMeter::new();
    {
        let handle = lcr.handle();
        let mut state = handle.lock().unwrap();
        state.bias_enabled = true;
        state.bias_stuck = true;
    }
    let mut procedure = CvRamp::new(
        Box::new(vsrc),
        Box::new(lcr),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
        FilterConfig::default(),
    );
    procedure.bind("bias_voltage_start", 0.0).unwrap();
    procedure.bind("bias_voltage_stop", -8.0).unwrap();
    procedure.bind("bias_voltage_step", 2.0).unwrap();
    procedure.bind("waiting_time", 0.0).unwrap();
    procedure.bind("vsrc_current_compliance", 25e-6).unwrap();

    let (process, _rx) = ProcessHandle::new();
    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::Protocol(_)));

    // No sweep happened and finalize left the source safe.
    assert_eq!(procedure.store().row_count(), 0);
    let state = vsrc_handle.lock().unwrap();
    assert_eq!(state.level, 0.0);
    assert!(!state.output);
}

#[tokio::test]
async fn test_missing_required_parameter_fails_before_hardware() {
    let smu = MockSourceMeter::new();
    let handle = smu.handle();
    let mut procedure = IvRamp::new(
        Box::new(smu),
        Box::new(MockEnvironmentSensor::default()),
        fast_general(),
    );
    // voltage_stop deliberately unbound.
    procedure.bind("voltage_start", 0.0).unwrap();
    procedure.bind("voltage_step", 10.0).unwrap();
    procedure.bind("hvsrc_current_compliance", 1e-6).unwrap();

    let (process, _rx) = ProcessHandle::new();
    let err = run(&mut procedure, &process).await.unwrap_err();
    assert!(matches!(err, MeasureError::MissingParameter(_)));
    assert!(handle.lock().unwrap().levels_seen.is_empty());
}
