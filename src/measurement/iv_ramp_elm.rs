//! IV ramp with electrometer: the SMU sweeps voltage while a picoammeter
//! measures the device current alongside the SMU's own readback.

use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analysis::{run_analysis, AnalysisFunction};
use crate::config::GeneralConfig;
use crate::data::SeriesStore;
use crate::error::{AppResult, MeasureError};
use crate::estimate::{format_estimate, Estimate};
use crate::instrument::{
    Electrometer, ElectrometerSetup, EnvironmentSensor, FilterType, RouteTerminal, SenseMode,
    SourceFunction, SourceMeter, SwitchingMatrix,
};
use crate::measurement::ramp::{ramp_guarded, ramp_to_zero, reading_x};
use crate::measurement::{Outcome, RampProcedure};
use crate::params::{ParameterSpec, ParameterValue, Parameters};
use crate::process::{Event, ProcessHandle};
use crate::range::Range;

use async_trait::async_trait;

const ROLE: &str = "HV Source";

/// Voltage ramp with a Keithley-style electrometer as the primary ammeter.
pub struct IvRampElm {
    params: Parameters,
    store: SeriesStore,
    smu: Box<dyn SourceMeter>,
    elm: Box<dyn Electrometer>,
    env: Box<dyn EnvironmentSensor>,
    matrix: Option<Box<dyn SwitchingMatrix>>,
    analyses: Vec<AnalysisFunction>,
    general: GeneralConfig,
}

impl IvRampElm {
    pub fn new(
        smu: Box<dyn SourceMeter>,
        elm: Box<dyn Electrometer>,
        env: Box<dyn EnvironmentSensor>,
        general: GeneralConfig,
    ) -> Self {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("voltage_start").unit("V").required());
        params.declare(ParameterSpec::new("voltage_stop").unit("V").required());
        params.declare(ParameterSpec::new("voltage_step").unit("V").required());
        params.declare(ParameterSpec::new("waiting_time").unit("s").default(1.0));
        params.declare(
            ParameterSpec::new("hvsrc_current_compliance")
                .unit("A")
                .required(),
        );
        params.declare(
            ParameterSpec::new("hvsrc_sense_mode")
                .choices(&["local", "remote"])
                .default("local"),
        );
        params.declare(
            ParameterSpec::new("hvsrc_route_terminal")
                .choices(&["front", "rear"])
                .default("rear"),
        );
        params.declare(ParameterSpec::new("hvsrc_filter_enable").default(false));
        params.declare(ParameterSpec::new("hvsrc_filter_count").default(10i64));
        params.declare(
            ParameterSpec::new("hvsrc_filter_type")
                .choices(&["repeat", "moving"])
                .default("repeat"),
        );
        // Integration rate in readings per power line cycle group; the
        // instrument NPLC is rate / 10.
        params.declare(ParameterSpec::new("elm_integration_rate").default(50.0));
        params.declare(ParameterSpec::new("elm_filter_enable").default(false));
        params.declare(ParameterSpec::new("elm_filter_count").default(10i64));
        params.declare(ParameterSpec::new("elm_read_timeout").unit("s").default(60.0));
        params.declare(ParameterSpec::new("matrix_channels").default(Vec::<String>::new()));

        let mut store = SeriesStore::new();
        store.register_series("timestamp", "s");
        store.register_series("voltage", "V");
        store.register_series("current_hvsrc", "A");
        store.register_series("current_elm", "A");
        store.register_series("temperature_box", "degC");
        store.register_series("temperature_chuck", "degC");
        store.register_series("humidity_box", "%");

        Self {
            params,
            store,
            smu,
            elm,
            env,
            matrix: None,
            analyses: Vec::new(),
            general,
        }
    }

    pub fn with_matrix(mut self, matrix: Box<dyn SwitchingMatrix>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn add_analysis(&mut self, function: AnalysisFunction) {
        self.analyses.push(function);
    }

    pub fn bind(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        self.params.bind(name, value)
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    fn read_timeout(&self) -> AppResult<Duration> {
        self.params.get_duration_secs("elm_read_timeout")
    }
}

#[async_trait]
impl RampProcedure for IvRampElm {
    fn name(&self) -> &str {
        "IV Ramp Elm"
    }

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn rows(&self) -> usize {
        self.store.row_count()
    }

    fn take_matrix(&mut self) -> Option<(Box<dyn SwitchingMatrix>, Vec<String>)> {
        let matrix = self.matrix.take()?;
        let channels = self
            .params
            .get_list("matrix_channels")
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        Some((matrix, channels))
    }

    fn restore_matrix(&mut self, matrix: Box<dyn SwitchingMatrix>) {
        self.matrix = Some(matrix);
    }

    async fn initialize(&mut self, process: &ProcessHandle) -> AppResult<()> {
        process.emit_message("Initialize...");
        process.emit_progress(0, 6);

        let compliance = self.params.get_f64("hvsrc_current_compliance")?;
        let sense_mode: SenseMode = self.params.get_str("hvsrc_sense_mode")?.parse()?;
        let terminal: RouteTerminal = self.params.get_str("hvsrc_route_terminal")?.parse()?;
        let filter_enable = self.params.get_bool("hvsrc_filter_enable")?;
        let filter_count = self.params.get_i64("hvsrc_filter_count")? as u32;
        let filter_type: FilterType = self.params.get_str("hvsrc_filter_type")?.parse()?;

        let idn = self.smu.identify().await?;
        info!(instrument = %idn, "detected source meter");
        let idn = self.elm.identify().await?;
        info!(instrument = %idn, "detected electrometer");

        self.smu.reset().await?;
        self.smu.clear().await?;
        self.smu.set_function(SourceFunction::Voltage).await?;
        self.smu.set_route_terminal(terminal).await?;
        self.smu.set_sense_mode(sense_mode).await?;
        self.smu.set_compliance(compliance).await?;
        self.smu.set_auto_range(true).await?;
        self.smu
            .set_filter(filter_enable, filter_count, filter_type)
            .await?;
        process.emit_progress(2, 6);

        // Electrometer: configure behind zero check, then release it.
        self.elm.reset().await?;
        self.elm.clear().await?;
        self.elm.set_zero_check(true).await?;
        if !self.elm.zero_check().await? {
            return Err(MeasureError::Protocol(
                "failed to enable electrometer zero check".to_string(),
            ));
        }
        let nplc = self.params.get_f64("elm_integration_rate")? / 10.0;
        self.elm
            .configure(&ElectrometerSetup {
                auto_range: true,
                nplc,
                filter_enabled: self.params.get_bool("elm_filter_enable")?,
                filter_count: self.params.get_i64("elm_filter_count")? as u32,
            })
            .await?;
        self.elm.set_zero_check(false).await?;
        if self.elm.zero_check().await? {
            return Err(MeasureError::Protocol(
                "failed to disable electrometer zero check".to_string(),
            ));
        }
        process.emit_progress(4, 6);

        if self.smu.output_enabled().await? {
            let step = self.params.get_f64("voltage_step")?;
            let level = self.smu.level().await?;
            for value in Range::new(level, 0.0, step)?.iter() {
                self.smu.set_level(value).await?;
                sleep(self.general.quick_ramp_delay).await;
            }
        } else {
            self.smu.set_level(0.0).await?;
            self.smu.set_output_enabled(true).await?;
        }
        process.emit_progress(5, 6);

        let env = self.env.query().await?;
        process.emit_state([
            ("hvsrc_output", json!(true)),
            ("env_box_temperature", json!(env.box_temperature)),
            ("env_chuck_temperature", json!(env.chuck_temperature)),
            ("env_box_humidity", json!(env.box_humidity)),
        ]);
        self.store.set_meta("measurement_type", "iv_ramp_elm");
        self.store
            .set_meta("start_timestamp", chrono::Utc::now().to_rfc3339());
        process.emit_progress(6, 6);
        Ok(())
    }

    async fn ramp_to_start(&mut self, process: &ProcessHandle) -> AppResult<()> {
        let start = self.params.get_f64("voltage_start")?;
        let step = self.params.get_f64("voltage_step")?;
        process.emit_message(format!("Ramp to start... {start:.3} V"));
        ramp_guarded(
            self.smu.as_mut(),
            ROLE,
            start,
            step,
            self.general.quick_ramp_delay,
            process,
        )
        .await?;
        Ok(())
    }

    async fn measure(&mut self, process: &ProcessHandle) -> AppResult<Outcome> {
        let stop = self.params.get_f64("voltage_stop")?;
        let step = self.params.get_f64("voltage_step")?;
        let waiting_time = self.params.get_duration_secs("waiting_time")?;
        let read_timeout = self.read_timeout()?;

        let level = self.smu.level().await?;
        let ramp = Range::new(level, stop, step)?;
        let mut est = Estimate::new(ramp.count());
        process.emit_progress(0, ramp.count());

        for voltage in ramp.iter() {
            if !process.running() {
                return Ok(Outcome::Aborted);
            }
            self.smu.set_level(voltage).await?;
            sleep(waiting_time).await;

            let elm_current = self.elm.read_with_timeout(read_timeout).await?;
            let hvsrc_current = self.smu.read_primary().await?;
            let env = self.env.query().await?;
            let timestamp = est.elapsed().as_secs_f64();
            let x = reading_x(voltage, ramp.step());

            process.emit_reading("elm", x, elm_current);
            process.emit_reading("hvsrc", x, hvsrc_current);
            self.store.append_row(&[
                ("timestamp", timestamp),
                ("voltage", voltage),
                ("current_hvsrc", hvsrc_current),
                ("current_elm", elm_current),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            process.emit(Event::Update);

            est.advance();
            let (completed, total) = est.progress();
            process.emit_progress(completed, total);
            process.emit_message(format!("{} | {voltage:.3} V", format_estimate(&est)));

            if self.smu.compliance_tripped().await? {
                error!(role = ROLE, "compliance tripped during ramp");
                return Err(MeasureError::ComplianceTripped(ROLE.to_string()));
            }
        }
        Ok(Outcome::Completed)
    }

    async fn analyze(&mut self, process: &ProcessHandle) -> AppResult<()> {
        for function in &self.analyses {
            let x = self.store.series(&function.x);
            let y = self.store.series(&function.y);
            match run_analysis(function, x, y) {
                Ok(result) => {
                    for &(x, y) in &result.fitted {
                        process.emit_reading("xfit", x, y);
                    }
                    process.emit(Event::AppendAnalysis {
                        key: result.key,
                        values: result.values,
                    });
                }
                Err(err) => warn!(kind = ?function.kind, %err, "analysis function failed"),
            }
        }
        Ok(())
    }

    async fn finalize(&mut self, process: &ProcessHandle) -> AppResult<()> {
        process.emit_message("Ramp to zero...");
        // Park the electrometer input before the source moves.
        if let Err(err) = self.elm.set_zero_check(true).await {
            warn!(%err, "failed to re-enable electrometer zero check");
        }
        let step = self.params.get_f64("voltage_step")?;
        ramp_to_zero(
            self.smu.as_mut(),
            ROLE,
            step,
            self.general.quick_ramp_delay,
        )
        .await?;
        process.emit_state([
            ("hvsrc_output", json!(false)),
            ("env_box_temperature", json!(f64::NAN)),
            ("env_chuck_temperature", json!(f64::NAN)),
            ("env_box_humidity", json!(f64::NAN)),
        ]);
        process.emit_progress(6, 6);
        Ok(())
    }
}
