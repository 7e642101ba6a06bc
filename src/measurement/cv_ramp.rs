//! CV ramp: a source sweeps the DC bias while an LCR meter measures the
//! CpRp pair at each step. Capacitance is also recorded as 1/C^2, the usual
//! depletion-voltage axis.

use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analysis::{run_analysis, AnalysisFunction};
use crate::config::{GeneralConfig, FilterConfig};
use crate::data::SeriesStore;
use crate::error::{AppResult, MeasureError};
use crate::estimate::{format_estimate, Estimate};
use crate::filter::acquire_filtered;
use crate::instrument::{
    Aperture, CorrectionMode, EnvironmentSensor, LcrMeter, LcrSetup, SenseMode, SourceFunction,
    SourceMeter, SwitchingMatrix,
};
use crate::measurement::ramp::{ramp_guarded, ramp_to_zero, reading_x};
use crate::measurement::{Outcome, RampProcedure};
use crate::params::{ParameterSpec, ParameterValue, Parameters};
use crate::process::{Event, ProcessHandle};
use crate::range::Range;

use async_trait::async_trait;

const ROLE: &str = "V Source";

/// Bias voltage sweep with LCR capacitance readout.
pub struct CvRamp {
    params: Parameters,
    store: SeriesStore,
    vsrc: Box<dyn SourceMeter>,
    lcr: Box<dyn LcrMeter>,
    env: Box<dyn EnvironmentSensor>,
    matrix: Option<Box<dyn SwitchingMatrix>>,
    analyses: Vec<AnalysisFunction>,
    general: GeneralConfig,
    filter: FilterConfig,
}

impl CvRamp {
    pub fn new(
        vsrc: Box<dyn SourceMeter>,
        lcr: Box<dyn LcrMeter>,
        env: Box<dyn EnvironmentSensor>,
        general: GeneralConfig,
        filter: FilterConfig,
    ) -> Self {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("bias_voltage_start").unit("V").required());
        params.declare(ParameterSpec::new("bias_voltage_stop").unit("V").required());
        params.declare(ParameterSpec::new("bias_voltage_step").unit("V").required());
        params.declare(ParameterSpec::new("waiting_time").unit("s").default(1.0));
        params.declare(
            ParameterSpec::new("vsrc_current_compliance")
                .unit("A")
                .required(),
        );
        params.declare(
            ParameterSpec::new("vsrc_sense_mode")
                .choices(&["local", "remote"])
                .default("local"),
        );
        params.declare(ParameterSpec::new("lcr_amplitude").unit("V").default(0.25));
        params.declare(ParameterSpec::new("lcr_frequency").unit("Hz").default(1e4));
        params.declare(
            ParameterSpec::new("lcr_integration_time")
                .choices(&["short", "medium", "long"])
                .default("medium"),
        );
        params.declare(ParameterSpec::new("lcr_averaging_rate").default(1i64));
        params.declare(ParameterSpec::new("lcr_auto_level_control").default(true));
        params.declare(ParameterSpec::new("lcr_soft_filter").default(true));
        params.declare(
            ParameterSpec::new("lcr_open_correction_mode")
                .choices(&["single", "multi"])
                .default("single"),
        );
        params.declare(ParameterSpec::new("lcr_open_correction_channel").default(0i64));
        params.declare(ParameterSpec::new("matrix_channels").default(Vec::<String>::new()));

        let mut store = SeriesStore::new();
        store.register_series("timestamp", "s");
        store.register_series("voltage_vsrc", "V");
        store.register_series("current_vsrc", "A");
        store.register_series("capacitance", "F");
        store.register_series("capacitance2", "1");
        store.register_series("resistance", "Ohm");
        store.register_series("temperature_box", "degC");
        store.register_series("temperature_chuck", "degC");
        store.register_series("humidity_box", "%");

        Self {
            params,
            store,
            vsrc,
            lcr,
            env,
            matrix: None,
            analyses: Vec::new(),
            general,
            filter,
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

    fn lcr_setup(&self) -> AppResult<LcrSetup> {
        let aperture: Aperture = self.params.get_str("lcr_integration_time")?.parse()?;
        let correction_mode: CorrectionMode =
            self.params.get_str("lcr_open_correction_mode")?.parse()?;
        Ok(LcrSetup {
            amplitude: self.params.get_f64("lcr_amplitude")?,
            frequency: self.params.get_f64("lcr_frequency")?,
            aperture,
            averaging_rate: self.params.get_i64("lcr_averaging_rate")? as u32,
            auto_level_control: self.params.get_bool("lcr_auto_level_control")?,
            correction_mode,
            correction_channel: self.params.get_i64("lcr_open_correction_channel")? as u32,
        })
    }
}

#[async_trait]
impl RampProcedure for CvRamp {
    fn name(&self) -> &str {
        "CV Ramp"
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

        let compliance = self.params.get_f64("vsrc_current_compliance")?;
        let sense_mode: SenseMode = self.params.get_str("vsrc_sense_mode")?.parse()?;

        let idn = self.vsrc.identify().await?;
        info!(instrument = %idn, "detected source meter");
        let idn = self.lcr.identify().await?;
        info!(instrument = %idn, "detected LCR meter");
        process.emit_progress(1, 6);

        self.vsrc.reset().await?;
        self.vsrc.clear().await?;
        self.vsrc.set_function(SourceFunction::Voltage).await?;
        self.vsrc.set_sense_mode(sense_mode).await?;
        self.vsrc.set_compliance(compliance).await?;
        self.vsrc.set_auto_range(true).await?;
        process.emit_progress(3, 6);

        self.vsrc.set_level(0.0).await?;
        self.vsrc.set_output_enabled(true).await?;
        process.emit_progress(4, 6);

        self.lcr.reset().await?;
        self.lcr.clear().await?;
        self.lcr.configure(&self.lcr_setup()?).await?;
        // The DC bias comes from the external source; the internal bias must
        // stay out of the circuit.
        self.lcr.set_bias_enabled(false).await?;
        if self.lcr.bias_enabled().await? {
            return Err(MeasureError::Protocol(
                "failed to disable LCR internal bias".to_string(),
            ));
        }
        process.emit_progress(5, 6);

        let env = self.env.query().await?;
        process.emit_state([
            ("vsrc_output", json!(true)),
            ("env_box_temperature", json!(env.box_temperature)),
            ("env_chuck_temperature", json!(env.chuck_temperature)),
            ("env_box_humidity", json!(env.box_humidity)),
        ]);
        self.store.set_meta("measurement_type", "cv_ramp");
        self.store
            .set_meta("start_timestamp", chrono::Utc::now().to_rfc3339());
        for name in [
            "bias_voltage_start",
            "bias_voltage_stop",
            "bias_voltage_step",
            "vsrc_current_compliance",
        ] {
            let value = self.params.get_f64(name)?;
            let unit = self.params.unit(name).unwrap_or("");
            self.store.set_meta(name, format!("{value:E} {unit}"));
        }
        process.emit_progress(6, 6);
        Ok(())
    }

    async fn ramp_to_start(&mut self, process: &ProcessHandle) -> AppResult<()> {
        let start = self.params.get_f64("bias_voltage_start")?;
        let step = self.params.get_f64("bias_voltage_step")?;
        process.emit_message(format!("Ramp to start... {start:.3} V"));
        ramp_guarded(
            self.vsrc.as_mut(),
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
        let stop = self.params.get_f64("bias_voltage_stop")?;
        let step = self.params.get_f64("bias_voltage_step")?;
        let waiting_time = self.params.get_duration_secs("waiting_time")?;
        let soft_filter = self.params.get_bool("lcr_soft_filter")?;

        let level = self.vsrc.level().await?;
        let ramp = Range::new(level, stop, step)?;
        let mut est = Estimate::new(ramp.count());
        process.emit_progress(0, ramp.count());

        for voltage in ramp.iter() {
            if !process.running() {
                return Ok(Outcome::Aborted);
            }
            self.vsrc.set_level(voltage).await?;
            sleep(waiting_time).await;

            // CpRp: primary is Cp, secondary is Rp.
            let (capacitance, resistance) = if soft_filter {
                acquire_filtered(&mut self.lcr, self.filter.into()).await?
            } else {
                self.lcr.trigger_and_fetch().await?
            };
            let capacitance2 = if capacitance == 0.0 {
                0.0
            } else {
                1.0 / (capacitance * capacitance)
            };
            let current = self.vsrc.read_primary().await?;
            let env = self.env.query().await?;
            let timestamp = est.elapsed().as_secs_f64();
            let x = reading_x(voltage, ramp.step());

            process.emit_reading("lcr", x, capacitance);
            process.emit_reading("lcr2", x, capacitance2);
            self.store.append_row(&[
                ("timestamp", timestamp),
                ("voltage_vsrc", voltage),
                ("current_vsrc", current),
                ("capacitance", capacitance),
                ("capacitance2", capacitance2),
                ("resistance", resistance),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            process.emit(Event::Update);

            est.advance();
            let (completed, total) = est.progress();
            process.emit_progress(completed, total);
            process.emit_message(format!("{} | {voltage:.3} V", format_estimate(&est)));

            if self.vsrc.compliance_tripped().await? {
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
        let step = self.params.get_f64("bias_voltage_step")?;
        ramp_to_zero(
            self.vsrc.as_mut(),
            ROLE,
            step,
            self.general.quick_ramp_delay,
        )
        .await?;
        process.emit_state([
            ("vsrc_output", json!(false)),
            ("env_box_temperature", json!(f64::NAN)),
            ("env_chuck_temperature", json!(f64::NAN)),
            ("env_box_humidity", json!(f64::NAN)),
        ]);
        process.emit_progress(2, 2);
        Ok(())
    }
}
