//! IV ramp with bias: one source sweeps voltage while a second source holds
//! (or tracks) a bias level; both currents are recorded per step.

use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analysis::{run_analysis, AnalysisFunction};
use crate::config::GeneralConfig;
use crate::data::SeriesStore;
use crate::error::{AppResult, MeasureError};
use crate::estimate::{format_estimate, Estimate};
use crate::instrument::{
    EnvironmentSensor, FilterType, RouteTerminal, SenseMode, SourceFunction, SourceMeter,
    SwitchingMatrix,
};
use crate::measurement::ramp::{ramp_guarded, ramp_to_zero, reading_x, SegmentEnd};
use crate::measurement::{Outcome, RampProcedure};
use crate::params::{ParameterSpec, ParameterValue, Parameters};
use crate::process::{Event, ProcessHandle};
use crate::range::Range;

use async_trait::async_trait;

const SWEEP_ROLE: &str = "V Source";
const BIAS_ROLE: &str = "HV Source";

/// Bias sources always walk in 1 V steps, independent of the sweep step.
const BIAS_RAMP_STEP: f64 = 1.0;

/// Voltage sweep on one source with a second source providing bias.
pub struct IvRampBias {
    params: Parameters,
    store: SeriesStore,
    vsrc: Box<dyn SourceMeter>,
    hvsrc: Box<dyn SourceMeter>,
    env: Box<dyn EnvironmentSensor>,
    matrix: Option<Box<dyn SwitchingMatrix>>,
    analyses: Vec<AnalysisFunction>,
    general: GeneralConfig,
}

impl IvRampBias {
    pub fn new(
        vsrc: Box<dyn SourceMeter>,
        hvsrc: Box<dyn SourceMeter>,
        env: Box<dyn EnvironmentSensor>,
        general: GeneralConfig,
    ) -> Self {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("voltage_start").unit("V").required());
        params.declare(ParameterSpec::new("voltage_stop").unit("V").required());
        params.declare(ParameterSpec::new("voltage_step").unit("V").required());
        params.declare(ParameterSpec::new("waiting_time").unit("s").default(1.0));
        params.declare(ParameterSpec::new("bias_voltage").unit("V").required());
        params.declare(
            ParameterSpec::new("bias_mode")
                .choices(&["constant", "offset"])
                .default("constant"),
        );
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
        params.declare(
            ParameterSpec::new("vsrc_route_terminal")
                .choices(&["front", "rear"])
                .default("rear"),
        );
        params.declare(ParameterSpec::new("vsrc_filter_enable").default(false));
        params.declare(ParameterSpec::new("vsrc_filter_count").default(10i64));
        params.declare(
            ParameterSpec::new("vsrc_filter_type")
                .choices(&["repeat", "moving"])
                .default("repeat"),
        );
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
        params.declare(ParameterSpec::new("hvsrc_filter_enable").default(false));
        params.declare(ParameterSpec::new("hvsrc_filter_count").default(10i64));
        params.declare(
            ParameterSpec::new("hvsrc_filter_type")
                .choices(&["repeat", "moving"])
                .default("repeat"),
        );
        params.declare(ParameterSpec::new("matrix_channels").default(Vec::<String>::new()));

        let mut store = SeriesStore::new();
        store.register_series("timestamp", "s");
        store.register_series("voltage", "V");
        store.register_series("bias_voltage", "V");
        store.register_series("current_vsrc", "A");
        store.register_series("current_hvsrc", "A");
        store.register_series("temperature_box", "degC");
        store.register_series("temperature_chuck", "degC");
        store.register_series("humidity_box", "%");

        Self {
            params,
            store,
            vsrc,
            hvsrc,
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

    async fn configure_source(
        source: &mut dyn SourceMeter,
        compliance: f64,
        sense_mode: SenseMode,
        filter_enable: bool,
        filter_count: u32,
        filter_type: FilterType,
    ) -> AppResult<()> {
        source.reset().await?;
        source.clear().await?;
        source.set_function(SourceFunction::Voltage).await?;
        source.set_sense_mode(sense_mode).await?;
        source.set_compliance(compliance).await?;
        source.set_auto_range(true).await?;
        source
            .set_filter(filter_enable, filter_count, filter_type)
            .await?;
        source.set_level(0.0).await?;
        source.set_output_enabled(true).await?;
        Ok(())
    }
}

#[async_trait]
impl RampProcedure for IvRampBias {
    fn name(&self) -> &str {
        "IV Ramp Bias"
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
        process.emit_progress(0, 4);

        let idn = self.vsrc.identify().await?;
        info!(instrument = %idn, "detected sweep source");
        let idn = self.hvsrc.identify().await?;
        info!(instrument = %idn, "detected bias source");

        Self::configure_source(
            self.vsrc.as_mut(),
            self.params.get_f64("vsrc_current_compliance")?,
            self.params.get_str("vsrc_sense_mode")?.parse()?,
            self.params.get_bool("vsrc_filter_enable")?,
            self.params.get_i64("vsrc_filter_count")? as u32,
            self.params.get_str("vsrc_filter_type")?.parse()?,
        )
        .await?;
        let terminal: RouteTerminal = self.params.get_str("vsrc_route_terminal")?.parse()?;
        self.vsrc.set_route_terminal(terminal).await?;
        process.emit_progress(2, 4);

        Self::configure_source(
            self.hvsrc.as_mut(),
            self.params.get_f64("hvsrc_current_compliance")?,
            self.params.get_str("hvsrc_sense_mode")?.parse()?,
            self.params.get_bool("hvsrc_filter_enable")?,
            self.params.get_i64("hvsrc_filter_count")? as u32,
            self.params.get_str("hvsrc_filter_type")?.parse()?,
        )
        .await?;
        process.emit_progress(3, 4);

        let env = self.env.query().await?;
        process.emit_state([
            ("vsrc_output", json!(true)),
            ("hvsrc_output", json!(true)),
            ("env_box_temperature", json!(env.box_temperature)),
            ("env_chuck_temperature", json!(env.chuck_temperature)),
            ("env_box_humidity", json!(env.box_humidity)),
        ]);
        self.store.set_meta("measurement_type", "iv_ramp_bias");
        self.store
            .set_meta("start_timestamp", chrono::Utc::now().to_rfc3339());
        self.store.set_meta(
            "bias_voltage",
            format!("{:E} V", self.params.get_f64("bias_voltage")?),
        );
        process.emit_progress(4, 4);
        Ok(())
    }

    async fn ramp_to_start(&mut self, process: &ProcessHandle) -> AppResult<()> {
        let bias = self.params.get_f64("bias_voltage")?;
        let start = self.params.get_f64("voltage_start")?;
        let step = self.params.get_f64("voltage_step")?;

        process.emit_message(format!("Ramp bias... {bias:.3} V"));
        let end = ramp_guarded(
            self.hvsrc.as_mut(),
            BIAS_ROLE,
            bias,
            BIAS_RAMP_STEP,
            self.general.quick_ramp_delay,
            process,
        )
        .await?;
        if end == SegmentEnd::Stopped {
            return Ok(());
        }

        process.emit_message(format!("Ramp to start... {start:.3} V"));
        ramp_guarded(
            self.vsrc.as_mut(),
            SWEEP_ROLE,
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
        let offset_mode = self.params.get_str("bias_mode")? == "offset";
        let mut bias_voltage = self.params.get_f64("bias_voltage")?;

        let level = self.vsrc.level().await?;
        let ramp = Range::new(level, stop, step)?;
        let mut est = Estimate::new(ramp.count());
        process.emit_progress(0, ramp.count());

        for voltage in ramp.iter() {
            if !process.running() {
                return Ok(Outcome::Aborted);
            }
            self.vsrc.set_level(voltage).await?;
            if offset_mode {
                // The bias tracks the sweep at a fixed offset.
                bias_voltage += ramp.step();
                self.hvsrc.set_level(bias_voltage).await?;
            }
            sleep(waiting_time).await;

            let vsrc_current = self.vsrc.read_primary().await?;
            let hvsrc_current = self.hvsrc.read_primary().await?;
            let env = self.env.query().await?;
            let timestamp = est.elapsed().as_secs_f64();
            let x = reading_x(voltage, ramp.step());

            process.emit_reading("vsrc", x, vsrc_current);
            process.emit_reading("hvsrc", x, hvsrc_current);
            self.store.append_row(&[
                ("timestamp", timestamp),
                ("voltage", voltage),
                ("bias_voltage", bias_voltage),
                ("current_vsrc", vsrc_current),
                ("current_hvsrc", hvsrc_current),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            process.emit(Event::Update);

            est.advance();
            let (completed, total) = est.progress();
            process.emit_progress(completed, total);
            process.emit_message(format!(
                "{} | {voltage:.3} V | Bias {bias_voltage:.3} V",
                format_estimate(&est)
            ));

            if self.vsrc.compliance_tripped().await? {
                error!(role = SWEEP_ROLE, "compliance tripped during ramp");
                return Err(MeasureError::ComplianceTripped(SWEEP_ROLE.to_string()));
            }
            if self.hvsrc.compliance_tripped().await? {
                error!(role = BIAS_ROLE, "compliance tripped during ramp");
                return Err(MeasureError::ComplianceTripped(BIAS_ROLE.to_string()));
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
        let step = self.params.get_f64("voltage_step")?;
        let sweep_down = ramp_to_zero(
            self.vsrc.as_mut(),
            SWEEP_ROLE,
            step,
            self.general.quick_ramp_delay,
        )
        .await;
        // The bias source comes down even when the sweep ramp-down failed.
        let bias_down = ramp_to_zero(
            self.hvsrc.as_mut(),
            BIAS_ROLE,
            BIAS_RAMP_STEP,
            self.general.quick_ramp_delay,
        )
        .await;
        process.emit_state([
            ("vsrc_output", json!(false)),
            ("hvsrc_output", json!(false)),
            ("env_box_temperature", json!(f64::NAN)),
            ("env_chuck_temperature", json!(f64::NAN)),
            ("env_box_humidity", json!(f64::NAN)),
        ]);
        process.emit_progress(4, 4);
        sweep_down?;
        bias_down
    }
}
