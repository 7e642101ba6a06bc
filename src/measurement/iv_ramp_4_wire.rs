//! IV ramp 4-wire: the source drives current through force leads while the
//! voltage drop is measured over separate sense leads, so lead and contact
//! resistance stay out of the reading.

use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analysis::{run_analysis, AnalysisFunction};
use crate::config::GeneralConfig;
use crate::data::SeriesStore;
use crate::error::{AppResult, MeasureError};
use crate::estimate::{format_estimate, Estimate};
use crate::instrument::{
    EnvironmentSensor, FilterType, SenseMode, SourceFunction, SourceMeter, SwitchingMatrix,
};
use crate::measurement::ramp::{ramp_guarded, ramp_to_zero, reading_x};
use crate::measurement::{Outcome, RampProcedure};
use crate::params::{ParameterSpec, ParameterValue, Parameters};
use crate::process::{Event, ProcessHandle};
use crate::range::Range;

use async_trait::async_trait;

const ROLE: &str = "V Source";

/// Current ramp with 4-wire voltage readback on a single SMU.
pub struct IvRamp4Wire {
    params: Parameters,
    store: SeriesStore,
    smu: Box<dyn SourceMeter>,
    env: Box<dyn EnvironmentSensor>,
    matrix: Option<Box<dyn SwitchingMatrix>>,
    analyses: Vec<AnalysisFunction>,
    general: GeneralConfig,
}

impl IvRamp4Wire {
    pub fn new(
        smu: Box<dyn SourceMeter>,
        env: Box<dyn EnvironmentSensor>,
        general: GeneralConfig,
    ) -> Self {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("current_start").unit("A").required());
        params.declare(ParameterSpec::new("current_stop").unit("A").required());
        params.declare(ParameterSpec::new("current_step").unit("A").required());
        params.declare(ParameterSpec::new("waiting_time").unit("s").default(1.0));
        params.declare(
            ParameterSpec::new("vsrc_voltage_compliance")
                .unit("V")
                .required(),
        );
        params.declare(
            ParameterSpec::new("vsrc_sense_mode")
                .choices(&["local", "remote"])
                .default("remote"),
        );
        params.declare(ParameterSpec::new("vsrc_filter_enable").default(false));
        params.declare(ParameterSpec::new("vsrc_filter_count").default(10i64));
        params.declare(
            ParameterSpec::new("vsrc_filter_type")
                .choices(&["repeat", "moving"])
                .default("repeat"),
        );
        params.declare(ParameterSpec::new("matrix_channels").default(Vec::<String>::new()));

        let mut store = SeriesStore::new();
        store.register_series("timestamp", "s");
        store.register_series("current", "A");
        store.register_series("voltage_vsrc", "V");
        store.register_series("temperature_box", "degC");
        store.register_series("temperature_chuck", "degC");
        store.register_series("humidity_box", "%");

        Self {
            params,
            store,
            smu,
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
}

#[async_trait]
impl RampProcedure for IvRamp4Wire {
    fn name(&self) -> &str {
        "IV Ramp 4-Wire"
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
        process.emit_progress(0, 5);

        let compliance = self.params.get_f64("vsrc_voltage_compliance")?;
        let sense_mode: SenseMode = self.params.get_str("vsrc_sense_mode")?.parse()?;
        let filter_enable = self.params.get_bool("vsrc_filter_enable")?;
        let filter_count = self.params.get_i64("vsrc_filter_count")? as u32;
        let filter_type: FilterType = self.params.get_str("vsrc_filter_type")?.parse()?;

        let idn = self.smu.identify().await?;
        info!(instrument = %idn, "detected source meter");
        self.smu.reset().await?;
        self.smu.clear().await?;
        process.emit_progress(1, 5);

        self.smu.set_function(SourceFunction::Current).await?;
        self.smu.set_sense_mode(sense_mode).await?;
        self.smu.set_compliance(compliance).await?;
        self.smu.set_auto_range(true).await?;
        process.emit_progress(2, 5);

        self.smu
            .set_filter(filter_enable, filter_count, filter_type)
            .await?;
        process.emit_progress(3, 5);

        // A source left on from a previous run is walked down first.
        if self.smu.output_enabled().await? {
            let step = self.params.get_f64("current_step")?;
            let level = self.smu.level().await?;
            for value in Range::new(level, 0.0, step)?.iter() {
                self.smu.set_level(value).await?;
                sleep(self.general.quick_ramp_delay).await;
            }
        } else {
            self.smu.set_level(0.0).await?;
            self.smu.set_output_enabled(true).await?;
        }
        process.emit_progress(4, 5);

        let env = self.env.query().await?;
        process.emit_state([
            ("vsrc_output", json!(true)),
            ("env_box_temperature", json!(env.box_temperature)),
            ("env_chuck_temperature", json!(env.chuck_temperature)),
            ("env_box_humidity", json!(env.box_humidity)),
        ]);

        self.store.set_meta("measurement_type", "iv_ramp_4_wire");
        self.store
            .set_meta("start_timestamp", chrono::Utc::now().to_rfc3339());
        for name in [
            "current_start",
            "current_stop",
            "current_step",
            "vsrc_voltage_compliance",
        ] {
            let value = self.params.get_f64(name)?;
            let unit = self.params.unit(name).unwrap_or("");
            self.store.set_meta(name, format!("{value:E} {unit}"));
        }
        process.emit_progress(5, 5);
        Ok(())
    }

    async fn ramp_to_start(&mut self, process: &ProcessHandle) -> AppResult<()> {
        let start = self.params.get_f64("current_start")?;
        let step = self.params.get_f64("current_step")?;
        process.emit_message(format!("Ramp to start... {start:E} A"));
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
        let stop = self.params.get_f64("current_stop")?;
        let step = self.params.get_f64("current_step")?;
        let waiting_time = self.params.get_duration_secs("waiting_time")?;

        let level = self.smu.level().await?;
        let ramp = Range::new(level, stop, step)?;
        let mut est = Estimate::new(ramp.count());
        process.emit_progress(0, ramp.count());
        info!(
            from = level,
            to = stop,
            step = ramp.step(),
            "ramping to stop current"
        );

        for current in ramp.iter() {
            if !process.running() {
                return Ok(Outcome::Aborted);
            }
            self.smu.set_level(current).await?;
            sleep(waiting_time).await;

            let voltage = self.smu.read_primary().await?;
            let env = self.env.query().await?;
            let timestamp = est.elapsed().as_secs_f64();

            process.emit_reading("vsrc", reading_x(current, ramp.step()), voltage);
            self.store.append_row(&[
                ("timestamp", timestamp),
                ("current", current),
                ("voltage_vsrc", voltage),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            process.emit(Event::Update);

            est.advance();
            let (completed, total) = est.progress();
            process.emit_progress(completed, total);
            process.emit_message(format!("{} | {current:E} A", format_estimate(&est)));

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
        let step = self.params.get_f64("current_step")?;
        ramp_to_zero(
            self.smu.as_mut(),
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
