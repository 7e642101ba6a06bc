//! In-process mock instruments.
//!
//! Every mock shares its state through an `Arc<Mutex<..>>` handle so a test
//! (or the demo binary) can keep observing and steering the instrument after
//! the measurement has taken ownership of it. Fault injection is scripted on
//! the state: trip compliance at a level, fail the nth command, report the
//! wrong relay set after a close.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::{
    Electrometer, ElectrometerSetup, EnvReading, EnvironmentSensor, FilterType, LcrMeter,
    LcrSetup, RouteTerminal, SenseMode, SourceFunction, SourceMeter, SwitchingMatrix,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Mock state never holds the lock across an await; poisoning cannot occur.
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Source meter
// ============================================================================

/// Observable state of a [`MockSourceMeter`].
#[derive(Debug)]
pub struct SourceMeterState {
    pub function: SourceFunction,
    pub level: f64,
    pub compliance: f64,
    pub output: bool,
    pub tripped: bool,
    /// Device under test modeled as a plain resistor.
    pub resistance: f64,
    /// Relative measurement noise amplitude.
    pub noise: f64,
    /// Trip compliance once `|level|` reaches this value.
    pub trip_at_level: Option<f64>,
    /// Fail the nth `set_level` call (1-based) with an instrument fault.
    pub fail_set_level_at: Option<usize>,
    /// Every level the instrument was commanded to, in order.
    pub levels_seen: Vec<f64>,
    set_level_calls: usize,
}

impl Default for SourceMeterState {
    fn default() -> Self {
        Self {
            function: SourceFunction::Voltage,
            level: 0.0,
            compliance: 0.0,
            output: false,
            tripped: false,
            resistance: 1e9,
            noise: 0.0,
            trip_at_level: None,
            fail_set_level_at: None,
            levels_seen: Vec::new(),
            set_level_calls: 0,
        }
    }
}

/// Source meter backed by a resistor model.
#[derive(Clone, Default)]
pub struct MockSourceMeter {
    state: Arc<Mutex<SourceMeterState>>,
}

impl MockSourceMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for observing and steering the mock from outside.
    pub fn handle(&self) -> Arc<Mutex<SourceMeterState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn identify(&mut self) -> AppResult<String> {
        Ok("Mock Instruments Inc., Source Meter, 0, v1.0".to_string())
    }

    async fn reset(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.level = 0.0;
        state.output = false;
        state.tripped = false;
        Ok(())
    }

    async fn clear(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn set_function(&mut self, function: SourceFunction) -> AppResult<()> {
        lock(&self.state).function = function;
        Ok(())
    }

    async fn level(&mut self) -> AppResult<f64> {
        Ok(lock(&self.state).level)
    }

    async fn set_level(&mut self, value: f64) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.set_level_calls += 1;
        if state.fail_set_level_at == Some(state.set_level_calls) {
            return Err(MeasureError::Instrument {
                code: -330,
                message: "self-test failed".to_string(),
            });
        }
        state.level = value;
        state.levels_seen.push(value);
        if let Some(limit) = state.trip_at_level {
            if value.abs() >= limit {
                state.tripped = true;
            }
        }
        Ok(())
    }

    async fn set_compliance(&mut self, value: f64) -> AppResult<()> {
        lock(&self.state).compliance = value;
        Ok(())
    }

    async fn compliance_tripped(&mut self) -> AppResult<bool> {
        Ok(lock(&self.state).tripped)
    }

    async fn output_enabled(&mut self) -> AppResult<bool> {
        Ok(lock(&self.state).output)
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> AppResult<()> {
        lock(&self.state).output = enabled;
        Ok(())
    }

    async fn set_sense_mode(&mut self, _mode: SenseMode) -> AppResult<()> {
        Ok(())
    }

    async fn set_route_terminal(&mut self, _terminal: RouteTerminal) -> AppResult<()> {
        Ok(())
    }

    async fn set_filter(&mut self, _enabled: bool, _count: u32, _kind: FilterType) -> AppResult<()> {
        Ok(())
    }

    async fn set_auto_range(&mut self, _enabled: bool) -> AppResult<()> {
        Ok(())
    }

    async fn set_range(&mut self, _value: f64) -> AppResult<()> {
        Ok(())
    }

    async fn read_primary(&mut self) -> AppResult<f64> {
        let (function, level, resistance, noise) = {
            let state = lock(&self.state);
            (state.function, state.level, state.resistance, state.noise)
        };
        let ideal = match function {
            SourceFunction::Voltage => level / resistance,
            SourceFunction::Current => level * resistance,
        };
        let jitter = if noise > 0.0 {
            rand::thread_rng().gen_range(-noise..=noise)
        } else {
            0.0
        };
        Ok(ideal * (1.0 + jitter))
    }

    async fn read_secondary(&mut self) -> AppResult<f64> {
        Ok(lock(&self.state).level)
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        Ok((0, "no error".to_string()))
    }
}

// ============================================================================
// LCR meter
// ============================================================================

/// Observable state of a [`MockLcrMeter`].
#[derive(Debug)]
pub struct LcrMeterState {
    /// DC bias applied to the junction model, steered from the test.
    pub bias_level: f64,
    pub bias_enabled: bool,
    /// Ignore bias state changes to model a wedged bias relay.
    pub bias_stuck: bool,
    pub setup: Option<LcrSetup>,
    /// Zero-bias capacitance of the modeled junction.
    pub base_capacitance: f64,
    pub parallel_resistance: f64,
    pub noise: f64,
}

impl Default for LcrMeterState {
    fn default() -> Self {
        Self {
            bias_level: 0.0,
            bias_enabled: false,
            bias_stuck: false,
            setup: None,
            base_capacitance: 100e-12,
            parallel_resistance: 50e6,
            noise: 0.0,
        }
    }
}

/// LCR meter backed by a depleting-junction model: capacitance falls with
/// the square root of applied reverse bias.
#[derive(Clone, Default)]
pub struct MockLcrMeter {
    state: Arc<Mutex<LcrMeterState>>,
}

impl MockLcrMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<LcrMeterState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl LcrMeter for MockLcrMeter {
    async fn identify(&mut self) -> AppResult<String> {
        Ok("Mock Instruments Inc., LCR Meter, 0, v1.0".to_string())
    }

    async fn reset(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.bias_level = 0.0;
        if !state.bias_stuck {
            state.bias_enabled = false;
        }
        Ok(())
    }

    async fn clear(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn configure(&mut self, setup: &LcrSetup) -> AppResult<()> {
        lock(&self.state).setup = Some(setup.clone());
        Ok(())
    }

    async fn trigger_and_fetch(&mut self) -> AppResult<(f64, f64)> {
        let (bias, c0, rp, noise) = {
            let state = lock(&self.state);
            (
                state.bias_level,
                state.base_capacitance,
                state.parallel_resistance,
                state.noise,
            )
        };
        let capacitance = c0 / (1.0 + bias.abs()).sqrt();
        let jitter = if noise > 0.0 {
            rand::thread_rng().gen_range(-noise..=noise)
        } else {
            0.0
        };
        Ok((capacitance * (1.0 + jitter), rp))
    }

    async fn bias_enabled(&mut self) -> AppResult<bool> {
        Ok(lock(&self.state).bias_enabled)
    }

    async fn set_bias_enabled(&mut self, enabled: bool) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.bias_stuck {
            state.bias_enabled = enabled;
        }
        Ok(())
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        Ok((0, "no error".to_string()))
    }
}

// ============================================================================
// Electrometer
// ============================================================================

/// Observable state of a [`MockElectrometer`].
#[derive(Debug)]
pub struct ElectrometerState {
    pub zero_check: bool,
    /// Ignore zero check changes to model a wedged input relay.
    pub zero_check_stuck: bool,
    pub setup: Option<ElectrometerSetup>,
    /// Readings served in order; the last one repeats when exhausted.
    pub readings: VecDeque<f64>,
    /// Simulate a wedged acquisition.
    pub never_completes: bool,
}

impl Default for ElectrometerState {
    fn default() -> Self {
        Self {
            zero_check: true,
            zero_check_stuck: false,
            setup: None,
            readings: VecDeque::from([0.0]),
            never_completes: false,
        }
    }
}

/// Electrometer serving scripted readings.
#[derive(Clone, Default)]
pub struct MockElectrometer {
    state: Arc<Mutex<ElectrometerState>>,
}

impl MockElectrometer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<ElectrometerState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Electrometer for MockElectrometer {
    async fn identify(&mut self) -> AppResult<String> {
        Ok("Mock Instruments Inc., Electrometer, 0, v1.0".to_string())
    }

    async fn reset(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.zero_check_stuck {
            state.zero_check = true;
        }
        Ok(())
    }

    async fn clear(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn set_zero_check(&mut self, enabled: bool) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.zero_check_stuck {
            state.zero_check = enabled;
        }
        Ok(())
    }

    async fn zero_check(&mut self) -> AppResult<bool> {
        Ok(lock(&self.state).zero_check)
    }

    async fn configure(&mut self, setup: &ElectrometerSetup) -> AppResult<()> {
        lock(&self.state).setup = Some(setup.clone());
        Ok(())
    }

    async fn read_with_timeout(&mut self, timeout: Duration) -> AppResult<f64> {
        let mut state = lock(&self.state);
        if state.never_completes {
            return Err(MeasureError::Timeout(format!(
                "electrometer reading exceeded {timeout:?}"
            )));
        }
        let value = if state.readings.len() > 1 {
            state.readings.pop_front().unwrap_or(0.0)
        } else {
            state.readings.front().copied().unwrap_or(0.0)
        };
        Ok(value)
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        Ok((0, "no error".to_string()))
    }
}

// ============================================================================
// Environment sensor
// ============================================================================

/// Environment sensor returning a fixed reading.
#[derive(Clone)]
pub struct MockEnvironmentSensor {
    reading: EnvReading,
}

impl MockEnvironmentSensor {
    pub fn new(reading: EnvReading) -> Self {
        Self { reading }
    }
}

impl Default for MockEnvironmentSensor {
    fn default() -> Self {
        Self {
            reading: EnvReading {
                box_temperature: 24.0,
                chuck_temperature: -20.0,
                box_humidity: 40.0,
            },
        }
    }
}

#[async_trait]
impl EnvironmentSensor for MockEnvironmentSensor {
    async fn query(&mut self) -> AppResult<EnvReading> {
        Ok(self.reading)
    }
}

// ============================================================================
// Switching matrix
// ============================================================================

/// Observable state of a [`MockSwitchingMatrix`].
#[derive(Debug, Default)]
pub struct SwitchingMatrixState {
    /// Relays currently closed on the device.
    pub closed: Vec<String>,
    /// Extra relays the device spuriously reports after a close.
    pub phantom_after_close: Vec<String>,
    pub fail_open_all: bool,
    pub open_all_calls: usize,
    pub close_calls: usize,
}

/// Switching matrix tracking its relay set in memory.
#[derive(Clone, Default)]
pub struct MockSwitchingMatrix {
    state: Arc<Mutex<SwitchingMatrixState>>,
}

impl MockSwitchingMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<SwitchingMatrixState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl SwitchingMatrix for MockSwitchingMatrix {
    async fn closed_channels(&mut self) -> AppResult<Vec<String>> {
        Ok(lock(&self.state).closed.clone())
    }

    async fn close_channels(&mut self, channels: &[String]) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        state.closed.extend(channels.iter().cloned());
        let phantom = state.phantom_after_close.clone();
        state.closed.extend(phantom);
        Ok(())
    }

    async fn open_all(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.open_all_calls += 1;
        if state.fail_open_all {
            return Err(MeasureError::Instrument {
                code: -300,
                message: "relay driver fault".to_string(),
            });
        }
        state.closed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_meter_resistor_model() {
        let mut smu = MockSourceMeter::new();
        smu.handle().lock().unwrap().resistance = 1e6;
        smu.set_level(5.0).await.unwrap();
        let current = smu.read_primary().await.unwrap();
        assert!((current - 5e-6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_source_meter_measures_voltage_when_sourcing_current() {
        let mut smu = MockSourceMeter::new();
        smu.handle().lock().unwrap().resistance = 1e3;
        smu.set_function(SourceFunction::Current).await.unwrap();
        smu.set_level(2e-3).await.unwrap();
        let voltage = smu.read_primary().await.unwrap();
        assert!((voltage - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_source_meter_trips_at_level() {
        let mut smu = MockSourceMeter::new();
        smu.handle().lock().unwrap().trip_at_level = Some(10.0);
        smu.set_level(5.0).await.unwrap();
        assert!(!smu.compliance_tripped().await.unwrap());
        smu.set_level(-10.0).await.unwrap();
        assert!(smu.compliance_tripped().await.unwrap());
    }

    #[tokio::test]
    async fn test_lcr_capacitance_falls_with_bias() {
        let mut lcr = MockLcrMeter::new();
        let (c_zero, _) = lcr.trigger_and_fetch().await.unwrap();
        lcr.handle().lock().unwrap().bias_level = -8.0;
        let (c_biased, _) = lcr.trigger_and_fetch().await.unwrap();
        assert!(c_biased < c_zero);
    }

    #[tokio::test]
    async fn test_electrometer_scripted_readings() {
        let mut elm = MockElectrometer::new();
        elm.handle().lock().unwrap().readings = VecDeque::from([1e-12, 2e-12]);
        let timeout = Duration::from_secs(1);
        assert_eq!(elm.read_with_timeout(timeout).await.unwrap(), 1e-12);
        assert_eq!(elm.read_with_timeout(timeout).await.unwrap(), 2e-12);
        // The last reading repeats.
        assert_eq!(elm.read_with_timeout(timeout).await.unwrap(), 2e-12);
    }

    #[tokio::test]
    async fn test_matrix_phantom_channels() {
        let mut matrix = MockSwitchingMatrix::new();
        matrix.handle().lock().unwrap().phantom_after_close = vec!["2C03".to_string()];
        matrix
            .close_channels(&["1A01".to_string()])
            .await
            .unwrap();
        assert_eq!(matrix.closed_channels().await.unwrap(), ["1A01", "2C03"]);
        matrix.open_all().await.unwrap();
        assert!(matrix.closed_channels().await.unwrap().is_empty());
    }
}
