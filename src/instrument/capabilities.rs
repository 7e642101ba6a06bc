//! Capability traits for the instrument families the ramp engine drives.
//!
//! The engine depends only on these traits, never on concrete device types.
//! Each trait is the minimum operation surface one instrument family must
//! expose; concrete adapters (K2410, K2657A, E4980A, ...) translate the
//! operations into their device command sets and normalize device faults
//! into [`MeasureError::Instrument`](crate::error::MeasureError).
//!
//! Methods take `&mut self`: an instrument handle is exclusively owned by
//! the running measurement for the duration of one `run()`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MeasureError};

/// Quantity a source-measure unit is sourcing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    Voltage,
    Current,
}

/// Two- or four-wire sensing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenseMode {
    Local,
    Remote,
}

/// Hardware averaging filter type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Repeat,
    Moving,
}

impl FromStr for SenseMode {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SenseMode::Local),
            "remote" => Ok(SenseMode::Remote),
            other => Err(MeasureError::InvalidParameter(format!(
                "unknown sense mode '{other}'"
            ))),
        }
    }
}

impl FromStr for FilterType {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repeat" => Ok(FilterType::Repeat),
            "moving" => Ok(FilterType::Moving),
            other => Err(MeasureError::InvalidParameter(format!(
                "unknown filter type '{other}'"
            ))),
        }
    }
}

/// Front or rear terminal routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTerminal {
    Front,
    Rear,
}

impl FromStr for RouteTerminal {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(RouteTerminal::Front),
            "rear" => Ok(RouteTerminal::Rear),
            other => Err(MeasureError::InvalidParameter(format!(
                "unknown route terminal '{other}'"
            ))),
        }
    }
}

/// LCR integration aperture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aperture {
    Short,
    Medium,
    Long,
}

impl FromStr for Aperture {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(Aperture::Short),
            "medium" => Ok(Aperture::Medium),
            "long" => Ok(Aperture::Long),
            other => Err(MeasureError::InvalidParameter(format!(
                "unknown aperture '{other}'"
            ))),
        }
    }
}

/// LCR open-correction mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMode {
    Single,
    Multi,
}

impl FromStr for CorrectionMode {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(CorrectionMode::Single),
            "multi" => Ok(CorrectionMode::Multi),
            other => Err(MeasureError::InvalidParameter(format!(
                "unknown correction mode '{other}'"
            ))),
        }
    }
}

/// Complete LCR measurement configuration applied during initialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LcrSetup {
    /// Test signal amplitude in volts.
    pub amplitude: f64,
    /// Test frequency in hertz.
    pub frequency: f64,
    pub aperture: Aperture,
    pub averaging_rate: u32,
    pub auto_level_control: bool,
    pub correction_mode: CorrectionMode,
    pub correction_channel: u32,
}

/// Electrometer configuration applied during initialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectrometerSetup {
    pub auto_range: bool,
    /// Integration rate in power line cycles.
    pub nplc: f64,
    pub filter_enabled: bool,
    pub filter_count: u32,
}

/// Snapshot from the environment box.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EnvReading {
    /// Box air temperature in degC.
    pub box_temperature: f64,
    /// Chuck temperature in degC.
    pub chuck_temperature: f64,
    /// Box relative humidity in %.
    pub box_humidity: f64,
}

impl EnvReading {
    /// All-NaN reading used when the environment box is disabled.
    pub fn nan() -> Self {
        Self {
            box_temperature: f64::NAN,
            chuck_temperature: f64::NAN,
            box_humidity: f64::NAN,
        }
    }
}

/// Source capability: SMU and HV-SMU models.
///
/// `read_primary` is the measured complement of the sourced quantity
/// (current for a voltage source); `read_secondary` is the sourced quantity
/// readback.
#[async_trait]
pub trait SourceMeter: Send {
    async fn identify(&mut self) -> AppResult<String>;
    async fn reset(&mut self) -> AppResult<()>;
    async fn clear(&mut self) -> AppResult<()>;

    async fn set_function(&mut self, function: SourceFunction) -> AppResult<()>;
    /// Present output level of the active source function.
    async fn level(&mut self) -> AppResult<f64>;
    async fn set_level(&mut self, value: f64) -> AppResult<()>;

    /// Protection limit on the measured quantity.
    async fn set_compliance(&mut self, value: f64) -> AppResult<()>;
    /// Read fresh from the instrument; never cached across steps.
    async fn compliance_tripped(&mut self) -> AppResult<bool>;

    async fn output_enabled(&mut self) -> AppResult<bool>;
    async fn set_output_enabled(&mut self, enabled: bool) -> AppResult<()>;

    async fn set_sense_mode(&mut self, mode: SenseMode) -> AppResult<()>;
    async fn set_route_terminal(&mut self, terminal: RouteTerminal) -> AppResult<()>;
    async fn set_filter(&mut self, enabled: bool, count: u32, kind: FilterType) -> AppResult<()>;
    async fn set_auto_range(&mut self, enabled: bool) -> AppResult<()>;
    async fn set_range(&mut self, value: f64) -> AppResult<()>;

    async fn read_primary(&mut self) -> AppResult<f64>;
    async fn read_secondary(&mut self) -> AppResult<f64>;

    /// Most recent `(code, message)` from the device error queue.
    async fn last_error(&mut self) -> AppResult<(i32, String)>;
}

/// Impedance capability: LCR meters reporting a primary/secondary pair
/// (capacitance-like / resistance-like for CpRp).
#[async_trait]
pub trait LcrMeter: Send {
    async fn identify(&mut self) -> AppResult<String>;
    async fn reset(&mut self) -> AppResult<()>;
    async fn clear(&mut self) -> AppResult<()>;
    async fn configure(&mut self, setup: &LcrSetup) -> AppResult<()>;
    /// Trigger one acquisition and fetch `(primary, secondary)`.
    async fn trigger_and_fetch(&mut self) -> AppResult<(f64, f64)>;

    /// Internal DC bias output state, read fresh from the device.
    async fn bias_enabled(&mut self) -> AppResult<bool>;
    async fn set_bias_enabled(&mut self, enabled: bool) -> AppResult<()>;

    async fn last_error(&mut self) -> AppResult<(i32, String)>;
}

#[async_trait]
impl crate::filter::PairSource for Box<dyn LcrMeter> {
    async fn read_pair(&mut self) -> AppResult<(f64, f64)> {
        self.trigger_and_fetch().await
    }
}

/// Electrometer capability for picoampere-scale reads.
#[async_trait]
pub trait Electrometer: Send {
    async fn identify(&mut self) -> AppResult<String>;
    async fn reset(&mut self) -> AppResult<()>;
    async fn clear(&mut self) -> AppResult<()>;
    async fn set_zero_check(&mut self, enabled: bool) -> AppResult<()>;
    async fn zero_check(&mut self) -> AppResult<bool>;
    async fn configure(&mut self, setup: &ElectrometerSetup) -> AppResult<()>;
    /// Initiate a reading and poll the completion flag at a fixed interval
    /// until set or `timeout` elapses; fails with `Timeout` when exceeded.
    async fn read_with_timeout(&mut self, timeout: Duration) -> AppResult<f64>;
    async fn last_error(&mut self) -> AppResult<(i32, String)>;
}

/// Environment box capability.
#[async_trait]
pub trait EnvironmentSensor: Send {
    /// Current readings; a disabled sensor reports NaN, never errors.
    async fn query(&mut self) -> AppResult<EnvReading>;
}

/// Relay switching matrix capability.
#[async_trait]
pub trait SwitchingMatrix: Send {
    /// Channels currently closed, in device order.
    async fn closed_channels(&mut self) -> AppResult<Vec<String>>;
    async fn close_channels(&mut self, channels: &[String]) -> AppResult<()>;
    async fn open_all(&mut self) -> AppResult<()>;
}
