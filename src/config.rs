//! Engine configuration loaded via Figment.
//!
//! Configuration is loaded from an optional TOML file plus environment
//! variables prefixed with `PQC_`, then handed into constructors by value;
//! the engine performs no ambient settings lookups. This covers the knobs
//! that are installation-wide rather than per-measurement: which instrument
//! model backs each source role, quick-ramp timing, soft-filter defaults and
//! whether the environment box is present.
//!
//! # Environment variable overrides
//!
//! ```text
//! PQC_GENERAL__QUICK_RAMP_DELAY="50ms"
//! PQC_INSTRUMENTS__HVSRC_MODEL="k2657a"
//! PQC_ENVIRONMENT__ENABLED=false
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::MeasureError;
use crate::filter::SoftFilter;

/// Which concrete model backs a source-measure role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceModel {
    /// Keithley 2410 (SCPI command set).
    K2410,
    /// Keithley 2657A (TSP command set).
    K2657a,
}

/// Timing defaults shared by all procedures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Per-step delay during ramp-to-start and ramp-to-zero.
    #[serde(with = "humantime_serde", default = "default_quick_ramp_delay")]
    pub quick_ramp_delay: Duration,
    /// Poll interval for the electrometer read-with-timeout loop.
    #[serde(with = "humantime_serde", default = "default_elm_poll_interval")]
    pub elm_poll_interval: Duration,
}

fn default_quick_ramp_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_elm_poll_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            quick_ramp_delay: default_quick_ramp_delay(),
            elm_poll_interval: default_elm_poll_interval(),
        }
    }
}

/// Instrument model selection per role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Model backing the high-voltage source role.
    #[serde(default = "default_hvsrc_model")]
    pub hvsrc_model: SourceModel,
    /// Model backing the general-purpose source role.
    #[serde(default = "default_vsrc_model")]
    pub vsrc_model: SourceModel,
}

fn default_hvsrc_model() -> SourceModel {
    SourceModel::K2410
}

fn default_vsrc_model() -> SourceModel {
    SourceModel::K2657a
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            hvsrc_model: default_hvsrc_model(),
            vsrc_model: default_vsrc_model(),
        }
    }
}

/// Environment box presence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// When false, environment readings report NaN instead of querying.
    #[serde(default = "default_env_enabled")]
    pub enabled: bool,
}

fn default_env_enabled() -> bool {
    true
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            enabled: default_env_enabled(),
        }
    }
}

/// Soft-filter defaults applied when a procedure enables filtering without
/// overriding the knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_filter_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_filter_threshold")]
    pub threshold: f64,
    #[serde(default = "default_filter_window")]
    pub window: usize,
}

fn default_filter_max_samples() -> usize {
    64
}

fn default_filter_threshold() -> f64 {
    0.005
}

fn default_filter_window() -> usize {
    2
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_samples: default_filter_max_samples(),
            threshold: default_filter_threshold(),
            window: default_filter_window(),
        }
    }
}

impl From<FilterConfig> for SoftFilter {
    fn from(cfg: FilterConfig) -> Self {
        SoftFilter {
            max_samples: cfg.max_samples,
            threshold: cfg.threshold,
            window: cfg.window,
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub instruments: InstrumentConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

impl Settings {
    /// Load settings from an optional TOML file plus `PQC_` environment
    /// overrides. Missing file sections fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, MeasureError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("PQC_").split("__"))
            .extract()
            .map_err(|err| MeasureError::Config(err.to_string()))
    }
}
