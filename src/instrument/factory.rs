//! Concrete adapter construction from settings.
//!
//! Call sites hand in a transport per device and the `[instruments]`,
//! `[environment]` and `[general]` sections pick the adapter and its knobs;
//! everything downstream depends only on the capability traits.

use crate::config::{EnvironmentConfig, GeneralConfig, InstrumentConfig, SourceModel};
use crate::instrument::capabilities::{
    Electrometer, EnvironmentSensor, LcrMeter, SourceMeter, SwitchingMatrix,
};
use crate::instrument::e4980a::E4980a;
use crate::instrument::environ::EnvironBox;
use crate::instrument::k2410::K2410;
use crate::instrument::k2657a::K2657a;
use crate::instrument::k6517b::K6517b;
use crate::instrument::k707b::K707b;
use crate::instrument::scpi::ScpiTransport;

/// Build the source meter backing one role.
pub fn source_meter<T>(model: SourceModel, transport: T) -> Box<dyn SourceMeter>
where
    T: ScpiTransport + 'static,
{
    match model {
        SourceModel::K2410 => Box::new(K2410::new(transport)),
        SourceModel::K2657a => Box::new(K2657a::new(transport)),
    }
}

/// High-voltage source role per the `[instruments]` section.
pub fn hv_source<T>(config: &InstrumentConfig, transport: T) -> Box<dyn SourceMeter>
where
    T: ScpiTransport + 'static,
{
    source_meter(config.hvsrc_model, transport)
}

/// General-purpose source role per the `[instruments]` section.
pub fn v_source<T>(config: &InstrumentConfig, transport: T) -> Box<dyn SourceMeter>
where
    T: ScpiTransport + 'static,
{
    source_meter(config.vsrc_model, transport)
}

pub fn lcr_meter<T>(transport: T) -> Box<dyn LcrMeter>
where
    T: ScpiTransport + 'static,
{
    Box::new(E4980a::new(transport))
}

/// Electrometer polling at the configured interval.
pub fn electrometer<T>(general: &GeneralConfig, transport: T) -> Box<dyn Electrometer>
where
    T: ScpiTransport + 'static,
{
    Box::new(K6517b::new(transport, general.elm_poll_interval))
}

/// Environment box; a disabled box reports NaN without going on the wire.
pub fn environment_sensor<T>(config: &EnvironmentConfig, transport: T) -> Box<dyn EnvironmentSensor>
where
    T: ScpiTransport + 'static,
{
    Box::new(EnvironBox::new(transport, config.enabled))
}

pub fn switching_matrix<T>(transport: T) -> Box<dyn SwitchingMatrix>
where
    T: ScpiTransport + 'static,
{
    Box::new(K707b::new(transport))
}
