//! Instrument capability traits, transports and adapters.

pub mod capabilities;
pub mod e4980a;
pub mod environ;
pub mod factory;
pub mod k2410;
pub mod k2657a;
pub mod k6517b;
pub mod k707b;
pub mod mock;
pub mod scpi;

pub use capabilities::{
    Aperture, CorrectionMode, Electrometer, ElectrometerSetup, EnvReading, EnvironmentSensor,
    FilterType, LcrMeter, LcrSetup, RouteTerminal, SenseMode, SourceFunction, SourceMeter,
    SwitchingMatrix,
};
pub use scpi::ScpiTransport;
