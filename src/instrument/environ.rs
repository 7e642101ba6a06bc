//! Environment box sensor (line protocol).
//!
//! The box answers `GET:PC_DATA ?` with one comma-separated snapshot line;
//! only three of its fields matter here: box humidity, box temperature and
//! chuck temperature. A disabled box reports NaN for everything so runs on
//! benches without one still produce complete rows.

use async_trait::async_trait;

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::{EnvReading, EnvironmentSensor};
use crate::instrument::scpi::ScpiTransport;

// Field indices within the PC_DATA snapshot.
const IDX_BOX_HUMIDITY: usize = 1;
const IDX_BOX_TEMPERATURE: usize = 2;
const IDX_CHUCK_TEMPERATURE: usize = 33;

/// Adapter mapping the [`EnvironmentSensor`] capability onto the box protocol.
pub struct EnvironBox<T> {
    transport: T,
    enabled: bool,
}

impl<T: ScpiTransport> EnvironBox<T> {
    pub fn new(transport: T, enabled: bool) -> Self {
        Self { transport, enabled }
    }
}

fn field(fields: &[&str], index: usize, line: &str) -> AppResult<f64> {
    fields
        .get(index)
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| MeasureError::Protocol(format!("malformed PC_DATA snapshot '{line}'")))
}

#[async_trait]
impl<T: ScpiTransport> EnvironmentSensor for EnvironBox<T> {
    async fn query(&mut self) -> AppResult<EnvReading> {
        if !self.enabled {
            return Ok(EnvReading::nan());
        }
        let line = self.transport.query("GET:PC_DATA ?").await?;
        let fields: Vec<&str> = line.split(',').collect();
        Ok(EnvReading {
            box_humidity: field(&fields, IDX_BOX_HUMIDITY, &line)?,
            box_temperature: field(&fields, IDX_BOX_TEMPERATURE, &line)?,
            chuck_temperature: field(&fields, IDX_CHUCK_TEMPERATURE, &line)?,
        })
    }
}
