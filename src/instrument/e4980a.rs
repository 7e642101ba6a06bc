//! Keysight E4980A LCR meter (SCPI command set).
//!
//! Configured for bus-triggered CpRp measurements with an internal DC bias
//! source; one acquisition is `:TRIG:IMM` followed by `:FETC?`.

use async_trait::async_trait;

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::{Aperture, CorrectionMode, LcrMeter, LcrSetup};
use crate::instrument::scpi::{next_error, parse_bool, safe_write, ScpiTransport};

/// Adapter mapping the [`LcrMeter`] capability onto the E4980A command set.
pub struct E4980a<T> {
    transport: T,
}

impl<T: ScpiTransport> E4980a<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: ScpiTransport> LcrMeter for E4980a<T> {
    async fn identify(&mut self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }

    async fn reset(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*RST").await
    }

    async fn clear(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*CLS").await
    }

    async fn configure(&mut self, setup: &LcrSetup) -> AppResult<()> {
        safe_write(&mut self.transport, ":SYST:BEEP:STAT 0").await?;
        let alc = if setup.auto_level_control { "1" } else { "0" };
        safe_write(&mut self.transport, &format!(":AMPL:ALC {alc}")).await?;
        safe_write(
            &mut self.transport,
            &format!(":VOLT {:E}V", setup.amplitude),
        )
        .await?;
        safe_write(
            &mut self.transport,
            &format!(":FREQ {:.0}HZ", setup.frequency),
        )
        .await?;
        safe_write(&mut self.transport, ":FUNC:IMP:RANG:AUTO ON").await?;
        safe_write(&mut self.transport, ":FUNC:IMP:TYPE CPRP").await?;
        let aperture = match setup.aperture {
            Aperture::Short => "SHOR",
            Aperture::Medium => "MED",
            Aperture::Long => "LONG",
        };
        safe_write(
            &mut self.transport,
            &format!(":APER {aperture},{}", setup.averaging_rate),
        )
        .await?;
        let method = match setup.correction_mode {
            CorrectionMode::Single => "SING",
            CorrectionMode::Multi => "MULT",
        };
        safe_write(&mut self.transport, &format!(":CORR:METH {method}")).await?;
        if setup.correction_mode == CorrectionMode::Multi {
            safe_write(
                &mut self.transport,
                &format!(":CORR:USE:CHAN {}", setup.correction_channel),
            )
            .await?;
        }
        // Bus triggering so each ramp step fetches exactly one reading.
        safe_write(&mut self.transport, ":INIT:CONT OFF").await?;
        safe_write(&mut self.transport, ":TRIG:SOUR BUS").await
    }

    async fn trigger_and_fetch(&mut self) -> AppResult<(f64, f64)> {
        safe_write(&mut self.transport, ":TRIG:IMM").await?;
        let response = self.transport.query(":FETC?").await?;
        let mut fields = response.split(',');
        let primary = fields
            .next()
            .map(str::trim)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| MeasureError::Protocol(format!("malformed fetch '{response}'")))?;
        let secondary = fields
            .next()
            .map(str::trim)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| MeasureError::Protocol(format!("malformed fetch '{response}'")))?;
        Ok((primary, secondary))
    }

    async fn bias_enabled(&mut self) -> AppResult<bool> {
        let response = self.transport.query(":BIAS:STAT?").await?;
        parse_bool(&response)
    }

    async fn set_bias_enabled(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "1" } else { "0" };
        safe_write(&mut self.transport, &format!(":BIAS:STAT {state}")).await
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        next_error(&mut self.transport).await
    }
}
