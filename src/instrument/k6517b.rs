//! Keithley 6517B electrometer (SCPI command set).
//!
//! Readings are initiated with `:INIT` and collected by polling the standard
//! event register for the operation-complete bit, so a slow integration never
//! blocks the transport and a wedged acquisition surfaces as `Timeout`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::{Electrometer, ElectrometerSetup};
use crate::instrument::scpi::{next_error, parse_bool, parse_float, safe_write, ScpiTransport};

/// Adapter mapping the [`Electrometer`] capability onto the 6517B command set.
pub struct K6517b<T> {
    transport: T,
    poll_interval: Duration,
}

impl<T: ScpiTransport> K6517b<T> {
    pub fn new(transport: T, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
        }
    }
}

#[async_trait]
impl<T: ScpiTransport> Electrometer for K6517b<T> {
    async fn identify(&mut self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }

    async fn reset(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*RST").await
    }

    async fn clear(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*CLS").await
    }

    async fn set_zero_check(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        safe_write(&mut self.transport, &format!(":SYST:ZCH {state}")).await
    }

    async fn zero_check(&mut self) -> AppResult<bool> {
        let response = self.transport.query(":SYST:ZCH?").await?;
        parse_bool(&response)
    }

    async fn configure(&mut self, setup: &ElectrometerSetup) -> AppResult<()> {
        safe_write(&mut self.transport, ":SENS:FUNC 'CURR'").await?;
        safe_write(
            &mut self.transport,
            &format!(":SENS:CURR:NPLC {:.2}", setup.nplc),
        )
        .await?;
        let auto = if setup.auto_range { "ON" } else { "OFF" };
        safe_write(
            &mut self.transport,
            &format!(":SENS:CURR:RANG:AUTO {auto}"),
        )
        .await?;
        safe_write(
            &mut self.transport,
            &format!(":SENS:CURR:AVER:COUN {}", setup.filter_count),
        )
        .await?;
        let filter = if setup.filter_enabled { "ON" } else { "OFF" };
        safe_write(
            &mut self.transport,
            &format!(":SENS:CURR:AVER:STAT {filter}"),
        )
        .await?;
        // One reading per :INIT.
        safe_write(&mut self.transport, ":INIT:CONT OFF").await?;
        safe_write(&mut self.transport, ":TRIG:COUN 1").await?;
        safe_write(&mut self.transport, ":FORM:ELEM READ").await
    }

    async fn read_with_timeout(&mut self, timeout: Duration) -> AppResult<f64> {
        let deadline = Instant::now() + timeout;
        let interval = self.poll_interval.min(timeout);
        // Arm the operation-complete bit, then kick off the acquisition.
        self.transport.write("*CLS").await?;
        self.transport.write("*OPC").await?;
        self.transport.write(":INIT").await?;
        loop {
            let esr = parse_float(&self.transport.query("*ESR?").await?)? as u32;
            if esr & 0x1 != 0 {
                let response = self.transport.query(":FETC?").await?;
                return parse_float(&response);
            }
            if Instant::now() >= deadline {
                return Err(MeasureError::Timeout(format!(
                    "electrometer reading exceeded {timeout:?}"
                )));
            }
            sleep(interval).await;
        }
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        next_error(&mut self.transport).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::scpi::testing::ScriptedTransport;

    #[tokio::test]
    async fn test_reading_polls_until_complete() {
        let mut elm = K6517b::new(ScriptedTransport::new(), Duration::from_millis(1));
        elm.transport.respond("*ESR?", "0");
        elm.transport.respond("*ESR?", "0");
        elm.transport.respond("*ESR?", "1");
        elm.transport.respond(":FETC?", "-4.210000E-12");
        let value = elm.read_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, -4.21e-12);
        assert_eq!(
            elm.transport.log.iter().filter(|c| *c == "*ESR?").count(),
            3
        );
        // Acquisition was armed exactly once.
        assert_eq!(elm.transport.log.iter().filter(|c| *c == ":INIT").count(), 1);
    }

    #[tokio::test]
    async fn test_reading_times_out() {
        let mut elm = K6517b::new(ScriptedTransport::new(), Duration::from_millis(1));
        // The scripted default answers "0" forever, so the bit never sets.
        tokio::time::pause();
        let result = elm.read_with_timeout(Duration::from_millis(5)).await;
        assert!(matches!(result, Err(MeasureError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_configure_command_mapping() {
        let mut elm = K6517b::new(ScriptedTransport::new(), Duration::from_millis(250));
        elm.configure(&ElectrometerSetup {
            auto_range: true,
            nplc: 1.0,
            filter_enabled: true,
            filter_count: 10,
        })
        .await
        .unwrap();
        let log = &elm.transport.log;
        assert!(log.contains(&":SENS:FUNC 'CURR'".to_string()));
        assert!(log.contains(&":SENS:CURR:NPLC 1.00".to_string()));
        assert!(log.contains(&":SENS:CURR:AVER:COUN 10".to_string()));
    }

    #[tokio::test]
    async fn test_zero_check_commands() {
        let mut elm = K6517b::new(ScriptedTransport::new(), Duration::from_millis(250));
        elm.set_zero_check(true).await.unwrap();
        assert!(elm.transport.log.contains(&":SYST:ZCH ON".to_string()));
        elm.transport.respond(":SYST:ZCH?", "1");
        assert!(elm.zero_check().await.unwrap());
    }
}
