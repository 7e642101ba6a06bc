//! Keithley 2410 source-measure unit (SCPI command set).

use async_trait::async_trait;

use crate::error::AppResult;
use crate::instrument::capabilities::{
    FilterType, RouteTerminal, SenseMode, SourceFunction, SourceMeter,
};
use crate::instrument::scpi::{next_error, parse_bool, parse_float, safe_write, ScpiTransport};

/// Adapter mapping the [`SourceMeter`] capability onto the 2410 command set.
pub struct K2410<T> {
    transport: T,
    function: SourceFunction,
}

impl<T: ScpiTransport> K2410<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            // Power-on default of the instrument.
            function: SourceFunction::Voltage,
        }
    }

    /// Sense quantity measured alongside the sourced one.
    fn sense_quantity(&self) -> &'static str {
        match self.function {
            SourceFunction::Voltage => "CURR",
            SourceFunction::Current => "VOLT",
        }
    }

    fn source_quantity(&self) -> &'static str {
        match self.function {
            SourceFunction::Voltage => "VOLT",
            SourceFunction::Current => "CURR",
        }
    }
}

#[async_trait]
impl<T: ScpiTransport> SourceMeter for K2410<T> {
    async fn identify(&mut self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }

    async fn reset(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*RST").await?;
        self.function = SourceFunction::Voltage;
        Ok(())
    }

    async fn clear(&mut self) -> AppResult<()> {
        safe_write(&mut self.transport, "*CLS").await
    }

    async fn set_function(&mut self, function: SourceFunction) -> AppResult<()> {
        self.function = function;
        let cmd = format!(":SOUR:FUNC:MODE {}", self.source_quantity());
        safe_write(&mut self.transport, &cmd).await?;
        // Measure the complement and report only that element on :READ?.
        let cmd = format!(":SENS:FUNC '{}'", self.sense_quantity());
        safe_write(&mut self.transport, &cmd).await?;
        let cmd = format!(":FORM:ELEM {}", self.sense_quantity());
        safe_write(&mut self.transport, &cmd).await
    }

    async fn level(&mut self) -> AppResult<f64> {
        let response = self
            .transport
            .query(&format!(":SOUR:{}:LEV?", self.source_quantity()))
            .await?;
        parse_float(&response)
    }

    async fn set_level(&mut self, value: f64) -> AppResult<()> {
        let cmd = format!(":SOUR:{}:LEV {value:E}", self.source_quantity());
        safe_write(&mut self.transport, &cmd).await
    }

    async fn set_compliance(&mut self, value: f64) -> AppResult<()> {
        let cmd = format!(":SENS:{}:PROT:LEV {value:E}", self.sense_quantity());
        safe_write(&mut self.transport, &cmd).await
    }

    async fn compliance_tripped(&mut self) -> AppResult<bool> {
        let response = self
            .transport
            .query(&format!(":SENS:{}:PROT:TRIP?", self.sense_quantity()))
            .await?;
        parse_bool(&response)
    }

    async fn output_enabled(&mut self) -> AppResult<bool> {
        let response = self.transport.query(":OUTP:STAT?").await?;
        parse_bool(&response)
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        safe_write(&mut self.transport, &format!(":OUTP:STAT {state}")).await
    }

    async fn set_sense_mode(&mut self, mode: SenseMode) -> AppResult<()> {
        let state = match mode {
            SenseMode::Remote => "ON",
            SenseMode::Local => "OFF",
        };
        safe_write(&mut self.transport, &format!(":SYST:RSEN {state}")).await
    }

    async fn set_route_terminal(&mut self, terminal: RouteTerminal) -> AppResult<()> {
        let name = match terminal {
            RouteTerminal::Front => "FRON",
            RouteTerminal::Rear => "REAR",
        };
        safe_write(&mut self.transport, &format!(":ROUT:TERM {name}")).await
    }

    async fn set_filter(&mut self, enabled: bool, count: u32, kind: FilterType) -> AppResult<()> {
        let tcon = match kind {
            FilterType::Repeat => "REP",
            FilterType::Moving => "MOV",
        };
        safe_write(&mut self.transport, &format!(":SENS:AVER:TCON {tcon}")).await?;
        safe_write(&mut self.transport, &format!(":SENS:AVER:COUN {count}")).await?;
        let state = if enabled { "ON" } else { "OFF" };
        safe_write(&mut self.transport, &format!(":SENS:AVER:STAT {state}")).await
    }

    async fn set_auto_range(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        let cmd = format!(":SENS:{}:RANG:AUTO {state}", self.sense_quantity());
        safe_write(&mut self.transport, &cmd).await
    }

    async fn set_range(&mut self, value: f64) -> AppResult<()> {
        let cmd = format!(":SENS:{}:RANG {value:E}", self.sense_quantity());
        safe_write(&mut self.transport, &cmd).await
    }

    async fn read_primary(&mut self) -> AppResult<f64> {
        let response = self.transport.query(":READ?").await?;
        parse_float(&response)
    }

    async fn read_secondary(&mut self) -> AppResult<f64> {
        self.level().await
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        next_error(&mut self.transport).await
    }
}
