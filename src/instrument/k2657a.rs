//! Keithley 2657A high-voltage source-measure unit (TSP command set).
//!
//! TSP instruments have no `:SYST:ERR?`; faults land in `errorqueue` and are
//! drained with `errorqueue.next()` after every state change.

use async_trait::async_trait;

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::{
    FilterType, RouteTerminal, SenseMode, SourceFunction, SourceMeter,
};
use crate::instrument::scpi::{parse_float, ScpiTransport};

/// Adapter mapping the [`SourceMeter`] capability onto 2657A TSP scripts.
pub struct K2657a<T> {
    transport: T,
    function: SourceFunction,
}

impl<T: ScpiTransport> K2657a<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            function: SourceFunction::Voltage,
        }
    }

    /// `v` for a voltage source, `i` for a current source.
    fn source_suffix(&self) -> &'static str {
        match self.function {
            SourceFunction::Voltage => "v",
            SourceFunction::Current => "i",
        }
    }

    fn measure_suffix(&self) -> &'static str {
        match self.function {
            SourceFunction::Voltage => "i",
            SourceFunction::Current => "v",
        }
    }

    async fn pop_error(&mut self) -> AppResult<(i32, String)> {
        let count = parse_float(&self.transport.query("print(errorqueue.count)").await?)?;
        if count < 1.0 {
            return Ok((0, "Queue Is Empty".to_string()));
        }
        let response = self.transport.query("print(errorqueue.next())").await?;
        // "code<TAB>message<TAB>severity<TAB>node", code printed as a float.
        let mut fields = response.split('\t');
        let code = fields
            .next()
            .and_then(|c| c.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                MeasureError::Protocol(format!("malformed errorqueue entry '{response}'"))
            })?;
        let message = fields.next().unwrap_or("").trim().to_string();
        Ok((code as i32, message))
    }

    /// Write one TSP statement, synchronize, then verify the error queue.
    async fn safe_write(&mut self, command: &str) -> AppResult<()> {
        self.transport.write(command).await?;
        self.transport.query("*OPC?").await?;
        let (code, message) = self.pop_error().await?;
        if code != 0 {
            return Err(MeasureError::Instrument { code, message });
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ScpiTransport> SourceMeter for K2657a<T> {
    async fn identify(&mut self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.safe_write("smua.reset()").await?;
        self.function = SourceFunction::Voltage;
        Ok(())
    }

    async fn clear(&mut self) -> AppResult<()> {
        self.transport.write("errorqueue.clear()").await?;
        self.transport.query("*OPC?").await?;
        Ok(())
    }

    async fn set_function(&mut self, function: SourceFunction) -> AppResult<()> {
        self.function = function;
        let constant = match function {
            SourceFunction::Voltage => "smua.OUTPUT_DCVOLTS",
            SourceFunction::Current => "smua.OUTPUT_DCAMPS",
        };
        self.safe_write(&format!("smua.source.func = {constant}"))
            .await
    }

    async fn level(&mut self) -> AppResult<f64> {
        let response = self
            .transport
            .query(&format!("print(smua.source.level{})", self.source_suffix()))
            .await?;
        parse_float(&response)
    }

    async fn set_level(&mut self, value: f64) -> AppResult<()> {
        self.safe_write(&format!(
            "smua.source.level{} = {value:E}",
            self.source_suffix()
        ))
        .await
    }

    async fn set_compliance(&mut self, value: f64) -> AppResult<()> {
        self.safe_write(&format!(
            "smua.source.limit{} = {value:E}",
            self.measure_suffix()
        ))
        .await
    }

    async fn compliance_tripped(&mut self) -> AppResult<bool> {
        let response = self
            .transport
            .query("print(smua.source.compliance)")
            .await?;
        match response.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(MeasureError::Protocol(format!(
                "expected a boolean, got '{other}'"
            ))),
        }
    }

    async fn output_enabled(&mut self) -> AppResult<bool> {
        let response = self.transport.query("print(smua.source.output)").await?;
        Ok(parse_float(&response)? != 0.0)
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> AppResult<()> {
        let constant = if enabled {
            "smua.OUTPUT_ON"
        } else {
            "smua.OUTPUT_OFF"
        };
        self.safe_write(&format!("smua.source.output = {constant}"))
            .await
    }

    async fn set_sense_mode(&mut self, mode: SenseMode) -> AppResult<()> {
        let constant = match mode {
            SenseMode::Remote => "smua.SENSE_REMOTE",
            SenseMode::Local => "smua.SENSE_LOCAL",
        };
        self.safe_write(&format!("smua.sense = {constant}")).await
    }

    async fn set_route_terminal(&mut self, _terminal: RouteTerminal) -> AppResult<()> {
        // Single fixed terminal pair on this model.
        Ok(())
    }

    async fn set_filter(&mut self, enabled: bool, count: u32, kind: FilterType) -> AppResult<()> {
        let constant = match kind {
            FilterType::Repeat => "smua.FILTER_REPEAT_AVG",
            FilterType::Moving => "smua.FILTER_MOVING_AVG",
        };
        self.safe_write(&format!("smua.measure.filter.type = {constant}"))
            .await?;
        self.safe_write(&format!("smua.measure.filter.count = {count}"))
            .await?;
        let state = if enabled {
            "smua.FILTER_ON"
        } else {
            "smua.FILTER_OFF"
        };
        self.safe_write(&format!("smua.measure.filter.enable = {state}"))
            .await
    }

    async fn set_auto_range(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled {
            "smua.AUTORANGE_ON"
        } else {
            "smua.AUTORANGE_OFF"
        };
        self.safe_write(&format!(
            "smua.measure.autorange{} = {state}",
            self.measure_suffix()
        ))
        .await
    }

    async fn set_range(&mut self, value: f64) -> AppResult<()> {
        self.safe_write(&format!(
            "smua.measure.range{} = {value:E}",
            self.measure_suffix()
        ))
        .await
    }

    async fn read_primary(&mut self) -> AppResult<f64> {
        let response = self
            .transport
            .query(&format!("print(smua.measure.{}())", self.measure_suffix()))
            .await?;
        parse_float(&response)
    }

    async fn read_secondary(&mut self) -> AppResult<f64> {
        let response = self
            .transport
            .query(&format!("print(smua.measure.{}())", self.source_suffix()))
            .await?;
        parse_float(&response)
    }

    async fn last_error(&mut self) -> AppResult<(i32, String)> {
        self.pop_error().await
    }
}
