//! Keithley 707B switching matrix (TSP command set).

use async_trait::async_trait;

use crate::error::{AppResult, MeasureError};
use crate::instrument::capabilities::SwitchingMatrix;
use crate::instrument::scpi::{parse_float, ScpiTransport};

/// Adapter mapping the [`SwitchingMatrix`] capability onto 707B TSP scripts.
pub struct K707b<T> {
    transport: T,
}

impl<T: ScpiTransport> K707b<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn check_error(&mut self) -> AppResult<()> {
        let count = parse_float(&self.transport.query("print(errorqueue.count)").await?)?;
        if count < 1.0 {
            return Ok(());
        }
        let response = self.transport.query("print(errorqueue.next())").await?;
        let mut fields = response.split('\t');
        let code = fields
            .next()
            .and_then(|c| c.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                MeasureError::Protocol(format!("malformed errorqueue entry '{response}'"))
            })?;
        let message = fields.next().unwrap_or("").trim().to_string();
        Err(MeasureError::Instrument {
            code: code as i32,
            message,
        })
    }

    async fn safe_write(&mut self, command: &str) -> AppResult<()> {
        self.transport.write(command).await?;
        self.transport.query("*OPC?").await?;
        self.check_error().await
    }
}

#[async_trait]
impl<T: ScpiTransport> SwitchingMatrix for K707b<T> {
    async fn closed_channels(&mut self) -> AppResult<Vec<String>> {
        let response = self
            .transport
            .query("print(channel.getclose(\"allslots\"))")
            .await?;
        let response = response.trim();
        if response.is_empty() || response == "nil" {
            return Ok(Vec::new());
        }
        Ok(response.split(';').map(|c| c.trim().to_string()).collect())
    }

    async fn close_channels(&mut self, channels: &[String]) -> AppResult<()> {
        if channels.is_empty() {
            return Ok(());
        }
        self.safe_write(&format!("channel.close(\"{}\")", channels.join(",")))
            .await
    }

    async fn open_all(&mut self) -> AppResult<()> {
        self.safe_write("channel.open(\"allslots\")").await
    }
}
