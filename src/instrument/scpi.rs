//! Message-based transport and the write-then-verify discipline.
//!
//! Concrete adapters are generic over [`ScpiTransport`] so they can run
//! against TCP sockets, serial bridges or scripted test transports without
//! changing any command logic. Every state-changing command goes through
//! [`safe_write`]: write, synchronize with `*OPC?`, then drain the device
//! error queue and surface a nonzero entry as a fault instead of letting it
//! poison a later step.

use async_trait::async_trait;

use crate::error::{AppResult, MeasureError};

/// Line-oriented command transport to one instrument.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send one command, no response expected.
    async fn write(&mut self, command: &str) -> AppResult<()>;
    /// Send one query and read the response line, trimmed.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}

/// Parse a `:SYST:ERR?` style response of the form `code,"message"`.
pub(crate) fn parse_error_response(response: &str) -> AppResult<(i32, String)> {
    let (code, message) = response
        .split_once(',')
        .ok_or_else(|| MeasureError::Protocol(format!("malformed error response '{response}'")))?;
    let code: i32 = code
        .trim()
        .parse()
        .map_err(|_| MeasureError::Protocol(format!("malformed error code '{code}'")))?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

/// Parse a numeric response, tolerating trailing fields after a comma.
pub(crate) fn parse_float(response: &str) -> AppResult<f64> {
    let first = response.split(',').next().unwrap_or(response).trim();
    first
        .parse()
        .map_err(|_| MeasureError::Protocol(format!("expected a number, got '{response}'")))
}

/// Parse a `0`/`1` (or `ON`/`OFF`) boolean response.
pub(crate) fn parse_bool(response: &str) -> AppResult<bool> {
    match response.trim() {
        "0" | "OFF" | "false" => Ok(false),
        "1" | "ON" | "true" => Ok(true),
        other => Err(MeasureError::Protocol(format!(
            "expected a boolean, got '{other}'"
        ))),
    }
}

/// Pop the head of the device error queue; `(0, ..)` means the queue is clean.
pub(crate) async fn next_error<T: ScpiTransport + ?Sized>(
    transport: &mut T,
) -> AppResult<(i32, String)> {
    let response = transport.query(":SYST:ERR?").await?;
    parse_error_response(&response)
}

/// Fail with the device's own diagnostics if the error queue is non-empty.
pub(crate) async fn check_error<T: ScpiTransport + ?Sized>(transport: &mut T) -> AppResult<()> {
    let (code, message) = next_error(transport).await?;
    if code != 0 {
        return Err(MeasureError::Instrument { code, message });
    }
    Ok(())
}

/// Write one command, wait for completion, then verify the error queue.
pub(crate) async fn safe_write<T: ScpiTransport + ?Sized>(
    transport: &mut T,
    command: &str,
) -> AppResult<()> {
    transport.write(command).await?;
    transport.query("*OPC?").await?;
    check_error(transport).await
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;

    #[test]
    fn test_parse_error_response() {
        let (code, message) = parse_error_response("-113,\"Undefined header\"").unwrap();
        assert_eq!(code, -113);
        assert_eq!(message, "Undefined header");
        assert!(parse_error_response("garbage").is_err());
    }

    #[test]
    fn test_parse_float_with_trailing_fields() {
        assert_eq!(parse_float("+1.234560E-09,+0.1,9.91e37").unwrap(), 1.23456e-9);
        assert!(parse_float("NOTANUMBER").is_err());
    }

    #[tokio::test]
    async fn test_safe_write_raises_device_error() {
        let mut transport = ScriptedTransport::new();
        transport.respond(":SYST:ERR?", "-222,\"Parameter data out of range\"");
        let err = safe_write(&mut transport, ":SOUR:VOLT:LEV 1E6")
            .await
            .unwrap_err();
        match err {
            MeasureError::Instrument { code, message } => {
                assert_eq!(code, -222);
                assert_eq!(message, "Parameter data out of range");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The command, the completion sync and the error poll all went out.
        assert_eq!(transport.log, [":SOUR:VOLT:LEV 1E6", "*OPC?", ":SYST:ERR?"]);
    }

    #[tokio::test]
    async fn test_safe_write_clean_queue() {
        let mut transport = ScriptedTransport::new();
        safe_write(&mut transport, "*RST").await.unwrap();
    }
}
