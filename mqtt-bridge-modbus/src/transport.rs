//! Serial Modbus RTU transport.
//!
//! The poller only sees [`RegisterReader`] and [`PortOpener`]; the real
//! implementations wrap `tokio-serial` and `tokio-modbus`.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rtugate_common::StatusCode;
use thiserror::Error;
use tokio_modbus::ExceptionCode;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use crate::config::{LineConfig, Parity, RegisterType};

/// Failure of a single Modbus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("no response")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("exception {1}")]
    Exception(StatusCode, String),
    #[error("port failure: {0}")]
    Port(String),
    #[error("{0}")]
    Other(String),
}

impl TransactionError {
    /// Status code reported for the parameters covered by the transaction.
    pub fn status(&self) -> StatusCode {
        match self {
            TransactionError::Timeout => StatusCode::Timeout,
            TransactionError::InvalidResponse(_) => StatusCode::CrcError,
            TransactionError::Exception(status, _) => *status,
            TransactionError::Port(_) => StatusCode::PortBusy,
            TransactionError::Other(_) => StatusCode::UnknownError,
        }
    }

    /// The serial port itself failed and must be reopened.
    pub fn is_port_failure(&self) -> bool {
        matches!(self, TransactionError::Port(_))
    }
}

/// The serial port could not be opened.
#[derive(Debug, Clone, Error)]
#[error("failed to open {device}: {message}")]
pub struct PortOpenError {
    pub device: String,
    pub message: String,
}

/// Reads registers from any unit on an open line.
///
/// Bit registers are returned as one `0`/`1` word per bit.
#[async_trait]
pub trait RegisterReader: Send {
    async fn read(
        &mut self,
        unit_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransactionError>;
}

/// Opens the port of a line.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, line: &LineConfig) -> Result<Box<dyn RegisterReader>, PortOpenError>;
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, line: &LineConfig) -> Result<Box<dyn RegisterReader>, PortOpenError> {
        let parity = match line.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let stop_bits = match line.stopbits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match line.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(&line.device, line.baudrate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .timeout(line.timeout());

        let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| PortOpenError {
            device: line.device.clone(),
            message: e.to_string(),
        })?;

        Ok(Box::new(RtuReader {
            ctx: rtu::attach_slave(serial, Slave(1)),
            timeout: line.timeout(),
        }))
    }
}

/// Modbus RTU client bound to one serial port.
struct RtuReader {
    ctx: Context,
    timeout: Duration,
}

#[async_trait]
impl RegisterReader for RtuReader {
    async fn read(
        &mut self,
        unit_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransactionError> {
        self.ctx.set_slave(Slave(unit_id));
        let timeout = self.timeout;

        match register_type {
            RegisterType::Coil => transact(timeout, self.ctx.read_coils(start, count))
                .await
                .map(bits_to_words),
            RegisterType::Discrete => {
                transact(timeout, self.ctx.read_discrete_inputs(start, count))
                    .await
                    .map(bits_to_words)
            }
            RegisterType::Holding => {
                transact(timeout, self.ctx.read_holding_registers(start, count)).await
            }
            RegisterType::Input => {
                transact(timeout, self.ctx.read_input_registers(start, count)).await
            }
        }
    }
}

fn bits_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

async fn transact<T, F>(timeout: Duration, request: F) -> Result<T, TransactionError>
where
    F: Future<Output = tokio_modbus::Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Err(_) => Err(TransactionError::Timeout),
        Ok(Err(e)) => Err(classify_error(e)),
        Ok(Ok(Err(code))) => Err(classify_exception(code)),
        Ok(Ok(Ok(values))) => Ok(values),
    }
}

fn classify_error(err: tokio_modbus::Error) -> TransactionError {
    match err {
        tokio_modbus::Error::Transport(e) => classify_io(e),
        tokio_modbus::Error::Protocol(e) => TransactionError::InvalidResponse(e.to_string()),
    }
}

fn classify_io(err: io::Error) -> TransactionError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransactionError::Timeout,
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            TransactionError::InvalidResponse(err.to_string())
        }
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => TransactionError::Port(err.to_string()),
        _ => TransactionError::Other(err.to_string()),
    }
}

fn classify_exception(code: ExceptionCode) -> TransactionError {
    let status = match code {
        ExceptionCode::IllegalFunction => StatusCode::IllegalFunction,
        ExceptionCode::IllegalDataAddress => StatusCode::IllegalDataAddress,
        ExceptionCode::IllegalDataValue => StatusCode::IllegalDataValue,
        ExceptionCode::ServerDeviceFailure => StatusCode::SlaveDeviceFailure,
        _ => StatusCode::UnknownError,
    };
    TransactionError::Exception(status, format!("{:?}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_mapping() {
        assert_eq!(
            classify_exception(ExceptionCode::IllegalDataAddress).status(),
            StatusCode::IllegalDataAddress
        );
        assert_eq!(
            classify_exception(ExceptionCode::ServerDeviceFailure).status(),
            StatusCode::SlaveDeviceFailure
        );
        assert_eq!(
            classify_exception(ExceptionCode::Acknowledge).status(),
            StatusCode::UnknownError
        );
    }

    #[test]
    fn test_io_mapping() {
        let timeout = classify_io(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert_eq!(timeout.status(), StatusCode::Timeout);
        assert!(!timeout.is_port_failure());

        let crc = classify_io(io::Error::new(io::ErrorKind::InvalidData, "bad crc"));
        assert_eq!(crc.status(), StatusCode::CrcError);

        let gone = classify_io(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        assert_eq!(gone.status(), StatusCode::PortBusy);
        assert!(gone.is_port_failure());
    }

    #[test]
    fn test_bits_to_words() {
        assert_eq!(bits_to_words(vec![true, false, true]), vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_open_missing_device() {
        let line: LineConfig =
            json5::from_str(r#"{ name: "l", device: "/dev/rtugate-does-not-exist" }"#).unwrap();

        let err = match SerialPortOpener.open(&line).await {
            Err(e) => e,
            Ok(_) => panic!("opened a nonexistent device"),
        };
        assert_eq!(err.device, "/dev/rtugate-does-not-exist");
    }
}
