use log::{error, trace};
use snafu::Snafu;

use crate::errors::ProtocolError::{Disconnected, IoException, Timeout};
use crate::io::PinModeId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Protocol error: {source}.
    ProtocolError { source: ProtocolError },
    /// Hardware error: {source}.
    HardwareError { source: HardwareError },
    /// Unknown error: {info}.
    Unknown { info: String },
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        let source = match error.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset => Disconnected,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                trace!("std::io timeout {:?}", error);
                return Self::ProtocolError {
                    source: Timeout { operation: "io" },
                };
            }
            std::io::ErrorKind::NotFound => IoException {
                info: String::from("Device not found or already in use"),
            },
            std::io::ErrorKind::PermissionDenied => IoException {
                info: String::from("Device connection lost"),
            },
            _ => IoException {
                info: error.to_string(),
            },
        };
        error!("std::io error {:?}", error);
        Self::ProtocolError { source }
    }
}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        Self::ProtocolError { source: value }
    }
}

impl From<HardwareError> for Error {
    fn from(value: HardwareError) -> Self {
        Self::HardwareError { source: value }
    }
}

impl Error {
    /// Checks if this error means the device stream reached its end.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Error::ProtocolError {
                source: Disconnected
            }
        )
    }

    /// Checks if this error is a transport poll timeout (not a failure by itself).
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ProtocolError {
                source: Timeout { .. }
            }
        )
    }
}

/// Transport and framing errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    /// {info}
    IoException { info: String },
    /// Device disconnected
    Disconnected,
    /// Connection has not been initialized
    NotInitialized,
    /// Not enough bytes received - '{operation}' expected {expected} bytes, {received} received
    MessageTooShort {
        operation: &'static str,
        expected: usize,
        received: usize,
    },
    #[snafu(display("Unexpected message start byte {byte:#04X}"))]
    UnexpectedMessage { byte: u8 },
    #[snafu(display("Unexpected byte {byte:#04X} inside a '{context}' frame"))]
    InvalidFrameByte { byte: u8, context: &'static str },
    /// Empty sysex message received
    EmptySysex,
    #[snafu(display(
        "Unexpected sysex command {command:#04X} received while nothing was waiting for it"
    ))]
    UnexpectedSysex { command: u8 },
    /// Unexpected reply - {context}
    UnexpectedReply { context: String },
    /// Operation '{operation}' timed out
    Timeout { operation: &'static str },
    /// Client is faulted: {info}
    Faulted { info: String },
}

/// Errors returned to the caller before anything reaches the wire.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HardwareError {
    /// Pin ({pin}) not compatible with mode ({mode}) - {context}
    IncompatibleMode {
        pin: u8,
        mode: PinModeId,
        context: &'static str,
    },
    /// Unknown pin {pin}
    UnknownPin { pin: u8 },
    /// A listener is already registered for {resource}
    AlreadyRegistered { resource: String },
    /// Value {value} out of range for {context} (max {max})
    OutOfRange {
        context: &'static str,
        value: usize,
        max: usize,
    },
    /// {what} has not been queried from the device yet
    NotQueried { what: &'static str },
    /// I2C has not been configured
    I2cNotConfigured,
    /// Unsupported feature: {feature}
    Unsupported { feature: String },
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::errors::HardwareError::{IncompatibleMode, UnknownPin};

    use super::*;

    #[test]
    fn test_error_display() {
        let protocol_error = Error::from(IoException {
            info: "I/O error message".to_string(),
        });
        assert_eq!(
            format!("{}", protocol_error),
            "Protocol error: I/O error message."
        );

        let hardware_error = Error::from(IncompatibleMode {
            pin: 1,
            mode: PinModeId::SERVO,
            context: "test context",
        });
        assert_eq!(
            format!("{}", hardware_error),
            "Hardware error: Pin (1) not compatible with mode (SERVO) - test context."
        );

        let unknown_error = Error::Unknown {
            info: "Some unknown error".to_string(),
        };
        assert_eq!(
            format!("{}", unknown_error),
            "Unknown error: Some unknown error."
        );

        let framing_error = Error::from(ProtocolError::UnexpectedSysex { command: 0x42 });
        assert_eq!(
            format!("{}", framing_error),
            "Protocol error: Unexpected sysex command 0x42 received while nothing was waiting for it."
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Device not found or already in use."
        );

        let io_error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let error: Error = io_error.into();
        assert!(error.is_disconnected());
        assert_eq!(format!("{}", error), "Protocol error: Device disconnected.");

        let io_error = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let error: Error = io_error.into();
        assert!(error.is_timeout());
        assert!(!error.is_disconnected());
    }

    #[test]
    fn test_from_protocol_error() {
        let protocol_error = ProtocolError::NotInitialized;
        let error: Error = protocol_error.into();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Connection has not been initialized."
        );
    }

    #[test]
    fn test_from_hardware_error() {
        let hardware_error = UnknownPin { pin: 42 };
        let error: Error = hardware_error.into();
        assert_eq!(format!("{}", error), "Hardware error: Unknown pin 42.");

        let error: Error = HardwareError::AlreadyRegistered {
            resource: String::from("i2c address 0x20"),
        }
        .into();
        assert_eq!(
            format!("{}", error),
            "Hardware error: A listener is already registered for i2c address 0x20."
        );
    }
}
