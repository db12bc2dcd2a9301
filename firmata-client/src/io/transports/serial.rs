use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::Error;
use crate::errors::ProtocolError::NotInitialized;
use crate::io::constants::DEFAULT_BAUD_RATE;
use crate::io::transports::IoTransport;

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Serial port transport (8N1, no flow control).
///
/// The port is opened twice (via `try_clone`): reads and writes lock independent handles so the
/// reader thread never holds up a writer.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct Serial {
    /// The connection port.
    port: String,
    /// The connection speed.
    baud_rate: u32,
    /// Handle used for writing.
    #[cfg_attr(feature = "serde", serde(skip))]
    writer: SharedPort,
    /// Handle used for reading.
    #[cfg_attr(feature = "serde", serde(skip))]
    reader: SharedPort,
}

impl Serial {
    /// Constructs a new `Serial` transport layer instance for communication through the specified port.
    ///
    /// # Example
    /// ```no_run
    /// use firmata_client::io::{Client, Serial};
    ///
    /// let client = Client::new(Serial::new("/dev/ttyACM0"));
    /// ```
    pub fn new<P: Into<String>>(port: P) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            writer: Arc::new(Mutex::new(None)),
            reader: Arc::new(Mutex::new(None)),
        }
    }

    /// Overrides the default baud rate (57600).
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Retrieves the configured port.
    pub fn port(&self) -> String {
        self.port.clone()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Default for Serial {
    /// Creates a new serial transport connection with the first available port or an empty string if no ports are available.
    ///
    /// # Notes
    /// The first available port will be used, None otherwise, which will probably lead to an error
    /// during the open phase.
    #[cfg(not(tarpaulin_include))]
    fn default() -> Self {
        let ports = serialport::available_ports().unwrap_or_else(|_| vec![]);
        match ports.first() {
            Some(port) => Self::new(&port.port_name),
            None => Self::new(""),
        }
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self.port)
    }
}

impl IoTransport for Serial {
    fn open(&mut self) -> Result<(), Error> {
        let connexion = serialport::new(self.port.clone(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(10))
            .open()?;
        let reader = connexion.try_clone()?;
        trace!("Serial port is now opened: {:?}", connexion.name());

        *self.writer.lock() = Some(connexion);
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        *self.writer.lock() = None;
        *self.reader.lock() = None;
        Ok(())
    }

    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error> {
        for handle in [&self.writer, &self.reader] {
            handle
                .lock()
                .as_mut()
                .ok_or(NotInitialized)?
                .set_timeout(duration)?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut lock = self.writer.lock();
        let port = lock.as_mut().ok_or(NotInitialized)?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut lock = self.reader.lock();
        lock.as_mut().ok_or(NotInitialized)?.read_exact(buf)?;
        Ok(())
    }
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        std::io::Error::from(value).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_serial_transport() {
        let transport = Serial::new("/dev/ttyACM0");
        assert_eq!(transport.port(), "/dev/ttyACM0");
        assert_eq!(transport.baud_rate(), 57_600);
        assert!(transport.writer.lock().is_none());
        assert!(transport.reader.lock().is_none());

        let transport = Serial::new("COM3").with_baud_rate(115_200);
        assert_eq!(transport.baud_rate(), 115_200);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Serial::new("/dev/ttyUSB0")), "Serial(/dev/ttyUSB0)");
    }

    #[test]
    fn test_use_before_open() {
        let mut transport = Serial::new("/dev/ttyACM0");
        assert_eq!(
            format!("{}", transport.write(&[0xFF]).unwrap_err()),
            "Protocol error: Connection has not been initialized."
        );
        let mut buf = [0u8; 1];
        assert!(transport.read_exact(&mut buf).is_err());
        assert!(transport.set_timeout(Duration::from_millis(100)).is_err());
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_clones_share_the_port() {
        let transport = Serial::new("/dev/ttyACM0");
        let clone = transport.clone();
        assert!(Arc::ptr_eq(&transport.writer, &clone.writer));
        assert!(Arc::ptr_eq(&transport.reader, &clone.reader));
    }

    #[test]
    fn test_serialport_error_conversion() {
        let error: Error =
            serialport::Error::new(serialport::ErrorKind::NoDevice, "no device").into();
        assert!(matches!(error, Error::ProtocolError { .. }));
        let error: Error = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut),
            "slow",
        )
        .into();
        assert!(error.is_timeout());
    }
}
