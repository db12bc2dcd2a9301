//! The single consumer of the device stream.
//!
//! Frames are parsed one at a time and routed to exactly one destination, in wire order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::errors::ProtocolError::{Disconnected, IoException, MessageTooShort, UnexpectedSysex};
use crate::errors::*;
use crate::io::client::Shared;
use crate::io::codec::decode_ascii_pairs;
use crate::io::constants::*;
use crate::io::data::{FirmwareReport, I2CPacket, Level, ProtocolVersion};
use crate::io::frame::Frame;
use crate::io::transports::IoTransport;
use crate::utils::helpers::format_as_hex;

pub(crate) struct FrameReader {
    transport: Box<dyn IoTransport>,
    shared: Arc<Shared>,
    /// Last bitmap seen for every digital port.
    last_ports: [Option<u8>; 16],
}

impl FrameReader {
    /// Starts the reader on a dedicated thread. The thread ends with the stream.
    pub(crate) fn spawn(transport: Box<dyn IoTransport>, shared: Arc<Shared>) -> Result<(), Error> {
        let reader = FrameReader {
            transport,
            shared,
            last_ports: [None; 16],
        };
        std::thread::Builder::new()
            .name(String::from("firmata-reader"))
            .spawn(move || reader.run())
            .map_err(|error| IoException {
                info: format!("cannot spawn the reader thread: {}", error),
            })?;
        Ok(())
    }

    fn run(mut self) {
        let error = loop {
            if let Err(error) = self.step() {
                break error;
            }
        };
        debug!("Reader loop ended: {}", error);
        self.shared.terminate(Some(error));
    }

    fn step(&mut self) -> Result<(), Error> {
        let frame = Frame::parse(|| self.next_byte())?;
        trace!("Read: [{}]", format_as_hex(&frame.encode()));
        self.dispatch(frame)
    }

    /// Blocks until a byte arrives. Read timeouts only serve to notice a shutdown.
    fn next_byte(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        loop {
            match self.transport.read_exact(&mut buf) {
                Ok(()) => return Ok(buf[0]),
                Err(error) if error.is_timeout() => {
                    if self.shared.is_closing() {
                        return Err(Disconnected.into());
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::ProtocolVersion { major, minor } => {
                let version = ProtocolVersion { major, minor };
                debug!("Device speaks Firmata protocol {}", version);
                self.shared.cache.write().protocol_version = Some(version);
                Ok(())
            }
            Frame::Analog { pin, value } => {
                if self.shared.registry.analog.dispatch(pin as usize, value).is_err() {
                    let dropped = self.shared.dropped_analog.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "Analog frame for channel {} dropped: no listener ({} dropped so far)",
                        pin, dropped
                    );
                }
                Ok(())
            }
            Frame::Digital { port, value } => {
                self.fan_out(port, value);
                Ok(())
            }
            Frame::Sysex { command, body } => self.dispatch_sysex(command, body),
        }
    }

    /// Notifies the pins of `port` whose level differs from the previous observation.
    fn fan_out(&mut self, port: u8, value: u16) {
        let levels = (value & 0xFF) as u8;
        let previous = self.last_ports[port as usize];
        for bit in 0..PINS_PER_PORT {
            let level = (levels >> bit) & 1;
            if previous.is_some_and(|previous| (previous >> bit) & 1 == level) {
                continue;
            }
            let pin = port as usize * PINS_PER_PORT as usize + bit as usize;
            let _ = self
                .shared
                .registry
                .digital
                .dispatch(pin, Level::from(level == 1));
        }
        self.last_ports[port as usize] = Some(levels);
    }

    fn dispatch_sysex(&mut self, command: u8, body: Vec<u8>) -> Result<(), Error> {
        // Replies routed by resource.
        match command {
            ONEWIRE_DATA => {
                if body.len() < 2 {
                    return Err(MessageTooShort {
                        operation: "1-wire reply",
                        expected: 2,
                        received: body.len(),
                    }
                    .into());
                }
                let pin = body[1];
                if self.shared.registry.onewire.dispatch(pin as usize, body).is_err() {
                    warn!("1-Wire reply for pin {} dropped: no listener", pin);
                }
                return Ok(());
            }
            I2C_REPLY => {
                let packet = match I2CPacket::from_body(&body) {
                    Ok(packet) => packet,
                    Err(error) => {
                        warn!("I2C reply dropped: {}", error);
                        return Ok(());
                    }
                };
                let address = packet.address;
                if self.shared.registry.i2c.dispatch(address as usize, packet).is_err() {
                    warn!("I2C reply for address {:#04X} dropped: no listener", address);
                }
                return Ok(());
            }
            _ => {}
        }

        // Long-lived feature listeners.
        let body = match self.shared.registry.sysex.dispatch(command as usize, body) {
            Ok(()) => return Ok(()),
            Err(body) => body,
        };

        // Oldest one-shot waiter.
        let body = match self.shared.writer.resolve(command, body) {
            Ok(()) => return Ok(()),
            Err(body) => body,
        };

        match command {
            STRING_DATA => {
                info!("Device says: {}", decode_ascii_pairs(&body));
                Ok(())
            }
            REPORT_FIRMWARE => {
                let firmware = FirmwareReport::from_body(&body)?;
                info!("Device announced firmware {}", firmware);
                self.shared.cache.write().firmware = Some(firmware);
                Ok(())
            }
            _ => Err(UnexpectedSysex { command }.into()),
        }
    }
}
