use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::Mutex;

use crate::errors::HardwareError::{OutOfRange, Unsupported};
use crate::errors::ProtocolError::{MessageTooShort, UnexpectedReply};
use crate::errors::*;
use crate::io::codec::{from_wire_safe, to_wire_safe};
use crate::io::constants::*;
use crate::io::{Client, Listener};
use crate::utils::helpers::format_as_hex;

/// Power applied on the bus after a transaction's write.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pullup {
    /// Regular pull-up resistor.
    #[default]
    Weak,
    /// Holds the line high for the strong pull-up delay (parasite-powered devices converting).
    Strong,
}

/// A 1-Wire bus driven by the device (ConfigurableFirmata `OneWireFirmata`).
///
/// The bus owns the 1-Wire listener of its pin for its whole lifetime: transactions on one bus
/// are serialized, and a second bus cannot be created on the same pin until this one is dropped.
pub struct OneWireBus {
    client: Client,
    pin: u8,
    listener: Mutex<Listener<Vec<u8>>>,
    correlation: AtomicU16,
    strong_pullup: Duration,
}

impl Debug for OneWireBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneWireBus")
            .field("pin", &self.pin)
            .field("strong_pullup", &self.strong_pullup)
            .finish()
    }
}

impl OneWireBus {
    /// Configures `pin` as a 1-Wire bus on the device.
    ///
    /// # Errors
    /// * `OutOfRange`: pin above 127.
    /// * `AlreadyRegistered`: a bus already exists on this pin.
    pub fn new(client: &Client, pin: u8, parasitic_power: bool) -> Result<Self, Error> {
        if pin > 0x7F {
            return Err(OutOfRange {
                context: "1-wire pin",
                value: pin as usize,
                max: 0x7F,
            }
            .into());
        }
        let listener = client.listen_onewire(pin)?;
        client.send_sysex(
            ONEWIRE_DATA,
            &[ONEWIRE_CONFIG_REQUEST, pin, parasitic_power as u8],
        )?;
        Ok(Self {
            client: client.clone(),
            pin,
            listener: Mutex::new(listener),
            correlation: AtomicU16::new(0),
            strong_pullup: Duration::from_millis(750),
        })
    }

    /// Sets the delay the line is held high for on [`Pullup::Strong`] requests.
    pub fn with_strong_pullup(mut self, delay: Duration) -> Self {
        self.strong_pullup = delay;
        self
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Lists the ROM ids of the devices on the bus (only those in alarm state when `alarm_only`).
    pub async fn search(&self, alarm_only: bool) -> Result<Vec<u64>, Error> {
        let (request, reply) = match alarm_only {
            true => (ONEWIRE_SEARCH_ALARMS_REQUEST, ONEWIRE_SEARCH_ALARMS_REPLY),
            false => (ONEWIRE_SEARCH_REQUEST, ONEWIRE_SEARCH_REPLY),
        };
        let mut listener = self.listener.lock().await;
        self.discard_queued(&mut listener);
        self.client.send_sysex(ONEWIRE_DATA, &[request, self.pin])?;
        let body = self.client.next_from(&mut listener, "1-wire search").await?;
        self.check_reply(&body, reply)?;

        let devices = from_wire_safe(&body[2..])
            .chunks_exact(8)
            .map(|rom| rom.iter().rev().fold(0u64, |id, &byte| (id << 8) | byte as u64))
            .collect::<Vec<_>>();
        trace!("1-Wire search on pin {}: {:X?}", self.pin, devices);
        Ok(devices)
    }

    /// Runs a reset / ROM command / write / read sequence on the bus.
    ///
    /// `write` starts with the ROM command: `0x55` (match ROM) followed by the 8-byte ROM id, or
    /// `0xCC` (skip ROM). The remaining bytes are written to the device, then `read.len()` bytes
    /// are read back.
    ///
    /// # Errors
    /// * `Unsupported`: any other ROM command, or a truncated match ROM.
    /// * `OutOfRange`: more than 65535 bytes to read.
    /// * `UnexpectedReply`: the reply does not belong to this request.
    ///
    /// Replies to earlier reads that timed out are skipped.
    pub async fn transact(&self, write: &[u8], read: &mut [u8], pullup: Pullup) -> Result<(), Error> {
        let mut command = ONEWIRE_RESET_REQUEST_BIT;
        let mut payload = Vec::with_capacity(write.len() + 8);
        let data = match write.first() {
            Some(&ONEWIRE_MATCH_ROM) if write.len() >= 9 => {
                command |= ONEWIRE_SELECT_REQUEST_BIT;
                payload.extend_from_slice(&write[1..9]);
                &write[9..]
            }
            Some(&ONEWIRE_SKIP_ROM) => {
                command |= ONEWIRE_SKIP_REQUEST_BIT;
                &write[1..]
            }
            Some(&ONEWIRE_MATCH_ROM) => {
                return Err(Unsupported {
                    feature: String::from("1-wire match ROM without a full 8-byte ROM id"),
                }
                .into())
            }
            Some(other) => {
                return Err(Unsupported {
                    feature: format!("1-wire ROM command {:#04X}", other),
                }
                .into())
            }
            None => {
                return Err(Unsupported {
                    feature: String::from("1-wire transaction without ROM command"),
                }
                .into())
            }
        };

        let correlation = match read.is_empty() {
            true => None,
            false => {
                let length = u16::try_from(read.len()).map_err(|_| OutOfRange {
                    context: "1-wire read length",
                    value: read.len(),
                    max: u16::MAX as usize,
                })?;
                let correlation = self.correlation.fetch_add(1, Ordering::Relaxed);
                command |= ONEWIRE_READ_REQUEST_BIT;
                payload.extend_from_slice(&length.to_le_bytes());
                payload.extend_from_slice(&correlation.to_le_bytes());
                Some(correlation)
            }
        };
        if pullup == Pullup::Strong {
            let delay = u32::try_from(self.strong_pullup.as_millis()).unwrap_or(u32::MAX);
            command |= ONEWIRE_DELAY_REQUEST_BIT;
            payload.extend_from_slice(&delay.to_le_bytes());
        }
        if !data.is_empty() {
            command |= ONEWIRE_WRITE_REQUEST_BIT;
            payload.extend_from_slice(data);
        }

        let mut body = vec![command, self.pin];
        body.extend(to_wire_safe(&payload));

        let mut listener = self.listener.lock().await;
        self.discard_queued(&mut listener);
        self.client.send_sysex(ONEWIRE_DATA, &body)?;
        let Some(correlation) = correlation else {
            return Ok(());
        };

        loop {
            let reply = self.client.next_from(&mut listener, "1-wire read").await?;
            self.check_reply(&reply, ONEWIRE_READ_REPLY)?;
            let decoded = from_wire_safe(&reply[2..]);
            if decoded.len() < 2 + read.len() {
                return Err(MessageTooShort {
                    operation: "1-wire read",
                    expected: 2 + read.len(),
                    received: decoded.len(),
                }
                .into());
            }
            let received = u16::from_le_bytes([decoded[0], decoded[1]]);
            if received == correlation {
                read.copy_from_slice(&decoded[2..2 + read.len()]);
                return Ok(());
            }
            if !(1..=0x7FFF).contains(&correlation.wrapping_sub(received)) {
                return Err(UnexpectedReply {
                    context: format!(
                        "1-wire reply {} while reply {} was expected on pin {}",
                        received, correlation, self.pin
                    ),
                }
                .into());
            }
            debug!(
                "1-Wire pin {}: late reply {} dropped while waiting for {}",
                self.pin, received, correlation
            );
        }
    }

    /// Drops replies left over by requests that timed out.
    fn discard_queued(&self, listener: &mut Listener<Vec<u8>>) {
        while let Some(stale) = listener.try_recv() {
            debug!(
                "1-Wire pin {}: stale reply dropped: [{}]",
                self.pin,
                format_as_hex(&stale)
            );
        }
    }

    fn check_reply(&self, body: &[u8], subcommand: u8) -> Result<(), Error> {
        match body {
            [command, pin, ..] if *command == subcommand && *pin == self.pin => Ok(()),
            [command, pin, ..] => Err(UnexpectedReply {
                context: format!(
                    "1-wire subcommand {:#04X} for pin {} while {:#04X} for pin {} was expected",
                    command, pin, subcommand, self.pin
                ),
            }
            .into()),
            _ => Err(MessageTooShort {
                operation: "1-wire reply",
                expected: 2,
                received: body.len(),
            }
            .into()),
        }
    }
}
