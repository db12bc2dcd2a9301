use std::fmt::{Debug, Display, Formatter};

use log::debug;

use crate::errors::ProtocolError::{MessageTooShort, UnexpectedReply};
use crate::errors::*;
use crate::io::codec::{decode_ascii_pairs, from_wire_safe, join_14bit};
use crate::io::constants::{I2C_REGISTER_NOT_SPECIFIED, SYSEX_REALTIME};

/// Digital level of a pin.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        match value {
            true => Level::High,
            false => Level::Low,
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        level == Level::High
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        match level {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

// ########################################

/// Represents a mode configuration for a pin.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default, Copy, PartialEq, Eq)]
pub struct PinMode {
    /// The mode.
    pub id: PinModeId,
    /// Resolution (number of bits) this mode uses.
    pub resolution: u8,
}

impl PinMode {
    /// Get the max value this pinMode can reach according to its resolution.
    pub fn max_value(&self) -> u32 {
        (1u32 << self.resolution.min(31)) - 1
    }
}

impl Display for PinMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Debug for PinMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.id {
            PinModeId::UNSUPPORTED => write!(f, "[{}]", self.id),
            _ => write!(f, "[id: {}, resolution: {}]", self.id, self.resolution),
        }
    }
}

// ########################################

/// Enumerates the possible modes for a pin.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
#[repr(u8)]
pub enum PinModeId {
    /// Same as INPUT defined in Arduino.
    INPUT = 0,
    /// Same as OUTPUT defined in Arduino.h
    OUTPUT = 1,
    /// Analog pin in analogInput mode
    ANALOG = 2,
    /// Digital pin in PWM output mode
    PWM = 3,
    /// Digital pin in Servo output mode
    SERVO = 4,
    /// shiftIn/shiftOut mode
    SHIFT = 5,
    /// Pin included in I2C setup
    I2C = 6,
    /// Pin configured for 1-wire
    ONEWIRE = 7,
    /// Pin configured for stepper motor
    STEPPER = 8,
    /// Pin configured for rotary encoders
    ENCODER = 9,
    /// Pin configured for serial communication
    SERIAL = 0x0A,
    /// Enable internal pull-up resistor for pin
    PULLUP = 0x0B,
    /// Pin configured for SPI
    SPI = 0x0C,
    /// Pin configured for proximity sensors
    SONAR = 0x0D,
    /// Pin configured for piezzo buzzer tone generation
    TONE = 0x0E,
    /// Pin configured for DHT humidity and temperature sensors
    DHT = 0x0F,
    /// Pin configured to be ignored by digitalWrite and capabilityResponse
    #[default]
    UNSUPPORTED = 0x7F,
}

impl PinModeId {
    /// Converts a `u8` byte value into a `PinModeId`.
    ///
    /// # Errors
    /// * `Unknown`: The value does not match any known pin mode.
    pub fn from_u8(value: u8) -> Result<PinModeId, Error> {
        match value {
            0 => Ok(PinModeId::INPUT),
            1 => Ok(PinModeId::OUTPUT),
            2 => Ok(PinModeId::ANALOG),
            3 => Ok(PinModeId::PWM),
            4 => Ok(PinModeId::SERVO),
            5 => Ok(PinModeId::SHIFT),
            6 => Ok(PinModeId::I2C),
            7 => Ok(PinModeId::ONEWIRE),
            8 => Ok(PinModeId::STEPPER),
            9 => Ok(PinModeId::ENCODER),
            0x0A => Ok(PinModeId::SERIAL),
            0x0B => Ok(PinModeId::PULLUP),
            0x0C => Ok(PinModeId::SPI),
            0x0D => Ok(PinModeId::SONAR),
            0x0E => Ok(PinModeId::TONE),
            0x0F => Ok(PinModeId::DHT),
            0x7F => Ok(PinModeId::UNSUPPORTED),
            x => Err(Error::Unknown {
                info: format!("PinMode not found with value: {}", x),
            }),
        }
    }

    /// Input-like modes (the pin reports its level).
    pub fn is_input(&self) -> bool {
        matches!(self, PinModeId::INPUT | PinModeId::PULLUP)
    }
}

impl From<PinModeId> for u8 {
    fn from(mode: PinModeId) -> u8 {
        mode as u8
    }
}

impl Display for PinModeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ########################################
// SysEx responses

/// The supported modes of every pin, indexed by pin number.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityResponse {
    pub pins: Vec<Vec<PinMode>>,
}

impl CapabilityResponse {
    /// Parses a CAPABILITY_RESPONSE body (command byte excluded).
    ///
    /// Every pin lists `(mode, resolution)` pairs terminated by `0x7F`. A last pin missing its
    /// terminator is still accepted. Modes unknown to this crate are skipped.
    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        let mut pins = vec![];
        let mut current = vec![];
        let mut index = 0;
        while index < body.len() {
            if body[index] == SYSEX_REALTIME {
                pins.push(std::mem::take(&mut current));
                index += 1;
                continue;
            }
            if index + 1 >= body.len() {
                return Err(MessageTooShort {
                    operation: "capability response",
                    expected: index + 2,
                    received: body.len(),
                }
                .into());
            }
            match PinModeId::from_u8(body[index]) {
                Ok(id) => current.push(PinMode {
                    id,
                    resolution: body[index + 1],
                }),
                Err(_) => debug!(
                    "Pin {} reports unknown mode {:#04X}: skipped",
                    pins.len(),
                    body[index]
                ),
            }
            index += 2;
        }
        if !current.is_empty() {
            pins.push(current);
        }
        Ok(Self { pins })
    }

    /// The supported modes of `pin`, if the pin exists.
    pub fn modes(&self, pin: u8) -> Option<&[PinMode]> {
        self.pins.get(pin as usize).map(Vec::as_slice)
    }

    /// The mode description of `pin` for `mode`, if supported.
    pub fn supports(&self, pin: u8, mode: PinModeId) -> Option<PinMode> {
        self.modes(pin)?.iter().find(|m| m.id == mode).copied()
    }
}

/// The analog channel associated to every pin, indexed by pin number.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalogMappingResponse {
    pub channels: Vec<Option<u8>>,
}

impl AnalogMappingResponse {
    /// Parses an ANALOG_MAPPING_RESPONSE body: one byte per pin, `0x7F` for "not analog".
    pub fn from_body(body: &[u8]) -> Self {
        Self {
            channels: body
                .iter()
                .map(|&channel| match channel {
                    SYSEX_REALTIME => None,
                    channel => Some(channel),
                })
                .collect(),
        }
    }

    /// The pin carrying analog `channel`.
    pub fn pin_of(&self, channel: u8) -> Option<u8> {
        self.channels
            .iter()
            .position(|c| *c == Some(channel))
            .and_then(|pin| u8::try_from(pin).ok())
    }
}

/// A pin current mode and state.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinStateResponse {
    pub pin: u8,
    pub mode: PinModeId,
    /// Output value for output modes, pull-up flag for input modes.
    pub state: u32,
}

impl PinStateResponse {
    /// Parses a PIN_STATE_RESPONSE body: pin, mode, then the state as 7-bit chunks LSB first.
    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 2 {
            return Err(MessageTooShort {
                operation: "pin state response",
                expected: 2,
                received: body.len(),
            }
            .into());
        }
        let state = body[2..]
            .iter()
            .take(4)
            .enumerate()
            .fold(0u32, |acc, (i, &chunk)| acc | ((chunk as u32 & 0x7F) << (7 * i)));
        Ok(Self {
            pin: body[0],
            mode: PinModeId::from_u8(body[1])?,
            state,
        })
    }
}

/// Name and version of the firmware running on the device.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareReport {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

impl FirmwareReport {
    /// Parses a REPORT_FIRMWARE body: major, minor, then the name as 7-bit pairs.
    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 2 {
            return Err(MessageTooShort {
                operation: "firmware report",
                expected: 2,
                received: body.len(),
            }
            .into());
        }
        Ok(Self {
            major: body[0],
            minor: body[1],
            name: decode_ascii_pairs(&body[2..]),
        })
    }
}

impl Display for FirmwareReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}.{}", self.name, self.major, self.minor)
    }
}

/// Version of the Firmata protocol implemented by the device.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Defines a decoded I2C reply.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct I2CPacket {
    pub address: u16,
    /// `None` when the read did not target a register.
    pub register: Option<u8>,
    pub data: Vec<u8>,
}

impl I2CPacket {
    /// Parses an I2C_REPLY body: address and register as 7-bit pairs, then bit-packed data.
    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 {
            return Err(MessageTooShort {
                operation: "i2c reply",
                expected: 4,
                received: body.len(),
            }
            .into());
        }
        let register = match (body[2], body[3]) {
            I2C_REGISTER_NOT_SPECIFIED => None,
            (lsb, msb) => Some(u8::try_from(join_14bit(lsb, msb)).map_err(|_| {
                Error::from(UnexpectedReply {
                    context: format!("i2c register {:#06X} is not a byte", join_14bit(lsb, msb)),
                })
            })?),
        };
        Ok(Self {
            address: join_14bit(body[0], body[1]),
            register,
            data: from_wire_safe(&body[4..]),
        })
    }
}
