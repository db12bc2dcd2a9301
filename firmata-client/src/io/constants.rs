//! Firmata protocol constants
//!
//! Official Firmata documentation: <https://github.com/firmata/protocol>

// ########################################
// Message command bytes (128-255/0x80-0xFF)

/// Send data for a digital port (collection of 8 pins)
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Digital message input range upper byte bound
pub const DIGITAL_MESSAGE_BOUND: u8 = 0x9F;
/// Enable analog input by pin #
pub const REPORT_ANALOG: u8 = 0xC0;
/// Enable digital input by port pair
pub const REPORT_DIGITAL: u8 = 0xD0;
/// Send data for an analog pin (or PWM)
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Analog message input range upper byte bound
pub const ANALOG_MESSAGE_BOUND: u8 = 0xEF;
//
/// Set a pin to INPUT/OUTPUT/PWM/etc
pub const SET_PIN_MODE: u8 = 0xF4;
/// Set value of an individual digital pin
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
//
/// Report protocol version
pub const REPORT_VERSION: u8 = 0xF9;
/// Reset from MIDI
pub const SYSTEM_RESET: u8 = 0xFF;
//
/// Start a MIDI Sysex message
pub const START_SYSEX: u8 = 0xF0;
/// End a MIDI Sysex message
pub const END_SYSEX: u8 = 0xF7;

// ########################################
// Extended command set using sysex (0-127/0x00-0x7F)

/// Communicate with serial devices
pub const SERIAL_DATA: u8 = 0x60;
/// Reply with encoders current positions
pub const ENCODER_DATA: u8 = 0x61;
/// Ask for mapping of analog to pin numbers
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
/// Reply with mapping info
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
/// Ask for supported modes and resolution of all pins
pub const CAPABILITY_QUERY: u8 = 0x6B;
/// Reply with supported modes and resolution
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
/// Ask for a pin's current mode and value
pub const PIN_STATE_QUERY: u8 = 0x6D;
/// Reply with pin's current mode and value
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
/// Analog write (PWM, Servo, etc) to any pin
pub const EXTENDED_ANALOG: u8 = 0x6F;
/// Set max angle, minPulse, maxPulse, freq
pub const SERVO_CONFIG: u8 = 0x70;
/// String message with 14-bits per char
pub const STRING_DATA: u8 = 0x71;
/// Control a stepper motor
pub const STEPPER_DATA: u8 = 0x72;
/// Send an OneWire read/write/reset/select/skip/search request
pub const ONEWIRE_DATA: u8 = 0x73;
/// Bitstream to/from a shift register
pub const SHIFT_DATA: u8 = 0x75;
/// Send an I2C read/write request
pub const I2C_REQUEST: u8 = 0x76;
/// Reply to an I2C read request
pub const I2C_REPLY: u8 = 0x77;
/// Config I2C settings such as delay times and power pins
pub const I2C_CONFIG: u8 = 0x78;
/// Report name and version of the firmware
pub const REPORT_FIRMWARE: u8 = 0x79;
/// Set the poll rate of the main loop
pub const SAMPLING_INTERVAL: u8 = 0x7A;
/// Send a createtask/deletetask/addtotask/schedule/querytasks/querytask request to the scheduler
pub const SCHEDULER_DATA: u8 = 0x7B;
/// MIDI Reserved for non-realtime messages
pub const SYSEX_NON_REALTIME: u8 = 0x7E;
/// MIDI Reserved for realtime messages
pub const SYSEX_REALTIME: u8 = 0x7F;

// ########################################
// I2C additions.

pub const I2C_WRITE: u8 = 0x00;
pub const I2C_READ: u8 = 0x01;
pub const I2C_READ_CONTINUOUSLY: u8 = 0x02;
pub const I2C_STOP_READING: u8 = 0x03;
/// Largest count a 7+7 bits length field can carry.
pub const I2C_MAX_READ_LENGTH: usize = 0x3FFF;
/// Register bytes sent back by the firmware when no register was specified.
pub const I2C_REGISTER_NOT_SPECIFIED: (u8, u8) = (0x7F, 0x7F);

// ########################################
// OneWire additions.

pub const ONEWIRE_SEARCH_REQUEST: u8 = 0x40;
pub const ONEWIRE_CONFIG_REQUEST: u8 = 0x41;
pub const ONEWIRE_SEARCH_REPLY: u8 = 0x42;
pub const ONEWIRE_READ_REPLY: u8 = 0x43;
pub const ONEWIRE_SEARCH_ALARMS_REQUEST: u8 = 0x44;
pub const ONEWIRE_SEARCH_ALARMS_REPLY: u8 = 0x45;
// Composite request bits.
pub const ONEWIRE_RESET_REQUEST_BIT: u8 = 0x01;
pub const ONEWIRE_SKIP_REQUEST_BIT: u8 = 0x02;
pub const ONEWIRE_SELECT_REQUEST_BIT: u8 = 0x04;
pub const ONEWIRE_READ_REQUEST_BIT: u8 = 0x08;
pub const ONEWIRE_DELAY_REQUEST_BIT: u8 = 0x10;
pub const ONEWIRE_WRITE_REQUEST_BIT: u8 = 0x20;
// ROM commands (first byte written on the bus).
pub const ONEWIRE_MATCH_ROM: u8 = 0x55;
pub const ONEWIRE_SKIP_ROM: u8 = 0xCC;

// ########################################
// Other values

/// Default serial baud rate used by StandardFirmata.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;
/// Number of pins carried by a digital port message.
pub const PINS_PER_PORT: u8 = 8;
/// Largest value a 7+7 bits field can carry.
pub const MAX_14BIT_VALUE: u16 = 0x3FFF;

/// Extended commands carried inside a SysEx frame.
///
/// The command-id space is fixed by the Firmata specification: every known id has its own
/// variant, anything else lands in [`SysexCommand::Unknown`] (custom firmware features).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysexCommand {
    SerialData,
    EncoderData,
    AnalogMappingQuery,
    AnalogMappingResponse,
    CapabilityQuery,
    CapabilityResponse,
    PinStateQuery,
    PinStateResponse,
    ExtendedAnalog,
    ServoConfig,
    StringData,
    StepperData,
    OneWireData,
    ShiftData,
    I2cRequest,
    I2cReply,
    I2cConfig,
    ReportFirmware,
    SamplingInterval,
    SchedulerData,
    NonRealtime,
    Realtime,
    Unknown(u8),
}

impl SysexCommand {
    /// The response expected on the wire after sending this command, if any.
    ///
    /// This is the static request → response table used to queue one-shot waiters. I2C and
    /// 1-Wire replies are not listed: they are routed by address/pin to listeners instead.
    pub fn expected_response(&self) -> Option<SysexCommand> {
        match self {
            SysexCommand::AnalogMappingQuery => Some(SysexCommand::AnalogMappingResponse),
            SysexCommand::CapabilityQuery => Some(SysexCommand::CapabilityResponse),
            SysexCommand::PinStateQuery => Some(SysexCommand::PinStateResponse),
            SysexCommand::ReportFirmware => Some(SysexCommand::ReportFirmware),
            _ => None,
        }
    }
}

impl From<u8> for SysexCommand {
    fn from(value: u8) -> Self {
        match value {
            SERIAL_DATA => SysexCommand::SerialData,
            ENCODER_DATA => SysexCommand::EncoderData,
            ANALOG_MAPPING_QUERY => SysexCommand::AnalogMappingQuery,
            ANALOG_MAPPING_RESPONSE => SysexCommand::AnalogMappingResponse,
            CAPABILITY_QUERY => SysexCommand::CapabilityQuery,
            CAPABILITY_RESPONSE => SysexCommand::CapabilityResponse,
            PIN_STATE_QUERY => SysexCommand::PinStateQuery,
            PIN_STATE_RESPONSE => SysexCommand::PinStateResponse,
            EXTENDED_ANALOG => SysexCommand::ExtendedAnalog,
            SERVO_CONFIG => SysexCommand::ServoConfig,
            STRING_DATA => SysexCommand::StringData,
            STEPPER_DATA => SysexCommand::StepperData,
            ONEWIRE_DATA => SysexCommand::OneWireData,
            SHIFT_DATA => SysexCommand::ShiftData,
            I2C_REQUEST => SysexCommand::I2cRequest,
            I2C_REPLY => SysexCommand::I2cReply,
            I2C_CONFIG => SysexCommand::I2cConfig,
            REPORT_FIRMWARE => SysexCommand::ReportFirmware,
            SAMPLING_INTERVAL => SysexCommand::SamplingInterval,
            SCHEDULER_DATA => SysexCommand::SchedulerData,
            SYSEX_NON_REALTIME => SysexCommand::NonRealtime,
            SYSEX_REALTIME => SysexCommand::Realtime,
            other => SysexCommand::Unknown(other),
        }
    }
}

impl From<SysexCommand> for u8 {
    fn from(command: SysexCommand) -> u8 {
        match command {
            SysexCommand::SerialData => SERIAL_DATA,
            SysexCommand::EncoderData => ENCODER_DATA,
            SysexCommand::AnalogMappingQuery => ANALOG_MAPPING_QUERY,
            SysexCommand::AnalogMappingResponse => ANALOG_MAPPING_RESPONSE,
            SysexCommand::CapabilityQuery => CAPABILITY_QUERY,
            SysexCommand::CapabilityResponse => CAPABILITY_RESPONSE,
            SysexCommand::PinStateQuery => PIN_STATE_QUERY,
            SysexCommand::PinStateResponse => PIN_STATE_RESPONSE,
            SysexCommand::ExtendedAnalog => EXTENDED_ANALOG,
            SysexCommand::ServoConfig => SERVO_CONFIG,
            SysexCommand::StringData => STRING_DATA,
            SysexCommand::StepperData => STEPPER_DATA,
            SysexCommand::OneWireData => ONEWIRE_DATA,
            SysexCommand::ShiftData => SHIFT_DATA,
            SysexCommand::I2cRequest => I2C_REQUEST,
            SysexCommand::I2cReply => I2C_REPLY,
            SysexCommand::I2cConfig => I2C_CONFIG,
            SysexCommand::ReportFirmware => REPORT_FIRMWARE,
            SysexCommand::SamplingInterval => SAMPLING_INTERVAL,
            SysexCommand::SchedulerData => SCHEDULER_DATA,
            SysexCommand::NonRealtime => SYSEX_NON_REALTIME,
            SysexCommand::Realtime => SYSEX_REALTIME,
            SysexCommand::Unknown(other) => other,
        }
    }
}
