//! Frame shapes carried by the Firmata byte stream and their byte-by-byte parser.

use crate::errors::ProtocolError::{EmptySysex, InvalidFrameByte, UnexpectedMessage};
use crate::errors::*;
use crate::io::codec::{join_14bit, split_14bit};
use crate::io::constants::*;

/// A decoded frame, consumed by exactly one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// REPORT_VERSION: the two body bytes are the protocol major and minor versions.
    ProtocolVersion { major: u8, minor: u8 },
    /// Ranged ANALOG_MESSAGE: 14-bit value for analog channel `pin`.
    Analog { pin: u8, value: u16 },
    /// Ranged DIGITAL_MESSAGE: bitmap of the 8 pins of `port`.
    Digital { port: u8, value: u16 },
    /// START_SYSEX, command id, body, END_SYSEX.
    Sysex { command: u8, body: Vec<u8> },
}

impl Frame {
    /// Reads a single frame, pulling bytes one at a time from `next`.
    ///
    /// # Errors
    /// * `UnexpectedMessage`: the first byte is not a known frame start.
    /// * `InvalidFrameByte`: a body byte has its high bit set.
    /// * `EmptySysex`: a sysex frame carries no command id.
    /// * Any error returned by `next` (end of stream, I/O failures).
    pub fn parse<F>(mut next: F) -> Result<Frame, Error>
    where
        F: FnMut() -> Result<u8, Error>,
    {
        let status = next()?;
        match status {
            REPORT_VERSION => {
                let major = data_byte(&mut next, "protocol version")?;
                let minor = data_byte(&mut next, "protocol version")?;
                Ok(Frame::ProtocolVersion { major, minor })
            }
            ANALOG_MESSAGE..=ANALOG_MESSAGE_BOUND => {
                let lsb = data_byte(&mut next, "analog message")?;
                let msb = data_byte(&mut next, "analog message")?;
                Ok(Frame::Analog {
                    pin: status & 0x0F,
                    value: join_14bit(lsb, msb),
                })
            }
            DIGITAL_MESSAGE..=DIGITAL_MESSAGE_BOUND => {
                let lsb = data_byte(&mut next, "digital message")?;
                let msb = data_byte(&mut next, "digital message")?;
                Ok(Frame::Digital {
                    port: status & 0x0F,
                    value: join_14bit(lsb, msb),
                })
            }
            START_SYSEX => {
                let command = next()?;
                if command == END_SYSEX {
                    return Err(EmptySysex.into());
                }
                if command & 0x80 != 0 {
                    return Err(InvalidFrameByte {
                        byte: command,
                        context: "sysex",
                    }
                    .into());
                }
                let mut body = vec![];
                loop {
                    match next()? {
                        END_SYSEX => break,
                        byte if byte & 0x80 != 0 => {
                            return Err(InvalidFrameByte {
                                byte,
                                context: "sysex",
                            }
                            .into())
                        }
                        byte => body.push(byte),
                    }
                }
                Ok(Frame::Sysex { command, body })
            }
            byte => Err(UnexpectedMessage { byte }.into()),
        }
    }

    /// Serializes the frame in its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::ProtocolVersion { major, minor } => vec![REPORT_VERSION, *major, *minor],
            Frame::Analog { pin, value } => {
                let (lsb, msb) = split_14bit(*value);
                vec![ANALOG_MESSAGE | (pin & 0x0F), lsb, msb]
            }
            Frame::Digital { port, value } => {
                let (lsb, msb) = split_14bit(*value);
                vec![DIGITAL_MESSAGE | (port & 0x0F), lsb, msb]
            }
            Frame::Sysex { command, body } => {
                let mut bytes = Vec::with_capacity(body.len() + 3);
                bytes.push(START_SYSEX);
                bytes.push(*command);
                bytes.extend_from_slice(body);
                bytes.push(END_SYSEX);
                bytes
            }
        }
    }
}

fn data_byte<F>(next: &mut F, context: &'static str) -> Result<u8, Error>
where
    F: FnMut() -> Result<u8, Error>,
{
    let byte = next()?;
    match byte & 0x80 {
        0 => Ok(byte),
        _ => Err(InvalidFrameByte { byte, context }.into()),
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::ProtocolError::Disconnected;
    use crate::utils::helpers::format_as_hex;

    use super::*;

    fn parse_all(bytes: &[u8]) -> Result<Frame, Error> {
        let mut iter = bytes.iter().copied();
        Frame::parse(|| iter.next().ok_or(Error::from(Disconnected)))
    }

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(
            parse_all(&[0xF9, 0x02, 0x05]).unwrap(),
            Frame::ProtocolVersion { major: 2, minor: 5 }
        );
    }

    #[test]
    fn test_parse_ranged() {
        assert_eq!(
            parse_all(&[0xE3, 0x7F, 0x07]).unwrap(),
            Frame::Analog {
                pin: 3,
                value: 1023
            }
        );
        assert_eq!(
            parse_all(&[0x91, 0x05, 0x01]).unwrap(),
            Frame::Digital {
                port: 1,
                value: 0x85
            }
        );
    }

    #[test]
    fn test_parse_sysex() {
        assert_eq!(
            parse_all(&[0xF0, 0x6C, 0x00, 0x01, 0x7F, 0xF7]).unwrap(),
            Frame::Sysex {
                command: 0x6C,
                body: vec![0x00, 0x01, 0x7F]
            }
        );
        assert_eq!(
            parse_all(&[0xF0, 0x79, 0xF7]).unwrap(),
            Frame::Sysex {
                command: 0x79,
                body: vec![]
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let error = parse_all(&[0xF0, 0xF7]).unwrap_err();
        assert!(matches!(
            error,
            Error::ProtocolError {
                source: EmptySysex
            }
        ));

        let error = parse_all(&[0x42]).unwrap_err();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Unexpected message start byte 0x42."
        );

        let error = parse_all(&[0xE0, 0x90, 0x00]).unwrap_err();
        assert!(matches!(
            error,
            Error::ProtocolError {
                source: InvalidFrameByte { byte: 0x90, .. }
            }
        ));

        let error = parse_all(&[0xF0, 0x71, 0x01, 0x90]).unwrap_err();
        assert!(matches!(
            error,
            Error::ProtocolError {
                source: InvalidFrameByte { byte: 0x90, .. }
            }
        ));

        // Truncated frame.
        assert!(parse_all(&[0xF0, 0x71, 0x01]).unwrap_err().is_disconnected());
    }

    #[test]
    fn test_encode_then_parse() {
        let frames = vec![
            Frame::ProtocolVersion { major: 2, minor: 6 },
            Frame::Analog {
                pin: 15,
                value: 0x3FFF,
            },
            Frame::Digital {
                port: 2,
                value: 0xFF,
            },
            Frame::Sysex {
                command: 0x77,
                body: vec![0x20, 0x00, 0x7F, 0x7F],
            },
        ];
        for frame in frames {
            let bytes = frame.encode();
            assert_eq!(
                parse_all(&bytes).unwrap(),
                frame,
                "Frame [{}] parses back",
                format_as_hex(&bytes)
            );
        }
    }
}
