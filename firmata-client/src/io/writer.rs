use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::errors::HardwareError::OutOfRange;
use crate::errors::ProtocolError::{Disconnected, Faulted, InvalidFrameByte};
use crate::errors::*;
use crate::io::codec::split_14bit;
use crate::io::constants::*;
use crate::io::pending::{PendingReply, PendingResponses};
use crate::io::transports::IoTransport;
use crate::utils::helpers::format_as_hex;

/// Why a client stopped working.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// End of stream, or the client was closed.
    Disconnected,
    /// The reader hit a transport or framing failure.
    Failed(String),
}

impl Fault {
    /// The error every in-flight and future call observes.
    pub fn to_error(&self) -> Error {
        match self {
            Fault::Disconnected => Disconnected.into(),
            Fault::Failed(info) => Faulted { info: info.clone() }.into(),
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Disconnected => write!(f, "disconnected"),
            Fault::Failed(info) => write!(f, "failed: {}", info),
        }
    }
}

/// Client-wide fault flag shared with replies waiting outside the writer lock.
#[derive(Clone, Default, Debug)]
pub(crate) struct FaultState(Arc<RwLock<Option<Fault>>>);

impl FaultState {
    pub(crate) fn get(&self) -> Option<Fault> {
        self.0.read().clone()
    }

    /// Records `fault` unless one is already recorded. Returns whether it was recorded.
    pub(crate) fn set(&self, fault: Fault) -> bool {
        let mut current = self.0.write();
        match *current {
            Some(_) => false,
            None => {
                *current = Some(fault);
                true
            }
        }
    }

    pub(crate) fn error(&self) -> Error {
        self.get()
            .map_or_else(|| Disconnected.into(), |fault| fault.to_error())
    }
}

struct WriterState {
    transport: Box<dyn IoTransport>,
    pending: PendingResponses,
}

/// Serializes outgoing frames under the single write lock.
///
/// The lock also guards the pending response queues: a waiter is installed before the lock is
/// released so the reader can never see a reply before its waiter exists.
pub(crate) struct CommandWriter {
    state: Mutex<WriterState>,
    fault: FaultState,
}

impl CommandWriter {
    pub(crate) fn new(transport: Box<dyn IoTransport>) -> Self {
        Self {
            state: Mutex::new(WriterState {
                transport,
                pending: PendingResponses::default(),
            }),
            fault: FaultState::default(),
        }
    }

    pub(crate) fn fault_state(&self) -> &FaultState {
        &self.fault
    }

    /// Opens the transport and hands back a clone of it for the reader.
    pub(crate) fn open(&self, read_timeout: Duration) -> Result<Box<dyn IoTransport>, Error> {
        let mut state = self.state.lock();
        if let Some(fault) = self.fault.get() {
            return Err(fault.to_error());
        }
        state.transport.open()?;
        state.transport.set_timeout(read_timeout)?;
        debug!("Transport {} opened", state.transport);
        Ok(dyn_clone::clone_box(&*state.transport))
    }

    pub(crate) fn close(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        debug!("Closing transport {}", state.transport);
        state.transport.close()
    }

    pub(crate) fn transport_name(&self) -> String {
        self.state.lock().transport.to_string()
    }

    /// Writes a single-byte command followed by its raw arguments.
    pub(crate) fn send_fixed(&self, command: u8, args: &[u8]) -> Result<(), Error> {
        if command & 0x80 == 0 {
            return Err(InvalidFrameByte {
                byte: command,
                context: "fixed command",
            }
            .into());
        }
        check_data_bytes("command argument", args)?;
        let mut bytes = Vec::with_capacity(args.len() + 1);
        bytes.push(command);
        bytes.extend_from_slice(args);
        self.write(&bytes)
    }

    /// Writes a ranged command: `family | target`, then the value.
    ///
    /// I/O messages carry a 14-bit value split 7+7, reporting toggles a single byte.
    pub(crate) fn send_ranged(&self, family: u8, target: u8, value: u16) -> Result<(), Error> {
        if target > 0x0F {
            return Err(OutOfRange {
                context: "ranged command pin/port",
                value: target as usize,
                max: 0x0F,
            }
            .into());
        }
        let bytes = match family {
            ANALOG_MESSAGE | DIGITAL_MESSAGE => {
                if value > MAX_14BIT_VALUE {
                    return Err(OutOfRange {
                        context: "ranged command value",
                        value: value as usize,
                        max: MAX_14BIT_VALUE as usize,
                    }
                    .into());
                }
                let (lsb, msb) = split_14bit(value);
                vec![family | target, lsb, msb]
            }
            REPORT_ANALOG | REPORT_DIGITAL => {
                if value > 0x7F {
                    return Err(OutOfRange {
                        context: "report toggle value",
                        value: value as usize,
                        max: 0x7F,
                    }
                    .into());
                }
                vec![family | target, value as u8]
            }
            _ => {
                return Err(InvalidFrameByte {
                    byte: family,
                    context: "ranged command family",
                }
                .into())
            }
        };
        self.write(&bytes)
    }

    /// Writes a sysex frame.
    ///
    /// When `command` elicits a reply (see [`SysexCommand::expected_response`]), the waiter is
    /// queued before the write lock is released and handed back.
    pub(crate) fn send_sysex(&self, command: u8, body: &[u8]) -> Result<Option<PendingReply>, Error> {
        if command & 0x80 != 0 {
            return Err(OutOfRange {
                context: "sysex command id",
                value: command as usize,
                max: 0x7F,
            }
            .into());
        }
        check_data_bytes("sysex body byte", body)?;

        let mut bytes = Vec::with_capacity(body.len() + 3);
        bytes.push(START_SYSEX);
        bytes.push(command);
        bytes.extend_from_slice(body);
        bytes.push(END_SYSEX);

        let mut state = self.state.lock();
        self.write_locked(&mut state, &bytes)?;
        match SysexCommand::from(command).expected_response() {
            Some(response) => {
                let (sender, receiver) = oneshot::channel();
                state.pending.push(u8::from(response), sender);
                Ok(Some(PendingReply::new(receiver, self.fault.clone())))
            }
            None => Ok(None),
        }
    }

    /// Pops the oldest waiter for `response` and hands it `body`.
    pub(crate) fn resolve(&self, response: u8, body: Vec<u8>) -> Result<(), Vec<u8>> {
        self.state.lock().pending.resolve(response, body)
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self, response: u8) -> usize {
        self.state.lock().pending.len(response)
    }

    /// Records the fault and drops every queued waiter.
    pub(crate) fn fault(&self, fault: Fault) -> bool {
        let mut state = self.state.lock();
        let recorded = self.fault.set(fault);
        state.pending.clear();
        recorded
    }

    fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.write_locked(&mut state, bytes)
    }

    fn write_locked(&self, state: &mut WriterState, bytes: &[u8]) -> Result<(), Error> {
        if let Some(fault) = self.fault.get() {
            return Err(fault.to_error());
        }
        trace!("Write: [{}]", format_as_hex(bytes));
        state.transport.write(bytes)
    }
}

fn check_data_bytes(context: &'static str, bytes: &[u8]) -> Result<(), Error> {
    match bytes.iter().find(|byte| *byte & 0x80 != 0) {
        Some(byte) => Err(OutOfRange {
            context,
            value: *byte as usize,
            max: 0x7F,
        }
        .into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockTransport;

    fn opened_writer() -> (CommandWriter, MockTransport) {
        let transport = MockTransport::new();
        let writer = CommandWriter::new(Box::new(transport.clone()));
        writer.open(Duration::from_millis(10)).unwrap();
        (writer, transport)
    }

    #[test]
    fn test_send_fixed() {
        let (writer, transport) = opened_writer();
        writer.send_fixed(SET_PIN_MODE, &[13, 1]).unwrap();
        writer.send_fixed(SYSTEM_RESET, &[]).unwrap();
        assert_eq!(
            transport.take_written(),
            vec![0xF4, 0x0D, 0x01, 0xFF],
            "Unexpected bytes: [{}]",
            format_as_hex(&transport.written())
        );

        assert!(writer.send_fixed(0x10, &[]).is_err());
        assert!(writer.send_fixed(SET_PIN_MODE, &[0x80, 1]).is_err());
        assert!(transport.written().is_empty());
    }

    #[test]
    fn test_send_ranged() {
        let (writer, transport) = opened_writer();
        writer.send_ranged(ANALOG_MESSAGE, 3, 1023).unwrap();
        writer.send_ranged(DIGITAL_MESSAGE, 1, 0x85).unwrap();
        writer.send_ranged(REPORT_DIGITAL, 1, 1).unwrap();
        writer.send_ranged(REPORT_ANALOG, 0, 0).unwrap();
        assert_eq!(
            transport.take_written(),
            vec![0xE3, 0x7F, 0x07, 0x91, 0x05, 0x01, 0xD1, 0x01, 0xC0, 0x00]
        );

        assert!(writer.send_ranged(ANALOG_MESSAGE, 16, 0).is_err());
        assert!(writer.send_ranged(ANALOG_MESSAGE, 1, 0x4000).is_err());
        assert!(writer.send_ranged(0xA0, 1, 0).is_err());
        assert!(transport.written().is_empty());
    }

    #[test]
    fn test_send_sysex_registers_waiter() {
        let (writer, transport) = opened_writer();
        let reply = writer.send_sysex(CAPABILITY_QUERY, &[]).unwrap();
        assert!(reply.is_some());
        assert_eq!(writer.pending_count(CAPABILITY_RESPONSE), 1);

        let reply = writer.send_sysex(I2C_CONFIG, &[0x00, 0x00]).unwrap();
        assert!(reply.is_none());

        assert_eq!(
            transport.take_written(),
            vec![0xF0, 0x6B, 0xF7, 0xF0, 0x78, 0x00, 0x00, 0xF7]
        );
        assert!(writer.send_sysex(0x80, &[]).is_err());
        assert!(writer.send_sysex(STRING_DATA, &[0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_fault_drains_and_blocks() {
        let (writer, _transport) = opened_writer();
        let reply = writer.send_sysex(REPORT_FIRMWARE, &[]).unwrap().unwrap();

        assert!(writer.fault(Fault::Disconnected));
        assert!(!writer.fault(Fault::Failed(String::from("later"))));
        assert_eq!(writer.fault_state().get(), Some(Fault::Disconnected));

        assert!(reply.wait().await.unwrap_err().is_disconnected());
        assert!(writer
            .send_fixed(SYSTEM_RESET, &[])
            .unwrap_err()
            .is_disconnected());
        assert!(writer.send_sysex(CAPABILITY_QUERY, &[]).is_err());
        assert_eq!(writer.pending_count(CAPABILITY_RESPONSE), 0);
    }

    #[test]
    fn test_write_before_open() {
        let writer = CommandWriter::new(Box::new(MockTransport::new()));
        let error = writer.send_fixed(SYSTEM_RESET, &[]).unwrap_err();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Connection has not been initialized."
        );
    }
}
