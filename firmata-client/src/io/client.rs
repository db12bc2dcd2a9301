use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::errors::HardwareError::{IncompatibleMode, NotQueried, OutOfRange, UnknownPin, Unsupported};
use crate::errors::ProtocolError::{Timeout, UnexpectedReply};
use crate::errors::*;
use crate::io::codec::{encode_ascii_pairs, split_14bit};
use crate::io::constants::*;
use crate::io::data::*;
use crate::io::pending::PendingReply;
use crate::io::reader::FrameReader;
use crate::io::registry::{Listener, ListenerKind, ListenerRegistry};
use crate::io::transports::IoTransport;
use crate::io::writer::{CommandWriter, Fault};
pub use crate::utils::events::{ClientEvent, EventPayload};
use crate::utils::events::{EventHandler, EventManager};

/// Typed client configuration.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bounds every wait for a device reply (queries, I2C and 1-Wire transactions).
    /// `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// Transport poll timeout used by the reader thread to notice a shutdown.
    pub read_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            response_timeout: None,
            read_timeout: Duration::from_millis(500),
        }
    }
}

impl ClientOptions {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Snapshots from the device, refreshed by every successful query and never invalidated.
#[derive(Debug, Default)]
pub(crate) struct DeviceCache {
    pub(crate) firmware: Option<FirmwareReport>,
    pub(crate) protocol_version: Option<ProtocolVersion>,
    pub(crate) capabilities: Option<CapabilityResponse>,
    pub(crate) analog_mapping: Option<AnalogMappingResponse>,
    /// Last mode set through this client.
    pub(crate) modes: HashMap<u8, PinModeId>,
    pub(crate) i2c_configured: bool,
}

/// State shared by the client handles and the reader thread.
pub(crate) struct Shared {
    pub(crate) writer: CommandWriter,
    pub(crate) registry: ListenerRegistry,
    pub(crate) cache: RwLock<DeviceCache>,
    pub(crate) dropped_analog: AtomicUsize,
    closing: AtomicBool,
    connected: AtomicBool,
    events: EventManager,
    runtime: Mutex<Option<Handle>>,
    /// Pins with digital reporting enabled, as one bitmask per port.
    report_ports: Mutex<[u8; 16]>,
}

impl Shared {
    fn new(transport: Box<dyn IoTransport>) -> Self {
        Self {
            writer: CommandWriter::new(transport),
            registry: ListenerRegistry::default(),
            cache: RwLock::new(DeviceCache::default()),
            dropped_analog: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            events: EventManager::default(),
            runtime: Mutex::new(None),
            report_ports: Mutex::new([0; 16]),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Moves the client to its faulted state: every waiter and listener is released, and every
    /// later call fails with the recorded fault.
    ///
    /// The first recorded fault wins. Every caller leaves the client stopped when it returns; only
    /// the first one emits the event.
    pub(crate) fn terminate(&self, cause: Option<Error>) {
        let fault = match cause {
            Some(error) if !self.is_closing() && !error.is_disconnected() => {
                // The outer `Faulted` display ends the sentence.
                Fault::Failed(error.to_string().trim_end_matches('.').to_string())
            }
            _ => Fault::Disconnected,
        };
        let recorded = self.writer.fault(fault.clone());
        self.connected.store(false, Ordering::SeqCst);
        self.registry.close();
        if !recorded {
            return;
        }
        match fault {
            Fault::Disconnected => {
                debug!("Client on {} stopped", self.writer.transport_name());
                self.emit(EventPayload::Closed);
            }
            Fault::Failed(info) => {
                error!("Firmata reader stopped: {}", info);
                self.emit(EventPayload::Faulted(info));
            }
        }
    }

    fn emit(&self, payload: EventPayload) {
        if let Some(runtime) = self.runtime.lock().as_ref() {
            self.events.emit(runtime, payload);
        }
    }
}

struct ClientInner {
    shared: Arc<Shared>,
    options: ClientOptions,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.shared.connected.load(Ordering::SeqCst) {
            self.shared.closing.store(true, Ordering::SeqCst);
            self.shared.terminate(None);
            let _ = self.shared.writer.close();
        }
    }
}

/// A Firmata client over a duplex byte stream.
///
/// The client owns the stream, the write lock, the listener registry and the pending response
/// queues. Cloning is cheap: all clones drive the same connection.
///
/// # Example
/// ```no_run
/// use firmata_client::io::{Client, Serial};
///
/// #[tokio::main]
/// async fn main() -> Result<(), firmata_client::errors::Error> {
///     let client = Client::new(Serial::new("/dev/ttyACM0"));
///     let firmware = client.start().await?;
///     println!("Connected to {}", firmware);
///     client.query_capabilities().await?;
///     client.close()
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.shared().writer.transport_name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Client {
    pub fn new<T: IoTransport + 'static>(transport: T) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options<T: IoTransport + 'static>(transport: T, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                shared: Arc::new(Shared::new(Box::new(transport))),
                options,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn options(&self) -> ClientOptions {
        self.inner.options
    }

    // ########################################
    // Lifecycle

    /// Opens the transport, launches the reader and waits for the firmware report.
    ///
    /// # Errors
    /// * Transport errors while opening.
    /// * `Timeout` when a response timeout is configured and the device stays silent.
    pub async fn start(&self) -> Result<FirmwareReport, Error> {
        let shared = self.shared();
        if self.is_connected() {
            return self.firmware().ok_or_else(|| {
                NotQueried {
                    what: "firmware",
                }
                .into()
            });
        }
        *shared.runtime.lock() = Handle::try_current().ok();

        let transport = shared.writer.open(self.inner.options.read_timeout)?;
        // The waiter is queued before the reader exists: the boot announcement resolves it too.
        let reply = shared.writer.send_sysex(REPORT_FIRMWARE, &[])?;
        FrameReader::spawn(transport, self.inner.shared.clone())?;
        shared.connected.store(true, Ordering::SeqCst);
        debug!("Client started on {}", shared.writer.transport_name());

        let firmware = match self.wait_reply(reply, "firmware query").await {
            Ok(body) => FirmwareReport::from_body(&body),
            Err(error) => Err(error),
        };
        let firmware = match firmware {
            Ok(firmware) => firmware,
            Err(error) => {
                let _ = self.close();
                return Err(error);
            }
        };
        shared.cache.write().firmware = Some(firmware.clone());
        shared.emit(EventPayload::Ready(firmware.clone()));
        Ok(firmware)
    }

    /// Closes the transport: the reader stops, every pending call fails with `Disconnected`.
    pub fn close(&self) -> Result<(), Error> {
        let shared = self.shared();
        shared.closing.store(true, Ordering::SeqCst);
        shared.terminate(None);
        shared.writer.close()
    }

    /// Checks if the reader is running and no fault occurred.
    pub fn is_connected(&self) -> bool {
        self.shared().connected.load(Ordering::SeqCst) && self.fault().is_none()
    }

    /// The reason the client stopped, if it did.
    pub fn fault(&self) -> Option<Fault> {
        self.shared().writer.fault_state().get()
    }

    /// Registers a callback for a client event. See [`ClientEvent`] for the payloads.
    ///
    /// Callbacks are spawned on the runtime that started the client.
    pub fn on<F, Fut>(&self, event: ClientEvent, callback: F) -> EventHandler
    where
        F: FnMut(EventPayload) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared().events.on(event, callback)
    }

    /// Removes a callback registered with [`Client::on`].
    pub fn off(&self, handler: EventHandler) -> bool {
        self.shared().events.unregister(handler)
    }

    // ########################################
    // Raw writer

    /// Writes a single-byte command (`0x80..=0xFF`) followed by 7-bit arguments.
    pub fn send_fixed(&self, command: u8, args: &[u8]) -> Result<(), Error> {
        self.shared().writer.send_fixed(command, args)
    }

    /// Writes a ranged command (`family | target`): 14-bit value for I/O messages,
    /// single byte for reporting toggles.
    pub fn send_ranged(&self, family: u8, target: u8, value: u16) -> Result<(), Error> {
        self.shared().writer.send_ranged(family, target, value)
    }

    /// Writes a sysex frame; returns the reply waiter when the command elicits one.
    pub fn send_sysex(&self, command: u8, body: &[u8]) -> Result<Option<PendingReply>, Error> {
        self.shared().writer.send_sysex(command, body)
    }

    // ########################################
    // Listeners

    pub fn listen_digital(&self, pin: u8) -> Result<Listener<Level>, Error> {
        self.check_fault()?;
        self.shared().registry.digital.register(pin as usize)
    }

    pub fn listen_analog(&self, channel: u8) -> Result<Listener<u16>, Error> {
        self.check_fault()?;
        self.shared().registry.analog.register(channel as usize)
    }

    pub fn listen_i2c(&self, address: u16) -> Result<Listener<I2CPacket>, Error> {
        self.check_fault()?;
        self.shared().registry.i2c.register(address as usize)
    }

    pub fn listen_onewire(&self, pin: u8) -> Result<Listener<Vec<u8>>, Error> {
        self.check_fault()?;
        self.shared().registry.onewire.register(pin as usize)
    }

    /// Subscribes to every sysex frame carrying `command` (custom firmware features).
    ///
    /// I2C and 1-Wire replies are routed by address/pin and cannot be subscribed to here.
    pub fn listen_sysex(&self, command: u8) -> Result<Listener<Vec<u8>>, Error> {
        self.check_fault()?;
        if command == I2C_REPLY || command == ONEWIRE_DATA {
            return Err(Unsupported {
                feature: format!("sysex listener for routed command {:#04X}", command),
            }
            .into());
        }
        self.shared().registry.sysex.register(command as usize)
    }

    pub fn is_listening(&self, kind: ListenerKind, key: usize) -> bool {
        self.shared().registry.is_registered(kind, key)
    }

    /// Number of analog frames discarded because no listener was registered for their channel.
    pub fn dropped_analog_frames(&self) -> usize {
        self.shared().dropped_analog.load(Ordering::Relaxed)
    }

    // ########################################
    // Queries

    /// Queries the firmware name and version (REPORT_FIRMWARE).
    pub async fn query_firmware(&self) -> Result<FirmwareReport, Error> {
        let reply = self.send_sysex(REPORT_FIRMWARE, &[])?;
        let firmware = FirmwareReport::from_body(&self.wait_reply(reply, "firmware query").await?)?;
        self.shared().cache.write().firmware = Some(firmware.clone());
        Ok(firmware)
    }

    /// Queries the supported modes of every pin and caches them.
    pub async fn query_capabilities(&self) -> Result<CapabilityResponse, Error> {
        let reply = self.send_sysex(CAPABILITY_QUERY, &[])?;
        let capabilities =
            CapabilityResponse::from_body(&self.wait_reply(reply, "capability query").await?)?;
        self.shared().cache.write().capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// Queries the analog channel of every pin and caches it.
    pub async fn query_analog_mapping(&self) -> Result<AnalogMappingResponse, Error> {
        let reply = self.send_sysex(ANALOG_MAPPING_QUERY, &[])?;
        let mapping =
            AnalogMappingResponse::from_body(&self.wait_reply(reply, "analog mapping query").await?);
        self.shared().cache.write().analog_mapping = Some(mapping.clone());
        Ok(mapping)
    }

    /// Queries the current mode and state of `pin`.
    pub async fn query_pin_state(&self, pin: u8) -> Result<PinStateResponse, Error> {
        check_pin(pin)?;
        let reply = self.send_sysex(PIN_STATE_QUERY, &[pin])?;
        let state = PinStateResponse::from_body(&self.wait_reply(reply, "pin state query").await?)?;
        if state.pin != pin {
            return Err(UnexpectedReply {
                context: format!("pin state for pin {} while pin {} was queried", state.pin, pin),
            }
            .into());
        }
        Ok(state)
    }

    /// Asks the device to report its protocol version. The answer lands in [`Client::protocol_version`].
    pub fn query_protocol_version(&self) -> Result<(), Error> {
        self.send_fixed(REPORT_VERSION, &[])
    }

    // ########################################
    // Device commands

    /// Resets the firmware; the client forgets modes, reporting and I2C configuration.
    pub fn system_reset(&self) -> Result<(), Error> {
        self.send_fixed(SYSTEM_RESET, &[])?;
        *self.shared().report_ports.lock() = [0; 16];
        let mut cache = self.shared().cache.write();
        cache.modes.clear();
        cache.i2c_configured = false;
        Ok(())
    }

    /// Sets the `mode` of `pin`, validated against the capabilities when they were queried.
    pub fn set_pin_mode(&self, pin: u8, mode: PinModeId) -> Result<(), Error> {
        check_pin(pin)?;
        if let Some(capabilities) = &self.shared().cache.read().capabilities {
            if capabilities.modes(pin).is_none() {
                return Err(UnknownPin { pin }.into());
            }
            if capabilities.supports(pin, mode).is_none() {
                return Err(IncompatibleMode {
                    pin,
                    mode,
                    context: "mode not supported by the pin",
                }
                .into());
            }
        }
        self.send_fixed(SET_PIN_MODE, &[pin, mode.into()])?;
        self.shared().cache.write().modes.insert(pin, mode);
        Ok(())
    }

    /// Last mode set on `pin` through this client.
    pub fn pin_mode(&self, pin: u8) -> Option<PinModeId> {
        self.shared().cache.read().modes.get(&pin).copied()
    }

    /// Sets the level of a single digital pin (SET_DIGITAL_PIN_VALUE).
    pub fn digital_write(&self, pin: u8, level: Level) -> Result<(), Error> {
        check_pin(pin)?;
        self.send_fixed(SET_DIGITAL_PIN_VALUE, &[pin, level.into()])
    }

    /// Sets the levels of the 8 pins of `port` at once.
    pub fn write_port(&self, port: u8, mask: u8) -> Result<(), Error> {
        self.send_ranged(DIGITAL_MESSAGE, port, mask as u16)
    }

    /// Writes an analog (PWM, servo...) value.
    ///
    /// Pins above 15 or values above 14 bits go through EXTENDED_ANALOG.
    pub fn analog_write(&self, pin: u8, value: u32) -> Result<(), Error> {
        if pin <= 0x0F && value <= MAX_14BIT_VALUE as u32 {
            return self.send_ranged(ANALOG_MESSAGE, pin, value as u16);
        }
        check_pin(pin)?;
        let mut body = vec![pin];
        let mut remaining = value;
        loop {
            body.push((remaining & 0x7F) as u8);
            remaining >>= 7;
            if remaining == 0 && body.len() >= 3 {
                break;
            }
        }
        self.send_sysex(EXTENDED_ANALOG, &body).map(|_| ())
    }

    /// Toggles the reporting of analog `channel`.
    pub fn report_analog(&self, channel: u8, enabled: bool) -> Result<(), Error> {
        self.send_ranged(REPORT_ANALOG, channel, enabled as u16)
    }

    /// Toggles the reporting of `pin`.
    ///
    /// Reporting is enabled per port on the device: the port stays reported while at least one of
    /// its pins asked for it.
    pub fn report_digital(&self, pin: u8, enabled: bool) -> Result<(), Error> {
        let port = pin / PINS_PER_PORT;
        if port > 0x0F {
            return Err(OutOfRange {
                context: "digital report port",
                value: port as usize,
                max: 0x0F,
            }
            .into());
        }
        let mut ports = self.shared().report_ports.lock();
        let mask = ports[port as usize];
        let bit = 1u8 << (pin % PINS_PER_PORT);
        let updated = match enabled {
            true => mask | bit,
            false => mask & !bit,
        };
        if (mask != 0) != (updated != 0) {
            self.send_ranged(REPORT_DIGITAL, port, (updated != 0) as u16)?;
        }
        ports[port as usize] = updated;
        Ok(())
    }

    /// Sets the sampling interval of analog reporting and I2C continuous reads.
    pub fn sampling_interval(&self, interval: Duration) -> Result<(), Error> {
        let (lsb, msb) = split_14bit(bounded_14bit("sampling interval (ms)", interval.as_millis())?);
        self.send_sysex(SAMPLING_INTERVAL, &[lsb, msb]).map(|_| ())
    }

    /// Enables I2C on the device, with `delay` between a write and the following read.
    pub fn i2c_config(&self, delay: Duration) -> Result<(), Error> {
        let (lsb, msb) = split_14bit(bounded_14bit("i2c read delay (us)", delay.as_micros())?);
        self.send_sysex(I2C_CONFIG, &[lsb, msb])?;
        self.shared().cache.write().i2c_configured = true;
        Ok(())
    }

    pub fn is_i2c_configured(&self) -> bool {
        self.shared().cache.read().i2c_configured
    }

    /// Sends a STRING_DATA message to the device.
    pub fn send_string(&self, text: &str) -> Result<(), Error> {
        self.send_sysex(STRING_DATA, &encode_ascii_pairs(text)).map(|_| ())
    }

    // ########################################
    // Cached lookups

    /// `A{channel}` for analog-mapped pins, `D{pin}` otherwise.
    pub fn pin_name(&self, pin: u8) -> String {
        let channel = self
            .shared()
            .cache
            .read()
            .analog_mapping
            .as_ref()
            .and_then(|mapping| mapping.channels.get(pin as usize).copied().flatten());
        match channel {
            Some(channel) => format!("A{}", channel),
            None => format!("D{}", pin),
        }
    }

    /// The supported modes of `pin`, from the cached capabilities.
    pub fn pin_modes(&self, pin: u8) -> Result<Vec<PinMode>, Error> {
        let cache = self.shared().cache.read();
        let capabilities = cache.capabilities.as_ref().ok_or(NotQueried {
            what: "capabilities",
        })?;
        Ok(capabilities.modes(pin).ok_or(UnknownPin { pin })?.to_vec())
    }

    /// The pin carrying analog `channel`, from the cached analog mapping.
    pub fn analog_pin_to_digital(&self, channel: u8) -> Result<u8, Error> {
        let cache = self.shared().cache.read();
        let mapping = cache.analog_mapping.as_ref().ok_or(NotQueried {
            what: "analog mapping",
        })?;
        Ok(mapping.pin_of(channel).ok_or(UnknownPin { pin: channel })?)
    }

    /// The analog channel of `pin` (`None` for a non analog pin), from the cached analog mapping.
    pub fn digital_pin_to_analog(&self, pin: u8) -> Result<Option<u8>, Error> {
        let cache = self.shared().cache.read();
        let mapping = cache.analog_mapping.as_ref().ok_or(NotQueried {
            what: "analog mapping",
        })?;
        Ok(*mapping.channels.get(pin as usize).ok_or(UnknownPin { pin })?)
    }

    pub fn firmware(&self) -> Option<FirmwareReport> {
        self.shared().cache.read().firmware.clone()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.shared().cache.read().protocol_version
    }

    pub fn capabilities(&self) -> Option<CapabilityResponse> {
        self.shared().cache.read().capabilities.clone()
    }

    pub fn analog_mapping(&self) -> Option<AnalogMappingResponse> {
        self.shared().cache.read().analog_mapping.clone()
    }

    // ########################################
    // Waiting helpers

    /// Waits for the next value of `listener`, within the configured response timeout.
    ///
    /// # Errors
    /// * `Disconnected` / `Faulted`: the client stopped.
    /// * `Timeout`: nothing arrived in time.
    pub async fn next_from<T>(
        &self,
        listener: &mut Listener<T>,
        operation: &'static str,
    ) -> Result<T, Error> {
        self.bounded(operation, async {
            match listener.recv().await {
                Some(value) => Ok(value),
                None => Err(self.shared().writer.fault_state().error()),
            }
        })
        .await
    }

    pub(crate) async fn wait_reply(
        &self,
        reply: Option<PendingReply>,
        operation: &'static str,
    ) -> Result<Vec<u8>, Error> {
        let reply = reply.ok_or_else(|| {
            Error::from(UnexpectedReply {
                context: format!("'{}' does not expect a reply", operation),
            })
        })?;
        self.bounded(operation, reply.wait()).await
    }

    async fn bounded<T, F>(&self, operation: &'static str, future: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match self.inner.options.response_timeout {
            Some(duration) => tokio::time::timeout(duration, future)
                .await
                .map_err(|_| Error::from(Timeout { operation }))?,
            None => future.await,
        }
    }

    fn check_fault(&self) -> Result<(), Error> {
        match self.fault() {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }
}

fn check_pin(pin: u8) -> Result<(), Error> {
    match pin {
        0..=0x7F => Ok(()),
        _ => Err(OutOfRange {
            context: "pin number",
            value: pin as usize,
            max: 0x7F,
        }
        .into()),
    }
}

fn bounded_14bit(context: &'static str, value: u128) -> Result<u16, Error> {
    match u16::try_from(value) {
        Ok(value) if value <= MAX_14BIT_VALUE => Ok(value),
        _ => Err(OutOfRange {
            context,
            value: usize::try_from(value).unwrap_or(usize::MAX),
            max: MAX_14BIT_VALUE as usize,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Frame;
    use crate::mocks::{firmware_frame, started_client, started_client_with_options, MockTransport};
    use crate::utils::helpers::format_as_hex;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_handshake() {
        let transport = MockTransport::new();
        transport.push(&firmware_frame());
        let client = Client::new(transport.clone());
        assert!(!client.is_connected());

        let firmware = client.start().await.unwrap();
        assert_eq!(firmware.name, "Mock");
        assert_eq!(firmware.major, 2);
        assert!(client.is_connected());
        assert_eq!(client.firmware(), Some(firmware));
        assert_eq!(
            transport.written(),
            vec![0xF0, 0x79, 0xF7],
            "Unexpected start sequence: [{}]",
            format_as_hex(&transport.written())
        );
        client.close().unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.fault(), Some(Fault::Disconnected));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_observed_on_return() {
        // The reader wakes up on close and races it to stop the client.
        for _ in 0..20 {
            let (client, _transport) = started_client().await;
            client.close().unwrap();
            assert_eq!(client.fault(), Some(Fault::Disconnected));
            assert!(!client.is_connected());
            assert!(client.listen_analog(0).unwrap_err().is_disconnected());
            assert!(client.send_fixed(SYSTEM_RESET, &[]).is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_timeout() {
        let transport = MockTransport::new();
        let client = Client::with_options(
            transport,
            ClientOptions::default().with_response_timeout(Duration::from_millis(50)),
        );
        let error = client.start().await.unwrap_err();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Operation 'firmware query' timed out."
        );
        assert!(!client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_correlation() {
        let (client, transport) = started_client().await;
        let first = client.send_sysex(CAPABILITY_QUERY, &[]).unwrap().unwrap();
        let second = client.send_sysex(CAPABILITY_QUERY, &[]).unwrap().unwrap();

        transport.push(&[0xF0, 0x6C, 0x00, 0x01, 0x7F, 0xF7]);
        transport.push(&[0xF0, 0x6C, 0x01, 0x01, 0x7F, 0xF7]);

        assert_eq!(first.wait().await.unwrap(), vec![0x00, 0x01, 0x7F]);
        assert_eq!(second.wait().await.unwrap(), vec![0x01, 0x01, 0x7F]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capability_scenario() {
        let (client, transport) = started_client().await;
        let query = {
            let client = client.clone();
            tokio::spawn(async move { client.query_capabilities().await })
        };
        assert_eq!(transport.written_until(3).await, vec![0xF0, 0x6B, 0xF7]);
        transport.push(&[0xF0, 0x6C, 0x00, 0x01, 0x7F, 0x01, 0x0F, 0xF7]);
        let capabilities = query.await.unwrap().unwrap();
        assert_eq!(capabilities.pins.len(), 2);
        assert_eq!(
            capabilities.pins[0],
            vec![PinMode {
                id: PinModeId::INPUT,
                resolution: 1
            }]
        );
        assert_eq!(
            capabilities.pins[1],
            vec![PinMode {
                id: PinModeId::OUTPUT,
                resolution: 0x0F
            }]
        );
        assert_eq!(client.capabilities(), Some(capabilities));
        assert_eq!(client.pin_modes(1).unwrap().len(), 1);
        assert!(client.pin_modes(5).is_err());

        // Cached capabilities validate pin modes.
        assert!(client.set_pin_mode(1, PinModeId::OUTPUT).is_ok());
        assert_eq!(client.pin_mode(1), Some(PinModeId::OUTPUT));
        assert!(client.set_pin_mode(1, PinModeId::PWM).is_err());
        assert!(client.set_pin_mode(9, PinModeId::OUTPUT).is_err());
        assert_eq!(transport.take_written(), vec![0xF4, 0x01, 0x01]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_analog_mapping_lookups() {
        let (client, transport) = started_client().await;
        assert!(client.analog_pin_to_digital(0).is_err());
        assert_eq!(client.pin_name(14), "D14");

        let query = {
            let client = client.clone();
            tokio::spawn(async move { client.query_analog_mapping().await })
        };
        transport.written_until(3).await;
        transport.push(&[0xF0, 0x6A, 0x7F, 0x7F, 0x00, 0x01, 0xF7]);
        query.await.unwrap().unwrap();
        assert_eq!(client.analog_pin_to_digital(1).unwrap(), 3);
        assert_eq!(client.digital_pin_to_analog(2).unwrap(), Some(0));
        assert_eq!(client.digital_pin_to_analog(0).unwrap(), None);
        assert!(client.digital_pin_to_analog(10).is_err());
        assert_eq!(client.pin_name(2), "A0");
        assert_eq!(client.pin_name(1), "D1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pin_state_query() {
        let (client, transport) = started_client().await;
        let query = |pin: u8| {
            let client = client.clone();
            tokio::spawn(async move { client.query_pin_state(pin).await })
        };

        let state = query(13);
        assert_eq!(transport.written_until(4).await, vec![0xF0, 0x6D, 0x0D, 0xF7]);
        transport.push(&[0xF0, 0x6E, 0x0D, 0x01, 0x01, 0xF7]);
        let state = state.await.unwrap().unwrap();
        assert_eq!(state.mode, PinModeId::OUTPUT);
        assert_eq!(state.state, 1);

        // The reply names another pin.
        let state = query(13);
        transport.written_until(4).await;
        transport.push(&[0xF0, 0x6E, 0x0C, 0x01, 0x01, 0xF7]);
        assert!(state.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_analog_dispatch() {
        let (client, transport) = started_client().await;
        let mut listener = client.listen_analog(2).unwrap();
        let mut other = client.listen_analog(3).unwrap();

        transport.push(&Frame::Analog { pin: 2, value: 777 }.encode());
        assert_eq!(client.next_from(&mut listener, "analog").await.unwrap(), 777);
        assert_eq!(other.try_recv(), None);

        // No listener on channel 5: dropped and counted.
        transport.push(&Frame::Analog { pin: 5, value: 1 }.encode());
        transport.push(&Frame::Analog { pin: 3, value: 2 }.encode());
        assert_eq!(client.next_from(&mut other, "analog").await.unwrap(), 2);
        assert_eq!(client.dropped_analog_frames(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_digital_fan_out() {
        let (client, transport) = started_client().await;
        let mut pin8 = client.listen_digital(8).unwrap();
        let mut pin9 = client.listen_digital(9).unwrap();
        let mut pin10 = client.listen_digital(10).unwrap();

        // First observation: every pin of the port is notified.
        transport.push(&Frame::Digital { port: 1, value: 0b0000_0001 }.encode());
        assert_eq!(client.next_from(&mut pin8, "d8").await.unwrap(), Level::High);
        assert_eq!(client.next_from(&mut pin9, "d9").await.unwrap(), Level::Low);
        assert_eq!(client.next_from(&mut pin10, "d10").await.unwrap(), Level::Low);

        // Only pin 9 changes.
        transport.push(&Frame::Digital { port: 1, value: 0b0000_0011 }.encode());
        assert_eq!(client.next_from(&mut pin9, "d9").await.unwrap(), Level::High);
        // Marker frame on an unrelated port, observed after the previous one.
        let mut pin0 = client.listen_digital(0).unwrap();
        transport.push(&Frame::Digital { port: 0, value: 1 }.encode());
        assert_eq!(client.next_from(&mut pin0, "d0").await.unwrap(), Level::High);
        assert_eq!(pin8.try_recv(), None);
        assert_eq!(pin10.try_recv(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exclusive_listeners() {
        let (client, _transport) = started_client().await;
        let listener = client.listen_i2c(0x20).unwrap();
        assert!(client.is_listening(ListenerKind::I2c, 0x20));
        assert!(client.listen_i2c(0x20).is_err());
        listener.release();
        assert!(!client.is_listening(ListenerKind::I2c, 0x20));
        assert!(client.listen_i2c(0x20).is_ok());
        assert!(client.listen_sysex(I2C_REPLY).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sysex_feature_listener() {
        let (client, transport) = started_client().await;
        let mut listener = client.listen_sysex(0x01).unwrap();
        transport.push(&[0xF0, 0x01, 0x0A, 0x0B, 0xF7]);
        transport.push(&[0xF0, 0x01, 0x0C, 0xF7]);
        assert_eq!(client.next_from(&mut listener, "feature").await.unwrap(), vec![0x0A, 0x0B]);
        assert_eq!(client.next_from(&mut listener, "feature").await.unwrap(), vec![0x0C]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unexpected_sysex_faults_client() {
        let (client, transport) = started_client().await;
        let mut listener = client.listen_analog(0).unwrap();
        let faults = Arc::new(Mutex::new(None));
        let captured = faults.clone();
        client.on(ClientEvent::OnFault, move |payload| {
            let captured = captured.clone();
            async move {
                *captured.lock() = Some(payload);
            }
        });

        transport.push(&[0xF0, 0x6C, 0x00, 0xF7]);
        let error = client.next_from(&mut listener, "analog").await.unwrap_err();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Client is faulted: Protocol error: Unexpected sysex command 0x6C received while nothing was waiting for it."
        );
        assert!(!client.is_connected());
        assert!(client.system_reset().is_err());
        assert!(client.listen_analog(1).is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *faults.lock(),
            Some(EventPayload::Faulted(
                "Protocol error: Unexpected sysex command 0x6C received while nothing was waiting for it"
                    .into()
            ))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsolicited_messages_are_not_fatal() {
        let (client, transport) = started_client().await;
        let mut listener = client.listen_analog(0).unwrap();
        transport.push(&[0xF9, 0x02, 0x06]);
        transport.push(&firmware_frame());
        let mut text = vec![0xF0, STRING_DATA];
        text.extend(encode_ascii_pairs("hello"));
        text.push(0xF7);
        transport.push(&text);
        transport.push(&Frame::Analog { pin: 0, value: 12 }.encode());

        assert_eq!(client.next_from(&mut listener, "analog").await.unwrap(), 12);
        assert!(client.is_connected());
        assert_eq!(
            client.protocol_version(),
            Some(ProtocolVersion { major: 2, minor: 6 })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_i2c_reply_is_dropped() {
        let (client, transport) = started_client().await;
        let mut i2c = client.listen_i2c(0x20).unwrap();
        let mut analog = client.listen_analog(0).unwrap();

        // Register 0x0100 does not fit a byte.
        transport.push(&[0xF0, 0x77, 0x20, 0x00, 0x00, 0x02, 0x12, 0x00, 0xF7]);
        transport.push(&Frame::Analog { pin: 0, value: 5 }.encode());

        assert_eq!(client.next_from(&mut analog, "analog").await.unwrap(), 5);
        assert!(client.is_connected());
        assert_eq!(i2c.try_recv(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_fails_in_flight_calls() {
        let (client, transport) = started_client().await;
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        client.on(ClientEvent::OnClose, move |payload| {
            let flag = flag.clone();
            async move {
                flag.store(payload == EventPayload::Closed, Ordering::SeqCst);
            }
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.query_capabilities().await })
        };
        transport.written_until(3).await;
        transport.disconnect();

        let error = pending.await.unwrap().unwrap_err();
        assert!(error.is_disconnected());
        assert_eq!(client.fault(), Some(Fault::Disconnected));
        assert!(client.send_fixed(SYSTEM_RESET, &[]).unwrap_err().is_disconnected());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_response_timeout() {
        let (client, _transport) = started_client_with_options(
            ClientOptions::default().with_response_timeout(Duration::from_millis(50)),
        )
        .await;
        let error = client.query_analog_mapping().await.unwrap_err();
        assert_eq!(
            format!("{}", error),
            "Protocol error: Operation 'analog mapping query' timed out."
        );
        assert!(client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reply_after_timeout_goes_to_the_next_query() {
        let (client, transport) = started_client_with_options(
            ClientOptions::default().with_response_timeout(Duration::from_millis(100)),
        )
        .await;
        // The device never answers the first query.
        assert!(client.query_analog_mapping().await.is_err());
        transport.take_written();

        let query = {
            let client = client.clone();
            tokio::spawn(async move { client.query_analog_mapping().await })
        };
        transport.written_until(3).await;
        transport.push(&[0xF0, 0x6A, 0x7F, 0x00, 0xF7]);
        let mapping = query.await.unwrap().unwrap();
        assert_eq!(mapping.channels, vec![None, Some(0)]);
        assert!(client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_callbacks() {
        let transport = MockTransport::new();
        transport.push(&firmware_frame());
        let client = Client::new(transport.clone());
        let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
        for event in [ClientEvent::OnReady, ClientEvent::OnClose] {
            let sender = sender.clone();
            client.on(event, move |payload| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(payload);
                }
            });
        }
        let handler = client.on(ClientEvent::OnFault, |_| async {});
        assert!(client.off(handler));

        let firmware = client.start().await.unwrap();
        assert_eq!(received.recv().await, Some(EventPayload::Ready(firmware)));
        client.close().unwrap();
        assert_eq!(received.recv().await, Some(EventPayload::Closed));
        // A second close records nothing new.
        client.close().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_device_commands() {
        let (client, transport) = started_client().await;
        client.digital_write(13, Level::High).unwrap();
        client.write_port(1, 0x85).unwrap();
        client.analog_write(3, 255).unwrap();
        client.analog_write(20, 1000).unwrap();
        client.analog_write(3, 0x4000).unwrap();
        client.report_analog(1, true).unwrap();
        client.sampling_interval(Duration::from_millis(100)).unwrap();
        client.i2c_config(Duration::ZERO).unwrap();
        client.send_string("ok").unwrap();
        client.query_protocol_version().unwrap();
        client.system_reset().unwrap();
        assert_eq!(
            transport.take_written(),
            vec![
                0xF5, 0x0D, 0x01, // digital write
                0x91, 0x05, 0x01, // port 1
                0xE3, 0x7F, 0x01, // analog 3
                0xF0, 0x6F, 0x14, 0x68, 0x07, 0xF7, // extended analog pin 20
                0xF0, 0x6F, 0x03, 0x00, 0x00, 0x01, 0xF7, // extended analog value 0x4000
                0xC1, 0x01, // report analog 1
                0xF0, 0x7A, 0x64, 0x00, 0xF7, // sampling interval
                0xF0, 0x78, 0x00, 0x00, 0xF7, // i2c config
                0xF0, 0x71, b'o', 0x00, b'k', 0x00, 0xF7, // string
                0xF9, // protocol version
                0xFF, // reset
            ]
        );
        assert!(!client.is_i2c_configured());
        assert!(client.digital_write(0x80, Level::Low).is_err());
        assert!(client.sampling_interval(Duration::from_secs(60)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_report_digital_is_counted_per_port() {
        let (client, transport) = started_client().await;
        client.report_digital(8, true).unwrap();
        client.report_digital(9, true).unwrap();
        assert_eq!(transport.take_written(), vec![0xD1, 0x01]);

        client.report_digital(8, false).unwrap();
        assert!(transport.take_written().is_empty());
        client.report_digital(9, false).unwrap();
        assert_eq!(transport.take_written(), vec![0xD1, 0x00]);
        assert!(client.report_digital(128, true).is_err());
    }
}
