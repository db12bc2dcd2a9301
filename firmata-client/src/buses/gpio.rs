use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::HardwareError::{IncompatibleMode, Unsupported};
use crate::errors::ProtocolError::Disconnected;
use crate::errors::*;
use crate::io::{Client, Level, Listener, PinModeId};

/// Pull resistor requested when a pin becomes an input.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pull {
    /// Floating input.
    #[default]
    Float,
    /// Internal pull-up resistor.
    Up,
    /// Not available on Firmata devices.
    Down,
    /// Keeps the current mode, which must already be an input.
    NoChange,
}

/// Level transitions [`GpioPin::wait_for_edge`] waits for.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    fn matches(&self, rising: bool, falling: bool) -> bool {
        match self {
            Edge::None => false,
            Edge::Rising => rising,
            Edge::Falling => falling,
            Edge::Both => rising || falling,
        }
    }
}

/// Rising / falling flags of a level observation.
///
/// The first observation has no reference level: it counts as both edges.
fn transitions(previous: Option<Level>, current: Level) -> (bool, bool) {
    match previous {
        None => (true, true),
        Some(previous) => (
            previous == Level::Low && current == Level::High,
            previous == Level::High && current == Level::Low,
        ),
    }
}

#[derive(Default)]
struct PinState {
    edge: Edge,
    level: Option<Level>,
    /// Transient channels of the running `wait_for_edge` calls.
    waiters: Vec<UnboundedSender<(Option<Level>, Level)>>,
}

/// A single digital pin of the device.
pub struct GpioPin {
    client: Client,
    pin: u8,
    state: Arc<Mutex<PinState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for GpioPin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GpioPin")
            .field("pin", &self.pin)
            .field("edge", &state.edge)
            .field("level", &state.level)
            .finish()
    }
}

impl GpioPin {
    pub fn new(client: &Client, pin: u8) -> Self {
        Self {
            client: client.clone(),
            pin,
            state: Arc::new(Mutex::new(PinState::default())),
            watcher: Mutex::new(None),
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Turns the pin into an input and starts watching its level changes.
    ///
    /// # Errors
    /// * `Unsupported`: [`Pull::Down`].
    /// * `IncompatibleMode`: [`Pull::NoChange`] on a pin which is not an input.
    pub async fn input(&self, pull: Pull, edge: Edge) -> Result<(), Error> {
        let mode = match pull {
            Pull::Float => PinModeId::INPUT,
            Pull::Up => PinModeId::PULLUP,
            Pull::Down => {
                return Err(Unsupported {
                    feature: String::from("pull-down inputs"),
                }
                .into())
            }
            Pull::NoChange => {
                let current = self.client.query_pin_state(self.pin).await?.mode;
                if !current.is_input() {
                    return Err(IncompatibleMode {
                        pin: self.pin,
                        mode: current,
                        context: "pin is not an input and no pull was requested",
                    }
                    .into());
                }
                current
            }
        };
        self.client.set_pin_mode(self.pin, mode)?;
        self.state.lock().edge = edge;

        {
            let mut watcher = self.watcher.lock();
            if !watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
                let listener = self.client.listen_digital(self.pin)?;
                self.state.lock().level = None;
                *watcher = Some(tokio::spawn(watch(listener, self.state.clone())));
                debug!("Watching {}", self.client.pin_name(self.pin));
            }
        }
        self.client.report_digital(self.pin, true)
    }

    /// The current level: the last reported one while watching, queried otherwise.
    pub async fn read(&self) -> Result<Level, Error> {
        let cached = self.state.lock().level;
        if let Some(level) = cached {
            return Ok(level);
        }
        let state = self.client.query_pin_state(self.pin).await?;
        Ok(Level::from(state.state != 0))
    }

    /// Waits for the edge requested by [`GpioPin::input`].
    ///
    /// Returns `false` when `timeout` elapses first, or right away when no edge was requested.
    pub async fn wait_for_edge(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        if !self.is_watching() {
            return Err(IncompatibleMode {
                pin: self.pin,
                mode: self.client.pin_mode(self.pin).unwrap_or_default(),
                context: "pin is not watched as an input",
            }
            .into());
        }
        let (sender, mut receiver) = unbounded_channel();
        let edge = {
            let mut state = self.state.lock();
            if state.edge == Edge::None {
                return Ok(false);
            }
            state.waiters.push(sender);
            state.edge
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let observation = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(observation) => observation,
                    Err(_) => return Ok(false),
                },
                None => receiver.recv().await,
            };
            let Some((previous, current)) = observation else {
                return Err(match self.client.fault() {
                    Some(fault) => fault.to_error(),
                    None => Disconnected.into(),
                });
            };
            let (rising, falling) = transitions(previous, current);
            trace!(
                "Pin {} observed {:?} (rising: {}, falling: {})",
                self.pin,
                current,
                rising,
                falling
            );
            if edge.matches(rising, falling) {
                return Ok(true);
            }
        }
    }

    /// Drives the pin, switching it to output first when needed.
    pub fn out(&self, level: Level) -> Result<(), Error> {
        if self.client.pin_mode(self.pin) != Some(PinModeId::OUTPUT) {
            self.client.set_pin_mode(self.pin, PinModeId::OUTPUT)?;
        }
        self.client.digital_write(self.pin, level)
    }

    /// Stops watching the pin and drives it low.
    pub async fn halt(&self) -> Result<(), Error> {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
            let _ = watcher.await;
            {
                let mut state = self.state.lock();
                state.waiters.clear();
                state.level = None;
            }
            self.client.report_digital(self.pin, false)?;
        }
        self.client.digital_write(self.pin, Level::Low)
    }

    fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for GpioPin {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
            let _ = self.client.report_digital(self.pin, false);
        }
    }
}

/// Owns the pin listener: records every level and forwards it to the edge waiters.
async fn watch(mut listener: Listener<Level>, state: Arc<Mutex<PinState>>) {
    while let Some(level) = listener.recv().await {
        let mut state = state.lock();
        let previous = state.level.replace(level);
        state
            .waiters
            .retain(|waiter| waiter.send((previous, level)).is_ok());
    }
    // The client stopped: pending waiters observe the closed channel.
    state.lock().waiters.clear();
}
