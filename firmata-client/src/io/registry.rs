//! Exclusive-ownership listener maps.
//!
//! Each resource class (digital pin, analog channel, I2C address, 1-Wire pin, sysex feature) owns
//! an arena of slots indexed by its small integer key, guarded by its own mutex. A slot holds at
//! most one subscriber; the [`Listener`] handle frees it when released or dropped.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::errors::HardwareError::{AlreadyRegistered, OutOfRange};
use crate::errors::ProtocolError::Disconnected;
use crate::errors::*;
use crate::io::data::{I2CPacket, Level};

/// The resource classes a [`Listener`] can be registered for.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Digital pin level changes, keyed by pin number.
    Digital,
    /// Analog readings, keyed by analog channel.
    Analog,
    /// I2C replies, keyed by device address.
    I2c,
    /// 1-Wire replies, keyed by pin number.
    OneWire,
    /// Raw sysex frames, keyed by command id.
    Sysex,
}

impl Display for ListenerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ListenerKind::Digital => "digital pin",
            ListenerKind::Analog => "analog channel",
            ListenerKind::I2c => "i2c address",
            ListenerKind::OneWire => "1-wire pin",
            ListenerKind::Sysex => "sysex command",
        };
        write!(f, "{}", name)
    }
}

struct Slot<T> {
    generation: u64,
    sender: UnboundedSender<T>,
}

struct SlotArena<T> {
    slots: Vec<Option<Slot<T>>>,
    next_generation: u64,
    closed: bool,
}

/// A fixed-capacity arena of listener slots for one resource class.
pub struct ListenerSlots<T> {
    kind: ListenerKind,
    arena: Arc<Mutex<SlotArena<T>>>,
}

impl<T: Send + 'static> ListenerSlots<T> {
    pub fn new(kind: ListenerKind, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            kind,
            arena: Arc::new(Mutex::new(SlotArena {
                slots,
                next_generation: 0,
                closed: false,
            })),
        }
    }

    /// Installs the subscriber for `key`.
    ///
    /// # Errors
    /// * `AlreadyRegistered`: `key` already has an active listener.
    /// * `OutOfRange`: `key` does not fit in this arena.
    /// * `Disconnected`: the registry has been closed.
    pub fn register(&self, key: usize) -> Result<Listener<T>, Error> {
        let mut arena = self.arena.lock();
        if arena.closed {
            return Err(Disconnected.into());
        }
        let max = arena.slots.len().saturating_sub(1);
        let generation = arena.next_generation;
        let slot = arena.slots.get_mut(key).ok_or(OutOfRange {
            context: "listener key",
            value: key,
            max,
        })?;
        if slot.is_some() {
            return Err(AlreadyRegistered {
                resource: format!("{} {}", self.kind, key),
            }
            .into());
        }
        let (sender, receiver) = unbounded_channel();
        *slot = Some(Slot { generation, sender });
        arena.next_generation += 1;
        debug!("Listener registered for {} {}", self.kind, key);
        Ok(Listener {
            kind: self.kind,
            key,
            generation,
            receiver,
            arena: self.arena.clone(),
        })
    }

    /// Hands `value` to the listener of `key`.
    ///
    /// Gives the value back when nobody listens.
    pub fn dispatch(&self, key: usize, value: T) -> Result<(), T> {
        let arena = self.arena.lock();
        match arena.slots.get(key) {
            Some(Some(slot)) => slot.sender.send(value).map_err(|error| error.0),
            _ => Err(value),
        }
    }

    pub fn is_registered(&self, key: usize) -> bool {
        matches!(self.arena.lock().slots.get(key), Some(Some(_)))
    }

    /// Drops every subscriber (their channels end) and refuses new ones.
    pub fn close(&self) {
        let mut arena = self.arena.lock();
        arena.closed = true;
        arena.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

/// A long-lived exclusive subscription to one resource key.
///
/// Every matching frame is delivered until the listener is released (or dropped).
pub struct Listener<T> {
    kind: ListenerKind,
    key: usize,
    generation: u64,
    receiver: UnboundedReceiver<T>,
    arena: Arc<Mutex<SlotArena<T>>>,
}

impl<T> std::fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<T> Listener<T> {
    /// Waits for the next value. `None` means the client stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// The next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Frees the slot so a new listener can be installed for this key.
    pub fn release(self) {}
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        let mut arena = self.arena.lock();
        if let Some(slot) = arena.slots.get_mut(self.key) {
            if matches!(slot, Some(s) if s.generation == self.generation) {
                *slot = None;
                debug!("Listener released for {} {}", self.kind, self.key);
            }
        }
    }
}

/// The listener maps owned by a client.
pub struct ListenerRegistry {
    pub digital: ListenerSlots<Level>,
    pub analog: ListenerSlots<u16>,
    pub i2c: ListenerSlots<I2CPacket>,
    pub onewire: ListenerSlots<Vec<u8>>,
    pub sysex: ListenerSlots<Vec<u8>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            digital: ListenerSlots::new(ListenerKind::Digital, 128),
            analog: ListenerSlots::new(ListenerKind::Analog, 16),
            i2c: ListenerSlots::new(ListenerKind::I2c, 255),
            onewire: ListenerSlots::new(ListenerKind::OneWire, 128),
            sysex: ListenerSlots::new(ListenerKind::Sysex, 128),
        }
    }
}

impl ListenerRegistry {
    pub fn is_registered(&self, kind: ListenerKind, key: usize) -> bool {
        match kind {
            ListenerKind::Digital => self.digital.is_registered(key),
            ListenerKind::Analog => self.analog.is_registered(key),
            ListenerKind::I2c => self.i2c.is_registered(key),
            ListenerKind::OneWire => self.onewire.is_registered(key),
            ListenerKind::Sysex => self.sysex.is_registered(key),
        }
    }

    pub fn close(&self) {
        self.digital.close();
        self.analog.close();
        self.i2c.close();
        self.onewire.close();
        self.sysex.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_registration() {
        let slots: ListenerSlots<u16> = ListenerSlots::new(ListenerKind::Analog, 16);
        let listener = slots.register(3).unwrap();
        assert!(slots.is_registered(3));

        let error = slots.register(3).err().unwrap();
        assert_eq!(
            format!("{}", error),
            "Hardware error: A listener is already registered for analog channel 3."
        );

        listener.release();
        assert!(!slots.is_registered(3));
        assert!(slots.register(3).is_ok());
    }

    #[test]
    fn test_out_of_range_key() {
        let slots: ListenerSlots<u16> = ListenerSlots::new(ListenerKind::Analog, 16);
        let error = slots.register(16).err().unwrap();
        assert!(matches!(
            error,
            Error::HardwareError {
                source: HardwareError::OutOfRange {
                    value: 16,
                    max: 15,
                    ..
                }
            }
        ));
    }

    #[tokio::test]
    async fn test_dispatch() {
        let slots: ListenerSlots<u16> = ListenerSlots::new(ListenerKind::Analog, 16);
        let mut listener = slots.register(2).unwrap();
        assert!(slots.dispatch(2, 512).is_ok());
        assert!(slots.dispatch(2, 513).is_ok());
        assert_eq!(slots.dispatch(5, 42), Err(42));
        assert_eq!(listener.recv().await, Some(512));
        assert_eq!(listener.recv().await, Some(513));
        assert_eq!(listener.try_recv(), None);
    }

    #[test]
    fn test_stale_handle_does_not_release_new_owner() {
        let slots: ListenerSlots<u8> = ListenerSlots::new(ListenerKind::OneWire, 4);
        let first = slots.register(1).unwrap();
        // Simulates a closed registry reopened by the owner: the first handle is detached.
        slots.arena.lock().slots[1] = None;
        let second = slots.register(1).unwrap();
        drop(first);
        assert!(slots.is_registered(1), "The newest owner keeps its slot");
        drop(second);
        assert!(!slots.is_registered(1));
    }

    #[tokio::test]
    async fn test_close() {
        let registry = ListenerRegistry::default();
        let mut listener = registry.i2c.register(0x20).unwrap();
        assert!(registry.is_registered(ListenerKind::I2c, 0x20));
        registry.close();
        assert!(!registry.is_registered(ListenerKind::I2c, 0x20));
        assert_eq!(listener.recv().await, None);
        assert!(registry
            .digital
            .register(13)
            .err()
            .unwrap()
            .is_disconnected());
    }
}
