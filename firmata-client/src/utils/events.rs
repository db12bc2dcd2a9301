//! Client lifecycle notifications: ready, close and fault callbacks.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::trace;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::io::FirmwareReport;

/// Lists all events a client can emit/listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// The device answered the firmware query: [`EventPayload::Ready`].
    OnReady,
    /// The connection ended normally (close or end of stream): [`EventPayload::Closed`].
    OnClose,
    /// The reader stopped on a transport or framing failure: [`EventPayload::Faulted`].
    OnFault,
}

impl Display for ClientEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientEvent::OnReady => "ready",
            ClientEvent::OnClose => "close",
            ClientEvent::OnFault => "fault",
        };
        write!(f, "{}", name)
    }
}

/// What a [`ClientEvent`] hands to its callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Ready(FirmwareReport),
    Closed,
    /// Text of the error that stopped the reader.
    Faulted(String),
}

impl EventPayload {
    /// The event this payload is emitted for.
    pub fn event(&self) -> ClientEvent {
        match self {
            EventPayload::Ready(_) => ClientEvent::OnReady,
            EventPayload::Closed => ClientEvent::OnClose,
            EventPayload::Faulted(_) => ClientEvent::OnFault,
        }
    }
}

pub type EventHandler = usize;

type Callback = Box<dyn FnMut(EventPayload) -> BoxFuture<'static, ()> + Send>;

/// Async callbacks registered per [`ClientEvent`].
#[derive(Clone, Default)]
pub struct EventManager {
    callbacks: Arc<Mutex<HashMap<ClientEvent, Vec<(EventHandler, Callback)>>>>,
    next_id: Arc<AtomicUsize>,
}

impl EventManager {
    /// Registers `callback` for `event`.
    ///
    /// # Return
    /// The handle to give to [`EventManager::unregister`].
    pub fn on<F, Fut>(&self, event: ClientEvent, mut callback: F) -> EventHandler
    where
        F: FnMut(EventPayload) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: Callback = Box::new(move |payload| callback(payload).boxed());
        self.callbacks.lock().entry(event).or_default().push((id, boxed));
        id
    }

    /// Spawns every callback registered for the event of `payload` on `runtime`.
    ///
    /// Callbacks run as independent tasks: `emit` does not wait for them.
    pub fn emit(&self, runtime: &Handle, payload: EventPayload) {
        let event = payload.event();
        let mut callbacks = self.callbacks.lock();
        let Some(callbacks) = callbacks.get_mut(&event) else {
            return;
        };
        trace!("Emitting '{}' to {} callback(s)", event, callbacks.len());
        for (_, callback) in callbacks.iter_mut() {
            runtime.spawn(callback(payload.clone()));
        }
    }

    /// Removes the callback behind `handler`; returns whether it was registered.
    pub fn unregister(&self, handler: EventHandler) -> bool {
        let mut removed = false;
        for callbacks in self.callbacks.lock().values_mut() {
            let before = callbacks.len();
            callbacks.retain(|(id, _)| *id != handler);
            removed |= callbacks.len() != before;
        }
        removed
    }
}
