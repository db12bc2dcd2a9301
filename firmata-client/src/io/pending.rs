//! FIFO one-shot waiters for sysex responses.

use std::collections::{HashMap, VecDeque};

use log::debug;
use tokio::sync::oneshot;

use crate::errors::Error;
use crate::io::writer::FaultState;

/// Queues of one-shot waiters keyed by the expected response command id.
///
/// Waiters of the same id are served strictly in registration order.
#[derive(Default)]
pub(crate) struct PendingResponses {
    queues: HashMap<u8, VecDeque<oneshot::Sender<Vec<u8>>>>,
    /// Waiters skipped because their caller gave up: the device may still answer them late.
    abandoned: HashMap<u8, usize>,
}

impl PendingResponses {
    pub(crate) fn push(&mut self, response: u8, sender: oneshot::Sender<Vec<u8>>) {
        self.queues.entry(response).or_default().push_back(sender);
    }

    /// Hands `body` to the oldest live waiter for `response`.
    ///
    /// Waiters whose receiver is gone (timed out) are skipped and counted: as many frames without
    /// a waiter are then absorbed as late answers. Gives the body back when nothing waits for
    /// `response` and no late answer is owed.
    pub(crate) fn resolve(&mut self, response: u8, mut body: Vec<u8>) -> Result<(), Vec<u8>> {
        if let Some(queue) = self.queues.get_mut(&response) {
            while let Some(sender) = queue.pop_front() {
                match sender.send(body) {
                    Ok(()) => return Ok(()),
                    Err(returned) => {
                        body = returned;
                        *self.abandoned.entry(response).or_default() += 1;
                    }
                }
            }
        }
        match self.abandoned.get_mut(&response) {
            Some(owed) if *owed > 0 => {
                *owed -= 1;
                debug!("Late response {:#04X} dropped", response);
                Ok(())
            }
            _ => Err(body),
        }
    }

    pub(crate) fn len(&self, response: u8) -> usize {
        self.queues.get(&response).map_or(0, VecDeque::len)
    }

    /// Drops every waiter: their receivers observe a closed channel.
    pub(crate) fn clear(&mut self) {
        self.queues.clear();
        self.abandoned.clear();
    }
}

/// The future reply to a sysex request.
pub struct PendingReply {
    receiver: oneshot::Receiver<Vec<u8>>,
    fault: FaultState,
}

impl PendingReply {
    pub(crate) fn new(receiver: oneshot::Receiver<Vec<u8>>, fault: FaultState) -> Self {
        Self { receiver, fault }
    }

    /// Waits for the reply body (command byte excluded).
    ///
    /// # Errors
    /// * `Disconnected` / `Faulted`: the client stopped before the reply arrived.
    pub async fn wait(self) -> Result<Vec<u8>, Error> {
        match self.receiver.await {
            Ok(body) => Ok(body),
            Err(_) => Err(self.fault.error()),
        }
    }
}
