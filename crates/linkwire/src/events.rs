//! Caller-visible notifications.
//!
//! Events are delivered in emission order over an unbounded channel. A
//! [`ReceiveHandler`] additionally sees each payload in place, before the
//! matching [`ClientEvent::PayloadReceived`] is queued.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::SourcedError;

/// Notifications emitted by a session.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    ConnectionAttempt,
    ConnectionEstablished,
    ConnectionTerminated,
    ConnectionError(SourcedError),
    SendStarted,
    SendComplete { bytes: usize },
    SendError(SourcedError),
    PayloadReceived(Bytes),
    ReceiveError(SourcedError),
    EndOfStream,
}

/// Borrowed view of a payload during a receive notification.
///
/// Successive [`ReceivedPayload::read`] calls walk through the payload and
/// wrap back to the start once it has been consumed.
pub struct ReceivedPayload<'a> {
    data: &'a [u8],
    read_index: usize,
}

impl<'a> ReceivedPayload<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            read_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Copy up to `length` unread bytes into `destination[offset..]`.
    ///
    /// Returns the number of bytes copied. Panics if `offset + length`
    /// exceeds `destination`.
    pub fn read(&mut self, destination: &mut [u8], offset: usize, length: usize) -> usize {
        let target = &mut destination[offset..offset + length];
        let remaining = self.data.len() - self.read_index;
        let count = length.min(remaining);

        target[..count].copy_from_slice(&self.data[self.read_index..self.read_index + count]);
        self.read_index += count;
        if self.read_index >= self.data.len() {
            self.read_index = 0;
        }
        count
    }
}

/// Synchronous payload callback run on the read loop.
pub trait ReceiveHandler: Send + Sync {
    fn on_payload(&self, payload: &mut ReceivedPayload<'_>);
}

impl<F> ReceiveHandler for F
where
    F: Fn(&mut ReceivedPayload<'_>) + Send + Sync,
{
    fn on_payload(&self, payload: &mut ReceivedPayload<'_>) {
        self(payload)
    }
}

/// Fan-out point for session notifications.
pub(crate) struct EventHub {
    tx: mpsc::UnboundedSender<ClientEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    handler: RwLock<Option<Arc<dyn ReceiveHandler>>>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handler: RwLock::new(None),
        }
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.rx.lock().take()
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.tx.send(event);
    }

    /// Run the receive handler, then queue the payload event.
    pub fn deliver(&self, payload: &[u8]) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_payload(&mut ReceivedPayload::new(payload));
        }
        self.emit(ClientEvent::PayloadReceived(Bytes::copy_from_slice(payload)));
    }
}
