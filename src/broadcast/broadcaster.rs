//! Fan-out of serialized event messages to connected WebSocket clients.
//!
//! A single-writer, many-reader channel: the Broadcast Tailer is the
//! sole producer, and every connected WebSocket client subscribes its
//! own receiver.

use bytes::Bytes;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Cheaply `Clone`-able handle shared between the Broadcast Tailer (the
/// sole producer) and every WebSocket connection handler (each a consumer).
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Bytes>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Registers a new observer. Dropping the returned receiver
    /// unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Pushes a message to every currently-subscribed observer. A send
    /// with no subscribers is not an error (mirrors ranging over an
    /// empty client map).
    pub fn broadcast(&self, message: Vec<u8>) {
        let _ = self.tx.send(Bytes::from(message));
    }
}
