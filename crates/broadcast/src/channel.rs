use log::{trace, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::BroadcastError;

/// Default buffer for in-process channels.
const DEFAULT_CAPACITY: usize = 64;

/// A publish/subscribe transport.
///
/// Consumers only depend on this trait, so the in-process implementation can
/// be replaced by any other transport that can deliver messages to every
/// subscriber (a websocket relay, a shared-memory ring, ...).
pub trait Broadcaster<T>: Send + Sync {
    /// Publishes a message and returns how many subscribers received it.
    fn publish(&self, message: T) -> Result<usize, BroadcastError>;

    /// Registers a new subscriber. Only messages published afterwards are
    /// delivered.
    fn subscribe(&self) -> Subscription<T>;
}

/// Receiving half of a [`Broadcaster`].
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. Returns `None` once the transport is
    /// closed. A lagging subscriber skips the messages it missed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged behind, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged behind, skipped {} messages", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// In-process transport backed by a tokio broadcast channel.
#[derive(Debug)]
pub struct LocalBroadcast<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> LocalBroadcast<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for LocalBroadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for LocalBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Broadcaster<T> for LocalBroadcast<T>
where
    T: Clone + Send + 'static,
{
    fn publish(&self, message: T) -> Result<usize, BroadcastError> {
        // No subscribers is not an error for a broadcast.
        match self.tx.send(message) {
            Ok(count) => Ok(count),
            Err(_) => {
                trace!("Published message without subscribers");
                Ok(0)
            }
        }
    }

    fn subscribe(&self) -> Subscription<T> {
        Subscription::new(self.tx.subscribe())
    }
}
