//! Best-effort event fan-out for dashboard subscribers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Error;

/// Depth of the central event queue.
const BUS_CAPACITY: usize = 100;
/// Depth of each dashboard subscriber queue.
const SUBSCRIBER_CAPACITY: usize = 10;

/// Bounded, lossy event bus.
///
/// Producers enqueue without blocking and lose the event when the queue is
/// full; a broadcaster task fans each event out to every subscriber with the
/// same drop-on-full policy. A slow dashboard can therefore never stall a
/// connection worker, and subscribers under load may each observe a
/// different subset of events.
///
/// Must be created inside a tokio runtime (the broadcaster is spawned on
/// construction).
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<String>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<String>>>>,
}

impl EventBus {
    /// A bus with the default queue depth.
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// A bus whose central queue holds up to `capacity` undelivered events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(capacity);
        let subscribers: Arc<Mutex<Vec<mpsc::Sender<String>>>> = Arc::default();

        let registry = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                registry.lock().retain(|sub| match sub.try_send(event.clone()) {
                    Ok(()) => true,
                    // Slow subscriber: it misses this event but stays registered.
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(error = %Error::SubscriberWrite, "pruning dashboard subscriber");
                        false
                    }
                });
            }
        });

        Self { tx, subscribers }
    }

    /// Enqueues an event, dropping it when the bus is full.
    pub fn emit(&self, event: impl Into<String>) {
        if self.tx.try_send(event.into()).is_err() {
            debug!("event bus full; dropping event");
        }
    }

    /// Registers a new subscriber queue and returns its receiving end.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of currently registered subscriber queues.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
