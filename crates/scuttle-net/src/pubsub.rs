//! In-process fan-out of events to any number of subscribers.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

/// One topic. Subscribers whose receiver was dropped are forgotten on the
/// next publish.
pub struct PubSub<T> {
    topic: &'static str,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> PubSub<T> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, value: T) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        debug!(topic = self.topic, subscribers = subscribers.len(), "published");
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
