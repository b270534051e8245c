//! Generic event fan-out (§9): one broadcaster per event kind. Subscribers
//! register and receive a handle; emission never blocks on a slow
//! subscriber because it goes through an unbounded `tokio::sync::mpsc`
//! channel per subscriber instead of a bounded broadcast.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// A broker for a single event type `T`. Clone-cheap; holds its
/// subscriber list behind a mutex that is never held across a send.
pub struct EventBus<T: Clone> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; drop the returned receiver to unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("event bus lock poisoned").push(tx);
        rx
    }

    /// Emit an event to every live subscriber. Dead subscribers (receiver
    /// dropped) are pruned opportunistically.
    pub fn emit(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(42);
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn prunes_dropped_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        bus.emit(1);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn fans_out_to_multiple_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }
}
