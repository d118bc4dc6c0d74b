//! Fan-out of bus events to live subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::event::BusEvent;
use crate::ports::subscriber::{DeliveryError, Subscriber};

pub type SubscriberId = u64;

/// Frames buffered per subscriber before it is considered too slow.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<dyn Subscriber>>> {
        // A panic while holding the lock leaves the map itself intact.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, subscriber);
        debug!(subscriber = id, "subscriber registered");
        id
    }

    /// Unregisters and closes a subscriber. Returns false for unknown ids.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.close();
                debug!(subscriber = id, "subscriber removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes `event` once and hands it to every subscriber. Subscribers
    /// that fail delivery are closed and dropped. Returns how many received
    /// the frame.
    pub fn broadcast(&self, event: &BusEvent) -> usize {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unserializable event");
                return 0;
            }
        };

        let mut subscribers = self.lock();
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, subscriber) in subscribers.iter() {
            match subscriber.deliver(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(subscriber = *id, error = %e, "dropping subscriber");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            if let Some(subscriber) = subscribers.remove(&id) {
                subscriber.close();
            }
        }
        delivered
    }
}

/// Subscriber backed by a bounded channel. The receiving half is drained by
/// whatever owns the connection.
pub struct ChannelSubscriber {
    sender: Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelSubscriber {
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (subscriber, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = guard.as_ref().ok_or(DeliveryError::Closed)?;
        sender.try_send(frame.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        // Dropping the sender ends the receiver's stream.
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::LogStream;
    use crate::domain::task_id::TaskId;

    fn log_event(line: &str) -> BusEvent {
        BusEvent::task_log(&TaskId::from("t-1"), LogStream::Stdout, line)
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let hub = EventHub::new();
        let (a, mut rx_a) = ChannelSubscriber::pair(4);
        let (b, mut rx_b) = ChannelSubscriber::pair(4);
        hub.add(a);
        hub.add(b);

        assert_eq!(hub.broadcast(&log_event("hello")), 2);
        let frame = rx_a.try_recv().unwrap();
        assert_eq!(frame, rx_b.try_recv().unwrap());
        let parsed: BusEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed, log_event("hello"));
    }

    #[test]
    fn closed_receiver_is_dropped_without_affecting_others() {
        let hub = EventHub::new();
        let (dead, rx_dead) = ChannelSubscriber::pair(4);
        let (live, mut rx_live) = ChannelSubscriber::pair(4);
        hub.add(dead);
        hub.add(live);
        drop(rx_dead);

        assert_eq!(hub.broadcast(&log_event("one")), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.broadcast(&log_event("two")), 1);
        assert!(rx_live.try_recv().is_ok());
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn full_buffer_drops_slow_subscriber() {
        let hub = EventHub::new();
        let (slow, mut rx) = ChannelSubscriber::pair(1);
        hub.add(slow);

        assert_eq!(hub.broadcast(&log_event("first")), 1);
        assert_eq!(hub.broadcast(&log_event("second")), 0);
        assert!(hub.is_empty());
        assert!(rx.try_recv().is_ok());
        // Sender was closed by the hub.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_closes_subscriber() {
        let hub = EventHub::new();
        let (sub, mut rx) = ChannelSubscriber::pair(4);
        let id = hub.add(sub);
        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        assert!(hub.is_empty());
        assert_eq!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn broadcast_without_subscribers_is_a_no_op() {
        assert_eq!(EventHub::new().broadcast(&log_event("x")), 0);
    }
}
