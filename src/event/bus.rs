//! Event fan-out to filtered subscribers.
//!
//! Each subscription owns an unbounded in-order queue; the publisher
//! never blocks. A subscriber that falls behind the high-water mark is
//! dropped with an overflow marker instead of stalling the session loop.
//! Dropping a [`Subscription`] reclaims its queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::event::{Event, Filter};

/// Queue depth at which a subscriber is considered stuck.
pub const DEFAULT_HIGH_WATER: usize = 1024;

enum Item {
    Event(Event),
    Overflow,
}

struct Entry {
    id: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<Item>,
    /// Undelivered events in this subscriber's queue.
    depth: Arc<AtomicUsize>,
}

struct Inner {
    subscribers: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    high_water: usize,
}

/// Broadcast hub for parsed events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a bus with the default high-water mark.
    #[must_use]
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// Creates a bus that drops subscribers whose queues exceed
    /// `high_water` undelivered events.
    #[must_use]
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                high_water,
            }),
        }
    }

    /// Subscribes with a filter; only matching events are delivered.
    #[must_use]
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let depth = Arc::new(AtomicUsize::new(0));
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .push(Entry {
                id,
                filter,
                tx,
                depth: Arc::clone(&depth),
            });
        Subscription {
            id,
            rx,
            depth,
            bus: Arc::downgrade(&self.inner),
            overflowed: false,
        }
    }

    /// Publishes one event to every matching live subscriber.
    pub fn publish(&self, event: &Event) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned");
        subscribers.retain(|entry| {
            if entry.tx.is_closed() {
                return false;
            }
            if !entry.filter.matches(event) {
                return true;
            }
            if entry.depth.load(Ordering::Acquire) >= self.inner.high_water {
                tracing::warn!(subscriber = entry.id, "dropping slow subscriber");
                let _ = entry.tx.send(Item::Overflow);
                return false;
            }
            if entry.tx.send(Item::Event(event.clone())).is_ok() {
                entry.depth.fetch_add(1, Ordering::AcqRel);
                true
            } else {
                false
            }
        });
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A filtered, in-order event stream.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Item>,
    depth: Arc<AtomicUsize>,
    bus: std::sync::Weak<Inner>,
    overflowed: bool,
}

impl Subscription {
    /// Receives the next matching event.
    ///
    /// Returns `None` when the bus is gone or this subscriber was dropped
    /// for falling behind (check [`Self::overflowed`]).
    pub async fn recv(&mut self) -> Option<Event> {
        match self.rx.recv().await {
            Some(Item::Event(event)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Some(event)
            }
            Some(Item::Overflow) => {
                self.overflowed = true;
                None
            }
            None => None,
        }
    }

    /// True once this subscriber was evicted for exceeding the bus
    /// high-water mark.
    #[must_use]
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.retain(|entry| entry.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Filter::messages_waiting());

        bus.publish(&Event::Ok { value: None });
        bus.publish(&Event::MessagesWaiting);

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, Event::MessagesWaiting));
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Filter::any());

        for ts in 0..5 {
            bus.publish(&Event::CurrentTime(ts));
        }

        for ts in 0..5 {
            let Some(Event::CurrentTime(got)) = sub.recv().await else {
                panic!("missing event {ts}");
            };
            assert_eq!(got, ts);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_reclaimed() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Filter::any());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_with_overflow() {
        let bus = EventBus::with_high_water(4);
        let mut slow = bus.subscribe(Filter::any());
        let mut fast = bus.subscribe(Filter::any());

        for ts in 0..4 {
            bus.publish(&Event::CurrentTime(ts));
            // The fast subscriber keeps up; the slow one never drains.
            let Some(Event::CurrentTime(got)) = fast.recv().await else {
                panic!("missing event");
            };
            assert_eq!(got, ts);
        }

        // Queue is now at the mark: the next publish evicts the laggard.
        bus.publish(&Event::CurrentTime(4));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(fast.recv().await.is_some());

        for _ in 0..4 {
            assert!(slow.recv().await.is_some());
        }
        assert!(slow.recv().await.is_none());
        assert!(slow.overflowed());
        assert!(!fast.overflowed());
    }
}
