use crate::log_debug;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Subscriber<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of events to any number of subscribers.
///
/// A subscriber that fails or panics is unsubscribed; delivery to the others
/// continues. Callbacks run outside the lock so they may subscribe or publish.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` and returns how many subscribers accepted it.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<(SubscriptionId, Subscriber<T>)> = self.subscribers.lock().clone();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, subscriber) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    log_debug!("Dropping event subscriber: {}", e);
                    failed.push(id);
                }
                Err(_) => {
                    log_debug!("Dropping event subscriber after panic");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            self.subscribers.lock().retain(|(id, _)| !failed.contains(id));
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn failing_subscriber_is_removed_and_others_still_receive() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| anyhow::bail!("gone"));
        bus.subscribe(|_| panic!("boom"));
        {
            let seen = seen.clone();
            bus.subscribe(move |v| {
                seen.fetch_add(*v as usize, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(bus.publish(&2), 1);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.publish(&3), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::<()>::new();
        let id = bus.subscribe(|_| Ok(()));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&()), 0);
    }
}
