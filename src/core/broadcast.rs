//! Event broadcaster - fan-out of leaderboard events to observers
//!
//! Each observer owns a bounded channel. Publishing never blocks: a full
//! observer misses the event, a disconnected one is dropped.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::protocol::BroadcastEvent;

pub struct EventBroadcaster {
    observers: Mutex<Vec<Sender<BroadcastEvent>>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        let (tx, rx) = bounded(self.capacity);
        let mut observers = self.observers.lock();
        observers.push(tx);
        debug!(observers = observers.len(), "[BROADCAST] Observer subscribed");
        rx
    }

    /// Deliver `event` to every observer. Returns how many received it.
    pub fn publish(&self, event: BroadcastEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut observers = self.observers.lock();
        observers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(event = kind, "[BROADCAST] Observer lagging, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("[BROADCAST] Observer gone");
                false
            }
        });
        debug!(event = kind, delivered, "[BROADCAST] Published");
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(enabled: bool) -> BroadcastEvent {
        BroadcastEvent::ChallengeModeChanged { enabled }
    }

    #[test]
    fn test_publish_without_observers() {
        let b = EventBroadcaster::new(4);
        assert_eq!(b.publish(mode(true)), 0);
    }

    #[test]
    fn test_all_observers_receive() {
        let b = EventBroadcaster::new(4);
        let r1 = b.subscribe();
        let r2 = b.subscribe();
        assert_eq!(b.publish(mode(true)), 2);
        assert_eq!(r1.try_recv().unwrap(), mode(true));
        assert_eq!(r2.try_recv().unwrap(), mode(true));
    }

    #[test]
    fn test_full_observer_does_not_block_others() {
        let b = EventBroadcaster::new(1);
        let slow = b.subscribe();
        let fast = b.subscribe();

        assert_eq!(b.publish(mode(true)), 2);
        fast.try_recv().unwrap();
        // `slow` still holds the first event
        assert_eq!(b.publish(mode(false)), 1);

        assert_eq!(fast.try_recv().unwrap(), mode(false));
        assert_eq!(slow.try_recv().unwrap(), mode(true));
        assert!(slow.try_recv().is_err());
        assert_eq!(b.observer_count(), 2);
    }

    #[test]
    fn test_disconnected_observer_removed() {
        let b = EventBroadcaster::new(4);
        let keep = b.subscribe();
        drop(b.subscribe());
        assert_eq!(b.observer_count(), 2);

        assert_eq!(b.publish(mode(true)), 1);
        assert_eq!(b.observer_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), mode(true));
    }
}
