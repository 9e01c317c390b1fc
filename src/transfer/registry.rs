use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::Message;

/// Responses buffered per outstanding request before late ones are dropped.
const RESPONSE_BUFFER: usize = 8;

/// Allocates transfer identifiers and demultiplexes inbound responses back to
/// the task that issued the matching request. TIDs come from an
/// entropy-seeded generator over the full `i64` range, so they are unique
/// per node for the life of the process with overwhelming probability.
pub struct TidRegistry {
    table: Mutex<HashMap<i64, mpsc::Sender<Message>>>,
    rng: Mutex<StdRng>,
}

impl TidRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reserve a fresh TID. The mapping lives until the guard drops, so a
    /// requester that returns early (timeout, error) still releases it.
    pub fn allocate(self: &Arc<Self>) -> (TidGuard, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let mut table = self.table.lock();
        let tid = loop {
            let candidate = self.rng.lock().gen::<i64>();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(tid, tx);

        (
            TidGuard {
                tid,
                registry: Arc::clone(self),
            },
            rx,
        )
    }

    /// Route a response to whoever is waiting on its TID. Unknown TIDs and
    /// saturated receivers are dropped silently; a requester that gave up
    /// must never block the inbound demultiplexer.
    pub fn deliver(&self, msg: Message) {
        let tx = self.table.lock().get(&msg.tid).cloned();
        match tx {
            Some(tx) => {
                if tx.try_send(msg).is_err() {
                    debug!("dropping response for a stale or saturated tid");
                }
            }
            None => debug!("dropping response for unknown tid {}", msg.tid),
        }
    }

    /// Idempotent.
    pub fn release(&self, tid: i64) {
        self.table.lock().remove(&tid);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}

pub struct TidGuard {
    tid: i64,
    registry: Arc<TidRegistry>,
}

impl TidGuard {
    pub fn id(&self) -> i64 {
        self.tid
    }
}

impl Drop for TidGuard {
    fn drop(&mut self) {
        self.registry.release(self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_routes_by_tid() {
        let registry = Arc::new(TidRegistry::new());
        let (guard_a, mut rx_a) = registry.allocate();
        let (guard_b, mut rx_b) = registry.allocate();
        assert_ne!(guard_a.id(), guard_b.id());

        registry.deliver(Message::nack("x", "f", guard_b.id()));
        registry.deliver(Message::nack("y", "f", guard_a.id()));

        assert_eq!(rx_a.recv().await.unwrap().from, "y");
        assert_eq!(rx_b.recv().await.unwrap().from, "x");
    }

    #[tokio::test]
    async fn test_unknown_tid_is_dropped() {
        let registry = Arc::new(TidRegistry::new());
        // must not panic or block
        registry.deliver(Message::nack("x", "f", 12345));
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let registry = Arc::new(TidRegistry::new());
        let tid;
        {
            let (guard, _rx) = registry.allocate();
            tid = guard.id();
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);

        // release is idempotent and late deliveries are no-ops
        registry.release(tid);
        registry.deliver(Message::nack("x", "f", tid));
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let registry = Arc::new(TidRegistry::new());
        let (guard, mut rx) = registry.allocate();

        for _ in 0..RESPONSE_BUFFER + 5 {
            registry.deliver(Message::nack("x", "f", guard.id()));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, RESPONSE_BUFFER);
    }
}
