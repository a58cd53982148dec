//! Acknowledgements: pending ack waiters on the sending side and duplicate
//! detection on the receiving side.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{FabricError, Result};
use crate::identity::NodeAddress;
use crate::message::MessageId;

/// Ack waiters keyed by message id. Acks may arrive in any order.
#[derive(Debug, Default)]
pub struct AckTable {
    inner: Mutex<AckTableInner>,
}

#[derive(Debug, Default)]
struct AckTableInner {
    waiters: HashMap<MessageId, oneshot::Sender<()>>,
    closed: bool,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the ack of `id`. The receiver resolves when
    /// [`resolve`](Self::resolve) is called and errors when the wait is
    /// cancelled.
    pub fn register(&self, id: MessageId) -> Result<oneshot::Receiver<()>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(FabricError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Complete the wait for `id`. Returns `false` for unknown or late acks.
    pub fn resolve(&self, id: MessageId) -> bool {
        match self.inner.lock().waiters.remove(&id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `id` without resolving it.
    pub fn cancel(&self, id: MessageId) {
        self.inner.lock().waiters.remove(&id);
    }

    /// Cancel every pending wait and refuse new ones.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let pending = inner.waiters.len();
        inner.waiters.clear();
        pending
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// Remembers the last `window` `(sender, id)` pairs seen on one link.
#[derive(Debug)]
pub struct DedupCache {
    window: usize,
    order: VecDeque<(NodeAddress, MessageId)>,
    seen: HashSet<(NodeAddress, MessageId)>,
}

impl DedupCache {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record a delivery. Returns `true` if the pair was already seen.
    pub fn check_and_insert(&mut self, sender: &NodeAddress, id: MessageId) -> bool {
        let key = (sender.clone(), id);
        if self.seen.contains(&key) {
            return true;
        }
        if self.order.len() >= self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        false
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_out_of_order_acks() {
        let table = AckTable::new();
        let rx1 = table.register(MessageId(1)).unwrap();
        let rx2 = table.register(MessageId(2)).unwrap();
        assert_eq!(table.pending(), 2);

        assert!(table.resolve(MessageId(2)));
        assert!(table.resolve(MessageId(1)));
        assert!(rx2.await.is_ok());
        assert!(rx1.await.is_ok());
        assert!(!table.resolve(MessageId(1)));
    }

    #[tokio::test]
    async fn test_close_cancels_waiters() {
        let table = AckTable::new();
        let rx = table.register(MessageId(1)).unwrap();
        assert_eq!(table.close(), 1);
        assert!(rx.await.is_err());
        assert!(matches!(table.register(MessageId(2)), Err(FabricError::Closed)));
    }

    #[test]
    fn test_cancel() {
        let table = AckTable::new();
        let _rx = table.register(MessageId(5)).unwrap();
        table.cancel(MessageId(5));
        assert_eq!(table.pending(), 0);
        assert!(!table.resolve(MessageId(5)));
    }

    #[test]
    fn test_dedup_detects_retransmission() {
        let mut cache = DedupCache::new(16);
        let a = NodeAddress::new("worker-a");
        let b = NodeAddress::new("worker-b");
        assert!(!cache.check_and_insert(&a, MessageId(1)));
        assert!(!cache.check_and_insert(&b, MessageId(1)));
        assert!(cache.check_and_insert(&a, MessageId(1)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut cache = DedupCache::new(2);
        let a = NodeAddress::new("worker-a");
        cache.check_and_insert(&a, MessageId(1));
        cache.check_and_insert(&a, MessageId(2));
        cache.check_and_insert(&a, MessageId(3));
        assert!(!cache.check_and_insert(&a, MessageId(1)));
        assert!(cache.check_and_insert(&a, MessageId(3)));

        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.check_and_insert(&a, MessageId(3)));
    }
}
