//! Handler execution pool.
//!
//! Handlers never run on a connection's receive loop. Each envelope is
//! queued to one of `workers` shards chosen by hashing its sender, so all
//! envelopes from one sender are handled in arrival order while different
//! senders proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::events::{DropReason, EventBus, FabricEvent};
use crate::message::Envelope;
use crate::router::Handler;

struct Job {
    handler: Handler,
    envelope: Envelope,
}

/// Outcome of [`HandlerPool::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Queued this many handler invocations.
    Queued(usize),
    /// Ephemeral envelope dropped because the backlog is over the limit.
    Shed,
}

/// A fixed set of workers executing subscription handlers.
pub struct HandlerPool {
    shards: Vec<mpsc::UnboundedSender<Job>>,
    pending: Mutex<Vec<mpsc::UnboundedReceiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backlog: Arc<AtomicUsize>,
    queue_limit: usize,
    events: EventBus,
}

impl HandlerPool {
    /// Create the pool. Jobs queue up until [`start`](Self::start) spawns
    /// the workers.
    pub fn new(workers: usize, queue_limit: usize, events: EventBus) -> Self {
        let (shards, pending): (Vec<_>, Vec<_>) =
            (0..workers.max(1)).map(|_| mpsc::unbounded_channel()).unzip();
        Self {
            shards,
            pending: Mutex::new(pending),
            workers: Mutex::new(Vec::new()),
            backlog: Arc::new(AtomicUsize::new(0)),
            queue_limit,
            events,
        }
    }

    /// Spawn the workers. Calling it again is a no-op.
    pub fn start(&self) {
        let receivers: Vec<_> = self.pending.lock().drain(..).collect();
        let mut workers = self.workers.lock();
        for (idx, rx) in receivers.into_iter().enumerate() {
            let backlog = Arc::clone(&self.backlog);
            let events = self.events.clone();
            workers.push(tokio::spawn(run_worker(idx, rx, backlog, events)));
        }
    }

    /// Queue `envelope` for every handler in `handlers`.
    pub fn submit(&self, envelope: &Envelope, handlers: Vec<Handler>) -> Submitted {
        if handlers.is_empty() {
            return Submitted::Queued(0);
        }
        if envelope.flags.ephemeral && self.backlog.load(Ordering::SeqCst) >= self.queue_limit {
            self.events.emit(FabricEvent::EnvelopeDropped {
                id: envelope.id,
                sender: envelope.sender.clone(),
                key: envelope.key.clone(),
                reason: DropReason::HandlerBacklog,
            });
            return Submitted::Shed;
        }

        let shard = &self.shards[self.shard_for(envelope)];
        let mut queued = 0;
        for handler in handlers {
            self.backlog.fetch_add(1, Ordering::SeqCst);
            let job = Job {
                handler,
                envelope: envelope.clone(),
            };
            if shard.send(job).is_err() {
                self.backlog.fetch_sub(1, Ordering::SeqCst);
                debug!("Handler pool is shut down, dropping '{}'", envelope.key);
                break;
            }
            queued += 1;
        }
        Submitted::Queued(queued)
    }

    /// Handler invocations queued or running.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Abort the workers. Queued jobs are discarded.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    fn shard_for(&self, envelope: &Envelope) -> usize {
        let mut hasher = DefaultHasher::new();
        envelope.sender.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

async fn run_worker(
    idx: usize,
    mut rx: mpsc::UnboundedReceiver<Job>,
    backlog: Arc<AtomicUsize>,
    events: EventBus,
) {
    while let Some(Job { handler, envelope }) = rx.recv().await {
        let key = envelope.key.clone();
        if AssertUnwindSafe(handler(envelope)).catch_unwind().await.is_err() {
            error!("Handler for '{key}' panicked on worker {idx}");
            events.emit(FabricEvent::HandlerPanicked { key });
        }
        backlog.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeAddress;
    use crate::message::{Flags, MessageId};
    use crate::router::handler_fn;
    use crate::value::Payload;
    use std::time::Duration;

    fn make_envelope(sender: &str, id: u64, ephemeral: bool) -> Envelope {
        Envelope::new(
            MessageId(id),
            NodeAddress::new(sender),
            None,
            "telemetry",
            Payload::new(),
        )
        .with_flags(Flags {
            ephemeral,
            ..Flags::default()
        })
    }

    #[tokio::test]
    async fn test_per_sender_order() {
        let pool = HandlerPool::new(4, 1024, EventBus::new());
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |env: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((env.sender.clone(), env.id.0));
            }
        });

        for id in 1..=50 {
            for sender in ["a", "b", "c"] {
                pool.submit(&make_envelope(sender, id, false), vec![Arc::clone(&handler)]);
            }
        }

        let mut last = std::collections::HashMap::new();
        for _ in 0..150 {
            let (sender, id) = rx.recv().await.unwrap();
            let prev = last.insert(sender.clone(), id).unwrap_or(0);
            assert_eq!(id, prev + 1, "out of order for {sender}");
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_ephemeral_shed_over_limit() {
        let events = EventBus::new();
        let mut listener = events.subscribe();
        // Not started: every job stays queued.
        let pool = HandlerPool::new(1, 2, events);
        let handler = handler_fn(|_env| async {});

        assert_eq!(
            pool.submit(&make_envelope("a", 1, true), vec![Arc::clone(&handler)]),
            Submitted::Queued(1)
        );
        pool.submit(&make_envelope("a", 2, false), vec![Arc::clone(&handler)]);
        assert_eq!(
            pool.submit(&make_envelope("a", 3, true), vec![Arc::clone(&handler)]),
            Submitted::Shed
        );
        // Non-ephemeral envelopes are always queued.
        assert_eq!(
            pool.submit(&make_envelope("a", 4, false), vec![Arc::clone(&handler)]),
            Submitted::Queued(1)
        );
        assert_eq!(pool.backlog(), 3);

        match listener.recv().await.unwrap() {
            FabricEvent::EnvelopeDropped { id, reason, .. } => {
                assert_eq!(id, MessageId(3));
                assert_eq!(reason, DropReason::HandlerBacklog);
            }
            other => panic!("unexpected {other:?}"),
        }

        pool.start();
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.backlog() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_worker() {
        let events = EventBus::new();
        let mut listener = events.subscribe();
        let pool = HandlerPool::new(1, 16, events);
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let panicky = handler_fn(|_env| async {
            if true {
                panic!("boom");
            }
        });
        let ok = handler_fn(move |env: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(env.id);
            }
        });

        pool.submit(&make_envelope("a", 1, false), vec![panicky]);
        pool.submit(&make_envelope("a", 2, false), vec![ok]);
        assert_eq!(rx.recv().await, Some(MessageId(2)));
        assert!(matches!(
            listener.recv().await.unwrap(),
            FabricEvent::HandlerPanicked { .. }
        ));
        pool.shutdown().await;
    }
}
