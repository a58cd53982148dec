//! Stream sessions for sequenced, lossy, high-rate data such as camera frames.
//!
//! A sender opens a [`StreamHandle`] and pushes chunks; each chunk is an
//! ephemeral envelope carrying a [`StreamHeader`] with a random session id
//! and a sequence number starting at 1. A receiver asks its node for a
//! [`StreamReceiver`] by key and reads [`StreamEvent`]s. Missing chunks are
//! never retransmitted; the receiver is told about them with a single
//! [`StreamEvent::Gap`] right before the next chunk that did arrive.
//!
//! Several sources may stream on one key. Each has its own session, which
//! ends on its end marker or when it goes quiet; the receiver outlives them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FabricError, Result};
use crate::events::{DropReason, EventBus, FabricEvent};
use crate::identity::NodeAddress;
use crate::message::{Envelope, Flags, StreamHeader, Target};
use crate::node::NodeInner;
use crate::value::Payload;

/// Why a receiver or one source's session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The source sent its end-of-stream marker.
    Source,
    /// Nothing arrived for the configured idle timeout.
    IdleTimeout,
    /// The local node closed.
    NodeClosed,
    /// Another receiver took over the key.
    Detached,
}

/// What a [`StreamReceiver`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk {
        source: NodeAddress,
        seq: u64,
        value: Payload,
        timestamp: DateTime<Utc>,
    },
    /// Chunks `first_missing..=last_missing` never reached the reader,
    /// either lost on the way or shed because the reader fell behind.
    Gap {
        source: NodeAddress,
        first_missing: u64,
        last_missing: u64,
    },
    /// One source's session is over. The receiver stays open for others.
    SourceEnded { source: NodeAddress, reason: EndReason },
    /// The receiver itself is done. Always the last event.
    Ended(EndReason),
}

// ---------------------------------------------------------------------------
// Sequence tracking
// ---------------------------------------------------------------------------

/// Verdict on one incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// The next expected chunk.
    InOrder,
    /// Chunks were skipped before this one.
    Gap { first_missing: u64, last_missing: u64 },
    /// Already delivered or older than something delivered.
    Stale,
}

/// Sequence state of one source's stream session.
#[derive(Debug, Clone, Copy)]
pub struct SequenceTracker {
    stream_id: u64,
    last_seq: u64,
}

impl SequenceTracker {
    /// Start tracking at the first chunk seen, without reporting a gap for
    /// anything before it.
    pub fn starting_at(header: &StreamHeader) -> Self {
        Self {
            stream_id: header.stream_id,
            last_seq: header.seq.saturating_sub(1),
        }
    }

    pub fn observe(&mut self, header: &StreamHeader) -> SequenceCheck {
        if header.stream_id != self.stream_id {
            // The source restarted: a new session, not a gap.
            *self = Self::starting_at(header);
        }
        if header.seq <= self.last_seq {
            return SequenceCheck::Stale;
        }
        let expected = self.last_seq + 1;
        self.last_seq = header.seq;
        if header.seq == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap {
                first_missing: expected,
                last_missing: header.seq - 1,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

/// One source's session on a key.
struct SourceSession {
    tracker: SequenceTracker,
    last_seen: Instant,
    /// Chunks shed because the reader was full, reported with the next
    /// chunk that fits.
    lost: Option<(u64, u64)>,
}

struct ReceiverSlot {
    tx: mpsc::Sender<StreamEvent>,
    sources: HashMap<NodeAddress, SourceSession>,
    /// `None` until the first chunk; the idle clock starts there.
    last_activity: Option<Instant>,
    end: Arc<Mutex<Option<EndReason>>>,
}

impl ReceiverSlot {
    /// Record why the receiver ends. The reader sees it once the slot,
    /// and with it the sender half, is dropped.
    fn finish(self, reason: EndReason) {
        *self.end.lock() = Some(reason);
    }
}

enum Offer {
    Sent,
    Full,
    Closed,
}

fn offer(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Offer {
    match tx.try_send(event) {
        Ok(()) => Offer::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => Offer::Full,
        Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
    }
}

fn merge(a: Option<(u64, u64)>, b: Option<(u64, u64)>) -> Option<(u64, u64)> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a.0.min(b.0), a.1.max(b.1))),
        (a, b) => a.or(b),
    }
}

/// Stream receivers of one node, keyed by stream key.
pub struct StreamManager {
    slots: Mutex<HashMap<String, ReceiverSlot>>,
    idle_timeout: Duration,
    capacity: usize,
    events: EventBus,
}

impl StreamManager {
    /// `capacity` bounds the events queued for each reader.
    pub fn new(idle_timeout: Duration, capacity: usize, events: EventBus) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_timeout,
            capacity: capacity.max(1),
            events,
        }
    }

    /// Attach a receiver to `key`. A receiver already attached to the key
    /// is ended.
    pub fn open_receiver(&self, key: &str) -> StreamReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        let end = Arc::new(Mutex::new(None));
        let slot = ReceiverSlot {
            tx,
            sources: HashMap::new(),
            last_activity: None,
            end: Arc::clone(&end),
        };
        if let Some(previous) = self.slots.lock().insert(key.to_string(), slot) {
            previous.finish(EndReason::Detached);
        }
        StreamReceiver {
            key: key.to_string(),
            rx,
            end,
            finished: false,
        }
    }

    /// Whether a live receiver waits on `key`.
    pub fn has_receiver(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| !slot.tx.is_closed())
    }

    /// Hand a stream envelope to its receiver. Returns `false` if nobody
    /// listens on the key.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        let Some(header) = envelope.stream else {
            return false;
        };
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&envelope.key) else {
            return false;
        };
        if slot.tx.is_closed() || !self.deliver_to(slot, envelope, &header) {
            slots.remove(&envelope.key);
            return false;
        }
        true
    }

    /// Returns `false` once the reader is gone.
    fn deliver_to(&self, slot: &mut ReceiverSlot, envelope: &Envelope, header: &StreamHeader) -> bool {
        let now = Instant::now();
        slot.last_activity = Some(now);
        let source = &envelope.sender;
        let session = slot
            .sources
            .entry(source.clone())
            .or_insert_with(|| SourceSession {
                tracker: SequenceTracker::starting_at(header),
                last_seen: now,
                lost: None,
            });
        session.last_seen = now;

        let skipped = match session.tracker.observe(header) {
            SequenceCheck::Stale => {
                debug!("Stale chunk {} of '{}' from {source}", header.seq, envelope.key);
                self.emit_drop(envelope, DropReason::StaleChunk);
                return true;
            }
            SequenceCheck::Gap {
                first_missing,
                last_missing,
            } => {
                warn!(
                    "Stream '{}' from {source} lost chunks {first_missing}..={last_missing}",
                    envelope.key
                );
                Some((first_missing, last_missing))
            }
            SequenceCheck::InOrder => None,
        };

        let mut blocked = false;
        if let Some((first_missing, last_missing)) = merge(session.lost.take(), skipped) {
            let gap = StreamEvent::Gap {
                source: source.clone(),
                first_missing,
                last_missing,
            };
            match offer(&slot.tx, gap) {
                Offer::Sent => self.events.emit(FabricEvent::StreamGap {
                    key: envelope.key.clone(),
                    source: source.clone(),
                    first_missing,
                    last_missing,
                }),
                Offer::Full => {
                    session.lost = Some((first_missing, last_missing));
                    blocked = true;
                }
                Offer::Closed => return false,
            }
        }

        if header.end {
            slot.sources.remove(source);
            debug!("Stream '{}' ended by {source}", envelope.key);
            let ended = StreamEvent::SourceEnded {
                source: source.clone(),
                reason: EndReason::Source,
            };
            return match offer(&slot.tx, ended) {
                Offer::Sent => true,
                Offer::Full => {
                    warn!("Reader of '{}' is full, end of {source} not reported", envelope.key);
                    self.emit_drop(envelope, DropReason::ReceiverBacklog);
                    true
                }
                Offer::Closed => false,
            };
        }

        let chunk = StreamEvent::Chunk {
            source: source.clone(),
            seq: header.seq,
            value: envelope.value.clone(),
            timestamp: envelope.timestamp,
        };
        // A chunk never overtakes the report of what went missing before it.
        let sent = if blocked { Offer::Full } else { offer(&slot.tx, chunk) };
        match sent {
            Offer::Sent => true,
            Offer::Full => {
                debug!("Reader of '{}' is full, shedding chunk {}", envelope.key, header.seq);
                session.lost = merge(session.lost, Some((header.seq, header.seq)));
                self.emit_drop(envelope, DropReason::ReceiverBacklog);
                true
            }
            Offer::Closed => false,
        }
    }

    fn emit_drop(&self, envelope: &Envelope, reason: DropReason) {
        self.events.emit(FabricEvent::EnvelopeDropped {
            id: envelope.id,
            sender: envelope.sender.clone(),
            key: envelope.key.clone(),
            reason,
        });
    }

    /// Expire silent sources and end receivers that have seen nothing for
    /// the idle timeout, or whose reader went away. A receiver no chunk has
    /// reached yet never idles out. Returns the number of receivers removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle = |at: Instant| now.saturating_duration_since(at) >= self.idle_timeout;
        let mut slots = self.slots.lock();
        let keys: Vec<String> = slots.keys().cloned().collect();
        let mut removed = 0;
        for key in keys {
            let Some(slot) = slots.get_mut(&key) else {
                continue;
            };
            if slot.tx.is_closed() {
                slots.remove(&key);
                removed += 1;
                continue;
            }
            if slot.last_activity.is_some_and(idle) {
                debug!("Stream '{key}' idle, ending receiver");
                if let Some(slot) = slots.remove(&key) {
                    slot.finish(EndReason::IdleTimeout);
                }
                removed += 1;
                continue;
            }
            let silent: Vec<NodeAddress> = slot
                .sources
                .iter()
                .filter(|(_, session)| idle(session.last_seen))
                .map(|(source, _)| source.clone())
                .collect();
            for source in silent {
                debug!("Source {source} of '{key}' went quiet");
                slot.sources.remove(&source);
                let ended = StreamEvent::SourceEnded {
                    source,
                    reason: EndReason::IdleTimeout,
                };
                if let Offer::Closed = offer(&slot.tx, ended) {
                    break;
                }
            }
        }
        removed
    }

    /// End every receiver.
    pub fn close_all(&self) {
        for (_, slot) in self.slots.lock().drain() {
            slot.finish(EndReason::NodeClosed);
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Receiving end of a stream key. Lives on the node, not on a connection,
/// so it keeps working across reconnects.
pub struct StreamReceiver {
    key: String,
    rx: mpsc::Receiver<StreamEvent>,
    end: Arc<Mutex<Option<EndReason>>>,
    finished: bool,
}

impl StreamReceiver {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event. Everything already queued is yielded before
    /// [`StreamEvent::Ended`]; after that this returns `None`.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.finished = true;
                let reason = self.end.lock().take().unwrap_or(EndReason::Detached);
                Some(StreamEvent::Ended(reason))
            }
        }
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut receiver| async move {
            let event = receiver.next().await?;
            Some((event, receiver))
        }))
    }
}

// ---------------------------------------------------------------------------
// Sending side
// ---------------------------------------------------------------------------

/// Sending end of a stream session.
pub struct StreamHandle {
    node: Arc<NodeInner>,
    key: String,
    target: Option<Target>,
    stream_id: u64,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl StreamHandle {
    pub(crate) fn new(node: Arc<NodeInner>, key: String, target: Option<Target>) -> Self {
        Self {
            node,
            key,
            target,
            stream_id: uuid::Uuid::new_v4().as_u64_pair().0,
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.node.is_closed()
    }

    /// Send one chunk. Returns its sequence number.
    pub fn send_chunk(&self, value: Payload) -> Result<u64> {
        if self.is_closed() {
            return Err(FabricError::StreamClosed(self.key.clone()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let flags = Flags {
            stream_chunk: true,
            ephemeral: true,
            ..Flags::default()
        };
        self.emit(value, flags, seq, false)?;
        Ok(seq)
    }

    /// Send the end-of-stream marker. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || self.node.is_closed() {
            return Ok(());
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let flags = Flags {
            stream_chunk: true,
            ..Flags::default()
        };
        self.emit(Payload::new(), flags, seq, true)
    }

    fn emit(&self, value: Payload, flags: Flags, seq: u64, end: bool) -> Result<()> {
        let mut envelope = self
            .node
            .envelope(self.target.clone(), &self.key, value)
            .with_flags(flags);
        envelope.stream = Some(StreamHeader {
            stream_id: self.stream_id,
            seq,
            end,
        });
        self.node.submit_local(envelope)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("End marker for stream '{}' not sent: {e}", self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use futures::StreamExt;

    fn chunk(sender: &str, stream_id: u64, seq: u64, end: bool) -> Envelope {
        let mut env = Envelope::new(
            MessageId(seq),
            NodeAddress::new(sender),
            None,
            "video",
            Payload::new().with("seq", seq as i64),
        )
        .with_flags(Flags {
            stream_chunk: true,
            ephemeral: !end,
            ..Flags::default()
        });
        env.stream = Some(StreamHeader {
            stream_id,
            seq,
            end,
        });
        env
    }

    fn manager() -> StreamManager {
        StreamManager::new(Duration::from_secs(30), 64, EventBus::new())
    }

    async fn collect(receiver: &mut StreamReceiver, n: usize) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(receiver.next().await.unwrap());
        }
        out
    }

    fn seqs(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                StreamEvent::Chunk { seq, .. } => seq.to_string(),
                StreamEvent::Gap {
                    first_missing,
                    last_missing,
                    ..
                } => format!("gap{first_missing}-{last_missing}"),
                StreamEvent::SourceEnded { source, reason } => format!("done:{source}:{reason:?}"),
                StreamEvent::Ended(reason) => format!("end:{reason:?}"),
            })
            .collect()
    }

    #[test]
    fn test_sequence_tracker() {
        let header = |seq| StreamHeader {
            stream_id: 1,
            seq,
            end: false,
        };
        let mut tracker = SequenceTracker::starting_at(&header(1));
        assert_eq!(tracker.observe(&header(1)), SequenceCheck::InOrder);
        assert_eq!(tracker.observe(&header(2)), SequenceCheck::InOrder);
        assert_eq!(
            tracker.observe(&header(5)),
            SequenceCheck::Gap {
                first_missing: 3,
                last_missing: 4
            }
        );
        assert_eq!(tracker.observe(&header(4)), SequenceCheck::Stale);
        assert_eq!(tracker.observe(&header(5)), SequenceCheck::Stale);
        assert_eq!(tracker.observe(&header(6)), SequenceCheck::InOrder);
    }

    #[tokio::test]
    async fn test_single_gap_before_next_chunk() {
        let streams = manager();
        let mut receiver = streams.open_receiver("video");
        for seq in [1, 2, 3, 4, 6, 7] {
            assert!(streams.deliver(&chunk("camera", 9, seq, false)));
        }
        let events = collect(&mut receiver, 7).await;
        assert_eq!(seqs(&events), vec!["1", "2", "3", "4", "gap5-5", "6", "7"]);
        let gaps = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Gap { .. }))
            .count();
        assert_eq!(gaps, 1);
    }

    #[tokio::test]
    async fn test_gap_emits_fabric_event() {
        let events = EventBus::new();
        let mut listener = events.subscribe();
        let streams = StreamManager::new(Duration::from_secs(30), 64, events);
        let _receiver = streams.open_receiver("video");
        streams.deliver(&chunk("camera", 9, 1, false));
        streams.deliver(&chunk("camera", 9, 4, false));
        match listener.recv().await.unwrap() {
            FabricEvent::StreamGap {
                first_missing,
                last_missing,
                ..
            } => assert_eq!((first_missing, last_missing), (2, 3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_stream_id_restarts_without_gap() {
        let streams = manager();
        let mut receiver = streams.open_receiver("video");
        streams.deliver(&chunk("camera", 9, 1, false));
        streams.deliver(&chunk("camera", 9, 2, false));
        // Source restarted with a fresh session.
        streams.deliver(&chunk("camera", 10, 1, false));
        streams.deliver(&chunk("camera", 10, 2, false));
        let events = collect(&mut receiver, 4).await;
        assert_eq!(seqs(&events), vec!["1", "2", "1", "2"]);
    }

    #[tokio::test]
    async fn test_sources_tracked_independently() {
        let streams = manager();
        let mut receiver = streams.open_receiver("video");
        streams.deliver(&chunk("cam-a", 1, 1, false));
        streams.deliver(&chunk("cam-b", 2, 1, false));
        streams.deliver(&chunk("cam-a", 1, 2, false));
        let events = collect(&mut receiver, 3).await;
        assert_eq!(seqs(&events), vec!["1", "1", "2"]);
    }

    #[tokio::test]
    async fn test_stale_chunk_dropped() {
        let streams = manager();
        let mut receiver = streams.open_receiver("video");
        streams.deliver(&chunk("camera", 9, 1, false));
        streams.deliver(&chunk("camera", 9, 3, false));
        streams.deliver(&chunk("camera", 9, 2, false));
        streams.deliver(&chunk("camera", 9, 4, false));
        let events = collect(&mut receiver, 4).await;
        assert_eq!(seqs(&events), vec!["1", "gap2-2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_end_marker_ends_only_its_source() {
        let streams = manager();
        let mut receiver = streams.open_receiver("video");
        streams.deliver(&chunk("cam-a", 1, 1, false));
        streams.deliver(&chunk("cam-b", 2, 1, false));
        assert!(streams.deliver(&chunk("cam-a", 1, 2, true)));
        assert!(streams.deliver(&chunk("cam-b", 2, 2, false)));
        // cam-a may start a fresh session on the same key.
        assert!(streams.deliver(&chunk("cam-a", 3, 1, false)));

        let events = collect(&mut receiver, 5).await;
        assert_eq!(seqs(&events), vec!["1", "1", "done:cam-a:Source", "2", "1"]);
        assert!(streams.has_receiver("video"));
    }

    #[tokio::test]
    async fn test_idle_clock_starts_at_first_chunk() {
        let streams = StreamManager::new(Duration::from_millis(100), 64, EventBus::new());
        let mut receiver = streams.open_receiver("video");
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(streams.sweep_idle(later), 0);
        assert!(streams.has_receiver("video"));

        streams.deliver(&chunk("camera", 9, 1, false));
        assert_eq!(streams.sweep_idle(Instant::now()), 0);
        assert_eq!(
            streams.sweep_idle(Instant::now() + Duration::from_millis(150)),
            1
        );
        let events = collect(&mut receiver, 2).await;
        assert_eq!(seqs(&events), vec!["1", "end:IdleTimeout"]);
        assert_eq!(receiver.next().await, None);
    }

    #[tokio::test]
    async fn test_quiet_source_expires_alone() {
        let streams = StreamManager::new(Duration::from_millis(100), 64, EventBus::new());
        let mut receiver = streams.open_receiver("video");
        streams.deliver(&chunk("cam-a", 1, 1, false));
        tokio::time::sleep(Duration::from_millis(120)).await;
        streams.deliver(&chunk("cam-b", 2, 1, false));

        assert_eq!(streams.sweep_idle(Instant::now()), 0);
        let events = collect(&mut receiver, 3).await;
        assert_eq!(seqs(&events), vec!["1", "1", "done:cam-a:IdleTimeout"]);
    }

    #[tokio::test]
    async fn test_full_reader_sheds_and_reports_gap() {
        let events = EventBus::new();
        let mut listener = events.subscribe();
        let streams = StreamManager::new(Duration::from_secs(30), 2, events);
        let mut receiver = streams.open_receiver("video");
        for seq in 1..=5 {
            assert!(streams.deliver(&chunk("camera", 9, seq, false)));
        }
        let drained = collect(&mut receiver, 2).await;
        assert_eq!(seqs(&drained), vec!["1", "2"]);

        streams.deliver(&chunk("camera", 9, 6, false));
        let events = collect(&mut receiver, 2).await;
        assert_eq!(seqs(&events), vec!["gap3-5", "6"]);

        let mut shed = 0;
        while let Ok(event) = listener.try_recv() {
            if let FabricEvent::EnvelopeDropped { reason, .. } = event {
                assert_eq!(reason, DropReason::ReceiverBacklog);
                shed += 1;
            }
        }
        assert_eq!(shed, 3);
    }

    #[tokio::test]
    async fn test_close_all_and_detach() {
        let streams = manager();
        let mut first = streams.open_receiver("video");
        streams.deliver(&chunk("camera", 9, 1, false));
        let mut second = streams.open_receiver("video");
        // Queued events still reach the detached reader.
        let events = collect(&mut first, 2).await;
        assert_eq!(seqs(&events), vec!["1", "end:Detached"]);

        let mut other = streams.open_receiver("audio");
        streams.close_all();
        assert_eq!(second.next().await, Some(StreamEvent::Ended(EndReason::NodeClosed)));
        assert_eq!(other.next().await, Some(StreamEvent::Ended(EndReason::NodeClosed)));
        assert_eq!(streams.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let streams = manager();
        let receiver = streams.open_receiver("video");
        for seq in 1..=3 {
            streams.deliver(&chunk("camera", 9, seq, false));
        }
        streams.deliver(&chunk("camera", 9, 4, true));
        streams.close_all();
        let events: Vec<StreamEvent> = receiver.into_stream().collect().await;
        assert_eq!(
            seqs(&events),
            vec!["1", "2", "3", "done:camera:Source", "end:NodeClosed"]
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_swept() {
        let streams = manager();
        drop(streams.open_receiver("video"));
        assert!(!streams.has_receiver("video"));
        assert_eq!(streams.sweep_idle(Instant::now()), 1);
    }
}
