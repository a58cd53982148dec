//! Everything a node drops or swallows, and every link state change.
//!
//! Events are fire-and-forget: the node never waits for a listener, and a
//! listener that falls behind loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::identity::{NodeAddress, Role};
use crate::link::LinkState;
use crate::message::MessageId;

/// Events buffered per listener before the oldest are overwritten.
const EVENT_CAPACITY: usize = 1024;

/// Why an envelope was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Addressed to a node no link leads to.
    Unroutable,
    /// Reached the end of its path with no subscriber.
    Unhandled,
    /// Evicted from a full outbound buffer.
    BufferOverflow,
    /// Ephemeral envelope shed because the handler pool is backed up.
    HandlerBacklog,
    /// Retransmission of an envelope that was already delivered.
    Duplicate,
    /// Control traffic arriving somewhere it has no meaning.
    UnexpectedControl,
    /// Stream chunk older than the last one delivered.
    StaleChunk,
    /// Could not be encoded for the wire.
    Unencodable,
    /// Stream chunk shed because its reader fell behind.
    ReceiverBacklog,
    /// Ephemeral envelope shed because the connection's send queue is
    /// backed up.
    SendBacklog,
    /// Buffered for a child that never came back.
    ChildEvicted,
    /// Buffered for a child session that was replaced by a new one.
    SessionReplaced,
}

/// A recorded fabric event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FabricEvent {
    /// The upstream link moved between states.
    LinkStateChanged { from: LinkState, to: LinkState },
    /// A connect attempt to the parent failed and will be retried.
    ConnectAttemptFailed {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A child completed registration, or resumed its session.
    ChildRegistered {
        address: NodeAddress,
        role: Role,
        resumed: bool,
    },
    /// A child's registration was refused.
    ChildRejected { address: NodeAddress, reason: String },
    /// A child link went down. The child stays registered.
    ChildDisconnected { address: NodeAddress, reason: String },
    /// A disconnected child was forgotten after the retention period.
    ChildEvicted { address: NodeAddress },
    /// An envelope was discarded.
    EnvelopeDropped {
        id: MessageId,
        sender: NodeAddress,
        key: String,
        reason: DropReason,
    },
    /// Bytes from a peer could not be decoded.
    MalformedEnvelope { peer: String, error: String },
    /// No acknowledgement arrived in time; the envelope is retransmitted.
    AckTimeout { id: MessageId, attempt: u32 },
    /// An acknowledged send gave up.
    DeliveryFailed { id: MessageId, attempts: u32 },
    /// A stream receiver skipped missing chunks.
    StreamGap {
        key: String,
        source: NodeAddress,
        first_missing: u64,
        last_missing: u64,
    },
    /// A subscription handler panicked.
    HandlerPanicked { key: String },
}

/// Fan-out of [`FabricEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FabricEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Record an event. Having no listener is fine.
    pub fn emit(&self, event: FabricEvent) {
        trace!("Fabric event: {event:?}");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
