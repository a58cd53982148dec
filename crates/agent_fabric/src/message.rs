//! Message envelope — the unit of communication between nodes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::NodeAddress;
use crate::value::Payload;

/// Prefix of the keys used by the fabric's own control traffic.
pub const CONTROL_PREFIX: &str = "_fabric/";

/// Reserved control keys.
pub mod keys {
    pub const REGISTER: &str = "_fabric/register";
    pub const REGISTER_ACK: &str = "_fabric/register_ack";
    pub const HEARTBEAT: &str = "_fabric/heartbeat";
    pub const HEARTBEAT_ACK: &str = "_fabric/heartbeat_ack";
    pub const RESUME: &str = "_fabric/resume";
    pub const ACK: &str = "_fabric/ack";
    pub const INTEREST: &str = "_fabric/interest";
    pub const ROUTES: &str = "_fabric/routes";
    pub const GOODBYE: &str = "_fabric/goodbye";
}

/// Sender-scoped message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an envelope is going. An envelope without a target travels to the
/// sender's parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// A specific node anywhere in the tree.
    Node(NodeAddress),
    /// Every subscriber whose pattern matches the topic.
    Topic(String),
}

impl Target {
    pub fn node(address: impl Into<NodeAddress>) -> Self {
        Self::Node(address.into())
    }

    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topic(topic.into())
    }
}

/// Per-envelope delivery flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Blob data in the payload is LZ4-compressed on the wire.
    pub compressed: bool,
    /// The envelope is a chunk of a stream session.
    pub stream_chunk: bool,
    /// The sender waits for an acknowledgement.
    pub requires_ack: bool,
    /// Losing this envelope is acceptable; never retried, first to be dropped.
    pub ephemeral: bool,
}

/// Sequencing information carried by stream chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Random id of the sending session; changes when the source restarts.
    pub stream_id: u64,
    /// Monotonic sequence number starting at 1.
    pub seq: u64,
    /// Marks the end-of-stream envelope.
    #[serde(default)]
    pub end: bool,
}

/// A message envelope carrying a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    /// Address of the originating node.
    pub sender: NodeAddress,
    /// `None` means "up to the parent".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    /// Semantic type of the message.
    pub key: String,
    #[serde(default)]
    pub value: Payload,
    /// Capture time at the sender.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamHeader>,
}

impl Envelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(
        id: MessageId,
        sender: NodeAddress,
        target: Option<Target>,
        key: impl Into<String>,
        value: Payload,
    ) -> Self {
        Self {
            id,
            sender,
            target,
            key: key.into(),
            value,
            timestamp: Utc::now(),
            flags: Flags::default(),
            stream: None,
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this envelope belongs to the fabric's control plane.
    pub fn is_control(&self) -> bool {
        is_control_key(&self.key)
    }

    /// Control traffic and acknowledged sends are never dropped from buffers.
    pub fn is_critical(&self) -> bool {
        self.is_control() || self.flags.requires_ack || self.is_stream_end()
    }

    pub fn is_stream_end(&self) -> bool {
        self.stream.is_some_and(|h| h.end)
    }

    /// The string subscriptions are matched against: the topic for
    /// topic-targeted envelopes, the key otherwise.
    pub fn route_key(&self) -> &str {
        match &self.target {
            Some(Target::Topic(topic)) => topic,
            _ => &self.key,
        }
    }
}

/// Whether `key` lives in the reserved control namespace.
pub fn is_control_key(key: &str) -> bool {
    key.starts_with(CONTROL_PREFIX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
