//! Link lifecycle pieces shared by the parent link and child links.
//!
//! Nothing in this module touches a socket or a clock. The upstream
//! supervisor and the downstream sweep drive these types from their own
//! timers, which keeps every transition testable with plain loops.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackoffConfig;
use crate::identity::NodeAddress;
use crate::message::{Envelope, MessageId};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// State of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Init,
    Connecting,
    AwaitingAck,
    Registered,
    HeartbeatMissed,
    Disconnected,
    Reconnecting,
    Closed,
}

impl LinkState {
    /// Whether envelopes can be written to the connection right now.
    pub fn is_up(self) -> bool {
        matches!(self, Self::Registered | Self::HeartbeatMissed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: LinkState) -> bool {
        use LinkState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Init, Connecting) => true,
            (Connecting, AwaitingAck | Init) => true,
            (AwaitingAck, Registered | Init) => true,
            (Registered, HeartbeatMissed | Disconnected) => true,
            (HeartbeatMissed, Registered | Disconnected) => true,
            (Disconnected, Reconnecting) => true,
            (Reconnecting, Registered | Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::AwaitingAck => "awaiting_ack",
            Self::Registered => "registered",
            Self::HeartbeatMissed => "heartbeat_missed",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Tracks the current [`LinkState`] and refuses illegal transitions.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: LinkState,
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Init,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Move to `to`. Returns the previous state, or `None` (and stays put)
    /// if the transition is illegal. Moving to the current state is a no-op
    /// and also returns `None`.
    pub fn transition(&mut self, to: LinkState) -> Option<LinkState> {
        if self.state == to || !self.state.can_transition(to) {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(from)
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Heartbeat tracking
// ---------------------------------------------------------------------------

/// Liveness verdict after one heartbeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Missed,
    Dead,
}

/// Counts consecutive heartbeat intervals without inbound traffic.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    miss_limit: u32,
    grace: u32,
    silent: u32,
    heard: bool,
}

impl HeartbeatTracker {
    pub fn new(miss_limit: u32, grace: u32) -> Self {
        Self {
            miss_limit: miss_limit.max(1),
            grace,
            silent: 0,
            heard: false,
        }
    }

    /// Any inbound envelope counts. Returns `true` if the link had been
    /// flagged as missing heartbeats.
    pub fn record_activity(&mut self) -> bool {
        let was_missed = self.silent >= self.miss_limit;
        self.silent = 0;
        self.heard = true;
        was_missed
    }

    /// Close one interval and judge the link.
    pub fn tick(&mut self) -> Liveness {
        if std::mem::take(&mut self.heard) {
            self.silent = 0;
        } else {
            self.silent = self.silent.saturating_add(1);
        }
        self.liveness()
    }

    pub fn liveness(&self) -> Liveness {
        if self.silent >= self.miss_limit.saturating_add(self.grace) {
            Liveness::Dead
        } else if self.silent >= self.miss_limit {
            Liveness::Missed
        } else {
            Liveness::Alive
        }
    }

    pub fn silent_intervals(&self) -> u32 {
        self.silent
    }

    pub fn reset(&mut self) {
        self.silent = 0;
        self.heard = false;
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff between connect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    next: Duration,
    bounded: bool,
}

impl Backoff {
    /// Gives up after `config.max_attempts` attempts.
    pub fn bounded(config: &BackoffConfig) -> Self {
        Self {
            next: config.initial,
            config: config.clone(),
            attempt: 0,
            bounded: true,
        }
    }

    /// Never gives up; used for background reconnects.
    pub fn unbounded(config: &BackoffConfig) -> Self {
        Self {
            bounded: false,
            ..Self::bounded(config)
        }
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Count an attempt. Returns `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.bounded && self.attempt >= self.config.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Delay to wait after a failed attempt, growing by `multiplier` each
    /// call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.config.max);
        self.next = self.next.mul_f64(self.config.multiplier).min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.config.initial;
    }
}

// ---------------------------------------------------------------------------
// Outbound buffer
// ---------------------------------------------------------------------------

/// What `push` had to give up to make room.
#[derive(Debug, PartialEq)]
pub enum Overflow {
    None,
    /// The oldest droppable envelope was evicted.
    DroppedOldest(Envelope),
    /// The buffer held only critical envelopes; the new one was refused.
    DroppedIncoming(Envelope),
}

/// Bounded queue of envelopes waiting for a link to come back.
///
/// Critical envelopes (control traffic, acknowledged sends, stream end
/// markers) are never evicted; the buffer grows past its capacity rather
/// than lose one. A retransmission replaces its earlier copy, so one
/// `(sender, id)` is held at most once.
#[derive(Debug)]
pub struct OutboundBuffer {
    queue: VecDeque<Envelope>,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, envelope: Envelope) -> Overflow {
        if let Some(queued) = self
            .queue
            .iter_mut()
            .find(|e| e.id == envelope.id && e.sender == envelope.sender)
        {
            *queued = envelope;
            return Overflow::None;
        }
        if self.queue.len() < self.capacity {
            self.queue.push_back(envelope);
            return Overflow::None;
        }
        match self.queue.iter().position(|e| !e.is_critical()) {
            Some(idx) => {
                let evicted = self.queue.remove(idx);
                self.queue.push_back(envelope);
                match evicted {
                    Some(evicted) => Overflow::DroppedOldest(evicted),
                    None => Overflow::None,
                }
            }
            None if envelope.is_critical() => {
                self.queue.push_back(envelope);
                Overflow::None
            }
            None => Overflow::DroppedIncoming(envelope),
        }
    }

    /// Drop the queued copy of `(sender, id)`, if any.
    pub fn remove(&mut self, sender: &NodeAddress, id: MessageId) -> Option<Envelope> {
        let idx = self
            .queue
            .iter()
            .position(|e| e.id == id && &e.sender == sender)?;
        self.queue.remove(idx)
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    /// Put envelopes back at the front, keeping their order. Used when a
    /// flush fails halfway.
    pub fn requeue_front(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            self.queue.push_front(envelope);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
