//! Parent link — registration handshake, heartbeats and reconnection.
//!
//! The link is driven by two tasks: a reader that feeds inbound envelopes
//! into the router, and a supervisor that sends heartbeats, judges liveness
//! and reconnects. While the link is down, upward envelopes wait in a
//! bounded [`OutboundBuffer`] and are flushed, in order, the moment the
//! link is registered again.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ack::DedupCache;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::events::{DropReason, EventBus, FabricEvent};
use crate::identity::{NodeAddress, PROTOCOL_VERSION, Role};
use crate::link::{Backoff, HeartbeatTracker, LinkState, LinkStateMachine, Liveness, Overflow, OutboundBuffer};
use crate::message::{Envelope, MessageId, keys};
use crate::node::NodeInner;
use crate::protocol::{InterestUpdate, Registration, RegistrationReply, Resume, RouteUpdate};
use crate::router::Origin;
use crate::transport::{self, Connection};
use crate::value::Payload;

/// Outcome of a successful [`register`](crate::FabricNode::register).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// Logical address of the parent that accepted us.
    pub parent: NodeAddress,
    /// Our session id, used to resume after a reconnect.
    pub session: String,
    /// Connect attempts it took.
    pub attempts: u32,
}

pub(crate) struct Upstream {
    state: Mutex<UpstreamState>,
    /// Wakes the supervisor early, e.g. when the reader loses the link.
    wake: Notify,
}

struct UpstreamState {
    machine: LinkStateMachine,
    parent_addr: Option<String>,
    parent: Option<NodeAddress>,
    role: Role,
    conn: Option<Arc<Connection>>,
    generation: u64,
    buffer: OutboundBuffer,
    dedup: DedupCache,
    tracker: HeartbeatTracker,
    last_interests: Option<BTreeSet<String>>,
    supervised: bool,
}

impl UpstreamState {
    fn move_to(&mut self, to: LinkState, events: &EventBus) -> bool {
        match self.machine.transition(to) {
            Some(from) => {
                debug!("Parent link {from} -> {to}");
                events.emit(FabricEvent::LinkStateChanged { from, to });
                true
            }
            None => false,
        }
    }
}

impl Upstream {
    pub(crate) fn new(config: &FabricConfig) -> Self {
        Self {
            state: Mutex::new(UpstreamState {
                machine: LinkStateMachine::new(),
                parent_addr: None,
                parent: None,
                role: config.role,
                conn: None,
                generation: 0,
                buffer: OutboundBuffer::new(config.outbound_buffer),
                dedup: DedupCache::new(config.dedup_window),
                tracker: HeartbeatTracker::new(config.heartbeat_miss_limit, config.heartbeat_grace),
                last_interests: None,
                supervised: false,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn link_state(&self) -> LinkState {
        self.state.lock().machine.state()
    }

    /// Whether upward traffic has somewhere to go (now or after a reconnect).
    pub(crate) fn has_parent(&self) -> bool {
        let st = self.state.lock();
        st.parent_addr.is_some() && st.machine.state() != LinkState::Closed
    }

    pub(crate) fn parent(&self) -> Option<NodeAddress> {
        self.state.lock().parent.clone()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Drop a queued copy of a message that no longer needs delivering.
    pub(crate) fn forget(&self, sender: &NodeAddress, id: MessageId) -> bool {
        self.state.lock().buffer.remove(sender, id).is_some()
    }

    pub(crate) fn check_duplicate(&self, envelope: &Envelope) -> bool {
        self.state
            .lock()
            .dedup
            .check_and_insert(&envelope.sender, envelope.id)
    }
}

/// Wait on `conn` for the first envelope whose key is in `wanted`.
async fn await_reply(
    node: &NodeInner,
    conn: &Connection,
    wanted: &[&str],
    timeout: Duration,
) -> Result<Envelope> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FabricError::RegistrationTimeout(timeout));
        }
        let bytes = match conn.receive(Some(remaining)).await {
            Ok(bytes) => bytes,
            Err(FabricError::Timeout(_)) => return Err(FabricError::RegistrationTimeout(timeout)),
            Err(e) => return Err(e),
        };
        match node.codec.decode(&bytes) {
            Ok(envelope) if wanted.contains(&envelope.key.as_str()) => return Ok(envelope),
            Ok(envelope) => debug!("Ignoring '{}' while waiting for the parent", envelope.key),
            Err(e) => node.report_malformed(conn.peer(), &e),
        }
    }
}

impl NodeInner {
    pub(crate) fn link_state(&self) -> LinkState {
        self.upstream.link_state()
    }

    /// Register with a parent, retrying the connect with bounded backoff.
    pub(crate) async fn register(self: &Arc<Self>, parent_addr: &str, role: Role) -> Result<RegistrationResult> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        if !self.is_running() {
            return Err(FabricError::NotRunning);
        }
        {
            let mut st = self.upstream.state.lock();
            let current = st.machine.state();
            if current != LinkState::Init {
                return Err(FabricError::Config(format!("parent link is already {current}")));
            }
            st.parent_addr = Some(parent_addr.to_string());
            st.role = role;
            st.move_to(LinkState::Connecting, &self.events);
        }
        info!("Registering '{}' with parent at {parent_addr}", self.identity.address);

        let mut backoff = Backoff::bounded(&self.config.backoff);
        let mut last_error = String::new();
        let conn = loop {
            if !backoff.begin_attempt() {
                self.abandon_registration();
                return Err(FabricError::RegistrationFailed {
                    attempts: backoff.attempts(),
                    last_error,
                });
            }
            match transport::connect(parent_addr, &self.handles).await {
                Ok(conn) => break Arc::new(conn),
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!("Connect attempt {} to {parent_addr} failed: {e}", backoff.attempts());
                    self.events.emit(FabricEvent::ConnectAttemptFailed {
                        attempt: backoff.attempts(),
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    last_error = e.to_string();
                    if backoff.attempts() < self.config.backoff.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        self.upstream
            .state
            .lock()
            .move_to(LinkState::AwaitingAck, &self.events);

        let reply = match self.register_on(&conn, role).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.close().await;
                self.abandon_registration();
                return Err(match e {
                    timeout @ FabricError::RegistrationTimeout(_) => timeout,
                    other => FabricError::RegistrationFailed {
                        attempts: backoff.attempts(),
                        last_error: other.to_string(),
                    },
                });
            }
        };
        if !reply.accepted {
            conn.close().await;
            self.abandon_registration();
            let reason = reply.reason.unwrap_or_else(|| "no reason given".into());
            warn!("Parent at {parent_addr} rejected registration: {reason}");
            return Err(FabricError::RegistrationRejected(reason));
        }

        self.attach_upstream(conn, reply.parent.clone(), false);
        let spawn_supervisor = {
            let mut st = self.upstream.state.lock();
            !std::mem::replace(&mut st.supervised, true)
        };
        if spawn_supervisor {
            let inner = Arc::clone(self);
            self.spawn_task(async move { inner.supervise_upstream().await });
        }
        info!(
            "'{}' registered with '{}' as {role}",
            self.identity.address, reply.parent
        );
        Ok(RegistrationResult {
            parent: reply.parent,
            session: self.identity.session.clone(),
            attempts: backoff.attempts(),
        })
    }

    fn abandon_registration(&self) {
        let mut st = self.upstream.state.lock();
        st.move_to(LinkState::Init, &self.events);
        st.parent_addr = None;
    }

    /// Send a full registration on `conn` and wait for the answer.
    async fn register_on(&self, conn: &Connection, role: Role) -> Result<RegistrationReply> {
        let interests = self.router.aggregate_interests();
        let registration = Registration {
            address: self.identity.address.clone(),
            role,
            protocol_version: PROTOCOL_VERSION,
            session: self.identity.session.clone(),
            interests: interests.iter().cloned().collect(),
            descendants: self.router.known_descendants(),
        };
        self.upstream.state.lock().last_interests = Some(interests);

        let envelope = self.envelope(None, keys::REGISTER, registration.to_payload());
        self.write(conn, &envelope)?;
        let reply = await_reply(
            self,
            conn,
            &[keys::REGISTER_ACK],
            self.config.registration_timeout,
        )
        .await?;
        RegistrationReply::from_payload(&reply.value)
    }

    /// Try to resume our session on `conn`; fall back to a full
    /// registration if the parent no longer knows it. Returns the parent's
    /// address and whether the session was resumed.
    async fn resume_or_register(&self, conn: &Connection) -> Result<(NodeAddress, bool)> {
        let resume = Resume {
            address: self.identity.address.clone(),
            session: self.identity.session.clone(),
        };
        self.write(conn, &self.envelope(None, keys::RESUME, resume.to_payload()))?;
        let timeout = self.config.registration_timeout;
        let reply = await_reply(self, conn, &[keys::HEARTBEAT_ACK, keys::REGISTER_ACK], timeout).await?;
        if reply.key == keys::HEARTBEAT_ACK {
            let parent = reply
                .value
                .get_str("parent")
                .map(NodeAddress::new)
                .or_else(|| self.upstream.parent())
                .ok_or_else(|| FabricError::MalformedEnvelope("resume reply without parent".into()))?;
            return Ok((parent, true));
        }

        debug!("Parent does not know our session, registering again");
        let role = self.upstream.state.lock().role;
        let reply = self.register_on(conn, role).await?;
        if reply.accepted {
            Ok((reply.parent, false))
        } else {
            Err(FabricError::RegistrationRejected(
                reply.reason.unwrap_or_else(|| "no reason given".into()),
            ))
        }
    }

    /// Install a registered connection, flush the buffer and start reading.
    fn attach_upstream(self: &Arc<Self>, conn: Arc<Connection>, parent: NodeAddress, resumed: bool) {
        let generation = {
            let mut st = self.upstream.state.lock();
            st.generation += 1;
            st.conn = Some(Arc::clone(&conn));
            st.parent = Some(parent);
            st.tracker.reset();
            // The parent's reply is traffic too.
            st.tracker.record_activity();
            if !resumed {
                // A fresh registration may face a restarted parent whose ids
                // start over.
                st.dedup.clear();
            }
            st.move_to(LinkState::Registered, &self.events);

            let pending = st.buffer.drain();
            if !pending.is_empty() {
                debug!("Flushing {} buffered envelopes to the parent", pending.len());
            }
            let mut rest = pending.into_iter();
            while let Some(envelope) = rest.next() {
                match self.codec.encode(&envelope) {
                    Ok(bytes) => {
                        if self.transmit(&conn, &envelope, bytes).is_err() {
                            let mut unsent = vec![envelope];
                            unsent.extend(rest);
                            st.buffer.requeue_front(unsent);
                            break;
                        }
                    }
                    Err(e) => self.report_unencodable(&envelope, &e),
                }
            }
            st.generation
        };

        let inner = Arc::clone(self);
        self.spawn_task(async move { inner.read_upstream(conn, generation).await });
    }

    /// Queue or write an envelope to the parent.
    pub(crate) fn send_upstream(&self, envelope: Envelope) {
        let mut st = self.upstream.state.lock();
        if st.machine.state().is_up() {
            if let Some(conn) = &st.conn {
                let bytes = match self.codec.encode(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.report_unencodable(&envelope, &e);
                        return;
                    }
                };
                match self.transmit(conn, &envelope, bytes) {
                    Ok(()) => return,
                    Err(e) => debug!("Write to parent failed, buffering: {e}"),
                }
            }
        }
        match st.buffer.push(envelope) {
            Overflow::None => {}
            Overflow::DroppedOldest(dropped) | Overflow::DroppedIncoming(dropped) => {
                warn!("Parent buffer full, dropped '{}' ({})", dropped.key, dropped.id);
                self.emit_drop(&dropped, DropReason::BufferOverflow);
            }
        }
    }

    /// Tell the parent what this subtree subscribes to, if it changed.
    pub(crate) fn propagate_interests(&self) {
        if !self.upstream.has_parent() {
            return;
        }
        let current = self.router.aggregate_interests();
        {
            let mut st = self.upstream.state.lock();
            if st.last_interests.as_ref() == Some(&current) {
                return;
            }
            st.last_interests = Some(current.clone());
        }
        let update = InterestUpdate {
            patterns: current.into_iter().collect(),
        };
        self.send_upstream(self.envelope(None, keys::INTEREST, update.to_payload()));
    }

    /// Tell the parent about descendants gained or lost.
    pub(crate) fn propagate_routes(&self, update: RouteUpdate) {
        if update.is_empty() || !self.upstream.has_parent() {
            return;
        }
        self.send_upstream(self.envelope(None, keys::ROUTES, update.to_payload()));
    }

    async fn read_upstream(self: Arc<Self>, conn: Arc<Connection>, generation: u64) {
        let reason = loop {
            let bytes = match conn.receive(None).await {
                Ok(bytes) => bytes,
                Err(e) => break e.to_string(),
            };
            let envelope = match self.codec.decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.report_malformed(conn.peer(), &e);
                    continue;
                }
            };
            self.upstream_activity();

            match envelope.key.as_str() {
                keys::HEARTBEAT_ACK => {}
                keys::HEARTBEAT => {
                    let ack = self.envelope(None, keys::HEARTBEAT_ACK, Payload::new());
                    if let Err(e) = self.write(&conn, &ack) {
                        debug!("Heartbeat reply to parent failed: {e}");
                    }
                }
                keys::GOODBYE => break "parent said goodbye".to_string(),
                keys::REGISTER | keys::REGISTER_ACK | keys::RESUME | keys::INTEREST | keys::ROUTES => {
                    debug!("Unexpected '{}' from parent", envelope.key);
                    self.emit_drop(&envelope, DropReason::UnexpectedControl);
                }
                _ => self.route(envelope, Origin::Parent),
            }
        };
        self.upstream_lost(generation, &reason).await;
    }

    fn upstream_activity(&self) {
        let mut st = self.upstream.state.lock();
        if st.tracker.record_activity() && st.machine.state() == LinkState::HeartbeatMissed {
            info!("Parent link recovered");
            st.move_to(LinkState::Registered, &self.events);
        }
    }

    /// Mark the link down if `generation` is still the current connection.
    async fn upstream_lost(&self, generation: u64, reason: &str) {
        let conn = {
            let mut st = self.upstream.state.lock();
            if st.generation != generation || !st.machine.state().is_up() {
                return;
            }
            warn!("Lost parent link: {reason}");
            st.move_to(LinkState::Disconnected, &self.events);
            st.conn.take()
        };
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.upstream.wake.notify_one();
    }

    async fn supervise_upstream(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.upstream.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.is_closed() {
                break;
            }
            match self.upstream.link_state() {
                LinkState::Registered | LinkState::HeartbeatMissed => self.heartbeat_tick().await,
                LinkState::Disconnected => self.reconnect_upstream(&mut shutdown).await,
                LinkState::Closed => break,
                _ => {}
            }
        }
        debug!("Parent supervisor stopped");
    }

    async fn heartbeat_tick(&self) {
        let (liveness, conn, generation) = {
            let mut st = self.upstream.state.lock();
            (st.tracker.tick(), st.conn.clone(), st.generation)
        };
        let Some(conn) = conn.filter(|c| c.is_open()) else {
            self.upstream_lost(generation, "connection closed").await;
            return;
        };
        match liveness {
            Liveness::Alive => {}
            Liveness::Missed => {
                let mut st = self.upstream.state.lock();
                if st.move_to(LinkState::HeartbeatMissed, &self.events) {
                    warn!("Parent missed {} heartbeat intervals", st.tracker.silent_intervals());
                }
            }
            Liveness::Dead => {
                self.upstream_lost(generation, "heartbeat timeout").await;
                return;
            }
        }
        let heartbeat = self.envelope(None, keys::HEARTBEAT, Payload::new());
        if let Err(e) = self.write(&conn, &heartbeat) {
            self.upstream_lost(generation, &e.to_string()).await;
        }
    }

    /// Reconnect with unbounded backoff until registered again or closed.
    async fn reconnect_upstream(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) {
        let addr = {
            let mut st = self.upstream.state.lock();
            if !st.move_to(LinkState::Reconnecting, &self.events) {
                return;
            }
            match st.parent_addr.clone() {
                Some(addr) => addr,
                None => return,
            }
        };
        let mut backoff = Backoff::unbounded(&self.config.backoff);
        loop {
            if self.is_closed() {
                return;
            }
            backoff.begin_attempt();
            let error = match transport::connect(&addr, &self.handles).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    match self.resume_or_register(&conn).await {
                        Ok((parent, resumed)) => {
                            self.attach_upstream(conn, parent.clone(), resumed);
                            if resumed {
                                self.reannounce();
                            }
                            info!(
                                "Reconnected to '{parent}' after {} attempts ({})",
                                backoff.attempts(),
                                if resumed { "session resumed" } else { "registered again" }
                            );
                            return;
                        }
                        Err(e) => {
                            conn.close().await;
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            let delay = backoff.next_delay();
            debug!("Reconnect attempt {} to {addr} failed: {error}", backoff.attempts());
            self.events.emit(FabricEvent::ConnectAttemptFailed {
                attempt: backoff.attempts(),
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// After a resume, bring the parent's view of our subtree up to date.
    fn reannounce(&self) {
        self.upstream.state.lock().last_interests = None;
        self.propagate_interests();
        self.propagate_routes(RouteUpdate {
            added: self.router.known_descendants(),
            removed: Vec::new(),
        });
    }

    /// Say goodbye and drop the parent link for good.
    pub(crate) async fn close_upstream(&self) {
        let (conn, was_up) = {
            let mut st = self.upstream.state.lock();
            let was_up = st.machine.state().is_up();
            st.move_to(LinkState::Closed, &self.events);
            (st.conn.take(), was_up)
        };
        if let Some(conn) = conn {
            if was_up {
                let goodbye = self.envelope(None, keys::GOODBYE, Payload::new());
                let _ = self.write(&conn, &goodbye);
            }
            conn.close().await;
        }
    }
}
