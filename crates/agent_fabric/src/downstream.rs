//! Child links: accepting registrations and tracking each child's state.
//!
//! A child keeps its registry entry across disconnects: envelopes bound for
//! it are buffered while it is away and flushed when it resumes its session
//! or registers again. A child that stays away longer than the retention
//! period is forgotten together with its routes and buffer. A new session
//! taking over the address starts with an empty buffer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ack::DedupCache;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::events::{DropReason, FabricEvent};
use crate::identity::{NodeAddress, PROTOCOL_VERSION, Role};
use crate::link::{HeartbeatTracker, Liveness, OutboundBuffer, Overflow};
use crate::message::{Envelope, MessageId, Target, keys};
use crate::node::{FabricNode, NodeInner};
use crate::protocol::{InterestUpdate, Registration, RegistrationReply, Resume, RouteUpdate};
use crate::router::Origin;
use crate::transport::Connection;
use crate::value::Payload;

/// Connection state of a registered child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    /// Registered with a live connection.
    Connected,
    /// Registered, but the connection is gone. Envelopes are buffered.
    Disconnected,
}

/// Snapshot of a registered child.
#[derive(Debug, Clone, Serialize)]
pub struct ChildInfo {
    pub address: NodeAddress,
    pub role: Role,
    pub session: String,
    pub state: ChildState,
    /// Transport address of the current (or last) connection.
    pub peer: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Patterns the child's subtree subscribes to.
    pub interests: Vec<String>,
    /// Nodes reachable through the child.
    pub descendants: Vec<NodeAddress>,
    /// Envelopes waiting for the child to come back.
    pub buffered: usize,
}

struct ChildLink {
    info: ChildInfo,
    conn: Option<Arc<Connection>>,
    generation: u64,
    buffer: OutboundBuffer,
    dedup: DedupCache,
    tracker: HeartbeatTracker,
    /// Set while the child is away; drives eviction.
    disconnected_at: Option<Instant>,
}

impl ChildLink {
    fn snapshot(&self) -> ChildInfo {
        ChildInfo {
            buffered: self.buffer.len(),
            ..self.info.clone()
        }
    }
}

/// Registry of all children of one node.
pub(crate) struct ChildRegistry {
    links: RwLock<HashMap<NodeAddress, ChildLink>>,
    next_generation: std::sync::atomic::AtomicU64,
    buffer_capacity: usize,
    dedup_window: usize,
    miss_limit: u32,
    grace: u32,
    retention: Duration,
}

impl ChildRegistry {
    pub(crate) fn new(config: &FabricConfig) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            buffer_capacity: config.outbound_buffer,
            dedup_window: config.dedup_window,
            miss_limit: config.heartbeat_miss_limit,
            grace: config.heartbeat_grace,
            retention: config.child_retention,
        }
    }

    fn next_generation(&self) -> u64 {
        self.next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Decide whether a registration may proceed.
    pub(crate) fn admit(&self, registration: &Registration, own_address: &NodeAddress) -> std::result::Result<(), String> {
        if registration.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {} not supported (expected {PROTOCOL_VERSION})",
                registration.protocol_version
            ));
        }
        if &registration.address == own_address {
            return Err(format!("address '{own_address}' belongs to the parent"));
        }
        let links = self.links.read();
        if let Some(existing) = links.get(&registration.address) {
            if existing.info.state == ChildState::Connected && existing.info.session != registration.session {
                return Err(format!("address '{}' is already in use", registration.address));
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, address: &NodeAddress) -> Option<ChildInfo> {
        self.links.read().get(address).map(ChildLink::snapshot)
    }

    /// List all registered children, sorted by address.
    pub(crate) fn list_all(&self) -> Vec<ChildInfo> {
        let mut all: Vec<ChildInfo> = self.links.read().values().map(ChildLink::snapshot).collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    /// Return the number of connected children.
    pub(crate) fn connected_count(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|l| l.info.state == ChildState::Connected)
            .count()
    }

    pub(crate) fn check_duplicate(&self, child: &NodeAddress, sender: &NodeAddress, id: MessageId) -> bool {
        self.links
            .write()
            .get_mut(child)
            .is_some_and(|link| link.dedup.check_and_insert(sender, id))
    }

    /// Drop buffered copies of `(sender, id)` bound for any child.
    pub(crate) fn forget(&self, sender: &NodeAddress, id: MessageId) -> bool {
        let mut found = false;
        for link in self.links.write().values_mut() {
            found |= link.buffer.remove(sender, id).is_some();
        }
        found
    }

    /// Remove children that have been disconnected for the retention
    /// period.
    fn take_expired(&self, now: Instant) -> Vec<ChildLink> {
        let mut links = self.links.write();
        let expired: Vec<NodeAddress> = links
            .iter()
            .filter(|(_, link)| {
                link.info.state == ChildState::Disconnected
                    && link
                        .disconnected_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.retention)
            })
            .map(|(address, _)| address.clone())
            .collect();
        expired.iter().filter_map(|address| links.remove(address)).collect()
    }

    fn record_activity(&self, child: &NodeAddress) {
        if let Some(link) = self.links.write().get_mut(child) {
            link.tracker.record_activity();
            link.info.last_seen = Utc::now();
        }
    }

    fn set_interests(&self, child: &NodeAddress, patterns: Vec<String>) {
        if let Some(link) = self.links.write().get_mut(child) {
            link.info.interests = patterns;
        }
    }

    fn apply_routes(&self, child: &NodeAddress, update: &RouteUpdate) {
        if let Some(link) = self.links.write().get_mut(child) {
            let descendants = &mut link.info.descendants;
            descendants.retain(|d| !update.removed.contains(d));
            for added in &update.added {
                if !descendants.contains(added) {
                    descendants.push(added.clone());
                }
            }
            descendants.sort();
        }
    }

    /// Advance every connected child's heartbeat tracker by one interval
    /// and return the children that went silent for too long.
    fn tick(&self) -> Vec<(NodeAddress, u64)> {
        let mut dead = Vec::new();
        for (address, link) in self.links.write().iter_mut() {
            if link.info.state != ChildState::Connected {
                continue;
            }
            match link.tracker.tick() {
                Liveness::Alive => {}
                Liveness::Missed => debug!(
                    "Child '{address}' silent for {} intervals",
                    link.tracker.silent_intervals()
                ),
                Liveness::Dead => dead.push((address.clone(), link.generation)),
            }
        }
        dead
    }
}

/// A handle to one registered child.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    address: NodeAddress,
    node: FabricNode,
}

impl ChildHandle {
    pub(crate) fn new(address: NodeAddress, node: FabricNode) -> Self {
        Self { address, node }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Current snapshot, or `None` if the child is no longer registered.
    pub fn info(&self) -> Option<ChildInfo> {
        self.node.inner().children.get(&self.address)
    }

    pub fn is_connected(&self) -> bool {
        self.info().is_some_and(|i| i.state == ChildState::Connected)
    }

    /// Send an envelope addressed to this child.
    pub async fn send(&self, key: &str, value: Payload, require_ack: bool) -> Result<MessageId> {
        self.node
            .send(key, value, Some(Target::Node(self.address.clone())), require_ack)
            .await
    }
}

impl NodeInner {
    /// Run the parent side of the handshake on a fresh connection.
    pub(crate) async fn accept_child(self: &Arc<Self>, conn: Connection) -> Result<NodeAddress> {
        let conn = Arc::new(conn);
        let timeout = self.config.registration_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = if remaining.is_zero() {
                Err(FabricError::Timeout(timeout))
            } else {
                conn.receive(Some(remaining)).await
            };
            let bytes = match received {
                Ok(bytes) => bytes,
                Err(e) => {
                    conn.close().await;
                    return Err(match e {
                        FabricError::Timeout(_) => FabricError::RegistrationTimeout(timeout),
                        other => other,
                    });
                }
            };
            let envelope = match self.codec.decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.report_malformed(conn.peer(), &e);
                    continue;
                }
            };

            match envelope.key.as_str() {
                keys::RESUME => {
                    let resume = match Resume::from_payload(&envelope.value) {
                        Ok(resume) => resume,
                        Err(e) => {
                            self.report_malformed(conn.peer(), &e);
                            continue;
                        }
                    };
                    if self.resume_child(&resume, &conn).await {
                        return Ok(resume.address);
                    }
                    debug!("Unknown session for '{}', asking for registration", resume.address);
                    let reply = RegistrationReply::reject(&self.identity.address, "unknown session");
                    self.write(&conn, &self.envelope(None, keys::REGISTER_ACK, reply.to_payload()))?;
                }
                keys::REGISTER => {
                    let registration = match Registration::from_payload(&envelope.value) {
                        Ok(registration) => registration,
                        Err(e) => {
                            self.reject_child(&conn, &envelope.sender, e.to_string()).await;
                            return Err(FabricError::RegistrationRejected(e.to_string()));
                        }
                    };
                    if let Err(reason) = self.children.admit(&registration, &self.identity.address) {
                        self.reject_child(&conn, &registration.address, reason.clone()).await;
                        return Err(FabricError::RegistrationRejected(reason));
                    }
                    let address = registration.address.clone();
                    self.register_child(registration, conn).await;
                    return Ok(address);
                }
                other => debug!("Ignoring '{other}' before registration from {}", conn.peer()),
            }
        }
    }

    async fn reject_child(&self, conn: &Connection, address: &NodeAddress, reason: String) {
        warn!("Rejecting child '{address}': {reason}");
        self.events.emit(FabricEvent::ChildRejected {
            address: address.clone(),
            reason: reason.clone(),
        });
        let reply = RegistrationReply::reject(&self.identity.address, reason);
        if let Err(e) = self.write(conn, &self.envelope(None, keys::REGISTER_ACK, reply.to_payload())) {
            debug!("Rejection not delivered: {e}");
        }
        conn.close().await;
    }

    async fn register_child(self: &Arc<Self>, registration: Registration, conn: Arc<Connection>) {
        let address = registration.address.clone();

        // Routing state first, so nothing the child sends after the reply
        // can outrun it.
        self.router.set_child_interests(&address, &registration.interests);
        let stale: Vec<NodeAddress> = self
            .router
            .descendants_via(&address)
            .into_iter()
            .filter(|d| *d != address && !registration.descendants.contains(d))
            .collect();
        for d in &stale {
            self.router.remove_route(d);
        }
        let mut added = Vec::new();
        for d in std::iter::once(&address).chain(registration.descendants.iter()) {
            if self.router.add_route(d.clone(), address.clone()) {
                added.push(d.clone());
            }
        }

        let generation = self.children.next_generation();
        let now = Utc::now();
        let previous_conn = {
            let mut links = self.children.links.write();
            let previous = links.remove(&address);
            let (buffer, previous_conn, registered_at) = match previous {
                Some(mut link) if link.info.session != registration.session => {
                    let stale = link.buffer.drain();
                    if !stale.is_empty() {
                        warn!(
                            "New session for '{address}', discarding {} envelopes buffered for the old one",
                            stale.len()
                        );
                    }
                    for envelope in &stale {
                        self.emit_drop(envelope, DropReason::SessionReplaced);
                    }
                    (link.buffer, link.conn, link.info.registered_at)
                }
                Some(link) => (link.buffer, link.conn, link.info.registered_at),
                None => (OutboundBuffer::new(self.children.buffer_capacity), None, now),
            };
            let mut link = ChildLink {
                info: ChildInfo {
                    address: address.clone(),
                    role: registration.role,
                    session: registration.session.clone(),
                    state: ChildState::Connected,
                    peer: conn.peer().to_string(),
                    registered_at,
                    last_seen: now,
                    interests: registration.interests.clone(),
                    descendants: registration.descendants.clone(),
                    buffered: 0,
                },
                conn: Some(Arc::clone(&conn)),
                generation,
                buffer,
                dedup: DedupCache::new(self.children.dedup_window),
                tracker: HeartbeatTracker::new(self.children.miss_limit, self.children.grace),
                disconnected_at: None,
            };
            let reply = RegistrationReply::accept(&self.identity.address);
            if let Err(e) = self.write(&conn, &self.envelope(None, keys::REGISTER_ACK, reply.to_payload())) {
                debug!("Registration reply to '{address}' failed: {e}");
            }
            self.flush_child(&mut link, &conn);
            links.insert(address.clone(), link);
            previous_conn
        };
        if let Some(old) = previous_conn {
            if !Arc::ptr_eq(&old, &conn) {
                old.close().await;
            }
        }

        info!(
            "Child '{address}' registered as {} from {}",
            registration.role,
            conn.peer()
        );
        self.events.emit(FabricEvent::ChildRegistered {
            address: address.clone(),
            role: registration.role,
            resumed: false,
        });

        let inner = Arc::clone(self);
        self.spawn_task(async move { inner.read_child(address, conn, generation).await });

        self.propagate_routes(RouteUpdate {
            added,
            removed: stale,
        });
        self.propagate_interests();
    }

    /// Reattach a known session. Returns `false` if the session is unknown.
    async fn resume_child(self: &Arc<Self>, resume: &Resume, conn: &Arc<Connection>) -> bool {
        let generation = self.children.next_generation();
        let (role, previous_conn) = {
            let mut links = self.children.links.write();
            let Some(link) = links.get_mut(&resume.address) else {
                return false;
            };
            if link.info.session != resume.session {
                return false;
            }
            let previous_conn = link.conn.replace(Arc::clone(conn));
            link.generation = generation;
            link.info.state = ChildState::Connected;
            link.info.peer = conn.peer().to_string();
            link.info.last_seen = Utc::now();
            link.disconnected_at = None;
            link.tracker.reset();

            let ack = self.envelope(
                None,
                keys::HEARTBEAT_ACK,
                Payload::new().with("parent", self.identity.address.as_str()),
            );
            if let Err(e) = self.write(conn, &ack) {
                debug!("Resume reply to '{}' failed: {e}", resume.address);
            }
            self.flush_child(link, conn);
            (link.info.role, previous_conn)
        };
        if let Some(old) = previous_conn {
            if !Arc::ptr_eq(&old, conn) {
                old.close().await;
            }
        }

        info!("Child '{}' resumed its session from {}", resume.address, conn.peer());
        self.events.emit(FabricEvent::ChildRegistered {
            address: resume.address.clone(),
            role,
            resumed: true,
        });
        let inner = Arc::clone(self);
        let address = resume.address.clone();
        let conn = Arc::clone(conn);
        self.spawn_task(async move { inner.read_child(address, conn, generation).await });
        true
    }

    /// Write out a child's buffer. Called with the registry lock held so
    /// newer envelopes can not overtake buffered ones.
    fn flush_child(&self, link: &mut ChildLink, conn: &Connection) {
        let pending = link.buffer.drain();
        if !pending.is_empty() {
            debug!("Flushing {} buffered envelopes to '{}'", pending.len(), link.info.address);
        }
        let mut rest = pending.into_iter();
        while let Some(envelope) = rest.next() {
            match self.codec.encode(&envelope) {
                Ok(bytes) => {
                    if self.transmit(conn, &envelope, bytes).is_err() {
                        let mut unsent = vec![envelope];
                        unsent.extend(rest);
                        link.buffer.requeue_front(unsent);
                        break;
                    }
                }
                Err(e) => self.report_unencodable(&envelope, &e),
            }
        }
    }

    /// Queue or write an envelope to a direct child.
    pub(crate) fn send_downstream(&self, child: &NodeAddress, envelope: Envelope) {
        let mut links = self.children.links.write();
        let Some(link) = links.get_mut(child) else {
            warn!("No child '{child}' for '{}'", envelope.key);
            self.emit_drop(&envelope, DropReason::Unroutable);
            return;
        };
        if link.info.state == ChildState::Connected {
            if let Some(conn) = &link.conn {
                let bytes = match self.codec.encode(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.report_unencodable(&envelope, &e);
                        return;
                    }
                };
                match self.transmit(conn, &envelope, bytes) {
                    Ok(()) => return,
                    Err(e) => debug!("Write to '{child}' failed, buffering: {e}"),
                }
            }
        }
        match link.buffer.push(envelope) {
            Overflow::None => {}
            Overflow::DroppedOldest(dropped) | Overflow::DroppedIncoming(dropped) => {
                warn!("Buffer for '{child}' full, dropped '{}' ({})", dropped.key, dropped.id);
                self.emit_drop(&dropped, DropReason::BufferOverflow);
            }
        }
    }

    async fn read_child(self: Arc<Self>, address: NodeAddress, conn: Arc<Connection>, generation: u64) {
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
            self.children.record_activity(&address);

            match envelope.key.as_str() {
                keys::HEARTBEAT => {
                    let ack = self.envelope(None, keys::HEARTBEAT_ACK, Payload::new());
                    if let Err(e) = self.write(&conn, &ack) {
                        debug!("Heartbeat reply to '{address}' failed: {e}");
                    }
                }
                keys::HEARTBEAT_ACK => {}
                keys::INTEREST => match InterestUpdate::from_payload(&envelope.value) {
                    Ok(update) => {
                        debug!("Child '{address}' now wants {:?}", update.patterns);
                        self.router.set_child_interests(&address, &update.patterns);
                        self.children.set_interests(&address, update.patterns);
                        self.propagate_interests();
                    }
                    Err(e) => self.report_malformed(conn.peer(), &e),
                },
                keys::ROUTES => match RouteUpdate::from_payload(&envelope.value) {
                    Ok(update) => self.apply_child_routes(&address, update),
                    Err(e) => self.report_malformed(conn.peer(), &e),
                },
                keys::GOODBYE => break "child said goodbye".to_string(),
                keys::REGISTER | keys::REGISTER_ACK | keys::RESUME => {
                    debug!("Unexpected '{}' from registered child '{address}'", envelope.key);
                    self.emit_drop(&envelope, DropReason::UnexpectedControl);
                }
                _ => self.route(envelope, Origin::Child(address.clone())),
            }
        };
        self.child_lost(&address, generation, &reason).await;
    }

    fn apply_child_routes(&self, child: &NodeAddress, update: RouteUpdate) {
        let mut applied = RouteUpdate::default();
        for d in update.added {
            if d == self.identity.address {
                continue;
            }
            if self.router.add_route(d.clone(), child.clone()) {
                applied.added.push(d);
            }
        }
        for d in update.removed {
            if self.router.route_for(&d).as_ref() == Some(child) && self.router.remove_route(&d) {
                applied.removed.push(d);
            }
        }
        self.children.apply_routes(child, &applied);
        self.propagate_routes(applied);
    }

    /// Mark a child disconnected if `generation` is still its connection.
    async fn child_lost(&self, address: &NodeAddress, generation: u64, reason: &str) {
        let conn = {
            let mut links = self.children.links.write();
            let Some(link) = links.get_mut(address) else {
                return;
            };
            if link.generation != generation || link.info.state != ChildState::Connected {
                return;
            }
            link.info.state = ChildState::Disconnected;
            link.disconnected_at = Some(Instant::now());
            link.conn.take()
        };
        warn!("Child '{address}' disconnected: {reason}");
        self.events.emit(FabricEvent::ChildDisconnected {
            address: address.clone(),
            reason: reason.to_string(),
        });
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// One liveness pass over all children, then eviction of those gone
    /// for longer than the retention period.
    pub(crate) async fn sweep_children(&self) {
        for (address, generation) in self.children.tick() {
            self.child_lost(&address, generation, "heartbeat timeout").await;
        }
        for link in self.children.take_expired(Instant::now()) {
            self.evict_child(link);
        }
    }

    fn evict_child(&self, mut link: ChildLink) {
        let address = link.info.address.clone();
        for envelope in link.buffer.drain() {
            self.emit_drop(&envelope, DropReason::ChildEvicted);
        }
        self.router.remove_child_interests(&address);
        let removed: Vec<NodeAddress> = self
            .router
            .descendants_via(&address)
            .into_iter()
            .filter(|d| self.router.remove_route(d))
            .collect();
        info!(
            "Forgot child '{address}' after {:?} away ({} routes)",
            self.children.retention,
            removed.len()
        );
        self.events.emit(FabricEvent::ChildEvicted { address });
        self.propagate_routes(RouteUpdate {
            added: Vec::new(),
            removed,
        });
        self.propagate_interests();
    }

    /// Close every child connection.
    pub(crate) async fn close_children(&self) {
        let conns: Vec<Arc<Connection>> = {
            let mut links = self.children.links.write();
            links
                .values_mut()
                .filter_map(|link| {
                    link.info.state = ChildState::Disconnected;
                    link.disconnected_at.get_or_insert_with(Instant::now);
                    link.conn.take()
                })
                .collect()
        };
        for conn in conns {
            conn.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
