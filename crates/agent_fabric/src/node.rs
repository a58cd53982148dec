//! FabricNode — the addressable node and the fabric's public API.
//!
//! [`FabricNode`] is what collaborators hold. It manages:
//! - the child listener and the downward registration handshake
//! - the parent link (see `upstream`)
//! - routing of every envelope through the [`Router`]
//! - acknowledged sends with retransmission
//! - stream sessions on both ends
//!
//! The same type serves every tier. A worker has a parent link and child
//! links at the same time; the coordinator just never registers.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ack::AckTable;
use crate::codec::EnvelopeCodec;
use crate::config::FabricConfig;
use crate::dispatch::HandlerPool;
use crate::downstream::{ChildHandle, ChildInfo, ChildRegistry};
use crate::error::{FabricError, Result};
use crate::events::{DropReason, EventBus, FabricEvent};
use crate::identity::{NodeAddress, NodeIdentity, Role};
use crate::link::LinkState;
use crate::message::{Envelope, MessageId, Target, is_control_key, keys};
use crate::protocol;
use crate::router::{HandlerId, Origin, PlanContext, Router, handler_fn};
use crate::stream::{StreamHandle, StreamManager, StreamReceiver};
use crate::transport::{Connection, HandleCounter, Listener};
use crate::upstream::{RegistrationResult, Upstream};
use crate::value::Payload;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-send options for [`FabricNode::send_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// `None` sends up to the parent.
    pub target: Option<Target>,
    /// Wait for an acknowledgement, retransmitting on timeout.
    pub require_ack: bool,
    /// Best-effort: may be shed under load and is not forwarded upward by
    /// nodes without a matching subscriber. Ignored with `require_ack`.
    pub ephemeral: bool,
}

impl SendOptions {
    pub fn to(target: Target) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    pub fn acked(mut self) -> Self {
        self.require_ack = true;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

/// Shared state behind every [`FabricNode`] clone.
pub(crate) struct NodeInner {
    pub(crate) identity: NodeIdentity,
    pub(crate) config: FabricConfig,
    pub(crate) codec: EnvelopeCodec,
    pub(crate) router: Router,
    pub(crate) handles: HandleCounter,
    pub(crate) events: EventBus,
    pub(crate) acks: AckTable,
    pub(crate) streams: StreamManager,
    pub(crate) pool: HandlerPool,
    pub(crate) upstream: Upstream,
    pub(crate) children: ChildRegistry,
    next_id: AtomicU64,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl NodeInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn a background task owned by the node. Tasks are aborted on
    /// close; once closed, nothing new is spawned.
    pub(crate) fn spawn_task<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(fut));
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn next_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// A fresh envelope from this node.
    pub(crate) fn envelope(&self, target: Option<Target>, key: &str, value: Payload) -> Envelope {
        Envelope::new(self.next_id(), self.identity.address.clone(), target, key, value)
    }

    /// Encode and enqueue directly on a connection, bypassing routing.
    pub(crate) fn write(&self, conn: &Connection, envelope: &Envelope) -> Result<()> {
        let bytes = self.codec.encode(envelope)?;
        conn.send(bytes)
    }

    /// Enqueue an encoded envelope on a live connection. Ephemeral ones are
    /// shed rather than queued behind a backed-up socket; that still counts
    /// as handled.
    pub(crate) fn transmit(&self, conn: &Connection, envelope: &Envelope, bytes: Vec<u8>) -> Result<()> {
        if !envelope.flags.ephemeral || envelope.is_critical() {
            return conn.send(bytes);
        }
        if !conn.send_droppable(bytes, self.config.send_queue_limit)? {
            debug!("Send queue to {} backed up, shedding '{}' ({})", conn.peer(), envelope.key, envelope.id);
            self.emit_drop(envelope, DropReason::SendBacklog);
        }
        Ok(())
    }

    pub(crate) fn report_malformed(&self, peer: &str, error: &FabricError) {
        warn!("Malformed envelope from {peer}: {error}");
        self.events.emit(FabricEvent::MalformedEnvelope {
            peer: peer.to_string(),
            error: error.to_string(),
        });
    }

    pub(crate) fn report_unencodable(&self, envelope: &Envelope, error: &FabricError) {
        warn!("Dropping '{}' ({}): {error}", envelope.key, envelope.id);
        self.emit_drop(envelope, DropReason::Unencodable);
    }

    pub(crate) fn emit_drop(&self, envelope: &Envelope, reason: DropReason) {
        self.events.emit(FabricEvent::EnvelopeDropped {
            id: envelope.id,
            sender: envelope.sender.clone(),
            key: envelope.key.clone(),
            reason,
        });
    }

    /// Entry point for envelopes produced on this node.
    pub(crate) fn submit_local(&self, mut envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(FabricError::Closed);
        }
        if !self.is_running() {
            return Err(FabricError::NotRunning);
        }
        self.codec.apply_compression_policy(&mut envelope);
        self.codec.check(&envelope)?;
        self.route(envelope, Origin::Local);
        Ok(())
    }

    /// Drop any copy of one of our own messages still waiting in a link
    /// buffer.
    fn forget_buffered(&self, id: MessageId) {
        let sender = &self.identity.address;
        if self.upstream.forget(sender, id) | self.children.forget(sender, id) {
            debug!("Discarded buffered copy of {id}");
        }
    }

    /// Deliver, acknowledge and forward one envelope according to its plan.
    pub(crate) fn route(&self, mut envelope: Envelope, origin: Origin) {
        if envelope.is_control() && envelope.key != keys::ACK {
            debug!("Control envelope '{}' can not be routed", envelope.key);
            self.emit_drop(&envelope, DropReason::UnexpectedControl);
            return;
        }

        let stream_interest = envelope.flags.stream_chunk && self.streams.has_receiver(&envelope.key);
        let plan = self.router.plan(
            &envelope,
            &origin,
            PlanContext {
                self_addr: &self.identity.address,
                has_parent: self.upstream.has_parent(),
                stream_interest,
            },
        );

        if plan.unroutable {
            warn!(
                "No route for '{}' ({}) from {} to {:?}",
                envelope.key, envelope.id, envelope.sender, envelope.target
            );
            self.emit_drop(&envelope, DropReason::Unroutable);
            return;
        }

        if plan.terminal && envelope.key == keys::ACK {
            match protocol::acked_id(&envelope.value) {
                Ok(id) => {
                    if !self.acks.resolve(id) {
                        debug!("Late or unknown ack for {id} from {}", envelope.sender);
                    }
                }
                Err(e) => self.report_malformed(envelope.sender.as_str(), &e),
            }
            return;
        }

        if plan.terminal && envelope.flags.requires_ack {
            let duplicate = match &origin {
                Origin::Local => {
                    self.acks.resolve(envelope.id);
                    false
                }
                Origin::Parent => self.upstream.check_duplicate(&envelope),
                Origin::Child(child) => {
                    self.children
                        .check_duplicate(child, &envelope.sender, envelope.id)
                }
            };
            if origin != Origin::Local {
                let ack = protocol::ack_for(self.next_id(), &self.identity.address, &envelope);
                self.route(ack, Origin::Local);
            }
            if duplicate {
                debug!(
                    "Duplicate '{}' ({}) from {}, acknowledged again",
                    envelope.key, envelope.id, envelope.sender
                );
                self.emit_drop(&envelope, DropReason::Duplicate);
                return;
            }
        }

        let forwarded = !plan.children.is_empty() || plan.to_parent;
        let mut consumed = false;
        if plan.deliver_local {
            if envelope.flags.stream_chunk {
                consumed |= self.streams.deliver(&envelope);
            }
            if !plan.handlers.is_empty() {
                self.pool.submit(&envelope, plan.handlers);
                consumed = true;
            }
        }
        if !consumed && !forwarded {
            debug!("No subscriber for '{}' from {}", envelope.key, envelope.sender);
            self.emit_drop(&envelope, DropReason::Unhandled);
            return;
        }

        if plan.terminal {
            // Acknowledged here. Copies travel on best-effort.
            envelope.flags.requires_ack = false;
        }
        for child in &plan.children {
            self.send_downstream(child, envelope.clone());
        }
        if plan.to_parent {
            self.send_upstream(envelope);
        }
    }

    /// Submit `envelope` and wait for its acknowledgement, retransmitting
    /// the same id after every `ack_timeout`.
    async fn send_acked(&self, mut envelope: Envelope) -> Result<MessageId> {
        let id = envelope.id;
        let attempts = self.config.max_retries + 1;
        // Something that can never be encoded fails now, not after every
        // retry has timed out.
        self.codec.apply_compression_policy(&mut envelope);
        self.codec.encode(&envelope)?;
        let mut waiter = self.acks.register(id)?;

        for attempt in 1..=attempts {
            if let Err(e) = self.submit_local(envelope.clone()) {
                self.acks.cancel(id);
                return Err(match e {
                    FabricError::Closed => FabricError::DeliveryFailed {
                        id,
                        attempts: attempt,
                        reason: "node closed".into(),
                    },
                    other => other,
                });
            }
            match tokio::time::timeout(self.config.ack_timeout, &mut waiter).await {
                Ok(Ok(())) => {
                    debug!("'{}' ({id}) acknowledged on attempt {attempt}", envelope.key);
                    self.forget_buffered(id);
                    return Ok(id);
                }
                Ok(Err(_)) => {
                    return Err(FabricError::DeliveryFailed {
                        id,
                        attempts: attempt,
                        reason: "node closed".into(),
                    });
                }
                Err(_) => {
                    debug!("No ack for {id} (attempt {attempt}/{attempts})");
                    self.events.emit(FabricEvent::AckTimeout { id, attempt });
                }
            }
        }

        self.acks.cancel(id);
        self.forget_buffered(id);
        warn!("Giving up on '{}' ({id}) after {attempts} attempts", envelope.key);
        self.events.emit(FabricEvent::DeliveryFailed { id, attempts });
        Err(FabricError::DeliveryFailed {
            id,
            attempts,
            reason: format!("no acknowledgement within {:?}", self.config.ack_timeout),
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let mut shutdown = self.shutdown_signal();
        loop {
            let incoming = tokio::select! {
                incoming = listener.accept() => incoming,
                _ = shutdown.changed() => break,
            };
            match incoming {
                Ok(incoming) => {
                    let inner = Arc::clone(&self);
                    self.spawn_task(async move {
                        let peer = incoming.peer_addr();
                        match incoming.upgrade(&inner.handles).await {
                            Ok(conn) => {
                                if let Err(e) = inner.accept_child(conn).await {
                                    warn!("Child handshake from {peer} failed: {e}");
                                }
                            }
                            Err(e) => debug!("WebSocket upgrade from {peer} failed: {e}"),
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!("Child listener stopped");
    }

    /// Child liveness and stream inactivity, once per heartbeat interval.
    async fn maintain(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.sweep_children().await;
            let ended = self.streams.sweep_idle(Instant::now());
            if ended > 0 {
                debug!("Ended {ended} idle stream receivers");
            }
        }
    }
}

/// A node in the agent tree. Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct FabricNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for FabricNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricNode")
            .field("address", &self.inner.identity.address)
            .field("role", &self.inner.identity.role)
            .field("running", &self.inner.is_running())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl FabricNode {
    /// Create a node. Nothing touches the network until [`start`](Self::start).
    pub fn new(config: FabricConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let (shutdown, _) = watch::channel(false);
        let inner = NodeInner {
            identity: NodeIdentity::new(config.address.as_str(), config.role),
            codec: EnvelopeCodec::new(config.compression_threshold, config.max_frame_size),
            router: Router::new(),
            handles: HandleCounter::new(),
            acks: AckTable::new(),
            streams: StreamManager::new(
                config.stream_idle_timeout,
                config.stream_receiver_capacity,
                events.clone(),
            ),
            pool: HandlerPool::new(config.handler_workers, config.handler_queue_limit, events.clone()),
            upstream: Upstream::new(&config),
            children: ChildRegistry::new(&config),
            events,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            listen_addr: Mutex::new(None),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<NodeInner> {
        &self.inner
    }

    pub fn address(&self) -> &NodeAddress {
        &self.inner.identity.address
    }

    pub fn role(&self) -> Role {
        self.inner.identity.role
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Start the node: bind the child listener if one is configured, start
    /// the maintenance loop, and register with `parent_addr` if set.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(FabricError::Closed);
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(addr) = inner.config.listen_addr {
            let listener = match Listener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    inner.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            let local = listener.local_addr()?;
            *inner.listen_addr.lock() = Some(local);
            info!("'{}' accepting children on {local}", inner.identity.address);
            let accept = Arc::clone(inner);
            inner.spawn_task(async move { accept.accept_loop(listener).await });
        }

        inner.pool.start();
        let maintenance = Arc::clone(inner);
        inner.spawn_task(async move { maintenance.maintain().await });
        info!(
            "Node '{}' started as {}",
            inner.identity.address, inner.identity.role
        );

        if let Some(parent) = inner.config.parent_addr.clone() {
            inner.register(&parent, inner.config.role).await?;
        }
        Ok(())
    }

    /// The bound child listener address, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    /// Register with a parent at transport address `parent_addr`.
    pub async fn register(&self, parent_addr: &str, role: Role) -> Result<RegistrationResult> {
        self.inner.register(parent_addr, role).await
    }

    /// State of the parent link.
    pub fn link_state(&self) -> LinkState {
        self.inner.link_state()
    }

    /// Address of the parent we are registered with.
    pub fn parent(&self) -> Option<NodeAddress> {
        self.inner.upstream.parent()
    }

    /// Envelopes waiting for the parent link to come back.
    pub fn upstream_buffered(&self) -> usize {
        self.inner.upstream.buffered()
    }

    /// Send `value` under `key`. `None` sends up to the parent.
    pub async fn send(
        &self,
        key: &str,
        value: Payload,
        target: Option<Target>,
        require_ack: bool,
    ) -> Result<MessageId> {
        let options = SendOptions {
            target,
            require_ack,
            ephemeral: false,
        };
        self.send_with(key, value, options).await
    }

    pub async fn send_with(&self, key: &str, value: Payload, options: SendOptions) -> Result<MessageId> {
        if key.is_empty() {
            return Err(FabricError::SendFailed("empty key".into()));
        }
        if is_control_key(key) {
            return Err(FabricError::SendFailed(format!("key '{key}' is reserved")));
        }

        let mut envelope = self.inner.envelope(options.target, key, value);
        envelope.flags.requires_ack = options.require_ack;
        envelope.flags.ephemeral = options.ephemeral && !options.require_ack;
        let id = envelope.id;
        if options.require_ack {
            return self.inner.send_acked(envelope).await;
        }
        self.inner.submit_local(envelope)?;
        Ok(id)
    }

    /// Publish to every subscriber of `topic` anywhere in the tree.
    pub async fn publish(&self, topic: &str, value: Payload) -> Result<MessageId> {
        self.send_with(topic, value, SendOptions::to(Target::topic(topic)))
            .await
    }

    /// Subscribe to a key pattern: an exact key, `ns/*` or `*`.
    pub fn subscribe<F, Fut>(&self, pattern: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.router.subscribe(pattern, handler_fn(handler))?;
        self.inner.propagate_interests();
        Ok(id)
    }

    pub fn unsubscribe(&self, pattern: &str, id: HandlerId) -> bool {
        let removed = self.inner.router.unsubscribe(pattern, id);
        if removed {
            self.inner.propagate_interests();
        }
        removed
    }

    /// Run the downward handshake on an already established connection.
    pub async fn add_child(&self, conn: Connection) -> Result<ChildHandle> {
        if self.inner.is_closed() {
            return Err(FabricError::Closed);
        }
        if !self.inner.is_running() {
            return Err(FabricError::NotRunning);
        }
        let address = self.inner.accept_child(conn).await?;
        Ok(ChildHandle::new(address, self.clone()))
    }

    /// Snapshots of every registered child, sorted by address.
    pub fn children(&self) -> Vec<ChildInfo> {
        self.inner.children.list_all()
    }

    pub fn connected_children(&self) -> usize {
        self.inner.children.connected_count()
    }

    pub fn child(&self, address: &NodeAddress) -> Option<ChildHandle> {
        self.inner
            .children
            .get(address)
            .map(|info| ChildHandle::new(info.address, self.clone()))
    }

    /// Open the sending end of a stream session.
    pub fn open_stream(&self, key: &str, target: Option<Target>) -> Result<StreamHandle> {
        if self.inner.is_closed() {
            return Err(FabricError::Closed);
        }
        if !self.inner.is_running() {
            return Err(FabricError::NotRunning);
        }
        if key.is_empty() || is_control_key(key) {
            return Err(FabricError::SendFailed(format!("invalid stream key '{key}'")));
        }
        Ok(StreamHandle::new(Arc::clone(&self.inner), key.to_string(), target))
    }

    /// Attach the receiving end for `key`.
    pub fn get_stream(&self, key: &str) -> Result<StreamReceiver> {
        if self.inner.is_closed() {
            return Err(FabricError::Closed);
        }
        Ok(self.inner.streams.open_receiver(key))
    }

    pub fn events(&self) -> broadcast::Receiver<FabricEvent> {
        self.inner.events.subscribe()
    }

    /// Transport connections currently open on this node.
    pub fn open_transport_handles(&self) -> usize {
        self.inner.handles.open()
    }

    /// The counter to pass to [`transport::connect`](crate::transport::connect)
    /// for connections later handed to [`add_child`](Self::add_child).
    pub fn handle_counter(&self) -> &HandleCounter {
        &self.inner.handles
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending()
    }

    /// Shut the node down. Pending acknowledged sends fail with
    /// `DeliveryFailed`, stream receivers end, every connection is closed.
    /// Calling it again does nothing.
    pub async fn close(&self) {
        let inner = &self.inner;
        {
            let _tasks = inner.tasks.lock();
            if inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        info!("Closing node '{}'", inner.identity.address);
        let _ = inner.shutdown.send(true);

        let cancelled = inner.acks.close();
        if cancelled > 0 {
            debug!("Cancelled {cancelled} pending acknowledgements");
        }
        inner.streams.close_all();
        inner.close_upstream().await;
        inner.close_children().await;

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        inner.pool.shutdown().await;
        inner.running.store(false, Ordering::SeqCst);
        info!(
            "Node '{}' closed, {} transport handles open",
            inner.identity.address,
            inner.handles.open()
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
