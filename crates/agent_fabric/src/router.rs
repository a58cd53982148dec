//! Message router — the dispatch table and routing decisions.
//!
//! The router holds three tables behind one read-mostly lock:
//!
//! - local subscriptions: key pattern → ordered set of handler ids
//! - child interests: the patterns each direct child (and its subtree) wants
//! - descendant routes: any node below us → the direct child leading to it
//!
//! [`Router::plan`] turns an incoming envelope into a [`RoutePlan`]. The plan
//! clones the matching handler `Arc`s out of the table, so handlers run
//! without holding the lock and never observe a half-applied update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::FabricError;
use crate::identity::NodeAddress;
use crate::message::{Envelope, Target};

/// A subscription handler. Handlers run on the node's dispatch pool.
pub type Handler = Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// Identifies one subscription; returned by `subscribe`, needed to
/// `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

/// Reserved token matching any key segment suffix.
pub const WILDCARD: &str = "*";

/// A subscription pattern: an exact key, `ns/*` for everything under the
/// `ns/` namespace, or `*` for all traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPattern {
    All,
    Namespace(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, FabricError> {
        if pattern.is_empty() {
            return Err(FabricError::Config("empty key pattern".into()));
        }
        if pattern == WILDCARD {
            return Ok(Self::All);
        }
        if let Some(ns) = pattern.strip_suffix(WILDCARD) {
            if ns.ends_with('/') && !ns.contains(WILDCARD) {
                return Ok(Self::Namespace(ns.to_string()));
            }
        } else if !pattern.contains(WILDCARD) {
            return Ok(Self::Exact(pattern.to_string()));
        }
        Err(FabricError::Config(format!(
            "invalid key pattern '{pattern}': '*' is only allowed as the whole pattern or after a trailing '/'"
        )))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Namespace(ns) => key.len() > ns.len() && key.starts_with(ns.as_str()),
            Self::Exact(exact) => key == exact,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Namespace(ns) => write!(f, "{ns}{WILDCARD}"),
            Self::Exact(exact) => f.write_str(exact),
        }
    }
}

/// Which link an envelope arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Produced by a collaborator on this node.
    Local,
    /// Received from the parent.
    Parent,
    /// Received from the given direct child.
    Child(NodeAddress),
}

/// Facts about the node that the routing decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub self_addr: &'a NodeAddress,
    pub has_parent: bool,
    /// A stream receiver is waiting for this envelope's key.
    pub stream_interest: bool,
}

/// What to do with one envelope.
#[derive(Default)]
pub struct RoutePlan {
    /// Hand the envelope to local consumers (handlers and stream receivers).
    pub deliver_local: bool,
    /// Matching local handlers, in subscription order.
    pub handlers: Vec<Handler>,
    /// Direct children to forward to, each at most once.
    pub children: Vec<NodeAddress>,
    /// Forward to the parent.
    pub to_parent: bool,
    /// The envelope's journey ends here; acknowledge it if asked to.
    pub terminal: bool,
    /// Addressed to a node nobody knows how to reach.
    pub unroutable: bool,
}

impl fmt::Debug for RoutePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePlan")
            .field("deliver_local", &self.deliver_local)
            .field("handlers", &self.handlers.len())
            .field("children", &self.children)
            .field("to_parent", &self.to_parent)
            .field("terminal", &self.terminal)
            .field("unroutable", &self.unroutable)
            .finish()
    }
}

#[derive(Default)]
struct DispatchTable {
    subscriptions: BTreeMap<KeyPattern, BTreeMap<HandlerId, Handler>>,
    child_interests: HashMap<NodeAddress, BTreeSet<KeyPattern>>,
    routes: HashMap<NodeAddress, NodeAddress>,
}

impl DispatchTable {
    fn handlers_for(&self, key: &str) -> Vec<Handler> {
        self.subscriptions
            .iter()
            .filter(|(pattern, _)| pattern.matches(key))
            .flat_map(|(_, handlers)| handlers.values().cloned())
            .collect()
    }

    fn interested_children(&self, key: &str, exclude: Option<&NodeAddress>) -> Vec<NodeAddress> {
        let matching: BTreeSet<&NodeAddress> = self
            .child_interests
            .iter()
            .filter(|(child, patterns)| {
                Some(*child) != exclude && patterns.iter().any(|p| p.matches(key))
            })
            .map(|(child, _)| child)
            .collect();
        matching.into_iter().cloned().collect()
    }
}

/// Routes incoming envelopes to local handlers, children and the parent.
pub struct Router {
    table: RwLock<DispatchTable>,
    next_id: AtomicU64,
}

impl Router {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(DispatchTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for a key pattern. Several handlers may share a
    /// pattern; all of them are invoked.
    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<HandlerId, FabricError> {
        let pattern = KeyPattern::parse(pattern)?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Subscribing handler {} to '{pattern}'", id.0);
        self.table
            .write()
            .subscriptions
            .entry(pattern)
            .or_default()
            .insert(id, handler);
        Ok(id)
    }

    /// Remove one handler. Returns whether it was registered under `pattern`.
    pub fn unsubscribe(&self, pattern: &str, id: HandlerId) -> bool {
        let Ok(pattern) = KeyPattern::parse(pattern) else {
            return false;
        };
        let mut table = self.table.write();
        let Some(handlers) = table.subscriptions.get_mut(&pattern) else {
            return false;
        };
        let removed = handlers.remove(&id).is_some();
        if handlers.is_empty() {
            table.subscriptions.remove(&pattern);
        }
        removed
    }

    /// Local handlers matching `key`.
    pub fn handlers_for(&self, key: &str) -> Vec<Handler> {
        self.table.read().handlers_for(key)
    }

    pub fn has_local_match(&self, key: &str) -> bool {
        self.table
            .read()
            .subscriptions
            .keys()
            .any(|pattern| pattern.matches(key))
    }

    /// Return the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.table.read().subscriptions.values().map(BTreeMap::len).sum()
    }

    /// Replace the interest set of a direct child. Invalid patterns are
    /// skipped.
    pub fn set_child_interests(&self, child: &NodeAddress, patterns: &[String]) {
        let parsed: BTreeSet<KeyPattern> = patterns
            .iter()
            .filter_map(|p| match KeyPattern::parse(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring interest from {child}: {e}");
                    None
                }
            })
            .collect();
        self.table.write().child_interests.insert(child.clone(), parsed);
    }

    pub fn remove_child_interests(&self, child: &NodeAddress) {
        self.table.write().child_interests.remove(child);
    }

    /// Direct children interested in `key`, deduplicated, excluding
    /// `exclude`.
    pub fn interested_children(&self, key: &str, exclude: Option<&NodeAddress>) -> Vec<NodeAddress> {
        self.table.read().interested_children(key, exclude)
    }

    /// Everything this node and its subtree subscribe to.
    pub fn aggregate_interests(&self) -> BTreeSet<String> {
        let table = self.table.read();
        table
            .subscriptions
            .keys()
            .chain(table.child_interests.values().flatten())
            .map(ToString::to_string)
            .collect()
    }

    /// Record that `descendant` is reached through direct child `via`.
    /// Returns `false` if the route was already known.
    pub fn add_route(&self, descendant: NodeAddress, via: NodeAddress) -> bool {
        let mut table = self.table.write();
        let previous = table.routes.insert(descendant, via.clone());
        previous.as_ref() != Some(&via)
    }

    /// Forget one descendant.
    pub fn remove_route(&self, descendant: &NodeAddress) -> bool {
        self.table.write().routes.remove(descendant).is_some()
    }

    /// The direct child leading to `address`.
    pub fn route_for(&self, address: &NodeAddress) -> Option<NodeAddress> {
        self.table.read().routes.get(address).cloned()
    }

    /// Descendants reached through `via` (including `via` itself if known).
    pub fn descendants_via(&self, via: &NodeAddress) -> Vec<NodeAddress> {
        let table = self.table.read();
        let mut found: Vec<NodeAddress> = table
            .routes
            .iter()
            .filter(|(_, v)| *v == via)
            .map(|(d, _)| d.clone())
            .collect();
        found.sort();
        found
    }

    /// Every node known below this one.
    pub fn known_descendants(&self) -> Vec<NodeAddress> {
        let mut all: Vec<NodeAddress> = self.table.read().routes.keys().cloned().collect();
        all.sort();
        all
    }

    /// Decide where an envelope goes next.
    pub fn plan(&self, envelope: &Envelope, origin: &Origin, ctx: PlanContext<'_>) -> RoutePlan {
        let table = self.table.read();
        let mut plan = RoutePlan::default();
        let from_parent = matches!(origin, Origin::Parent);
        let from_child = match origin {
            Origin::Child(child) => Some(child),
            _ => None,
        };

        match &envelope.target {
            Some(Target::Node(address)) if address == ctx.self_addr => {
                plan.deliver_local = true;
                plan.handlers = table.handlers_for(&envelope.key);
                plan.terminal = true;
            }
            Some(Target::Node(address)) => {
                match table.routes.get(address) {
                    Some(via) if Some(via) != from_child => plan.children.push(via.clone()),
                    Some(_) => plan.unroutable = true,
                    None if !from_parent && ctx.has_parent => plan.to_parent = true,
                    None => plan.unroutable = true,
                }
            }
            Some(Target::Topic(topic)) => {
                if *origin != Origin::Local {
                    plan.handlers = table.handlers_for(topic);
                    plan.deliver_local = !plan.handlers.is_empty() || ctx.stream_interest;
                    plan.terminal = true;
                }
                plan.children = table.interested_children(topic, from_child);
                plan.to_parent = !from_parent && ctx.has_parent;
            }
            None => match origin {
                Origin::Local if ctx.has_parent => plan.to_parent = true,
                Origin::Local | Origin::Parent => {
                    plan.deliver_local = true;
                    plan.handlers = table.handlers_for(&envelope.key);
                    plan.terminal = true;
                }
                Origin::Child(_) => {
                    let handlers = table.handlers_for(&envelope.key);
                    if !handlers.is_empty() || ctx.stream_interest {
                        plan.deliver_local = true;
                        plan.handlers = handlers;
                        plan.terminal = true;
                    } else if !envelope.flags.ephemeral && ctx.has_parent {
                        plan.to_parent = true;
                    } else {
                        plan.terminal = true;
                    }
                }
            },
        }
        plan
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
