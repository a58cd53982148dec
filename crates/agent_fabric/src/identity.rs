//! Node identity — logical addresses, roles and per-process sessions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version of the registration/heartbeat protocol spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// The stable logical address of a node (e.g. `"rig-3/camera"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(pub String);

impl NodeAddress {
    /// Create an address from an existing string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The tier a node occupies in the hierarchy.
///
/// Every tier runs the same [`FabricNode`](crate::FabricNode); the role is
/// advertised during registration and otherwise only informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Worker,
    SubWorker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
            Self::SubWorker => "sub_worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            "sub_worker" => Ok(Self::SubWorker),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The full identity of a node within the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Logical address, unique among the children of one parent.
    pub address: NodeAddress,
    /// Advertised role.
    pub role: Role,
    /// Random id generated once per process. A parent uses it to tell a
    /// reconnecting child apart from a second node claiming the same address.
    pub session: String,
    /// Protocol version spoken by this node.
    pub protocol_version: u32,
}

impl NodeIdentity {
    /// Create an identity with a fresh session id.
    pub fn new(address: impl Into<NodeAddress>, role: Role) -> Self {
        Self {
            address: address.into(),
            role,
            session: uuid::Uuid::new_v4().to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
