//! Control payloads exchanged on a link: registration, session resume,
//! interest and route propagation, acknowledgements.
//!
//! Every control message is an ordinary [`Envelope`] under a reserved
//! `_fabric/` key, so the codec and transport need no special cases.

use crate::error::{FabricError, Result};
use crate::identity::{NodeAddress, Role};
use crate::message::{Envelope, MessageId, Target, keys};
use crate::value::{Payload, Value};

fn missing(key: &str, field: &str) -> FabricError {
    FabricError::MalformedEnvelope(format!("{key}: missing or invalid field '{field}'"))
}

fn text_list<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Value::List(items.into_iter().map(|s| Value::from(s.as_ref())).collect())
}

fn address_list(payload: &Payload, key: &str, field: &str) -> Result<Vec<NodeAddress>> {
    let list = payload
        .get_str_list(field)
        .ok_or_else(|| missing(key, field))?;
    Ok(list.into_iter().map(NodeAddress::from).collect())
}

/// First message a child sends on a fresh connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub address: NodeAddress,
    pub role: Role,
    pub protocol_version: u32,
    pub session: String,
    /// Patterns this node and its subtree subscribe to.
    pub interests: Vec<String>,
    /// Nodes reachable below the registering node.
    pub descendants: Vec<NodeAddress>,
}

impl Registration {
    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("address", self.address.as_str())
            .with("role", self.role.as_str())
            .with("protocol_version", i64::from(self.protocol_version))
            .with("session", self.session.as_str())
            .with("interests", text_list(&self.interests))
            .with("descendants", text_list(self.descendants.iter().map(NodeAddress::as_str)))
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let key = keys::REGISTER;
        let address = payload
            .get_str("address")
            .filter(|a| !a.is_empty())
            .ok_or_else(|| missing(key, "address"))?;
        let role = payload
            .get_str("role")
            .and_then(|r| r.parse::<Role>().ok())
            .ok_or_else(|| missing(key, "role"))?;
        let protocol_version = payload
            .get_i64("protocol_version")
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| missing(key, "protocol_version"))?;
        let session = payload
            .get_str("session")
            .ok_or_else(|| missing(key, "session"))?;
        Ok(Self {
            address: NodeAddress::new(address),
            role,
            protocol_version,
            session: session.to_string(),
            interests: payload.get_str_list("interests").unwrap_or_default(),
            descendants: address_list(payload, key, "descendants").unwrap_or_default(),
        })
    }
}

/// The parent's answer to a registration or resume attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationReply {
    pub accepted: bool,
    pub reason: Option<String>,
    /// Address of the answering parent.
    pub parent: NodeAddress,
}

impl RegistrationReply {
    pub fn accept(parent: &NodeAddress) -> Self {
        Self {
            accepted: true,
            reason: None,
            parent: parent.clone(),
        }
    }

    pub fn reject(parent: &NodeAddress, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            parent: parent.clone(),
        }
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new()
            .with("accepted", self.accepted)
            .with("parent", self.parent.as_str());
        if let Some(reason) = &self.reason {
            payload.insert("reason", reason.as_str());
        }
        payload
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let key = keys::REGISTER_ACK;
        Ok(Self {
            accepted: payload
                .get_bool("accepted")
                .ok_or_else(|| missing(key, "accepted"))?,
            reason: payload.get_str("reason").map(str::to_string),
            parent: NodeAddress::new(
                payload
                    .get_str("parent")
                    .ok_or_else(|| missing(key, "parent"))?,
            ),
        })
    }
}

/// A reconnecting child asking to pick up its old session.
#[derive(Debug, Clone, PartialEq)]
pub struct Resume {
    pub address: NodeAddress,
    pub session: String,
}

impl Resume {
    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("address", self.address.as_str())
            .with("session", self.session.as_str())
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let key = keys::RESUME;
        Ok(Self {
            address: NodeAddress::new(
                payload
                    .get_str("address")
                    .ok_or_else(|| missing(key, "address"))?,
            ),
            session: payload
                .get_str("session")
                .ok_or_else(|| missing(key, "session"))?
                .to_string(),
        })
    }
}

/// Full replacement of a child's interest set.
#[derive(Debug, Clone, PartialEq)]
pub struct InterestUpdate {
    pub patterns: Vec<String>,
}

impl InterestUpdate {
    pub fn to_payload(&self) -> Payload {
        Payload::new().with("patterns", text_list(&self.patterns))
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(Self {
            patterns: payload
                .get_str_list("patterns")
                .ok_or_else(|| missing(keys::INTEREST, "patterns"))?,
        })
    }
}

/// Descendants gained or lost below the sending node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteUpdate {
    pub added: Vec<NodeAddress>,
    pub removed: Vec<NodeAddress>,
}

impl RouteUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("added", text_list(self.added.iter().map(NodeAddress::as_str)))
            .with("removed", text_list(self.removed.iter().map(NodeAddress::as_str)))
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(Self {
            added: address_list(payload, keys::ROUTES, "added")?,
            removed: address_list(payload, keys::ROUTES, "removed")?,
        })
    }
}

/// Body of an acknowledgement: the id being acknowledged.
pub fn ack_payload(id: MessageId) -> Payload {
    // Ids are sender-scoped counters and stay far below i64::MAX.
    Payload::new().with("id", id.0 as i64)
}

pub fn acked_id(payload: &Payload) -> Result<MessageId> {
    payload
        .get_i64("id")
        .and_then(|id| u64::try_from(id).ok())
        .map(MessageId)
        .ok_or_else(|| missing(keys::ACK, "id"))
}

/// Build an acknowledgement for `envelope`, addressed back to its sender.
pub fn ack_for(id: MessageId, from: &NodeAddress, envelope: &Envelope) -> Envelope {
    Envelope::new(
        id,
        from.clone(),
        Some(Target::Node(envelope.sender.clone())),
        keys::ACK,
        ack_payload(envelope.id),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PROTOCOL_VERSION;

    #[test]
    fn test_registration_payload() {
        let reg = Registration {
            address: NodeAddress::new("worker-a"),
            role: Role::Worker,
            protocol_version: PROTOCOL_VERSION,
            session: "b7c1".into(),
            interests: vec!["frames/*".into(), "status".into()],
            descendants: vec![NodeAddress::new("sub-1")],
        };
        assert_eq!(Registration::from_payload(&reg.to_payload()).unwrap(), reg);
    }

    #[test]
    fn test_registration_requires_identity_fields() {
        let payload = Payload::new().with("address", "worker-a").with("role", "worker");
        assert!(matches!(
            Registration::from_payload(&payload),
            Err(FabricError::MalformedEnvelope(_))
        ));

        let payload = Payload::new()
            .with("address", "worker-a")
            .with("role", "pilot")
            .with("protocol_version", 1i64)
            .with("session", "x");
        assert!(Registration::from_payload(&payload).is_err());
    }

    #[test]
    fn test_registration_defaults_empty_lists() {
        let payload = Payload::new()
            .with("address", "worker-a")
            .with("role", "worker")
            .with("protocol_version", 1i64)
            .with("session", "x");
        let reg = Registration::from_payload(&payload).unwrap();
        assert!(reg.interests.is_empty());
        assert!(reg.descendants.is_empty());
    }

    #[test]
    fn test_reply_payload() {
        let parent = NodeAddress::new("coordinator");
        let reply = RegistrationReply::reject(&parent, "address in use");
        let back = RegistrationReply::from_payload(&reply.to_payload()).unwrap();
        assert!(!back.accepted);
        assert_eq!(back.reason.as_deref(), Some("address in use"));
        assert_eq!(back.parent, parent);

        let ok = RegistrationReply::accept(&parent);
        assert!(RegistrationReply::from_payload(&ok.to_payload()).unwrap().accepted);
    }

    #[test]
    fn test_route_update_payload() {
        let update = RouteUpdate {
            added: vec![NodeAddress::new("sub-1"), NodeAddress::new("sub-2")],
            removed: vec![],
        };
        assert_eq!(RouteUpdate::from_payload(&update.to_payload()).unwrap(), update);
        assert!(RouteUpdate::default().is_empty());
    }

    #[test]
    fn test_ack_for_targets_sender() {
        let original = Envelope::new(
            MessageId(41),
            NodeAddress::new("worker-a"),
            None,
            "status",
            Payload::new(),
        );
        let ack = ack_for(MessageId(3), &NodeAddress::new("coordinator"), &original);
        assert_eq!(ack.key, keys::ACK);
        assert_eq!(ack.target, Some(Target::node("worker-a")));
        assert_eq!(acked_id(&ack.value).unwrap(), MessageId(41));
        assert!(ack.is_critical());
    }
}
