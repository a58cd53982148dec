//! Agent Fabric — messaging between a tree of cooperating agents.
//!
//! One coordinator, any number of workers below it, each worker optionally
//! delegating to sub-workers. Every agent runs a [`FabricNode`]; the same
//! type serves every tier.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket (via `tokio-tungstenite`) binary frames, one
//!   connection per parent/child edge.
//! - **Codec**: self-describing JSON envelopes; blobs are base64 and LZ4
//!   compressed above a size threshold.
//! - **Links**: registration handshake, heartbeats, reconnect with session
//!   resume, bounded buffering while a link is down.
//! - **Routing**: key-pattern subscriptions, topic fan-out along propagated
//!   child interests, node addressing along propagated descendant routes.
//! - **Streams**: sequenced best-effort chunks with gap detection.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use agent_fabric::{FabricConfig, FabricNode, Payload, Role};
//!
//! # async fn example() -> agent_fabric::Result<()> {
//! let coordinator = FabricNode::new(
//!     FabricConfig::new("coordinator", Role::Coordinator)
//!         .with_listen_addr("127.0.0.1:7400".parse().unwrap()),
//! )?;
//! coordinator.subscribe("status", |env| async move {
//!     println!("{} is {:?}", env.sender, env.value.get_str("state"));
//! })?;
//! coordinator.start().await?;
//!
//! let worker = FabricNode::new(
//!     FabricConfig::new("worker-a", Role::Worker).with_parent("127.0.0.1:7400"),
//! )?;
//! worker.start().await?;
//! worker
//!     .send("status", Payload::new().with("state", "ready"), None, true)
//!     .await?;
//!
//! worker.close().await;
//! coordinator.close().await;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod downstream;
pub mod error;
pub mod events;
pub mod identity;
pub mod link;
pub mod logging;
pub mod message;
pub mod node;
pub mod protocol;
pub mod router;
pub mod stream;
pub mod transport;
pub mod upstream;
pub mod value;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{BackoffConfig, FabricConfig};
pub use downstream::{ChildHandle, ChildInfo, ChildState};
pub use error::{FabricError, Result};
pub use events::{DropReason, FabricEvent};
pub use identity::{NodeAddress, NodeIdentity, Role};
pub use link::LinkState;
pub use message::{Envelope, Flags, MessageId, Target};
pub use node::{FabricNode, SendOptions};
pub use router::HandlerId;
pub use stream::{EndReason, StreamEvent, StreamHandle, StreamReceiver};
pub use upstream::RegistrationResult;
pub use value::{ArrayValue, DType, Payload, Value};
