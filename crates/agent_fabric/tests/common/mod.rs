#![allow(dead_code)]

use std::time::Duration;

use agent_fabric::{BackoffConfig, FabricConfig, FabricNode, Role};

/// Tight timings so liveness and retry paths finish quickly.
pub fn fast_config(address: &str, role: Role) -> FabricConfig {
    let mut config = FabricConfig::new(address, role);
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_miss_limit = 3;
    config.heartbeat_grace = 2;
    config.registration_timeout = Duration::from_secs(2);
    config.ack_timeout = Duration::from_millis(300);
    config.max_retries = 2;
    config.backoff = BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: 3,
    };
    config
}

/// Start a node listening on an ephemeral port. Returns it with the
/// address children connect to.
pub async fn start_listening(config: FabricConfig) -> (FabricNode, String) {
    let node = FabricNode::new(config.with_listen_addr("127.0.0.1:0".parse().unwrap())).unwrap();
    node.start().await.unwrap();
    let addr = node.listen_addr().unwrap().to_string();
    (node, addr)
}

pub async fn start_coordinator() -> (FabricNode, String) {
    start_listening(fast_config("coordinator", Role::Coordinator)).await
}

/// Start a leaf node registered under `parent`.
pub async fn start_leaf(address: &str, role: Role, parent: &str) -> FabricNode {
    let node = FabricNode::new(fast_config(address, role).with_parent(parent)).unwrap();
    node.start().await.unwrap();
    node
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
