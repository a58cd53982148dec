mod common;

use std::time::Duration;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent_fabric::{
    ChildState, DropReason, FabricError, FabricEvent, FabricNode, LinkState, NodeAddress, Payload, Role, Target,
};
use common::{fast_config, start_coordinator, start_leaf, start_listening, wait_until};
use tokio::sync::mpsc;

#[tokio::test]
async fn worker_status_is_acknowledged_by_coordinator() {
    let (coordinator, addr) = start_coordinator().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator
        .subscribe("status", move |env| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((env.sender.clone(), env.value.get_str("state").map(str::to_string)));
            }
        })
        .unwrap();

    let worker = FabricNode::new(fast_config("worker-a", Role::Worker)).unwrap();
    worker.start().await.unwrap();
    let result = worker.register(&addr, Role::Worker).await.unwrap();
    assert_eq!(result.parent, NodeAddress::new("coordinator"));
    assert_eq!(result.session, worker.identity().session);
    assert_eq!(worker.link_state(), LinkState::Registered);

    worker
        .send("status", Payload::new().with("state", "ready"), None, true)
        .await
        .unwrap();

    let (sender, state) = rx.recv().await.unwrap();
    assert_eq!(sender, NodeAddress::new("worker-a"));
    assert_eq!(state.as_deref(), Some("ready"));
    assert_eq!(worker.pending_acks(), 0);

    let children = coordinator.children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].address, NodeAddress::new("worker-a"));
    assert_eq!(children[0].role, Role::Worker);
    assert_eq!(children[0].state, ChildState::Connected);

    worker.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn duplicate_address_is_rejected_without_leaking_connections() {
    let (coordinator, addr) = start_coordinator().await;
    let mut events = coordinator.events();
    let first = start_leaf("worker-a", Role::Worker, &addr).await;

    let second = FabricNode::new(fast_config("worker-a", Role::Worker)).unwrap();
    second.start().await.unwrap();
    let err = second.register(&addr, Role::Worker).await.unwrap_err();
    assert!(matches!(err, FabricError::RegistrationRejected(_)), "{err}");
    assert_eq!(second.link_state(), LinkState::Init);
    assert_eq!(second.open_transport_handles(), 0);

    let rejected = wait_until(Duration::from_secs(2), || {
        while let Ok(event) = events.try_recv() {
            if matches!(event, FabricEvent::ChildRejected { .. }) {
                return true;
            }
        }
        false
    })
    .await;
    assert!(rejected);

    // The original registration is untouched.
    assert_eq!(first.link_state(), LinkState::Registered);
    assert_eq!(coordinator.connected_children(), 1);

    second.close().await;
    first.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn node_cannot_register_under_its_own_address() {
    let (coordinator, addr) = start_coordinator().await;
    let imposter = FabricNode::new(fast_config("coordinator", Role::Worker)).unwrap();
    imposter.start().await.unwrap();
    let err = imposter.register(&addr, Role::Worker).await.unwrap_err();
    assert!(matches!(err, FabricError::RegistrationRejected(_)));
    imposter.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn registration_gives_up_after_backoff_budget() {
    // Bind and drop to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let worker = FabricNode::new(fast_config("worker-a", Role::Worker)).unwrap();
    worker.start().await.unwrap();
    let mut events = worker.events();

    let err = worker
        .register(&format!("127.0.0.1:{port}"), Role::Worker)
        .await
        .unwrap_err();
    match err {
        FabricError::RegistrationFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected {other}"),
    }
    assert_eq!(worker.link_state(), LinkState::Init);
    assert_eq!(worker.open_transport_handles(), 0);

    let mut failed_attempts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FabricEvent::ConnectAttemptFailed { .. }) {
            failed_attempts += 1;
        }
    }
    assert_eq!(failed_attempts, 3);
    worker.close().await;
}

#[tokio::test]
async fn register_requires_a_started_node() {
    let worker = FabricNode::new(fast_config("worker-a", Role::Worker)).unwrap();
    let err = worker.register("127.0.0.1:1", Role::Worker).await.unwrap_err();
    assert!(matches!(err, FabricError::NotRunning));
}

#[tokio::test]
async fn child_goodbye_marks_it_disconnected() {
    let (coordinator, addr) = start_coordinator().await;
    let worker = start_leaf("worker-a", Role::Worker, &addr).await;
    assert_eq!(coordinator.connected_children(), 1);

    worker.close().await;
    assert!(wait_until(Duration::from_secs(2), || coordinator.connected_children() == 0).await);
    let info = coordinator
        .child(&NodeAddress::new("worker-a"))
        .and_then(|child| child.info())
        .unwrap();
    assert_eq!(info.state, ChildState::Disconnected);

    coordinator.close().await;
}

#[tokio::test]
async fn restarted_child_may_take_over_its_address() {
    let (coordinator, addr) = start_coordinator().await;
    let first = start_leaf("worker-a", Role::Worker, &addr).await;
    let old_session = first.identity().session.clone();
    first.close().await;
    assert!(wait_until(Duration::from_secs(2), || coordinator.connected_children() == 0).await);

    let second = start_leaf("worker-a", Role::Worker, &addr).await;
    assert_eq!(second.link_state(), LinkState::Registered);
    let info = coordinator.children().remove(0);
    assert_ne!(info.session, old_session);
    assert_eq!(info.state, ChildState::Connected);

    second.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn new_session_does_not_inherit_old_buffer() {
    let (coordinator, addr) = start_coordinator().await;
    let first = start_leaf("worker-a", Role::Worker, &addr).await;
    first.close().await;
    assert!(wait_until(Duration::from_secs(2), || coordinator.connected_children() == 0).await);

    let mut events = coordinator.events();
    coordinator
        .send("cmd/stop", Payload::new(), Some(Target::node("worker-a")), false)
        .await
        .unwrap();
    assert_eq!(coordinator.children()[0].buffered, 1);

    let second = FabricNode::new(fast_config("worker-a", Role::Worker).with_parent(addr.as_str())).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&seen);
    second
        .subscribe("cmd/*", move |_env| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    second.start().await.unwrap();
    assert_eq!(second.link_state(), LinkState::Registered);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.children()[0].buffered, 0);
    let mut replaced = false;
    while let Ok(event) = events.try_recv() {
        if let FabricEvent::EnvelopeDropped { key, reason, .. } = event {
            replaced |= key == "cmd/stop" && reason == DropReason::SessionReplaced;
        }
    }
    assert!(replaced);

    second.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn departed_child_is_forgotten_after_retention() {
    let mut config = fast_config("coordinator", Role::Coordinator);
    config.child_retention = Duration::from_millis(100);
    let (coordinator, addr) = start_listening(config).await;
    let mut events = coordinator.events();

    let worker = start_leaf("worker-a", Role::Worker, &addr).await;
    worker.close().await;
    assert!(wait_until(Duration::from_secs(2), || coordinator.children().is_empty()).await);

    coordinator
        .send("cmd/stop", Payload::new(), Some(Target::node("worker-a")), false)
        .await
        .unwrap();

    let mut evicted = false;
    let mut unroutable = false;
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        while !(evicted && unroutable) {
            match events.recv().await.unwrap() {
                FabricEvent::ChildEvicted { address } => {
                    evicted |= address == NodeAddress::new("worker-a");
                }
                FabricEvent::EnvelopeDropped { key, reason, .. } if key == "cmd/stop" => {
                    unroutable |= reason == DropReason::Unroutable;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(outcome.is_ok());

    coordinator.close().await;
}
