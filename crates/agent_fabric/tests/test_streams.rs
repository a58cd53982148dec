mod common;

use std::time::Duration;

use agent_fabric::{
    ArrayValue, EndReason, FabricEvent, NodeAddress, Payload, Role, StreamEvent, StreamReceiver, Target,
};
use common::{fast_config, start_coordinator, start_leaf, start_listening, wait_until};

fn frame(n: u8) -> ArrayValue {
    // Large and repetitive enough to cross the compression threshold.
    ArrayValue::frame(120, 160, 3, vec![n; 120 * 160 * 3]).unwrap()
}

async fn next_event(receiver: &mut StreamReceiver) -> Option<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(2), receiver.next())
        .await
        .unwrap()
}

#[tokio::test]
async fn frames_stream_from_worker_to_coordinator() {
    let (coordinator, addr) = start_coordinator().await;
    let mut receiver = coordinator.get_stream("camera/frames").unwrap();
    let worker = start_leaf("worker-a", Role::Worker, &addr).await;

    let stream = worker
        .open_stream("camera/frames", Some(Target::node("coordinator")))
        .unwrap();
    for n in 1..=5u8 {
        let seq = stream.send_chunk(Payload::new().with("frame", frame(n))).unwrap();
        assert_eq!(seq, u64::from(n));
    }
    stream.close().unwrap();

    let mut received = Vec::new();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = receiver.next().await {
            match event {
                StreamEvent::Chunk { source, seq, value, .. } => {
                    assert_eq!(source, NodeAddress::new("worker-a"));
                    let pixels = value.get("frame").and_then(|v| v.as_array()).cloned();
                    received.push((seq, pixels));
                }
                StreamEvent::SourceEnded { source, reason } => return (source, reason),
                StreamEvent::Ended(reason) => panic!("receiver ended early: {reason:?}"),
                StreamEvent::Gap { .. } => panic!("no chunk should go missing on a healthy link"),
            }
        }
        panic!("receiver closed");
    })
    .await
    .unwrap();

    assert_eq!(ended, (NodeAddress::new("worker-a"), EndReason::Source));
    assert_eq!(received.len(), 5);
    for (i, (seq, pixels)) in received.into_iter().enumerate() {
        assert_eq!(seq, i as u64 + 1);
        assert_eq!(pixels, Some(frame(i as u8 + 1)));
    }

    worker.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn receiver_survives_its_source_reconnecting() {
    let (coordinator, addr) = start_coordinator().await;
    let mut receiver = coordinator.get_stream("telemetry/imu").unwrap();

    let first = start_leaf("worker-a", Role::Worker, &addr).await;
    let stream = first
        .open_stream("telemetry/imu", Some(Target::node("coordinator")))
        .unwrap();
    stream.send_chunk(Payload::new().with("ax", 0.5)).unwrap();
    drop(stream);
    first.close().await;

    match receiver.next().await {
        Some(StreamEvent::Chunk { seq, .. }) => assert_eq!(seq, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        receiver.next().await,
        Some(StreamEvent::SourceEnded {
            source: NodeAddress::new("worker-a"),
            reason: EndReason::Source,
        })
    );

    assert!(wait_until(Duration::from_secs(2), || coordinator.connected_children() == 0).await);

    // The same receiver picks up the source's next session.
    let second = start_leaf("worker-a", Role::Worker, &addr).await;
    let stream = second
        .open_stream("telemetry/imu", Some(Target::node("coordinator")))
        .unwrap();
    stream.send_chunk(Payload::new().with("ax", 0.25)).unwrap();
    match receiver.next().await {
        Some(StreamEvent::Chunk { seq, value, .. }) => {
            assert_eq!(seq, 1);
            assert_eq!(value.get_f64("ax"), Some(0.25));
        }
        other => panic!("unexpected {other:?}"),
    }

    drop(stream);
    second.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn idle_stream_receiver_ends() {
    let mut config = fast_config("coordinator", Role::Coordinator);
    config.stream_idle_timeout = Duration::from_millis(150);
    let (coordinator, addr) = start_listening(config).await;

    // Waiting for a source that has not started yet is not idleness.
    let mut receiver = coordinator.get_stream("camera/frames").unwrap();
    let early = tokio::time::timeout(Duration::from_millis(400), receiver.next()).await;
    assert!(early.is_err(), "receiver ended before any chunk: {early:?}");

    let worker = start_leaf("worker-a", Role::Worker, &addr).await;
    let stream = worker
        .open_stream("camera/frames", Some(Target::node("coordinator")))
        .unwrap();
    stream.send_chunk(Payload::new().with("n", 1i64)).unwrap();

    let events = tokio::time::timeout(Duration::from_secs(2), async {
        let mut events = Vec::new();
        while let Some(event) = receiver.next().await {
            events.push(event);
        }
        events
    })
    .await
    .unwrap();
    assert!(matches!(events[0], StreamEvent::Chunk { seq: 1, .. }));
    assert_eq!(events.last(), Some(&StreamEvent::Ended(EndReason::IdleTimeout)));

    drop(stream);
    worker.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn one_source_ending_leaves_the_other_streaming() {
    let (coordinator, addr) = start_coordinator().await;
    let mut receiver = coordinator.get_stream("video").unwrap();
    let cam_a = start_leaf("cam-a", Role::Worker, &addr).await;
    let cam_b = start_leaf("cam-b", Role::Worker, &addr).await;

    let a = cam_a.open_stream("video", Some(Target::node("coordinator"))).unwrap();
    let b = cam_b.open_stream("video", Some(Target::node("coordinator"))).unwrap();
    a.send_chunk(Payload::new()).unwrap();
    a.close().unwrap();
    assert!(matches!(next_event(&mut receiver).await, Some(StreamEvent::Chunk { seq: 1, .. })));
    assert!(matches!(
        next_event(&mut receiver).await,
        Some(StreamEvent::SourceEnded { reason: EndReason::Source, .. })
    ));

    b.send_chunk(Payload::new().with("n", 1i64)).unwrap();
    b.send_chunk(Payload::new().with("n", 2i64)).unwrap();
    for expected in 1..=2u64 {
        match next_event(&mut receiver).await {
            Some(StreamEvent::Chunk { source, seq, .. }) => {
                assert_eq!(source, NodeAddress::new("cam-b"));
                assert_eq!(seq, expected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    drop(a);
    drop(b);
    cam_a.close().await;
    cam_b.close().await;
    coordinator.close().await;
}

#[tokio::test]
async fn chunks_through_an_intermediate_node() {
    let (coordinator, coordinator_addr) = start_coordinator().await;
    let (worker, worker_addr) =
        start_listening(fast_config("worker-a", Role::Worker).with_parent(coordinator_addr.as_str())).await;
    let sub = start_leaf("sub-1", Role::SubWorker, &worker_addr).await;
    let mut events = coordinator.events();
    let mut receiver = coordinator.get_stream("lidar/scan").unwrap();

    let stream = sub
        .open_stream("lidar/scan", Some(Target::node("coordinator")))
        .unwrap();
    for _ in 0..3 {
        stream.send_chunk(Payload::new().with("points", vec![1u8, 2, 3])).unwrap();
    }
    stream.close().unwrap();

    let mut seqs = Vec::new();
    while let Some(event) = receiver.next().await {
        match event {
            StreamEvent::Chunk { source, seq, .. } => {
                assert_eq!(source, NodeAddress::new("sub-1"));
                seqs.push(seq);
            }
            StreamEvent::SourceEnded { source, reason } => {
                assert_eq!(source, NodeAddress::new("sub-1"));
                assert_eq!(reason, EndReason::Source);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(seqs, vec![1, 2, 3]);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, FabricEvent::StreamGap { .. }));
    }

    sub.close().await;
    worker.close().await;
    coordinator.close().await;
}
