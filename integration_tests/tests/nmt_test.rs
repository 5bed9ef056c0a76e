use std::time::{Duration, Instant};

use canmaster::common::nmt::NmtCommand;
use canmaster::NmtMasterConfig;
use integration_tests::prelude::*;
use tokio::sync::mpsc;

fn start_core(bus: &SimBus) -> Core {
    let (sender, receiver) = bus.endpoint();
    Core::with_transport(sender, receiver)
}

#[tokio::test]
async fn test_nmt_command_frames() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();
    let node = NodeId::new(5).unwrap();

    core.nmt.start_node(node).unwrap();
    assert_eq!(&[0x01, 0x05], tap.expect_frame().await.data());

    core.nmt.stop_node(node).unwrap();
    assert_eq!(&[0x02, 0x05], tap.expect_frame().await.data());

    core.nmt.enter_preoperational(node).unwrap();
    assert_eq!(&[0x80, 0x05], tap.expect_frame().await.data());

    core.nmt.reset_communication(node).unwrap();
    assert_eq!(&[0x82, 0x05], tap.expect_frame().await.data());

    // reset_all_nodes broadcasts a reset_node command
    core.nmt.reset_all_nodes().unwrap();
    let frame = tap.expect_frame().await;
    assert_eq!(CanId::std(0x000), frame.id());
    assert_eq!(&[0x81, 0x00], frame.data());

    core.stop().await;
}

#[tokio::test]
async fn test_broadcast_command() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();

    core.nmt.broadcast_nmt_command(NmtCommand::StartNode).unwrap();
    assert_eq!(&[0x01, 0x00], tap.expect_frame().await.data());

    core.stop().await;
}

#[tokio::test]
async fn test_discover_nodes_sweeps_all_ids() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();

    core.nmt.discover_nodes().unwrap();

    let frames = tap.collect_for(Duration::from_millis(200)).await;
    let rtrs: Vec<_> = frames.iter().filter(|(_, f)| f.is_rtr()).collect();
    assert_eq!(127, rtrs.len());
    assert_eq!(CanId::std(0x701), rtrs[0].1.id());
    assert_eq!(CanId::std(0x77F), rtrs[126].1.id());

    core.stop().await;
}

#[tokio::test]
async fn test_heartbeat_updates_state_and_liveness() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (peer, _) = bus.endpoint();

    peer.send_now(CanMessage::new(CanId::std(0x703), &[0x7F]));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let node = NodeId::new(3).unwrap();
    assert_eq!(Some(NmtState::PreOperational), core.nmt.node_state(node));
    assert_eq!(vec![node], core.nmt.alive_nodes());

    core.stop().await;
}

/// A node that sends a single heartbeat must fire `device_alive` once
/// immediately, `device_dead` once after two silent sweeps, and nothing
/// afterwards.
#[tokio::test]
#[serial_test::serial]
async fn test_liveness_two_sweep_policy() {
    integration_tests::init_test_logging();
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let core = Core::with_config(
        sender,
        receiver,
        CoreConfig {
            nmt: NmtMasterConfig {
                alive_check_interval: Duration::from_millis(100),
            },
            ..Default::default()
        },
    );
    let (peer, _) = bus.endpoint();

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let alive_tx = event_tx.clone();
    core.nmt.register_device_alive_callback(move |node| {
        alive_tx.send(("alive", node.raw(), Instant::now())).ok();
    });
    core.nmt.register_device_dead_callback(move |node| {
        event_tx.send(("dead", node.raw(), Instant::now())).ok();
    });

    let start = Instant::now();
    peer.send_now(CanMessage::new(CanId::std(0x701), &[0x05]));

    let (kind, node, at) = events.recv().await.unwrap();
    assert_eq!(("alive", 1), (kind, node));
    assert!(at.duration_since(start) < Duration::from_millis(50));

    let (kind, node, at) = events.recv().await.unwrap();
    assert_eq!(("dead", 1), (kind, node));
    let elapsed = at.duration_since(start);
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(400),
        "dead fired after {elapsed:?}"
    );

    // No further callbacks
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "unexpected extra liveness callback"
    );

    core.stop().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_continued_heartbeats_keep_node_alive() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let core = Core::with_config(
        sender,
        receiver,
        CoreConfig {
            nmt: NmtMasterConfig {
                alive_check_interval: Duration::from_millis(100),
            },
            ..Default::default()
        },
    );
    let (peer, _) = bus.endpoint();

    let (event_tx, mut events) = mpsc::unbounded_channel();
    core.nmt.register_device_dead_callback(move |node| {
        event_tx.send(node.raw()).ok();
    });

    // Heartbeat every 60 ms for half a second: always inside the grace window
    for _ in 0..8 {
        peer.send_now(CanMessage::new(CanId::std(0x702), &[0x05]));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    assert!(events.try_recv().is_err(), "node wrongly declared dead");

    core.stop().await;
}
