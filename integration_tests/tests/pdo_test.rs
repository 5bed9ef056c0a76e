use std::time::Duration;

use integration_tests::prelude::*;

fn start_core(bus: &SimBus) -> Core {
    let (sender, receiver) = bus.endpoint();
    Core::with_transport(sender, receiver)
}

/// Build a device with a velocity/controlword pair in its dictionary
fn drive_device(core: &Core, node: u8) -> Device {
    let device = Device::new(core, NodeId::new(node).unwrap());
    device
        .add_entry(0x60FF, 0, "target_velocity", DataType::U32, AccessType::ReadWrite)
        .unwrap();
    device
        .add_entry(0x6040, 0, "controlword", DataType::U16, AccessType::ReadWrite)
        .unwrap();
    device
        .add_entry(0x6041, 0, "statusword", DataType::U16, AccessType::ReadOnly)
        .unwrap();
    device
}

#[tokio::test]
#[serial_test::serial]
async fn test_periodic_tpdo_cadence_and_payload() {
    integration_tests::init_test_logging();
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (_, mut tap) = bus.endpoint();

    device
        .set_entry("target_velocity", Value::U32(2000), WriteAccessMethod::Pdo)
        .await
        .unwrap();
    device
        .set_entry("controlword", Value::U16(0x000F), WriteAccessMethod::Pdo)
        .await
        .unwrap();

    device
        .add_transmit_pdo_mapping(
            0x201,
            &[
                Mapping::new("target_velocity", 0),
                Mapping::new("controlword", 4),
            ],
            TransmissionType::Periodic,
            Duration::from_millis(50),
        )
        .unwrap();

    // The first frame goes out one period after registration
    let frames = tap.collect_for(Duration::from_millis(280)).await;
    let pdo_frames: Vec<_> = frames
        .iter()
        .filter(|(_, f)| f.id() == CanId::std(0x201))
        .collect();
    assert!(
        pdo_frames.len() >= 4,
        "expected at least 4 periodic frames, got {}",
        pdo_frames.len()
    );
    for (_, frame) in &pdo_frames {
        assert_eq!(
            &[0xD0, 0x07, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00],
            frame.data()
        );
    }
    for pair in pdo_frames.windows(2) {
        let gap = pair[1].0.duration_since(pair[0].0);
        assert!(
            gap >= Duration::from_millis(30) && gap <= Duration::from_millis(90),
            "period out of tolerance: {gap:?}"
        );
    }

    core.stop().await;
}

#[tokio::test]
async fn test_on_change_tpdo_sends_per_update() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (_, mut tap) = bus.endpoint();

    device
        .add_transmit_pdo_mapping(
            0x201,
            &[Mapping::new("controlword", 0)],
            TransmissionType::OnChange,
            Duration::ZERO,
        )
        .unwrap();

    device
        .set_entry("controlword", Value::U16(0x0006), WriteAccessMethod::Pdo)
        .await
        .unwrap();
    device
        .set_entry("controlword", Value::U16(0x000F), WriteAccessMethod::Pdo)
        .await
        .unwrap();

    let first = tap.expect_frame_on(CanId::std(0x201)).await;
    assert_eq!(&[0x06, 0x00, 0, 0, 0, 0, 0, 0], first.data());
    let second = tap.expect_frame_on(CanId::std(0x201)).await;
    assert_eq!(&[0x0F, 0x00, 0, 0, 0, 0, 0, 0], second.data());

    core.stop().await;
}

#[tokio::test]
async fn test_receive_pdo_updates_entry() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (peer, _) = bus.endpoint();

    device
        .add_receive_pdo_mapping(0x181, "statusword", 0)
        .unwrap();
    assert!(device
        .get_entry("statusword", ReadAccessMethod::Pdo)
        .await
        .unwrap()
        .is_invalid());

    peer.send_now(CanMessage::new(CanId::std(0x181), &[0x37, 0x02]));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        Value::U16(0x0237),
        device
            .get_entry("statusword", ReadAccessMethod::Pdo)
            .await
            .unwrap()
    );

    core.stop().await;
}

#[tokio::test]
async fn test_short_pdo_payload_dropped() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (peer, _) = bus.endpoint();

    // statusword is mapped at offset 1, so a 2-byte payload is too short
    device
        .add_receive_pdo_mapping(0x181, "statusword", 1)
        .unwrap();
    peer.send_now(CanMessage::new(CanId::std(0x181), &[0x37, 0x02]));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(device
        .get_entry("statusword", ReadAccessMethod::Pdo)
        .await
        .unwrap()
        .is_invalid());

    core.stop().await;
}

#[tokio::test]
async fn test_mapping_validation() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);

    // Receive mapping must fit the 8-byte frame
    assert!(matches!(
        device.add_receive_pdo_mapping(0x181, "target_velocity", 5),
        Err(DeviceError::Dictionary { .. })
    ));

    // Transmit mappings must not overlap
    assert!(matches!(
        device.add_transmit_pdo_mapping(
            0x201,
            &[
                Mapping::new("target_velocity", 0),
                Mapping::new("controlword", 2),
            ],
            TransmissionType::Periodic,
            Duration::from_millis(50),
        ),
        Err(DeviceError::Dictionary { .. })
    ));

    core.stop().await;
}

#[tokio::test]
async fn test_pdo_request_and_wait() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (peer, mut peer_rx) = bus.endpoint();

    device
        .add_receive_pdo_mapping(0x181, "statusword", 0)
        .unwrap();

    // A scripted node: answer the remote request with the PDO
    let responder = tokio::spawn(async move {
        use canmaster_common::traits::AsyncCanReceiver;
        loop {
            if let Ok(msg) = peer_rx.recv().await {
                if msg.is_rtr() && msg.id() == CanId::std(0x181) {
                    peer.send_now(CanMessage::new(CanId::std(0x181), &[0x40, 0x06]));
                    break;
                }
            } else {
                break;
            }
        }
    });

    let value = device
        .get_entry("statusword", ReadAccessMethod::PdoRequestAndWait)
        .await
        .unwrap();
    assert_eq!(Value::U16(0x0640), value);

    responder.await.unwrap();
    core.stop().await;
}

#[tokio::test]
async fn test_pdo_request_and_wait_times_out() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = Device::with_config(
        &core,
        NodeId::new(1).unwrap(),
        canmaster::DeviceConfig {
            pdo_request_timeout: Duration::from_millis(50),
        },
    );
    device
        .add_entry(0x6041, 0, "statusword", DataType::U16, AccessType::ReadOnly)
        .unwrap();
    device
        .add_receive_pdo_mapping(0x181, "statusword", 0)
        .unwrap();

    // Nothing answers the remote request
    let err = device
        .get_entry("statusword", ReadAccessMethod::PdoRequestAndWait)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::PdoRequestTimeout { .. }));

    core.stop().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_sync_ticks_periodic_transmitter() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = drive_device(&core, 1);
    let (peer, mut tap) = bus.endpoint();

    device
        .add_transmit_pdo_mapping(
            0x201,
            &[Mapping::new("controlword", 0)],
            TransmissionType::Periodic,
            Duration::from_secs(5),
        )
        .unwrap();

    // Nothing is emitted while the producer sleeps out its 5 s period
    let early = tap.collect_for(Duration::from_millis(50)).await;
    assert!(early.iter().all(|(_, f)| f.id() != CanId::std(0x201)));

    // A SYNC frame ticks the scheduler well before the period elapses
    peer.send_now(CanMessage::new(CanId::std(0x080), &[]));
    tap.expect_frame_on(CanId::std(0x201)).await;
    assert_eq!(1, core.pdo.sync_count());

    core.stop().await;
}
