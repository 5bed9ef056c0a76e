use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use integration_tests::prelude::*;

fn start_core(bus: &SimBus) -> Core {
    let (sender, receiver) = bus.endpoint();
    Core::with_transport(sender, receiver)
}

/// Scenario: remap TPDO1 on a remote drive. The slave must see the writes in
/// the exact disable / clear / map / count / type / enable order.
#[tokio::test]
async fn test_map_tpdo_write_sequence() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 1);
    // TPDO1 currently enabled on COB-ID 0x201
    slave.set_object(0x1800, 1, &0x0000_0201u32.to_le_bytes());

    let device = Device::new(&core, NodeId::new(1).unwrap());
    device
        .map_tpdo_in_device(
            TpdoNumber::Tpdo1,
            &[0x606C_0020, 0x6041_0010, 0x603F_0010],
            transmission_types::ASYNC_PROFILE,
            None,
            None,
        )
        .await
        .unwrap();

    let expected: Vec<(u16, u8, Vec<u8>)> = vec![
        // Disable: bit 31 set on the COB-ID entry
        (0x1800, 1, 0x8000_0201u32.to_le_bytes().to_vec()),
        // Clear the mapping count
        (0x1A00, 0, vec![0]),
        // The three packed mapping words
        (0x1A00, 1, 0x606C_0020u32.to_le_bytes().to_vec()),
        (0x1A00, 2, 0x6041_0010u32.to_le_bytes().to_vec()),
        (0x1A00, 3, 0x603F_0010u32.to_le_bytes().to_vec()),
        // Write the count
        (0x1A00, 0, vec![3]),
        // Transmission type 255: asynchronous, profile event
        (0x1800, 2, vec![255]),
        // Re-enable: bit 31 cleared
        (0x1800, 1, 0x0000_0201u32.to_le_bytes().to_vec()),
    ];
    assert_eq!(expected, slave.recorded_writes());

    core.stop().await;
}

#[tokio::test]
async fn test_map_rpdo_write_sequence() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 1);
    // RPDO1 currently enabled on COB-ID 0x201
    slave.set_object(0x1400, 1, &0x0000_0201u32.to_le_bytes());

    let device = Device::new(&core, NodeId::new(1).unwrap());
    device
        .map_rpdo_in_device(
            RpdoNumber::Rpdo1,
            &[0x6040_0010],
            transmission_types::SYNCHRONOUS,
        )
        .await
        .unwrap();

    let expected: Vec<(u16, u8, Vec<u8>)> = vec![
        (0x1400, 1, 0x8000_0201u32.to_le_bytes().to_vec()),
        (0x1600, 0, vec![0]),
        (0x1600, 1, 0x6040_0010u32.to_le_bytes().to_vec()),
        (0x1600, 0, vec![1]),
        (0x1400, 2, vec![transmission_types::SYNCHRONOUS]),
        (0x1400, 1, 0x0000_0201u32.to_le_bytes().to_vec()),
    ];
    assert_eq!(expected, slave.recorded_writes());

    core.stop().await;
}

#[tokio::test]
async fn test_map_tpdo_aborts_on_failure() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 1);
    slave.set_object(0x1800, 1, &0x0000_0201u32.to_le_bytes());
    // The mapping object rejects writes
    slave.set_abort(0x1A00, 0, AbortCode::ReadOnly);

    let device = Device::new(&core, NodeId::new(1).unwrap());
    let err = device
        .map_tpdo_in_device(
            TpdoNumber::Tpdo1,
            &[0x606C_0020],
            transmission_types::ASYNC_PROFILE,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Sdo { .. }));

    // The sequence stopped at the failing step: only the disable write landed
    assert_eq!(1, slave.recorded_writes().len());

    core.stop().await;
}

#[tokio::test]
async fn test_set_then_get_entry_via_sdo() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 2);
    let device = Device::new(&core, NodeId::new(2).unwrap());
    device
        .add_entry(0x60FF, 0, "Target Velocity", DataType::I32, AccessType::ReadWrite)
        .unwrap();

    device
        .set_entry("target_velocity", Value::I32(-1500), WriteAccessMethod::Sdo)
        .await
        .unwrap();
    // What was written is what a subsequent SDO read yields
    let value = device
        .get_entry("target_velocity", ReadAccessMethod::Sdo)
        .await
        .unwrap();
    assert_eq!(Value::I32(-1500), value);
    assert_eq!(
        vec![(0x60FF, 0, (-1500i32).to_le_bytes().to_vec())],
        slave.recorded_writes()
    );

    core.stop().await;
}

#[tokio::test]
async fn test_set_entry_type_checked() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = Device::new(&core, NodeId::new(2).unwrap());
    device
        .add_entry(0x60FF, 0, "target_velocity", DataType::I32, AccessType::ReadWrite)
        .unwrap();

    let err = device
        .set_entry("target_velocity", Value::U16(5), WriteAccessMethod::Pdo)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Dictionary { .. }));

    core.stop().await;
}

#[tokio::test]
async fn test_unknown_entry_errors() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = Device::new(&core, NodeId::new(2).unwrap());

    assert!(!device.has_entry("nonexistent"));
    let err = device
        .get_entry("nonexistent", ReadAccessMethod::Sdo)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Dictionary { .. }));

    core.stop().await;
}

#[tokio::test]
async fn test_add_entry_rejects_duplicates() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let device = Device::new(&core, NodeId::new(2).unwrap());
    device
        .add_entry(0x2000, 0, "some value", DataType::U8, AccessType::ReadWrite)
        .unwrap();

    assert!(matches!(
        device.add_entry(0x2000, 0, "other", DataType::U8, AccessType::ReadWrite),
        Err(DeviceError::CanOpen { .. })
    ));
    assert!(matches!(
        device.add_entry(0x2001, 0, "Some  Value", DataType::U8, AccessType::ReadWrite),
        Err(DeviceError::CanOpen { .. })
    ));

    // replace_entry is the explicit overwrite path
    device.replace_entry(0x2000, 0, "some value", DataType::U16, AccessType::ReadOnly);
    assert_eq!(
        DataType::U16,
        device.get_entry_type("some_value").unwrap()
    );

    core.stop().await;
}

#[tokio::test]
async fn test_constants_and_operations() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 2);
    let device = Device::new(&core, NodeId::new(2).unwrap());
    device
        .add_entry(0x6040, 0, "controlword", DataType::U16, AccessType::ReadWrite)
        .unwrap();

    device
        .add_constant("controlword_halt", Value::U16(0x0102))
        .unwrap();
    assert_eq!(
        Value::U16(0x0102),
        device.get_constant("Controlword Halt").unwrap()
    );
    assert!(device
        .add_constant("controlword_halt", Value::U16(0))
        .is_err());

    device
        .add_operation(
            "halt",
            Arc::new(|device: &Device, _arg| {
                async move {
                    let halt = device.get_constant("controlword_halt")?;
                    device
                        .set_entry("controlword", halt, WriteAccessMethod::Sdo)
                        .await?;
                    Ok(Value::Invalid)
                }
                .boxed()
            }),
        )
        .unwrap();

    device.execute("halt", Value::Invalid).await.unwrap();
    assert_eq!(
        vec![(0x6040, 0, vec![0x02, 0x01])],
        slave.recorded_writes()
    );

    // Unknown operations surface as dictionary errors
    assert!(matches!(
        device.execute("warp_drive", Value::Invalid).await,
        Err(DeviceError::Dictionary { .. })
    ));

    core.stop().await;
}

#[tokio::test]
async fn test_load_dictionary_from_library_and_start() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();
    let slave = SdoSlaveSim::spawn(&bus, 3);
    // Device type: profile 402
    slave.set_object(0x1000, 0, &402u32.to_le_bytes());

    let device = Device::new(&core, NodeId::new(3).unwrap());
    device.load_dictionary_from_library().await.unwrap();
    assert!(device.has_entry("controlword"));
    assert!(device.has_entry("statusword"));
    assert!(device.has_entry("device_type"));

    device.start().await.unwrap();

    // start() issued the NMT start command for the node
    let frame = tap.expect_frame_on(CanId::std(0x000)).await;
    assert_eq!(&[0x01, 0x03], frame.data());

    // The 402 profile contributed the power state machine walk
    device
        .execute("enable_operation", Value::Invalid)
        .await
        .unwrap();
    let controlwords: Vec<_> = slave
        .recorded_writes()
        .into_iter()
        .filter(|(index, _, _)| *index == 0x6040)
        .map(|(_, _, data)| data)
        .collect();
    assert_eq!(
        vec![vec![0x06, 0x00], vec![0x07, 0x00], vec![0x0F, 0x00]],
        controlwords
    );

    core.stop().await;
}

#[tokio::test]
async fn test_read_complete_dictionary_disables_missing() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 2);
    slave.set_object(0x2000, 0, &[0x2A]);
    // 0x2001 is absent: the slave aborts reads of it

    let device = Device::new(&core, NodeId::new(2).unwrap());
    device
        .add_entry(0x2000, 0, "present", DataType::U8, AccessType::ReadWrite)
        .unwrap();
    device
        .add_entry(0x2001, 0, "missing", DataType::U8, AccessType::ReadWrite)
        .unwrap();

    device.read_complete_dictionary().await;

    let present = device.dictionary().get_by_name("present").unwrap();
    assert_eq!(Value::U8(0x2A), present.get_value());
    assert!(!present.is_disabled());

    let missing = device.dictionary().get_by_name("missing").unwrap();
    assert!(missing.is_disabled());

    core.stop().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_request_heartbeat_producer() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();
    let device = Device::new(&core, NodeId::new(2).unwrap());

    device.request_heartbeat(42, Duration::from_millis(50), false, NmtState::Operational);

    let first = tap.expect_frame_on(CanId::std(0x72A)).await;
    assert_eq!(&[0x05], first.data());
    let second = tap.expect_frame_on(CanId::std(0x72A)).await;
    assert_eq!(&[0x05], second.data());

    device.stop_request_heartbeat();
    // Drain anything in flight, then verify silence
    tokio::time::sleep(Duration::from_millis(20)).await;
    let frames = tap.collect_for(Duration::from_millis(150)).await;
    assert!(
        frames.iter().all(|(_, f)| f.id() != CanId::std(0x72A)),
        "heartbeat producer kept running after stop"
    );

    core.stop().await;
}

#[tokio::test]
async fn test_load_dictionary_from_eds_file() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 3);
    slave.set_object(0x1000, 0, &402u32.to_le_bytes());

    let eds = "\
[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[6040]
ParameterName=Drive command word
ObjectType=0x7
DataType=0x0006
AccessType=rw
PDOMapping=1
";
    let dir = std::env::temp_dir();
    let path = dir.join("canmaster_test_device.eds");
    std::fs::write(&path, eds).unwrap();

    let device = Device::new(&core, NodeId::new(3).unwrap());
    device.load_dictionary_from_eds(&path).await.unwrap();
    std::fs::remove_file(&path).ok();

    // Manufacturer name and merged standard name reach the same entry
    let vendor = device.dictionary().get_by_name("drive_command_word").unwrap();
    let standard = device.dictionary().get_by_name("controlword").unwrap();
    assert_eq!(vendor.address(), standard.address());

    // Profile entries absent from the EDS were added as generic
    let status = device.dictionary().get_by_name("statusword").unwrap();
    assert!(status.is_generic());

    core.stop().await;
}
