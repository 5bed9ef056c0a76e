use std::time::Duration;

use canmaster::common::sdo::RawAbortCode;
use canmaster::SdoClientConfig;
use integration_tests::prelude::*;

fn start_core(bus: &SimBus) -> Core {
    let (sender, receiver) = bus.endpoint();
    Core::with_transport(sender, receiver)
}

fn start_core_with_sdo_config(bus: &SimBus, sdo: SdoClientConfig) -> Core {
    let (sender, receiver) = bus.endpoint();
    Core::with_config(
        sender,
        receiver,
        CoreConfig {
            sdo,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_expedited_upload() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();
    let slave = SdoSlaveSim::spawn(&bus, 1);
    slave.set_object(0x1000, 0, &[0x12]);

    let node = NodeId::new(1).unwrap();
    let data = core.sdo.upload(node, 0x1000, 0).await.unwrap();
    assert_eq!(vec![0x12], data);

    // The request on the wire is a plain initiate-upload for 0x1000sub0
    let request = tap.expect_frame_on(CanId::std(0x601)).await;
    assert_eq!(&[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0], request.data());

    core.stop().await;
}

#[tokio::test]
async fn test_expedited_download() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 4);

    let node = NodeId::new(4).unwrap();
    core.sdo.download_u16(node, 0x6040, 0, 0x000F).await.unwrap();

    assert_eq!(
        vec![(0x6040, 0, vec![0x0F, 0x00])],
        slave.recorded_writes()
    );
    core.stop().await;
}

#[tokio::test]
async fn test_segmented_download() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let (_, mut tap) = bus.endpoint();
    let slave = SdoSlaveSim::spawn(&bus, 1);

    let node = NodeId::new(1).unwrap();
    let payload = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
    core.sdo.download(node, 0x1017, 0, &payload).await.unwrap();

    assert_eq!(vec![(0x1017, 0, payload.to_vec())], slave.recorded_writes());

    // Initiate announces the 7-byte size; the single segment carries c=1
    let initiate = tap.expect_frame_on(CanId::std(0x601)).await;
    assert_eq!(&[0x21, 0x17, 0x10, 0x00, 7, 0, 0, 0], initiate.data());
    let segment = tap.expect_frame_on(CanId::std(0x601)).await;
    assert_eq!(0x01, segment.data()[0]);
    assert_eq!(&payload, &segment.data()[1..8]);

    core.stop().await;
}

#[tokio::test]
async fn test_segmented_upload() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 1);
    let payload: Vec<u8> = (0..20).collect();
    slave.set_object(0x1008, 0, &payload);

    let node = NodeId::new(1).unwrap();
    let data = core.sdo.upload(node, 0x1008, 0).await.unwrap();
    assert_eq!(payload, data);

    core.stop().await;
}

#[tokio::test]
async fn test_sdo_abort_surfaces_without_retry() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave = SdoSlaveSim::spawn(&bus, 1);
    slave.set_abort(0x1234, 0, AbortCode::NoSuchObject);

    let node = NodeId::new(1).unwrap();
    let err = core.sdo.upload(node, 0x1234, 0).await.unwrap_err();
    match err {
        SdoClientError::ServerAbort {
            index,
            sub,
            abort_code,
        } => {
            assert_eq!(0x1234, index);
            assert_eq!(0, sub);
            assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), abort_code);
            assert_eq!(0x0602_0000, abort_code.raw());
        }
        other => panic!("expected ServerAbort, got {other:?}"),
    }

    // The retry policy applies only to timeouts: exactly one request was made
    assert_eq!(1, slave.initiate_count(0x1234, 0));

    core.stop().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_timeout_then_retry_succeeds() {
    let bus = SimBus::new();
    let core = start_core_with_sdo_config(
        &bus,
        SdoClientConfig {
            response_timeout: Duration::from_millis(50),
            retries: 1,
        },
    );
    let slave = SdoSlaveSim::spawn(&bus, 1);
    slave.set_object(0x2000, 0, &[0xAA, 0xBB]);
    slave.drop_requests(0x2000, 0, 1);

    let node = NodeId::new(1).unwrap();
    let data = core.sdo.upload(node, 0x2000, 0).await.unwrap();
    assert_eq!(vec![0xAA, 0xBB], data);
    assert_eq!(2, slave.initiate_count(0x2000, 0));

    core.stop().await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_retries_exhausted() {
    let bus = SimBus::new();
    let core = start_core_with_sdo_config(
        &bus,
        SdoClientConfig {
            response_timeout: Duration::from_millis(50),
            retries: 1,
        },
    );
    let slave = SdoSlaveSim::spawn(&bus, 1);
    slave.set_object(0x2000, 0, &[0xAA]);
    slave.drop_requests(0x2000, 0, 2);

    let node = NodeId::new(1).unwrap();
    let err = core.sdo.upload(node, 0x2000, 0).await.unwrap_err();
    assert_eq!(SdoClientError::NoResponse, err);
    // Initial attempt plus one retry
    assert_eq!(2, slave.initiate_count(0x2000, 0));

    core.stop().await;
}

#[tokio::test]
async fn test_transactions_on_distinct_nodes_run_in_parallel() {
    let bus = SimBus::new();
    let core = start_core(&bus);
    let slave1 = SdoSlaveSim::spawn(&bus, 1);
    let slave2 = SdoSlaveSim::spawn(&bus, 2);
    slave1.set_object(0x1000, 0, &[1, 0, 0, 0]);
    slave2.set_object(0x1000, 0, &[2, 0, 0, 0]);

    let (a, b) = tokio::join!(
        core.sdo.upload_u32(NodeId::new(1).unwrap(), 0x1000, 0),
        core.sdo.upload_u32(NodeId::new(2).unwrap(), 0x1000, 0),
    );
    assert_eq!(1, a.unwrap());
    assert_eq!(2, b.unwrap());

    core.stop().await;
}

#[tokio::test]
async fn test_stop_wakes_waiters_with_cancelled() {
    let bus = SimBus::new();
    let core = start_core_with_sdo_config(
        &bus,
        SdoClientConfig {
            response_timeout: Duration::from_secs(10),
            retries: 0,
        },
    );
    // No slave attached: the upload would wait out its long deadline
    let sdo = core.sdo.clone();
    let upload = tokio::spawn(async move {
        sdo.upload(NodeId::new(1).unwrap(), 0x1000, 0).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    core.stop().await;

    assert_eq!(Err(SdoClientError::Cancelled), upload.await.unwrap());
}
