// End-to-end transfers between the client library and the mock node over a virtual bus
use canopen_client::sdo::abort::{ABORT_ATTEMPT_TO_WRITE_READ_ONLY, ABORT_OBJECT_DOES_NOT_EXIST};
use canopen_client::{CanopenContext, DisplayMode, NmtCommand, NodeId, SdoError, TransferMode, VirtualBus};
use mock_canopen_node::{Access, DataType, MockNode, NmtState, ObjectDictionary, SdoServer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NODE: u8 = 4;

struct Harness {
    context: CanopenContext,
    node: Arc<Mutex<MockNode>>,
}

async fn start(block_size: u8) -> Harness {
    let (host, device) = VirtualBus::pair();

    let mut od = ObjectDictionary::new();
    od.add_test_objects_for_node(NODE);
    od.add_static(0x2200, 0x00, Vec::new(), DataType::Domain, Access::ReadWrite);

    let server = SdoServer::new(NodeId::clamped(NODE), od).with_block_size(block_size);
    let node = Arc::new(Mutex::new(MockNode::new(server)));

    let worker = node.clone();
    tokio::spawn(async move {
        loop {
            {
                let mut node = worker.lock().unwrap();
                let _ = node.poll(&device);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let context = CanopenContext::initialize(host.opener(), Duration::from_millis(5));
    tokio::time::timeout(Duration::from_secs(1), context.wait_until_ready())
        .await
        .expect("channel did not become ready");

    Harness { context, node }
}

fn printable(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'A' + (i % 26) as u8).collect()
}

#[tokio::test]
async fn expedited_read_and_write() {
    let h = start(127).await;

    let upload = h.context.sdo_read(NODE, 0x1000, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.mode, TransferMode::Expedited);
    assert_eq!(upload.as_u32(), 0x191);

    let mode = h
        .context
        .sdo_write(NODE, 0x1017, 0, &500u16.to_le_bytes(), DisplayMode::Silent, None)
        .await
        .unwrap();
    assert_eq!(mode, TransferMode::Expedited);

    let upload = h.context.sdo_read(NODE, 0x1017, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.as_u32(), 500);
}

#[tokio::test]
async fn segmented_read_of_the_device_name() {
    let h = start(127).await;

    let upload = h.context.sdo_read(NODE, 0x1008, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.mode, TransferMode::Segmented);
    assert_eq!(upload.length, 19);
    assert_eq!(upload.as_text(), "Mock CANopen Node 4");
}

#[tokio::test]
async fn segmented_write_then_read_back() {
    let h = start(127).await;
    let text = b"written in several segments";

    let mode = h
        .context
        .sdo_write_segmented(NODE, 0x2100, 0, text, DisplayMode::Silent, None)
        .await
        .unwrap();
    assert_eq!(mode, TransferMode::Segmented);

    let upload = h.context.sdo_read(NODE, 0x2100, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.data, text);
}

#[tokio::test]
async fn block_write_across_several_blocks() {
    let h = start(16).await;
    let data = printable(300);

    h.context
        .sdo_write_block(NODE, 0x2200, 0, &data, DisplayMode::Silent, None)
        .await
        .unwrap();
    assert!(h.node.lock().unwrap().sdo_server().is_idle());

    let upload = h.context.sdo_read(NODE, 0x2200, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.length, 300);
    assert_eq!(upload.data, data);
}

#[tokio::test]
async fn block_write_from_a_file() {
    let h = start(127).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.bin");
    std::fs::write(&path, printable(50)).unwrap();

    let sent = h
        .context
        .sdo_write_block_file(NODE, 0x2200, 0, &path, DisplayMode::Silent, None)
        .await
        .unwrap();
    assert_eq!(sent, 50);

    let upload = h.context.sdo_read(NODE, 0x2200, 0, DisplayMode::Silent, None).await.unwrap();
    assert_eq!(upload.data, printable(50));
}

#[tokio::test]
async fn device_aborts_reach_the_caller() {
    let h = start(127).await;

    let err = h.context.sdo_read(NODE, 0x6000, 0, DisplayMode::Silent, None).await.unwrap_err();
    assert!(matches!(err, SdoError::AbortTransfer { code: ABORT_OBJECT_DOES_NOT_EXIST, .. }));
    assert_eq!(err.to_string(), "SDO abort 0x06020000: Object does not exist in the object dictionary");

    let err = h
        .context
        .sdo_write_segmented(NODE, 0x1008, 0, b"renamed device", DisplayMode::Silent, None)
        .await
        .unwrap_err();
    assert_eq!(err.abort_code(), Some(ABORT_ATTEMPT_TO_WRITE_READ_ONLY));

    let err = h
        .context
        .sdo_write_block(NODE, 0x1000, 0, &[1, 2, 3, 4, 5], DisplayMode::Silent, None)
        .await
        .unwrap_err();
    assert_eq!(err.abort_code(), Some(ABORT_ATTEMPT_TO_WRITE_READ_ONLY));
}

#[tokio::test]
async fn absent_node_times_out() {
    let h = start(127).await;

    let err = h.context.sdo_read(NODE + 1, 0x1000, 0, DisplayMode::Silent, None).await.unwrap_err();
    assert!(matches!(err, SdoError::Timeout { index: 0x1000, subindex: 0 }));
}

#[tokio::test]
async fn nmt_commands_drive_the_node() {
    let h = start(127).await;

    async fn wait_for(node: &Arc<Mutex<MockNode>>, state: NmtState) {
        for _ in 0..100 {
            if node.lock().unwrap().state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("node never reached {:?}", state);
    }

    h.context.nmt_send_command(NODE, NmtCommand::Operational, DisplayMode::Report).unwrap();
    wait_for(&h.node, NmtState::Operational).await;

    h.context.nmt_send_command(NODE, NmtCommand::Stop, DisplayMode::Silent).unwrap();
    wait_for(&h.node, NmtState::Stopped).await;

    // A stopped node does not answer SDO
    let err = h.context.sdo_read(NODE, 0x1000, 0, DisplayMode::Silent, None).await.unwrap_err();
    assert!(matches!(err, SdoError::Timeout { .. }));

    h.context.nmt_send_command(NODE, NmtCommand::ResetCommunication, DisplayMode::Silent).unwrap();
    wait_for(&h.node, NmtState::PreOperational).await;
    assert!(h.context.sdo_read(NODE, 0x1000, 0, DisplayMode::Silent, None).await.is_ok());
}
