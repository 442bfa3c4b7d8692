//! End-to-end tests over the wire: a data node serving a partition,
//! driven by a raw packet client.

use std::sync::Arc;

use tempfile::tempdir;
use tokio::net::{TcpListener, TcpStream};

use tidefs_datanode::{DataNode, DataNodeConfig, StaticClusterView, READ_BLOCK_SIZE};
use tidefs_proto::{AdminTask, HeartbeatResponse, Opcode, Packet, ResultCode, StoreMode, TaskStatus};
use tidefs_storage::{crc32, ExtentInfo, BLOCK_SIZE};

async fn start_node(dir: &std::path::Path) -> (Arc<DataNode>, std::net::SocketAddr) {
    let cluster = Arc::new(StaticClusterView::new("127.0.0.1:17030"));
    let node = DataNode::start(
        DataNodeConfig {
            local_addr: "127.0.0.1:17030".into(),
            disks: vec![(dir.to_path_buf(), 1 << 40)],
        },
        cluster,
    )
    .unwrap();
    node.space()
        .create_partition("vol1", 1, 1 << 30, "extent")
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&node);
    tokio::spawn(async move {
        serving.serve(listener).await;
    });
    (node, addr)
}

async fn roundtrip(conn: &mut TcpStream, pkt: &Packet) -> Packet {
    pkt.write_to(conn).await.unwrap();
    Packet::read_from(conn).await.unwrap()
}

#[tokio::test]
async fn test_create_write_read_over_wire() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    // Create extent 2 owned by inode 1000.
    let mut create = Packet::new_request(Opcode::CreateFile, StoreMode::Normal, 1, 2, 0);
    let ino_body = 1000u64.to_be_bytes().to_vec();
    let ino_crc = crc32(&ino_body);
    create.set_body(ino_body, ino_crc);
    let reply = roundtrip(&mut conn, &create).await;
    assert_eq!(reply.result_code, ResultCode::Ok, "{:?}", reply.data);

    // Creating the same extent again fails with ExistErr.
    let reply = roundtrip(&mut conn, &create).await;
    assert_eq!(reply.result_code, ResultCode::ExistErr);

    // Write one full block of 0xAA.
    let data = vec![0xAA; BLOCK_SIZE as usize];
    let data_crc = crc32(&data);
    let mut write = Packet::new_request(Opcode::Write, StoreMode::Normal, 1, 2, 0);
    write.set_body(data.clone(), data_crc);
    let reply = roundtrip(&mut conn, &write).await;
    assert_eq!(reply.result_code, ResultCode::Ok, "{:?}", reply.data);

    // Read it back; the reply carries the CRC of the bytes read.
    let mut read = Packet::new_request(Opcode::Read, StoreMode::Normal, 1, 2, 0);
    let size_body = BLOCK_SIZE.to_be_bytes().to_vec();
    let size_crc = crc32(&size_body);
    read.set_body(size_body, size_crc);
    let reply = roundtrip(&mut conn, &read).await;
    assert_eq!(reply.result_code, ResultCode::Ok);
    assert_eq!(reply.data, data);
    assert_eq!(reply.crc, data_crc);

    // The stored watermark reflects the write.
    let watermark = Packet::new_request(Opcode::GetWatermark, StoreMode::Normal, 1, 2, 0);
    let reply = roundtrip(&mut conn, &watermark).await;
    let info: ExtentInfo = serde_json::from_slice(&reply.data).unwrap();
    assert_eq!(info.size, BLOCK_SIZE);
    assert_eq!(info.inode, 1000);

    node.shutdown();
}

#[tokio::test]
async fn test_stream_read_chunks_with_independent_crcs() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let mut create = Packet::new_request(Opcode::CreateFile, StoreMode::Normal, 1, 2, 0);
    create.set_body(1u64.to_be_bytes().to_vec(), 0);
    create.crc = crc32(&create.data);
    roundtrip(&mut conn, &create).await;

    let data = vec![0x5C; BLOCK_SIZE as usize];
    let mut write = Packet::new_request(Opcode::Write, StoreMode::Normal, 1, 2, 0);
    let data_crc = crc32(&data);
    write.set_body(data.clone(), data_crc);
    roundtrip(&mut conn, &write).await;

    // Stream the block back: expect ceil(BLOCK_SIZE / READ_BLOCK_SIZE)
    // replies, each with its own CRC.
    let mut stream_read = Packet::new_request(Opcode::StreamRead, StoreMode::Normal, 1, 2, 0);
    let body = BLOCK_SIZE.to_be_bytes().to_vec();
    let body_crc = crc32(&body);
    stream_read.set_body(body, body_crc);
    stream_read.write_to(&mut conn).await.unwrap();

    let mut collected = Vec::new();
    let chunks = (BLOCK_SIZE + READ_BLOCK_SIZE - 1) / READ_BLOCK_SIZE;
    for _ in 0..chunks {
        let reply = Packet::read_from(&mut conn).await.unwrap();
        assert_eq!(reply.result_code, ResultCode::Ok);
        assert_eq!(reply.crc, crc32(&reply.data));
        collected.extend_from_slice(&reply.data);
    }
    assert_eq!(collected, data);

    node.shutdown();
}

#[tokio::test]
async fn test_mark_delete_then_reads_fail() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let mut create = Packet::new_request(Opcode::CreateFile, StoreMode::Normal, 1, 2, 0);
    create.set_body(1u64.to_be_bytes().to_vec(), 0);
    roundtrip(&mut conn, &create).await;

    let delete = Packet::new_request(Opcode::MarkDelete, StoreMode::Normal, 1, 2, 0);
    let reply = roundtrip(&mut conn, &delete).await;
    assert_eq!(reply.result_code, ResultCode::Ok);

    // Repeating the delete stays OK (idempotent).
    let reply = roundtrip(&mut conn, &delete).await;
    assert_eq!(reply.result_code, ResultCode::Ok);

    let watermark = Packet::new_request(Opcode::GetWatermark, StoreMode::Normal, 1, 2, 0);
    let reply = roundtrip(&mut conn, &watermark).await;
    assert_eq!(reply.result_code, ResultCode::NotExistErr);

    node.shutdown();
}

#[tokio::test]
async fn test_tiny_write_claims_extent_and_returns_location() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;

    // Make one tiny extent claimable.
    let partition = node.space().get_partition(1).unwrap();
    let tiny_id = partition.store().get_unavailable_tiny().unwrap();
    partition.store().put_tiny_available(tiny_id);

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let data = vec![0x42; 100];
    let data_crc = crc32(&data);
    let mut write = Packet::new_request(Opcode::Write, StoreMode::Tiny, 1, 0, 0);
    write.set_body(data, data_crc);
    let reply = roundtrip(&mut conn, &write).await;
    assert_eq!(reply.result_code, ResultCode::Ok, "{:?}", reply.data);
    assert_eq!(reply.extent_id, tiny_id);

    // The claim drained the available queue.
    assert_eq!(partition.store().available_tiny_len(), 0);
    let parked = partition.store().unavailable_tiny_len();

    // Closing the connection parks the claimed extent in the
    // unavailable queue.
    drop(conn);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(partition.store().unavailable_tiny_len(), parked + 1);

    node.shutdown();
}

#[tokio::test]
async fn test_heartbeat_task_reports_partitions() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let task = AdminTask {
        id: "hb1".into(),
        op_code: Opcode::DataNodeHeartbeat as u8,
        request: serde_json::json!({ "master_addr": "127.0.0.1:17010" }),
        response: None,
    };
    let mut heartbeat = Packet::new_request(Opcode::DataNodeHeartbeat, StoreMode::Normal, 0, 0, 0);
    let body = serde_json::to_vec(&task).unwrap();
    let body_crc = crc32(&body);
    heartbeat.set_body(body, body_crc);
    let reply = roundtrip(&mut conn, &heartbeat).await;
    assert_eq!(reply.result_code, ResultCode::Ok);

    let answered: AdminTask = serde_json::from_slice(&reply.data).unwrap();
    let response: HeartbeatResponse = serde_json::from_value(answered.response.unwrap()).unwrap();
    assert_eq!(response.status, TaskStatus::Success);
    assert_eq!(response.partition_reports.len(), 1);
    assert_eq!(response.partition_reports[0].partition_id, 1);

    node.shutdown();
}

#[tokio::test]
async fn test_unknown_partition_is_not_exist() {
    let dir = tempdir().unwrap();
    let (node, addr) = start_node(dir.path()).await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let mut read = Packet::new_request(Opcode::Read, StoreMode::Normal, 99, 2, 0);
    read.set_body(8u64.to_be_bytes().to_vec(), 0);
    let reply = roundtrip(&mut conn, &read).await;
    assert_eq!(reply.result_code, ResultCode::NotExistErr);

    node.shutdown();
}
