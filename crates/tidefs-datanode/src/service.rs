//! Packet service: the per-connection state machine dispatching every
//! data-tier opcode.
//!
//! Each accepted connection runs packets sequentially: read a frame,
//! execute, write the reply. Stream reads write their chunk replies
//! directly and the connection is closed on any I/O error mid-stream.
//! Connection teardown destroys the per-connection pipeline state and
//! parks every tiny extent the connection claimed back in the
//! unavailable queue.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use tidefs_proto::{
    AdminTask, CreateDataPartitionRequest, DeleteDataPartitionRequest, DeleteDataPartitionResponse,
    ExtentKey, HeartbeatRequest, HeartbeatResponse, LoadDataPartitionRequest, Opcode, Packet,
    StoreMode, TaskStatus,
};
use tidefs_storage::{crc32, stable_extent_filter, tiny_extent_filter};
use tidefs_transport::ConnectPool;

use crate::cluster::ClusterView;
use crate::error::{DataNodeError, DataNodeResult};
use crate::partition::DataPartition;
use crate::pipeline::ReplicationPipeline;
use crate::repair::MembersFileMetas;
use crate::space::SpaceManager;

/// Chunk size of stream-read replies.
pub const READ_BLOCK_SIZE: u64 = 64 * 1024;

/// Action tags packed into error reply bodies.
fn action_tag(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::CreateFile => "OpCreateFile",
        Opcode::Write => "OpWrite",
        Opcode::Read => "OpRead",
        Opcode::StreamRead => "OpStreamRead",
        Opcode::MarkDelete => "OpMarkDelete",
        Opcode::GetWatermark => "OpGetWatermark",
        Opcode::ExtentStoreGetAllWatermark => "OpGetAllWatermark",
        Opcode::NotifyExtentRepair => "OpNotifyExtentRepair",
        Opcode::CreateDataPartition => "OpCreateDataPartition",
        Opcode::LoadDataPartition => "OpLoadDataPartition",
        Opcode::DeleteDataPartition => "OpDeleteDataPartition",
        Opcode::DataNodeHeartbeat => "OpDataNodeHeartbeat",
        Opcode::GetDataPartitionMetrics => "OpGetDataPartitionMetrics",
        _ => "OpUnknown",
    }
}

/// The data node's packet dispatcher.
pub struct DataNodeService {
    space: Arc<SpaceManager>,
    pool: Arc<ConnectPool>,
    cluster: Arc<dyn ClusterView>,
}

impl DataNodeService {
    /// Creates a service over the node's space manager and pool.
    pub fn new(
        space: Arc<SpaceManager>,
        pool: Arc<ConnectPool>,
        cluster: Arc<dyn ClusterView>,
    ) -> Self {
        Self {
            space,
            pool,
            cluster,
        }
    }

    /// The node's space manager.
    pub fn space(&self) -> &Arc<SpaceManager> {
        &self.space
    }

    /// Runs one connection to completion.
    pub async fn serve_connection(&self, mut stream: TcpStream) {
        let pipeline = ReplicationPipeline::new(Arc::clone(&self.pool));
        let mut claimed_tiny: Vec<(u32, u64)> = Vec::new();
        loop {
            let mut pkt = match Packet::read_from(&mut stream).await {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!(error = %e, "connection drained");
                    break;
                }
            };
            if pkt.opcode == Opcode::StreamRead {
                if self.handle_stream_read(&mut pkt, &mut stream).await.is_err() {
                    break;
                }
                continue;
            }
            self.process_packet(&mut pkt, &pipeline, &mut claimed_tiny)
                .await;
            if pkt.write_to(&mut stream).await.is_err() {
                break;
            }
        }
        pipeline.teardown().await;
        for (partition_id, extent_id) in claimed_tiny {
            if let Some(partition) = self.space.get_partition(partition_id) {
                partition.store().put_tiny_unavailable(extent_id);
            }
        }
    }

    /// Executes one non-streaming packet, mutating it into its reply.
    pub async fn process_packet(
        &self,
        pkt: &mut Packet,
        pipeline: &ReplicationPipeline,
        claimed_tiny: &mut Vec<(u32, u64)>,
    ) {
        let opcode = pkt.opcode;
        let result = match opcode {
            Opcode::CreateFile => self.handle_create_file(pkt, pipeline).await,
            Opcode::Write => self.handle_write(pkt, pipeline, claimed_tiny).await,
            Opcode::Read => self.handle_read(pkt),
            Opcode::MarkDelete => self.handle_mark_delete(pkt, pipeline).await,
            Opcode::GetWatermark => self.handle_get_watermark(pkt),
            Opcode::ExtentStoreGetAllWatermark => self.handle_get_all_watermark(pkt),
            Opcode::NotifyExtentRepair => self.handle_notify_repair(pkt).await,
            Opcode::CreateDataPartition => self.handle_create_partition_task(pkt),
            Opcode::DeleteDataPartition => self.handle_delete_partition_task(pkt),
            Opcode::LoadDataPartition => self.handle_load_partition_task(pkt),
            Opcode::DataNodeHeartbeat => self.handle_heartbeat_task(pkt),
            Opcode::GetDataPartitionMetrics => self.handle_metrics(pkt),
            other => Err(DataNodeError::Proto(
                tidefs_proto::ProtoError::UnknownOpcode(other as u8),
            )),
        };
        if let Err(e) = result {
            warn!(op = %opcode, request = %pkt.unique_id(), error = %e, "packet failed");
            pkt.pack_error_body(e.result_code(), action_tag(opcode), &e.to_string());
        }
    }

    fn partition(&self, pkt: &Packet) -> DataNodeResult<Arc<DataPartition>> {
        self.space
            .get_partition(pkt.partition_id as u32)
            .ok_or(DataNodeError::PartitionNotFound(pkt.partition_id as u32))
    }

    fn pack_ok_json<T: serde::Serialize>(pkt: &mut Packet, value: &T) -> DataNodeResult<()> {
        let body = serde_json::to_vec(value)?;
        let crc = crc32(&body);
        pkt.pack_ok_with_body(body);
        pkt.crc = crc;
        Ok(())
    }

    async fn handle_create_file(
        &self,
        pkt: &mut Packet,
        pipeline: &ReplicationPipeline,
    ) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        partition.check_writable()?;
        let inode = if pkt.data.len() >= 8 {
            u64::from_be_bytes(pkt.data[..8].try_into().unwrap())
        } else {
            0
        };
        let extent_id = pkt.extent_id;
        if pkt.next_addrs.is_empty() {
            partition.store().create(extent_id, inode, false)?;
            pkt.pack_ok_reply();
            return Ok(());
        }
        let store = partition.store();
        let request = &*pkt;
        let (local, acks) = pipeline
            .forward(request, || {
                store.create(extent_id, inode, false)?;
                Ok(())
            })
            .await;
        match ReplicationPipeline::aggregate_error(action_tag(Opcode::CreateFile), &local, &acks) {
            None => pkt.pack_ok_reply(),
            Some((code, body)) => pkt.pack_error_body(code, action_tag(Opcode::CreateFile), &body),
        }
        Ok(())
    }

    async fn handle_write(
        &self,
        pkt: &mut Packet,
        pipeline: &ReplicationPipeline,
        claimed_tiny: &mut Vec<(u32, u64)>,
    ) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        partition.check_writable()?;

        // A tiny write without a target claims one from the pool; the
        // reply's extent id and offset tell the writer where it landed.
        if pkt.store_mode == StoreMode::Tiny && pkt.extent_id == 0 {
            let extent_id = partition.store().get_available_tiny()?;
            claimed_tiny.push((partition.id(), extent_id));
            pkt.extent_id = extent_id;
            pkt.offset = partition.store().get_watermark_for_write(extent_id)?;
        }

        let started = Instant::now();
        let store = partition.store();
        let request = &*pkt;
        let do_write = || {
            store
                .write(
                    request.extent_id,
                    request.offset,
                    request.data.len() as u64,
                    &request.data,
                    request.crc,
                )
                .map_err(DataNodeError::from)
        };

        let outcome = if pkt.next_addrs.is_empty() {
            let local = do_write();
            if let Err(e) = &local {
                if matches!(e, DataNodeError::Storage(tidefs_storage::StorageError::Io(_))) {
                    partition.disk().record_error(true);
                }
            }
            local.map(|_| None)
        } else {
            let (local, acks) = pipeline.forward(request, do_write).await;
            if matches!(
                &local,
                Err(DataNodeError::Storage(tidefs_storage::StorageError::Io(_)))
            ) {
                partition.disk().record_error(true);
            }
            Ok(ReplicationPipeline::aggregate_error(
                action_tag(Opcode::Write),
                &local,
                &acks,
            ))
        };

        partition
            .metrics()
            .add_write(started.elapsed().as_micros() as u64);

        match outcome? {
            None => pkt.pack_ok_reply(),
            Some((code, body)) => pkt.pack_error_body(code, action_tag(Opcode::Write), &body),
        }
        Ok(())
    }

    fn handle_read(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        if pkt.data.len() < 8 {
            return Err(DataNodeError::Storage(
                tidefs_storage::StorageError::ParamMismatch {
                    offset: pkt.offset,
                    size: 0,
                },
            ));
        }
        let size = u64::from_be_bytes(pkt.data[..8].try_into().unwrap());
        let started = Instant::now();
        let mut buf = vec![0u8; size as usize];
        let crc = partition
            .store()
            .read(pkt.extent_id, pkt.offset, size, &mut buf)
            .map_err(|e| {
                if matches!(e, tidefs_storage::StorageError::Io(_)) {
                    partition.disk().record_error(false);
                }
                e
            })?;
        partition
            .metrics()
            .add_read(started.elapsed().as_micros() as u64);
        pkt.pack_ok_with_body(buf);
        pkt.crc = crc;
        Ok(())
    }

    /// Streams a large read as independent chunk replies, each carrying
    /// its own CRC. Returns `Err` when the connection must be closed.
    pub async fn handle_stream_read(
        &self,
        pkt: &mut Packet,
        stream: &mut TcpStream,
    ) -> Result<(), ()> {
        let partition = match self.partition(pkt) {
            Ok(p) => p,
            Err(e) => {
                pkt.pack_error_body(e.result_code(), action_tag(Opcode::StreamRead), &e.to_string());
                return pkt.write_to(stream).await.map_err(|_| ());
            }
        };
        let total = if pkt.data.len() >= 8 {
            u64::from_be_bytes(pkt.data[..8].try_into().unwrap())
        } else {
            0
        };
        let mut offset = pkt.offset;
        let mut remaining = total;
        while remaining > 0 {
            let chunk = remaining.min(READ_BLOCK_SIZE);
            let mut buf = vec![0u8; chunk as usize];
            match partition.store().read(pkt.extent_id, offset, chunk, &mut buf) {
                Ok(crc) => {
                    let mut reply = Packet::new_reply(pkt);
                    reply.offset = offset;
                    reply.set_body(buf, crc);
                    if reply.write_to(stream).await.is_err() {
                        return Err(());
                    }
                }
                Err(e) => {
                    partition.disk().record_error(false);
                    let mut reply = Packet::new_reply(pkt);
                    reply.offset = offset;
                    reply.pack_error_body(
                        DataNodeError::from(e).result_code(),
                        action_tag(Opcode::StreamRead),
                        "stream read failed",
                    );
                    let _ = reply.write_to(stream).await;
                    // Any stream I/O error closes the connection.
                    return Err(());
                }
            }
            offset += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    async fn handle_mark_delete(
        &self,
        pkt: &mut Packet,
        pipeline: &ReplicationPipeline,
    ) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        let (offset, size) = if pkt.store_mode == StoreMode::Tiny {
            let key: ExtentKey = serde_json::from_slice(&pkt.data)?;
            (key.extent_offset, key.size as u64)
        } else {
            (0, 0)
        };
        let extent_id = pkt.extent_id;
        let store = partition.store();
        if pkt.next_addrs.is_empty() {
            store.mark_delete(extent_id, offset, size)?;
            pkt.pack_ok_reply();
            return Ok(());
        }
        let request = &*pkt;
        let (local, acks) = pipeline
            .forward(request, || {
                store.mark_delete(extent_id, offset, size)?;
                Ok(())
            })
            .await;
        match ReplicationPipeline::aggregate_error(action_tag(Opcode::MarkDelete), &local, &acks) {
            None => pkt.pack_ok_reply(),
            Some((code, body)) => pkt.pack_error_body(code, action_tag(Opcode::MarkDelete), &body),
        }
        Ok(())
    }

    fn handle_get_watermark(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        let info = partition.store().get_watermark(pkt.extent_id, false)?;
        Self::pack_ok_json(pkt, &info)
    }

    fn handle_get_all_watermark(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        let infos = match pkt.store_mode {
            StoreMode::Normal => partition
                .store()
                .get_all_watermark(Some(&stable_extent_filter())),
            StoreMode::Tiny => {
                let ids: Vec<u64> = serde_json::from_slice(&pkt.data)?;
                partition
                    .store()
                    .get_all_watermark(Some(&tiny_extent_filter(ids)))
            }
        };
        Self::pack_ok_json(pkt, &infos)
    }

    async fn handle_notify_repair(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        let metas: MembersFileMetas = serde_json::from_slice(&pkt.data)?;
        partition.merge_repair(metas, &self.pool).await;
        pkt.pack_ok_reply();
        Ok(())
    }

    fn handle_create_partition_task(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let mut task: AdminTask = serde_json::from_slice(&pkt.data)?;
        let request: CreateDataPartitionRequest =
            task.decode_request(Opcode::CreateDataPartition)?;
        self.space.create_partition(
            &request.volume_id,
            request.partition_id,
            request.partition_size,
            &request.partition_type,
        )?;
        task.set_response(&TaskStatus::Success)?;
        Self::pack_ok_json(pkt, &task)
    }

    fn handle_delete_partition_task(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let mut task: AdminTask = serde_json::from_slice(&pkt.data)?;
        let request: DeleteDataPartitionRequest =
            task.decode_request(Opcode::DeleteDataPartition)?;
        let response = match self.space.delete_partition(request.partition_id) {
            Ok(()) => DeleteDataPartitionResponse {
                partition_id: request.partition_id as u64,
                status: TaskStatus::Success,
                result: String::new(),
            },
            Err(e) => DeleteDataPartitionResponse {
                partition_id: request.partition_id as u64,
                status: TaskStatus::Failed,
                result: e.to_string(),
            },
        };
        task.set_response(&response)?;
        Self::pack_ok_json(pkt, &task)
    }

    fn handle_load_partition_task(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let mut task: AdminTask = serde_json::from_slice(&pkt.data)?;
        let request: LoadDataPartitionRequest = task.decode_request(Opcode::LoadDataPartition)?;
        let response = match self.space.get_partition(request.partition_id) {
            Some(partition) => partition.load_response(),
            None => tidefs_proto::LoadDataPartitionResponse {
                partition_id: request.partition_id as u64,
                partition_status: 0,
                used: 0,
                partition_snapshot: Vec::new(),
                status: TaskStatus::Failed,
                result: format!("data partition {} not found", request.partition_id),
            },
        };
        task.set_response(&response)?;
        Self::pack_ok_json(pkt, &task)
    }

    fn handle_heartbeat_task(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let mut task: AdminTask = serde_json::from_slice(&pkt.data)?;
        let _request: HeartbeatRequest = task.decode_request(Opcode::DataNodeHeartbeat)?;
        let (total, used) = self.space.totals();
        let response = HeartbeatResponse {
            total,
            used,
            partition_reports: self.space.partition_reports(),
            status: TaskStatus::Success,
            result: String::new(),
        };
        task.set_response(&response)?;
        Self::pack_ok_json(pkt, &task)
    }

    fn handle_metrics(&self, pkt: &mut Packet) -> DataNodeResult<()> {
        let partition = self.partition(pkt)?;
        let snapshot = partition.metrics().snapshot();
        Self::pack_ok_json(pkt, &snapshot)
    }

    /// Cluster view this service resolves replica sets through.
    pub fn cluster(&self) -> &Arc<dyn ClusterView> {
        &self.cluster
    }
}
