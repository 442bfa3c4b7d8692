//! Asynchronous orphan reclamation.
//!
//! Two paced workers per meta partition. On the leader, the deletion
//! worker drains the free list in batches: every extent key of a popped
//! inode becomes a `MarkDelete` RPC to the owning data partition's
//! leader; inodes whose keys all land are committed out of the inode
//! tree through one replicated command, and partial failures re-queue
//! the inode carrying only the keys that remain. On followers, the
//! audit worker keeps the free list coherent with applied state without
//! performing RPCs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use tidefs_proto::{crc32, is_tiny_extent, ExtentKey, Opcode, Packet, StoreMode};
use tidefs_transport::ConnectPool;

use crate::error::{MetaError, MetaResult};
use crate::fsm::MetaOp;
use crate::inode::Inode;
use crate::partition::MetaPartition;
use crate::view::DataPartitionView;

/// Cadence of the leader deletion worker.
pub const ASYNC_DELETE_INTERVAL: Duration = Duration::from_secs(10);
/// Cadence of the follower free-list audit.
pub const FREELIST_AUDIT_INTERVAL: Duration = Duration::from_secs(1);
/// Inodes drained per worker pass.
pub const BATCH_COUNT: usize = 100;
/// Deadline for one delete RPC.
pub const DELETE_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Delivers one extent-key delete to the data tier.
#[async_trait]
pub trait ExtentDeleter: Send + Sync {
    /// Sends `MarkDelete` for one key to the owning partition's leader.
    async fn delete(&self, key: &ExtentKey) -> MetaResult<()>;
}

/// TCP deleter: resolves the owning data partition's leader through the
/// data view and drives a pooled connection.
pub struct TcpExtentDeleter {
    pool: Arc<ConnectPool>,
    view: Arc<dyn DataPartitionView>,
}

impl TcpExtentDeleter {
    /// Creates a deleter over a pool and a data-partition view.
    pub fn new(pool: Arc<ConnectPool>, view: Arc<dyn DataPartitionView>) -> Self {
        Self { pool, view }
    }

    fn build_packet(key: &ExtentKey) -> MetaResult<Packet> {
        let mut packet = Packet::new_request(
            Opcode::MarkDelete,
            if is_tiny_extent(key.extent_id) {
                StoreMode::Tiny
            } else {
                StoreMode::Normal
            },
            key.partition_id as u64,
            key.extent_id,
            key.extent_offset,
        );
        if is_tiny_extent(key.extent_id) {
            let body = serde_json::to_vec(key)?;
            let crc = crc32(&body);
            packet.set_body(body, crc);
        }
        Ok(packet)
    }
}

#[async_trait]
impl ExtentDeleter for TcpExtentDeleter {
    async fn delete(&self, key: &ExtentKey) -> MetaResult<()> {
        let hosts = self
            .view
            .partition_hosts(key.partition_id)
            .ok_or_else(|| {
                MetaError::Again(format!("unknown data partition {}", key.partition_id))
            })?;
        let leader = hosts
            .first()
            .ok_or_else(|| MetaError::Again(format!("empty host list for {}", key.partition_id)))?
            .clone();

        let packet = Self::build_packet(key)?;
        let mut conn = self.pool.get(&leader).await?;
        let result = timeout(DELETE_RPC_DEADLINE, async {
            packet.write_to(&mut conn).await?;
            Packet::read_from(&mut conn).await
        })
        .await;
        match result {
            Ok(Ok(reply)) => {
                self.pool.put(&leader, conn, false).await;
                if reply.is_error() {
                    return Err(MetaError::Again(format!(
                        "delete {key} rejected: {}: {}",
                        reply.result_code,
                        String::from_utf8_lossy(&reply.data)
                    )));
                }
                debug!(%key, leader = %leader, "extent delete accepted");
                Ok(())
            }
            Ok(Err(e)) => {
                if let tidefs_proto::ProtoError::Io(io_err) = &e {
                    self.pool.check_error(&leader, io_err).await;
                }
                self.pool.put(&leader, conn, true).await;
                Err(e.into())
            }
            Err(_) => {
                self.pool.put(&leader, conn, true).await;
                Err(MetaError::Again(format!("delete {key} timed out")))
            }
        }
    }
}

/// One leader pass: drains up to [`BATCH_COUNT`] inodes, issues their
/// extent deletes, re-queues partial failures, and commits the fully
/// reclaimed ones through the log.
pub async fn delete_worker_pass(
    partition: &Arc<MetaPartition>,
    deleter: &Arc<dyn ExtentDeleter>,
) -> MetaResult<usize> {
    let mut batch = Vec::with_capacity(BATCH_COUNT);
    while batch.len() < BATCH_COUNT {
        let Some(inode) = partition.free_list().pop() else {
            break;
        };
        batch.push(inode);
    }
    if batch.is_empty() {
        return Ok(0);
    }

    let mut committable: Vec<Inode> = Vec::with_capacity(batch.len());
    for inode in batch {
        let mut remaining: Vec<ExtentKey> = Vec::new();
        for key in &inode.extents {
            if let Err(e) = deleter.delete(key).await {
                warn!(inode = inode.inode, %key, error = %e, "extent delete failed");
                remaining.push(*key);
            }
        }
        if remaining.is_empty() {
            committable.push(inode);
        } else {
            let mut retry = inode.clone();
            retry.extents = remaining;
            partition.free_list().push(retry);
        }
    }

    if committable.is_empty() {
        return Ok(0);
    }
    let mut packed = Vec::with_capacity(8 * committable.len());
    for inode in &committable {
        packed.extend_from_slice(&inode.inode.to_be_bytes());
    }
    match partition.submit(MetaOp::InternalDeleteInode, packed) {
        Ok(_) => {
            debug!(count = committable.len(), "reclaimed inodes committed");
            Ok(committable.len())
        }
        Err(e) => {
            // The commit failed; nothing was removed, so everything goes
            // back on the queue for the next pass.
            for inode in committable {
                partition.free_list().push(inode);
            }
            Err(e)
        }
    }
}

/// One follower pass: pops a batch and re-queues whatever still exists
/// in the tree, dropping entries whose removal has already applied.
pub fn freelist_audit_pass(partition: &Arc<MetaPartition>) -> MetaResult<usize> {
    let mut audited = 0;
    let mut batch = Vec::with_capacity(BATCH_COUNT);
    while batch.len() < BATCH_COUNT {
        let Some(inode) = partition.free_list().pop() else {
            break;
        };
        batch.push(inode);
    }
    for inode in batch {
        if partition.has_inode(inode.inode)? {
            partition.free_list().push(inode);
        } else {
            audited += 1;
        }
    }
    Ok(audited)
}

/// Spawns both reclamation workers for a partition; each selects on the
/// stop signal.
pub fn start_free_list_workers(
    partition: Arc<MetaPartition>,
    deleter: Arc<dyn ExtentDeleter>,
    stop: watch::Receiver<bool>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let delete_partition = Arc::clone(&partition);
    let mut delete_stop = stop.clone();
    let delete_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ASYNC_DELETE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !delete_partition.is_leader() {
                        continue;
                    }
                    if let Err(e) = delete_worker_pass(&delete_partition, &deleter).await {
                        warn!(partition_id = delete_partition.id(), error = %e, "delete pass failed");
                    }
                }
                res = delete_stop.changed() => {
                    if res.is_err() || *delete_stop.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let audit_partition = partition;
    let mut audit_stop = stop;
    let audit_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FREELIST_AUDIT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if audit_partition.is_leader() {
                        continue;
                    }
                    if let Err(e) = freelist_audit_pass(&audit_partition) {
                        warn!(partition_id = audit_partition.id(), error = %e, "freelist audit failed");
                    }
                }
                res = audit_stop.changed() => {
                    if res.is_err() || *audit_stop.borrow() {
                        return;
                    }
                }
            }
        }
    });
    (delete_handle, audit_handle)
}
