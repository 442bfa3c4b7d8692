//! Leader-driven extent repair.
//!
//! On each repair tick the leader refreshes its replica set, gathers
//! watermarks from itself and every follower, computes the three task
//! sets (delete, add, fix-size), and pushes them to the followers, which
//! apply them by deleting, creating, and stream-pulling missing tails
//! from the leader.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tidefs_proto::{is_tiny_extent, Opcode, Packet, StoreMode};
use tidefs_storage::{crc32, ExtentInfo};
use tidefs_transport::ConnectPool;

use crate::cluster::ClusterView;
use crate::error::{DataNodeError, DataNodeResult};
use crate::partition::{DataPartition, PartitionStatus};

/// Concurrent stream-fix workers per repair pass.
pub const SIMULTANEOUSLY_RECOVER_FILES: usize = 7;

/// Deadline for a single repair RPC.
pub const REPAIR_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Repair task sets pushed from the leader to one follower.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembersFileMetas {
    /// Extent ids present on the follower but not the leader.
    pub need_delete: Vec<u64>,
    /// Extents present on the leader but missing on the follower; the
    /// `source` field names the host to pull from.
    pub need_add: Vec<ExtentInfo>,
    /// Extents present on both with divergent sizes.
    pub need_fix_size: Vec<ExtentInfo>,
}

impl MembersFileMetas {
    /// Whether there is nothing to repair.
    pub fn is_empty(&self) -> bool {
        self.need_delete.is_empty() && self.need_add.is_empty() && self.need_fix_size.is_empty()
    }
}

/// Computes one follower's repair task sets from the leader's and the
/// follower's stable watermarks. Tiny extents never appear in the delete
/// or add sets.
pub fn compute_repair_tasks(
    leader: &[ExtentInfo],
    follower: &[ExtentInfo],
    leader_addr: &str,
) -> MembersFileMetas {
    let mut metas = MembersFileMetas::default();
    for follower_info in follower {
        if is_tiny_extent(follower_info.extent_id) {
            continue;
        }
        if !leader.iter().any(|l| l.extent_id == follower_info.extent_id) {
            metas.need_delete.push(follower_info.extent_id);
        }
    }
    for leader_info in leader {
        if is_tiny_extent(leader_info.extent_id) {
            continue;
        }
        match follower
            .iter()
            .find(|f| f.extent_id == leader_info.extent_id)
        {
            None => {
                let mut task = leader_info.clone();
                task.source = leader_addr.to_string();
                metas.need_add.push(task);
            }
            Some(follower_info) if follower_info.size < leader_info.size => {
                let mut task = leader_info.clone();
                task.source = leader_addr.to_string();
                metas.need_fix_size.push(task);
            }
            Some(_) => {}
        }
    }
    metas
}

/// One leader repair pass over a partition. Skipped outright when the
/// partition is unavailable or this replica is not the leader.
pub async fn launch_repair(
    partition: &Arc<DataPartition>,
    view: &dyn ClusterView,
    pool: &Arc<ConnectPool>,
) -> DataNodeResult<()> {
    if partition.status() == PartitionStatus::Unavailable {
        return Ok(());
    }
    partition.update_replica_hosts(view)?;
    if !partition.is_leader() {
        return Ok(());
    }
    let leader_watermarks = partition.all_watermarks();
    let local_addr = view.local_addr();
    let hosts = partition.replica_hosts();
    for follower in hosts.iter().skip(1) {
        let follower_watermarks =
            match fetch_follower_watermarks(pool, follower, partition.id()).await {
                Ok(w) => w,
                Err(e) => {
                    warn!(partition_id = partition.id(), follower = %follower, error = %e, "watermark fetch failed");
                    continue;
                }
            };
        let metas = compute_repair_tasks(&leader_watermarks, &follower_watermarks, &local_addr);
        if metas.is_empty() {
            continue;
        }
        info!(
            partition_id = partition.id(),
            follower = %follower,
            delete = metas.need_delete.len(),
            add = metas.need_add.len(),
            fix = metas.need_fix_size.len(),
            "repair tasks issued"
        );
        if let Err(e) = notify_repair(pool, follower, partition.id(), &metas).await {
            warn!(partition_id = partition.id(), follower = %follower, error = %e, "repair notify failed");
        }
    }
    Ok(())
}

/// Fetches one follower's stable watermarks.
pub async fn fetch_follower_watermarks(
    pool: &Arc<ConnectPool>,
    addr: &str,
    partition_id: u32,
) -> DataNodeResult<Vec<ExtentInfo>> {
    let request = Packet::new_request(
        Opcode::ExtentStoreGetAllWatermark,
        StoreMode::Normal,
        partition_id as u64,
        0,
        0,
    );
    let reply = roundtrip(pool, addr, &request).await?;
    if reply.is_error() {
        return Err(DataNodeError::ReplicaFailed {
            addr: addr.to_string(),
            code: reply.result_code,
            message: String::from_utf8_lossy(&reply.data).into_owned(),
        });
    }
    Ok(serde_json::from_slice(&reply.data)?)
}

/// Pushes a repair task set to one follower.
pub async fn notify_repair(
    pool: &Arc<ConnectPool>,
    addr: &str,
    partition_id: u32,
    metas: &MembersFileMetas,
) -> DataNodeResult<()> {
    let mut request = Packet::new_request(
        Opcode::NotifyExtentRepair,
        StoreMode::Normal,
        partition_id as u64,
        0,
        0,
    );
    let body = serde_json::to_vec(metas)?;
    let crc = crc32(&body);
    request.set_body(body, crc);
    let reply = roundtrip(pool, addr, &request).await?;
    if reply.is_error() {
        return Err(DataNodeError::ReplicaFailed {
            addr: addr.to_string(),
            code: reply.result_code,
            message: String::from_utf8_lossy(&reply.data).into_owned(),
        });
    }
    Ok(())
}

async fn roundtrip(
    pool: &Arc<ConnectPool>,
    addr: &str,
    request: &Packet,
) -> DataNodeResult<Packet> {
    let mut conn = pool.get(addr).await?;
    let result = timeout(REPAIR_RPC_DEADLINE, async {
        request.write_to(&mut conn).await?;
        Packet::read_from(&mut conn).await
    })
    .await;
    match result {
        Ok(Ok(reply)) => {
            pool.put(addr, conn, false).await;
            Ok(reply)
        }
        Ok(Err(e)) => {
            if let tidefs_proto::ProtoError::Io(io_err) = &e {
                pool.check_error(addr, io_err).await;
            }
            pool.put(addr, conn, true).await;
            Err(e.into())
        }
        Err(_) => {
            pool.put(addr, conn, true).await;
            Err(DataNodeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("repair rpc to {addr} timed out"),
            )))
        }
    }
}

impl DataPartition {
    /// Applies a repair task set on a follower: deletes strays, creates
    /// missing extents, then stream-pulls divergent tails with at most
    /// [`SIMULTANEOUSLY_RECOVER_FILES`] concurrent workers.
    pub async fn merge_repair(
        self: &Arc<Self>,
        metas: MembersFileMetas,
        pool: &Arc<ConnectPool>,
    ) {
        let store = self.store();
        for extent_id in &metas.need_delete {
            if is_tiny_extent(*extent_id) {
                continue;
            }
            if let Err(e) = store.mark_delete(*extent_id, 0, 0) {
                warn!(extent_id, error = %e, "repair delete failed");
            }
        }

        let mut fix_tasks = metas.need_fix_size;
        for add in metas.need_add {
            if is_tiny_extent(add.extent_id) {
                continue;
            }
            if !store.is_extent_exist(add.extent_id) {
                if let Err(e) = store.create(add.extent_id, add.inode, false) {
                    warn!(extent_id = add.extent_id, error = %e, "repair create failed");
                    continue;
                }
            }
            fix_tasks.push(add);
        }

        for chunk in fix_tasks.chunks(SIMULTANEOUSLY_RECOVER_FILES) {
            let mut joins = Vec::with_capacity(chunk.len());
            for fix in chunk {
                let partition = Arc::clone(self);
                let pool = Arc::clone(pool);
                let fix = fix.clone();
                joins.push(tokio::spawn(async move {
                    if let Err(e) = partition.stream_fix_extent(&fix, &pool).await {
                        warn!(
                            extent_id = fix.extent_id,
                            source = %fix.source,
                            error = %e,
                            "stream repair failed"
                        );
                    }
                }));
            }
            for join in joins {
                let _ = join.await;
            }
        }
    }

    /// Pulls the missing tail of one extent from its repair source.
    pub async fn stream_fix_extent(
        self: &Arc<Self>,
        fix: &ExtentInfo,
        pool: &Arc<ConnectPool>,
    ) -> DataNodeResult<()> {
        let store = self.store();
        if !store.is_extent_exist(fix.extent_id) {
            return Ok(());
        }
        let local_size = store.get_watermark(fix.extent_id, true)?.size;
        if local_size >= fix.size {
            return Ok(());
        }
        let mut need = fix.size - local_size;
        let mut offset = local_size;

        let mut request = Packet::new_request(
            Opcode::StreamRead,
            if is_tiny_extent(fix.extent_id) {
                StoreMode::Tiny
            } else {
                StoreMode::Normal
            },
            self.id() as u64,
            fix.extent_id,
            offset,
        );
        let body = need.to_be_bytes().to_vec();
        let body_crc = crc32(&body);
        request.set_body(body, body_crc);

        let mut conn = pool.get(&fix.source).await?;
        let result: DataNodeResult<()> = async {
            request.write_to(&mut conn).await?;
            while need > 0 {
                let reply = timeout(REPAIR_RPC_DEADLINE, Packet::read_from(&mut conn))
                    .await
                    .map_err(|_| {
                        DataNodeError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "stream repair read timed out",
                        ))
                    })??;
                if reply.is_error() {
                    return Err(DataNodeError::ReplicaFailed {
                        addr: fix.source.clone(),
                        code: reply.result_code,
                        message: String::from_utf8_lossy(&reply.data).into_owned(),
                    });
                }
                if crc32(&reply.data) != reply.crc {
                    return Err(DataNodeError::ReplicaMismatch {
                        addr: fix.source.clone(),
                        req_id: reply.req_id,
                    });
                }
                let size = reply.data.len() as u64;
                if is_tiny_extent(fix.extent_id) {
                    store.write_tiny_recover(fix.extent_id, reply.offset, size, &reply.data)?;
                } else {
                    store.write(fix.extent_id, reply.offset, size, &reply.data, reply.crc)?;
                }
                offset += size;
                need = need.saturating_sub(size);
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                pool.put(&fix.source, conn, false).await;
                debug!(
                    extent_id = fix.extent_id,
                    from = local_size,
                    to = offset,
                    "stream repair complete"
                );
                Ok(())
            }
            Err(e) => {
                match &e {
                    DataNodeError::Proto(tidefs_proto::ProtoError::Io(io_err)) => {
                        pool.check_error(&fix.source, io_err).await;
                    }
                    DataNodeError::Io(io_err) => {
                        pool.check_error(&fix.source, io_err).await;
                    }
                    _ => {}
                }
                pool.put(&fix.source, conn, true).await;
                Err(e)
            }
        }
    }
}
