//! The leader-chained replication pipeline.
//!
//! Create, write, and mark-delete packets carry an ordered follower list.
//! The leader pushes the packet to every follower, executes the local
//! operation, then collects each follower's reply and matches it against
//! the packet identity (request id, partition, extent, offset, CRC,
//! size). There is no quorum: any follower failure surfaces to the
//! client as a packet-level error carrying every replica's message, and
//! the repair loop reconciles whatever landed.
//!
//! Normal-extent writes reuse one socket per
//! `(partition, extent, follower)` so a sequential stream of writes does
//! not re-dial; every other forwarded op takes a per-packet pooled
//! connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use tidefs_proto::{Opcode, Packet, ResultCode, StoreMode};
use tidefs_transport::ConnectPool;

#[cfg(test)]
use crate::error::DataNodeError;
use crate::error::DataNodeResult;

/// Deadline for one follower reply.
pub const REPLY_DEADLINE: Duration = Duration::from_secs(30);

/// Outcome of forwarding one packet to one follower.
#[derive(Debug)]
pub struct ReplicaAck {
    /// Follower address.
    pub addr: String,
    /// `Ok` on a matching OK reply; otherwise the follower's result code
    /// and message.
    pub result: Result<(), (ResultCode, String)>,
}

impl ReplicaAck {
    fn ok(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            result: Ok(()),
        }
    }

    fn failed(addr: &str, code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            addr: addr.to_string(),
            result: Err((code, message.into())),
        }
    }
}

enum ForwardConn {
    /// Keyed stable connection for normal-extent writes; returned to the
    /// map on success, dropped on failure.
    Keyed(String, TcpStream),
    /// Per-packet pooled connection.
    Pooled(TcpStream),
}

/// Forwards packets through the replica chain and collects acks.
pub struct ReplicationPipeline {
    pool: Arc<ConnectPool>,
    write_conns: Mutex<HashMap<String, TcpStream>>,
    sent_list: Mutex<VecDeque<u64>>,
}

impl ReplicationPipeline {
    /// Creates a pipeline on top of a connection pool.
    pub fn new(pool: Arc<ConnectPool>) -> Self {
        Self {
            pool,
            write_conns: Mutex::new(HashMap::new()),
            sent_list: Mutex::new(VecDeque::new()),
        }
    }

    fn conn_key(pkt: &Packet, addr: &str) -> String {
        format!("{}_{}_{}", pkt.partition_id, pkt.extent_id, addr)
    }

    fn uses_keyed_conn(pkt: &Packet) -> bool {
        pkt.store_mode == StoreMode::Normal && pkt.opcode == Opcode::Write
    }

    async fn acquire(&self, pkt: &Packet, addr: &str) -> DataNodeResult<ForwardConn> {
        if Self::uses_keyed_conn(pkt) {
            let key = Self::conn_key(pkt, addr);
            if let Some(conn) = self.write_conns.lock().await.remove(&key) {
                return Ok(ForwardConn::Keyed(key, conn));
            }
            let conn = self.pool.get(addr).await?;
            return Ok(ForwardConn::Keyed(key, conn));
        }
        Ok(ForwardConn::Pooled(self.pool.get(addr).await?))
    }

    async fn release(&self, addr: &str, conn: ForwardConn, failed: bool) {
        match conn {
            ForwardConn::Keyed(key, stream) => {
                if failed {
                    // Dropped; the next write re-dials.
                    debug!(key = %key, "keyed replication connection closed");
                } else {
                    self.write_conns.lock().await.insert(key, stream);
                }
            }
            ForwardConn::Pooled(stream) => {
                self.pool.put(addr, stream, failed).await;
            }
        }
    }

    /// Threads `pkt` through its follower list: pushes it downstream,
    /// runs the local operation, then collects and identity-checks every
    /// follower's reply. Returns the local result and one ack per
    /// follower, in replica order.
    pub async fn forward<F>(
        &self,
        pkt: &Packet,
        local: F,
    ) -> (DataNodeResult<()>, Vec<ReplicaAck>)
    where
        F: FnOnce() -> DataNodeResult<()>,
    {
        self.sent_list.lock().await.push_back(pkt.req_id);

        // Push the packet onto every follower first.
        let mut conns: Vec<(String, Option<ForwardConn>, Option<ReplicaAck>)> = Vec::new();
        let mut downstream = pkt.clone();
        downstream.next_addrs = Vec::new();
        downstream.remaining_followers = 0;
        for addr in &pkt.next_addrs {
            match self.acquire(pkt, addr).await {
                Ok(mut conn) => {
                    let stream = match &mut conn {
                        ForwardConn::Keyed(_, s) => s,
                        ForwardConn::Pooled(s) => s,
                    };
                    let pushed = downstream.write_to(stream).await;
                    match pushed {
                        Ok(()) => conns.push((addr.clone(), Some(conn), None)),
                        Err(e) => {
                            self.note_io_error(addr, &e).await;
                            self.release(addr, conn, true).await;
                            conns.push((
                                addr.clone(),
                                None,
                                Some(ReplicaAck::failed(addr, ResultCode::Err, e.to_string())),
                            ));
                        }
                    }
                }
                Err(e) => conns.push((
                    addr.clone(),
                    None,
                    Some(ReplicaAck::failed(addr, ResultCode::Again, e.to_string())),
                )),
            }
        }

        // Execute the local op while the followers work.
        let local_result = local();

        // Collect replies in replica order.
        let mut acks = Vec::with_capacity(conns.len());
        for (addr, conn, early_failure) in conns {
            if let Some(ack) = early_failure {
                acks.push(ack);
                continue;
            }
            let mut conn = conn.expect("connection present when no early failure");
            let stream = match &mut conn {
                ForwardConn::Keyed(_, s) => s,
                ForwardConn::Pooled(s) => s,
            };
            let awaited = timeout(REPLY_DEADLINE, Packet::read_from(stream)).await;
            let reply = match awaited {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    self.note_io_error(&addr, &e).await;
                    self.release(&addr, conn, true).await;
                    acks.push(ReplicaAck::failed(&addr, ResultCode::Err, e.to_string()));
                    continue;
                }
                Err(_) => {
                    self.release(&addr, conn, true).await;
                    acks.push(ReplicaAck::failed(
                        &addr,
                        ResultCode::Again,
                        "reply deadline exceeded",
                    ));
                    continue;
                }
            };

            if reply.is_error() {
                self.release(&addr, conn, true).await;
                acks.push(ReplicaAck::failed(
                    &addr,
                    reply.result_code,
                    String::from_utf8_lossy(&reply.data).into_owned(),
                ));
                continue;
            }
            if !pkt.matches_reply(&reply) {
                warn!(
                    addr = %addr,
                    request = %pkt.unique_id(),
                    reply = %reply.unique_id(),
                    "replica reply identity mismatch"
                );
                self.release(&addr, conn, true).await;
                acks.push(ReplicaAck::failed(
                    &addr,
                    ResultCode::ReplicaMismatch,
                    format!(
                        "reply identity mismatch: request crc {:#x} reply crc {:#x}",
                        pkt.crc, reply.crc
                    ),
                ));
                continue;
            }
            self.release(&addr, conn, false).await;
            acks.push(ReplicaAck::ok(&addr));
        }

        self.sent_list.lock().await.retain(|id| *id != pkt.req_id);
        (local_result, acks)
    }

    async fn note_io_error(&self, addr: &str, err: &tidefs_proto::ProtoError) {
        if let tidefs_proto::ProtoError::Io(io_err) = err {
            self.pool.check_error(addr, io_err).await;
        }
    }

    /// Composes the aggregated error body from the local result and the
    /// replica acks, ordered by replica, each entry carrying the action
    /// tag. Returns `None` when everything acked.
    pub fn aggregate_error(
        action: &str,
        local: &DataNodeResult<()>,
        acks: &[ReplicaAck],
    ) -> Option<(ResultCode, String)> {
        let mut parts = Vec::new();
        let mut code = ResultCode::Ok;
        if let Err(e) = local {
            code = e.result_code();
            parts.push(format!("{action} local: {e}"));
        }
        for ack in acks {
            if let Err((ack_code, message)) = &ack.result {
                if code == ResultCode::Ok {
                    code = *ack_code;
                }
                parts.push(format!("{action} {}: {}: {}", ack.addr, ack_code, message));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some((code, parts.join("; ")))
        }
    }

    /// Outstanding forwarded request ids.
    pub async fn pending(&self) -> usize {
        self.sent_list.lock().await.len()
    }

    /// Tears the pipeline down: drops every keyed write connection and
    /// clears the sent list. Called when the upstream connection closes.
    pub async fn teardown(&self) {
        self.write_conns.lock().await.clear();
        self.sent_list.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidefs_storage::crc32;
    use tidefs_transport::PoolConfig;
    use tokio::net::TcpListener;

    /// A fake follower answering every packet through `reply_fn`.
    async fn fake_follower<F>(reply_fn: F) -> String
    where
        F: Fn(&Packet) -> Packet + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                loop {
                    let Ok(request) = Packet::read_from(&mut sock).await else {
                        break;
                    };
                    let reply = reply_fn(&request);
                    if reply.write_to(&mut sock).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    fn pipeline() -> ReplicationPipeline {
        ReplicationPipeline::new(Arc::new(ConnectPool::new(PoolConfig {
            min_idle: 0,
            ..PoolConfig::default()
        })))
    }

    fn write_packet(followers: Vec<String>) -> Packet {
        let mut pkt = Packet::new_request(Opcode::Write, StoreMode::Normal, 1, 2, 0);
        let body = vec![0xAA; 4096];
        let crc = crc32(&body);
        pkt.set_body(body, crc);
        pkt.remaining_followers = followers.len() as u8;
        pkt.next_addrs = followers;
        pkt
    }

    #[tokio::test]
    async fn test_forward_all_ack() {
        let follower = fake_follower(|req| {
            let mut reply = Packet::new_reply(req);
            reply.pack_ok_reply();
            reply
        })
        .await;
        let pipeline = pipeline();
        let pkt = write_packet(vec![follower]);
        let (local, acks) = pipeline.forward(&pkt, || Ok(())).await;
        assert!(local.is_ok());
        assert_eq!(acks.len(), 1);
        assert!(acks[0].result.is_ok());
        assert!(ReplicationPipeline::aggregate_error("OpWrite", &local, &acks).is_none());
        assert_eq!(pipeline.pending().await, 0);
    }

    #[tokio::test]
    async fn test_forward_crc_mismatch_surfaces_per_replica() {
        // Follower replies with a divergent CRC; the leader must flag the
        // mismatch, drop the pooled connection, and return a non-OK
        // aggregated error naming the replica.
        let follower = fake_follower(|req| {
            let mut reply = Packet::new_reply(req);
            reply.pack_ok_reply();
            reply.crc = 0xBEEF;
            reply
        })
        .await;
        let pipeline = pipeline();
        let pkt = write_packet(vec![follower.clone()]);
        let (local, acks) = pipeline.forward(&pkt, || Ok(())).await;
        assert!(local.is_ok());
        assert_eq!(acks.len(), 1);
        let (code, _) = acks[0].result.as_ref().unwrap_err();
        assert_eq!(*code, ResultCode::ReplicaMismatch);

        let (code, body) =
            ReplicationPipeline::aggregate_error("OpWrite", &local, &acks).unwrap();
        assert_eq!(code, ResultCode::ReplicaMismatch);
        assert!(body.contains("OpWrite"));
        assert!(body.contains(&follower));

        // The failed keyed connection was not retained.
        assert!(pipeline.write_conns.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_forward_follower_error_aggregates() {
        let follower = fake_follower(|req| {
            let mut reply = Packet::new_reply(req);
            reply.pack_error_body(ResultCode::NoSpaceErr, "OpWrite", "partition full");
            reply
        })
        .await;
        let pipeline = pipeline();
        let pkt = write_packet(vec![follower]);
        let (local, acks) = pipeline.forward(&pkt, || Ok(())).await;
        let (code, body) =
            ReplicationPipeline::aggregate_error("OpWrite", &local, &acks).unwrap();
        assert_eq!(code, ResultCode::NoSpaceErr);
        assert!(body.contains("partition full"));
    }

    #[tokio::test]
    async fn test_local_failure_reported_first() {
        let follower = fake_follower(|req| {
            let mut reply = Packet::new_reply(req);
            reply.pack_ok_reply();
            reply
        })
        .await;
        let pipeline = pipeline();
        let pkt = write_packet(vec![follower]);
        let (local, acks) = pipeline
            .forward(&pkt, || Err(DataNodeError::NoSpace))
            .await;
        let (code, body) =
            ReplicationPipeline::aggregate_error("OpWrite", &local, &acks).unwrap();
        assert_eq!(code, ResultCode::NoSpaceErr);
        assert!(body.starts_with("OpWrite local:"));
    }

    #[tokio::test]
    async fn test_keyed_connection_reused_across_writes() {
        let follower = fake_follower(|req| {
            let mut reply = Packet::new_reply(req);
            reply.pack_ok_reply();
            reply
        })
        .await;
        let pipeline = pipeline();
        for _ in 0..3 {
            let pkt = write_packet(vec![follower.clone()]);
            let (_, acks) = pipeline.forward(&pkt, || Ok(())).await;
            assert!(acks[0].result.is_ok());
        }
        assert_eq!(pipeline.write_conns.lock().await.len(), 1);
        pipeline.teardown().await;
        assert!(pipeline.write_conns.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_follower_is_again() {
        let pipeline = pipeline();
        let pkt = write_packet(vec!["127.0.0.1:1".into()]);
        let (_, acks) = pipeline.forward(&pkt, || Ok(())).await;
        let (code, _) = acks[0].result.as_ref().unwrap_err();
        assert_eq!(*code, ResultCode::Again);
    }
}
