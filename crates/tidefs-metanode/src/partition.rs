//! Meta partitions: a replicated ordered keyspace `[start, end)` of
//! inode ids, holding the inode, dentry, extended-attribute, and
//! multipart trees, all mutated through the replicated log.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tidefs_proto::{crc32, MODE_DIR};

use crate::error::{MetaError, MetaResult};
use crate::free_list::FreeList;
use crate::fsm::{FsmResponse, MetaItem, MetaOp};
use crate::inode::Inode;
use crate::kvstore::KvBackend;
use crate::raft::ReplicatedLog;
use crate::tree::{
    DentryTree, ExtendTree, InodeTree, MemoryBackend, MultipartTree, TreeBackend,
};

/// Partition config file name under the partition directory.
pub const META_FILE: &str = "meta";
/// Store-snapshot directory name.
pub const SNAPSHOT_DIR: &str = "snapshot";
const SNAPSHOT_TMP_DIR: &str = ".snapshot_tmp";
const SNAPSHOT_BACKUP_DIR: &str = ".snapshot_backup";
/// Per-tree CRC sidecar inside a snapshot directory.
pub const SNAPSHOT_SIGN_FILE: &str = ".sign";
/// Prefix stamped onto partition directories the cluster no longer owns.
pub const EXPIRED_PARTITION_PREFIX: &str = "expired_";
/// Inode headroom granted above the max allocated id when a partition
/// splits at its range ceiling.
pub const PARTITION_INODE_ID_STEP: u64 = 1 << 24;

const SNAPSHOT_TREE_FILES: [&str; 4] = ["inode", "dentry", "extend", "multipart"];
const SNAPSHOT_APPLY_FILE: &str = "applyid";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Tree persistence backend selector, per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreType {
    /// In-memory ordered trees flushed wholesale by the store snapshot.
    #[default]
    Memory,
    /// Embedded key-value store with its own WAL and checkpointing.
    Kv,
}

/// One consensus group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Node id.
    pub id: u64,
    /// Node address.
    pub addr: String,
}

/// One non-voting group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learner {
    /// Node id.
    pub id: u64,
    /// Node address.
    pub addr: String,
}

/// Configuration a meta partition is created from and persists in its
/// `meta` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPartitionConfig {
    /// Partition id; doubles as the consensus group id.
    pub partition_id: u64,
    /// Volume name.
    pub vol_name: String,
    /// Minimal inode id of the range (inclusive).
    pub start: u64,
    /// Maximal inode id of the range (exclusive).
    pub end: u64,
    /// Consensus members.
    pub peers: Vec<Peer>,
    /// Non-voting members.
    #[serde(default)]
    pub learners: Vec<Learner>,
    /// Tree backend selector.
    #[serde(default)]
    pub store_type: StoreType,
    /// This node's id within the peer set.
    #[serde(skip)]
    pub node_id: u64,
    /// Partition directory.
    #[serde(skip)]
    pub root_dir: PathBuf,
}

impl MetaPartitionConfig {
    /// Validates the configuration.
    pub fn check(&self) -> MetaResult<()> {
        if self.partition_id == 0 {
            return Err(MetaError::ConfigInvalid(
                "partition id must be at least 1".into(),
            ));
        }
        if self.end <= self.start {
            return Err(MetaError::ConfigInvalid(format!(
                "end={} start={}; end must exceed start",
                self.end, self.start
            )));
        }
        if self.peers.is_empty() {
            return Err(MetaError::ConfigInvalid("must have peers".into()));
        }
        Ok(())
    }

    /// Orders peers by node id, keeping persisted configs canonical.
    pub fn sort_peers(&mut self) {
        self.peers.sort_by_key(|p| p.id);
    }
}

/// A replicated metadata keyspace.
pub struct MetaPartition {
    config: RwLock<MetaPartitionConfig>,
    cursor: AtomicU64,
    end: AtomicU64,
    apply_id: AtomicU64,
    pending_applies: AtomicU64,
    store_ticks_enabled: AtomicBool,
    pub(crate) inodes: InodeTree,
    pub(crate) dentries: DentryTree,
    pub(crate) extends: ExtendTree,
    pub(crate) multiparts: MultipartTree,
    pub(crate) free_list: FreeList,
    log: RwLock<Option<Arc<dyn ReplicatedLog>>>,
}

impl MetaPartition {
    /// Builds a partition from its configuration, creating the partition
    /// directory and trees (loading whatever the KV backend holds).
    pub fn new(mut config: MetaPartitionConfig) -> MetaResult<Arc<Self>> {
        config.check()?;
        config.sort_peers();
        fs::create_dir_all(&config.root_dir)?;

        let make_backend = |name: &str| -> MetaResult<Arc<dyn TreeBackend>> {
            Ok(match config.store_type {
                StoreType::Memory => Arc::new(MemoryBackend::new()),
                StoreType::Kv => Arc::new(KvBackend::open(&config.root_dir.join("kv").join(name))?),
            })
        };
        let inode_backend = make_backend("inode")?;
        let dentry_backend = make_backend("dentry")?;
        let extend_backend = make_backend("extend")?;
        let multipart_backend = make_backend("multipart")?;

        let partition = Arc::new(Self {
            cursor: AtomicU64::new(config.start),
            end: AtomicU64::new(config.end),
            apply_id: AtomicU64::new(0),
            pending_applies: AtomicU64::new(0),
            store_ticks_enabled: AtomicBool::new(false),
            inodes: InodeTree::new(inode_backend),
            dentries: DentryTree::new(dentry_backend),
            extends: ExtendTree::new(extend_backend),
            multiparts: MultipartTree::new(multipart_backend),
            free_list: FreeList::new(),
            log: RwLock::new(None),
            config: RwLock::new(config),
        });

        if partition.store_type() == StoreType::Kv {
            // The KV backend recovered itself; derive apply id and cursor
            // from what it holds.
            let apply_id = partition.inodes.backend().get_apply_id();
            partition.apply_id.store(apply_id, Ordering::SeqCst);
            let max_inode = partition.inodes.max_inode()?;
            if max_inode > partition.cursor.load(Ordering::SeqCst) {
                partition.cursor.store(max_inode, Ordering::SeqCst);
            }
        } else {
            partition.load_store_snapshot()?;
        }
        partition.rebuild_free_list()?;
        Ok(partition)
    }

    /// Loads a partition from an existing directory's `meta` file.
    pub fn load(root_dir: &Path, node_id: u64) -> MetaResult<Arc<Self>> {
        let raw = fs::read(root_dir.join(META_FILE))?;
        let mut config: MetaPartitionConfig = serde_json::from_slice(&raw)?;
        config.node_id = node_id;
        config.root_dir = root_dir.to_path_buf();
        Self::new(config)
    }

    fn rebuild_free_list(&self) -> MetaResult<()> {
        let mut pending = Vec::new();
        self.inodes.ascend(&mut |inode| {
            if !inode.is_dir() && inode.mark_delete {
                pending.push(inode.clone());
            }
            true
        })?;
        for inode in pending {
            self.free_list.push(inode);
        }
        Ok(())
    }

    /// Partition id.
    pub fn id(&self) -> u64 {
        self.config.read().unwrap().partition_id
    }

    /// Volume name.
    pub fn vol_name(&self) -> String {
        self.config.read().unwrap().vol_name.clone()
    }

    /// Partition directory.
    pub fn root_dir(&self) -> PathBuf {
        self.config.read().unwrap().root_dir.clone()
    }

    /// Tree backend selector.
    pub fn store_type(&self) -> StoreType {
        self.config.read().unwrap().store_type
    }

    /// Range start (inclusive).
    pub fn start(&self) -> u64 {
        self.config.read().unwrap().start
    }

    /// Range end (exclusive); lowered when the partition splits.
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::SeqCst)
    }

    /// Next allocatable inode id.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Highest applied log index.
    pub fn apply_id(&self) -> u64 {
        self.apply_id.load(Ordering::SeqCst)
    }

    /// Consensus members.
    pub fn peers(&self) -> Vec<Peer> {
        self.config.read().unwrap().peers.clone()
    }

    /// Replaces the peer set (driven by member-change commands) and
    /// persists the canonical config.
    pub fn update_peers(&self, peers: Vec<Peer>) -> MetaResult<()> {
        {
            let mut config = self.config.write().unwrap();
            config.peers = peers;
            config.sort_peers();
        }
        self.persist_metadata()
    }

    /// The asynchronous reclaimer's work queue.
    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Attaches the replicated log this partition proposes through.
    pub fn attach_log(&self, log: Arc<dyn ReplicatedLog>) {
        *self.log.write().unwrap() = Some(log);
    }

    fn log(&self) -> MetaResult<Arc<dyn ReplicatedLog>> {
        self.log
            .read()
            .unwrap()
            .clone()
            .ok_or(MetaError::LogNotAttached)
    }

    /// Whether this replica leads the group.
    pub fn is_leader(&self) -> bool {
        self.log()
            .map(|log| log.is_leader())
            .unwrap_or(false)
    }

    /// The current leader's address, when known.
    pub fn leader_addr(&self) -> Option<String> {
        self.log().ok().and_then(|log| log.leader_addr())
    }

    /// Proposes one command through the log and returns the applied
    /// response.
    pub fn submit(&self, op: MetaOp, value: Vec<u8>) -> MetaResult<FsmResponse> {
        let item = MetaItem {
            op: op as u32,
            k: Vec::new(),
            v: value,
        };
        let command = serde_json::to_vec(&item)?;
        self.log()?.submit(command)
    }

    /// Allocates the next inode id via CAS on the cursor, failing once
    /// the cursor reaches the range end.
    pub fn next_inode_id(&self) -> MetaResult<u64> {
        loop {
            let cur = self.cursor.load(Ordering::SeqCst);
            let end = self.end.load(Ordering::SeqCst);
            if cur >= end {
                return Err(MetaError::InodeIdOutOfRange { cursor: cur, end });
            }
            let next = cur + 1;
            if self
                .cursor
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(next);
            }
        }
    }

    /// Advances the cursor to at least `inode`; applied commands drive
    /// this so the cursor never decreases.
    pub(crate) fn advance_cursor(&self, inode: u64) {
        let mut cur = self.cursor.load(Ordering::SeqCst);
        while inode > cur {
            match self
                .cursor
                .compare_exchange(cur, inode, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }

    pub(crate) fn record_apply(&self, index: u64) {
        self.apply_id.store(index, Ordering::SeqCst);
        self.pending_applies.fetch_add(1, Ordering::Relaxed);
    }

    /// Applies a new (lower) range end; used by the split workflow.
    pub(crate) fn set_end(&self, end: u64) -> MetaResult<()> {
        self.end.store(end, Ordering::SeqCst);
        self.config.write().unwrap().end = end;
        self.persist_metadata()
    }

    /// Initiates a split when the partition nears its ceiling: lowers
    /// its own end to `max allocated + step` through the log (the end
    /// never rises) and returns the start of the successor range the
    /// cluster controller must place. The original partition keeps
    /// refusing allocation past its lowered end.
    pub fn split(&self) -> MetaResult<u64> {
        let new_end = self
            .end()
            .min(self.cursor().saturating_add(PARTITION_INODE_ID_STEP));
        let body = serde_json::to_vec(&crate::fsm::UpdatePartitionEndRequest { end: new_end })?;
        match self.submit(MetaOp::UpdatePartitionEnd, body)? {
            FsmResponse::Status(code) if code == tidefs_proto::ResultCode::Ok => {}
            other => {
                return Err(MetaError::Again(format!(
                    "split command not applied: {other:?}"
                )))
            }
        }
        info!(partition_id = self.id(), new_end, "partition split initiated");
        Ok(new_end + 1)
    }

    /// Admin operation: drops the cursor back to the highest inode id
    /// actually present, reclaiming ids that were allocated but never
    /// committed. Leader-only; the cursor never moves forward here.
    pub fn reset_cursor(&self) -> MetaResult<u64> {
        if !self.is_leader() {
            return Err(MetaError::NotLeader {
                leader: self.leader_addr(),
            });
        }
        let floor = self.inodes.max_inode()?.max(self.start());
        let current = self.cursor.load(Ordering::SeqCst);
        if floor >= current {
            return Err(MetaError::ArgMismatch(format!(
                "cursor {current} already at or below max inode {floor}"
            )));
        }
        self.cursor.store(floor, Ordering::SeqCst);
        info!(partition_id = self.id(), cursor = floor, "cursor reset");
        Ok(floor)
    }

    /// Handles a leadership transition: gates the store-snapshot ticker,
    /// and on first leadership of a fresh first partition seeds the
    /// volume root directory inode.
    pub fn handle_leader_change(&self, is_leader: bool) -> MetaResult<()> {
        self.store_ticks_enabled.store(is_leader, Ordering::SeqCst);
        if !is_leader {
            return Ok(());
        }
        if self.start() == 0 && self.cursor() == 0 {
            let inode_id = self.next_inode_id()?;
            let root = Inode::new(inode_id, MODE_DIR);
            let body = bincode::serialize(&root)?;
            self.submit(MetaOp::CreateInode, body)?;
            info!(partition_id = self.id(), inode_id, "root inode seeded");
        }
        Ok(())
    }

    /// Whether the store-snapshot ticker is currently enabled.
    pub fn store_ticks_enabled(&self) -> bool {
        self.store_ticks_enabled.load(Ordering::SeqCst)
    }

    /// Applies accumulated since the last store snapshot.
    pub fn pending_applies(&self) -> u64 {
        self.pending_applies.load(Ordering::Relaxed)
    }

    /// Persists the canonical config JSON via `tmp → rename`.
    pub fn persist_metadata(&self) -> MetaResult<()> {
        let (root_dir, body) = {
            let mut config = self.config.write().unwrap();
            config.sort_peers();
            config.end = self.end.load(Ordering::SeqCst);
            (config.root_dir.clone(), serde_json::to_vec(&*config)?)
        };
        let tmp = root_dir.join(format!("{META_FILE}.tmp"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, root_dir.join(META_FILE))?;
        Ok(())
    }

    fn tree_backends(&self) -> [(&str, &Arc<dyn TreeBackend>); 4] {
        [
            (SNAPSHOT_TREE_FILES[0], self.inodes.backend()),
            (SNAPSHOT_TREE_FILES[1], self.dentries.backend()),
            (SNAPSHOT_TREE_FILES[2], self.extends.backend()),
            (SNAPSHOT_TREE_FILES[3], self.multiparts.backend()),
        ]
    }

    /// Flushes the trees to disk. KV-backed partitions checkpoint their
    /// store; memory-backed partitions rewrite the snapshot directory
    /// atomically (`tmp → rename → backup → rename → remove backup`)
    /// with a per-tree CRC sidecar.
    pub fn store_snapshot(&self) -> MetaResult<()> {
        for (_, backend) in self.tree_backends() {
            backend.set_apply_id(self.apply_id());
        }
        if self.store_type() == StoreType::Kv {
            for (_, backend) in self.tree_backends() {
                backend.flush()?;
            }
            self.pending_applies.store(0, Ordering::Relaxed);
            return Ok(());
        }

        let root_dir = self.root_dir();
        let tmp_dir = root_dir.join(SNAPSHOT_TMP_DIR);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let mut signs = Vec::with_capacity(SNAPSHOT_TREE_FILES.len());
        for (name, backend) in self.tree_backends() {
            let crc = write_tree_file(&tmp_dir.join(name), backend.as_ref())?;
            signs.push(crc.to_string());
        }
        {
            let mut apply_file = File::create(tmp_dir.join(SNAPSHOT_APPLY_FILE))?;
            apply_file.write_all(&self.apply_id().to_be_bytes())?;
            apply_file.write_all(&self.cursor().to_be_bytes())?;
            apply_file.sync_all()?;
        }
        fs::write(tmp_dir.join(SNAPSHOT_SIGN_FILE), signs.join(" "))?;

        let snapshot_dir = root_dir.join(SNAPSHOT_DIR);
        let backup_dir = root_dir.join(SNAPSHOT_BACKUP_DIR);
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)?;
        }
        if snapshot_dir.exists() {
            fs::rename(&snapshot_dir, &backup_dir)?;
        }
        if let Err(e) = fs::rename(&tmp_dir, &snapshot_dir) {
            let _ = fs::rename(&backup_dir, &snapshot_dir);
            return Err(e.into());
        }
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)?;
        }
        self.pending_applies.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Loads the store snapshot into the (memory) trees, verifying each
    /// tree file against the CRC sidecar.
    pub fn load_store_snapshot(&self) -> MetaResult<()> {
        let snapshot_dir = self.root_dir().join(SNAPSHOT_DIR);
        if !snapshot_dir.exists() {
            return Ok(());
        }
        let sign_raw = fs::read_to_string(snapshot_dir.join(SNAPSHOT_SIGN_FILE))
            .map_err(|e| MetaError::Broken(format!("sign file: {e}")))?;
        let signs: Vec<&str> = sign_raw.split_whitespace().collect();
        if signs.len() != SNAPSHOT_TREE_FILES.len() {
            return Err(MetaError::Broken(format!(
                "sign file holds {} entries, expected {}",
                signs.len(),
                SNAPSHOT_TREE_FILES.len()
            )));
        }
        for ((name, backend), expected) in self.tree_backends().into_iter().zip(signs) {
            let raw = fs::read(snapshot_dir.join(name))?;
            let actual = crc32(&raw);
            if expected != actual.to_string() {
                return Err(MetaError::Broken(format!(
                    "tree file {name} crc {actual} does not match sign {expected}"
                )));
            }
            backend.clear()?;
            load_tree_file(&raw, backend.as_ref())?;
        }
        let mut apply_raw = [0u8; 16];
        File::open(snapshot_dir.join(SNAPSHOT_APPLY_FILE))?.read_exact(&mut apply_raw)?;
        let apply_id = u64::from_be_bytes(apply_raw[..8].try_into().unwrap());
        let stored_cursor = u64::from_be_bytes(apply_raw[8..].try_into().unwrap());
        self.apply_id.store(apply_id, Ordering::SeqCst);
        let max_inode = self.inodes.max_inode()?;
        self.advance_cursor(stored_cursor.max(max_inode));
        info!(
            partition_id = self.id(),
            apply_id,
            cursor = self.cursor(),
            "store snapshot loaded"
        );
        Ok(())
    }

    /// Stops the partition: final snapshot and config persist.
    pub fn stop(&self) {
        if let Err(e) = self.store_snapshot() {
            warn!(partition_id = self.id(), error = %e, "final snapshot failed");
        }
        if let Err(e) = self.persist_metadata() {
            warn!(partition_id = self.id(), error = %e, "final metadata persist failed");
        }
    }

    /// Marks the partition directory expired: renamed out of the way
    /// with a timestamp, never deleted.
    pub fn expired(&self) -> MetaResult<PathBuf> {
        let current = self.root_dir();
        let base = current
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let new_path = current
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{EXPIRED_PARTITION_PREFIX}{base}_{}", unix_now()));
        fs::rename(&current, &new_path)?;
        warn!(
            partition_id = self.id(),
            path = %new_path.display(),
            "partition marked expired"
        );
        Ok(new_path)
    }

    /// Summary counters served to the controller's load probe.
    pub fn load_summary(&self) -> PartitionLoadSummary {
        PartitionLoadSummary {
            partition_id: self.id(),
            max_inode: self.cursor(),
            inode_count: self.inodes.count(),
            dentry_count: self.dentries.count(),
            apply_id: self.apply_id(),
        }
    }
}

/// Counters reported by [`MetaPartition::load_summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLoadSummary {
    /// Partition id.
    pub partition_id: u64,
    /// Cursor at probe time.
    pub max_inode: u64,
    /// Inode tree count.
    pub inode_count: u64,
    /// Dentry tree count.
    pub dentry_count: u64,
    /// Highest applied log index.
    pub apply_id: u64,
}

fn write_tree_file(path: &Path, backend: &dyn TreeBackend) -> MetaResult<u32> {
    let mut contents = Vec::new();
    backend.range(&[], None, &mut |k, v| {
        contents.extend_from_slice(&(k.len() as u32).to_be_bytes());
        contents.extend_from_slice(k);
        contents.extend_from_slice(&(v.len() as u32).to_be_bytes());
        contents.extend_from_slice(v);
        true
    })?;
    let mut file = File::create(path)?;
    file.write_all(&contents)?;
    file.sync_all()?;
    Ok(crc32(&contents))
}

fn load_tree_file(raw: &[u8], backend: &dyn TreeBackend) -> MetaResult<()> {
    let mut pos = 0;
    while pos < raw.len() {
        if pos + 4 > raw.len() {
            return Err(MetaError::Broken("truncated tree record key length".into()));
        }
        let klen = u32::from_be_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + klen + 4 > raw.len() {
            return Err(MetaError::Broken("truncated tree record key".into()));
        }
        let key = raw[pos..pos + klen].to_vec();
        pos += klen;
        let vlen = u32::from_be_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + vlen > raw.len() {
            return Err(MetaError::Broken("truncated tree record value".into()));
        }
        let value = raw[pos..pos + vlen].to_vec();
        pos += vlen;
        backend.put(key, value)?;
    }
    Ok(())
}

/// Scans a metanode root for partition directories the cluster view no
/// longer lists and renames them with the expired prefix. Returns the
/// renamed paths.
pub fn expire_unlisted_partitions(
    metadata_dir: &Path,
    listed: &[u64],
) -> MetaResult<Vec<PathBuf>> {
    let mut expired = Vec::new();
    for entry in fs::read_dir(metadata_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id_str) = name.strip_prefix("partition_") else {
            continue;
        };
        let Ok(partition_id) = id_str.parse::<u64>() else {
            continue;
        };
        if listed.contains(&partition_id) {
            continue;
        }
        let new_path = metadata_dir.join(format!(
            "{EXPIRED_PARTITION_PREFIX}{name}_{}",
            unix_now()
        ));
        fs::rename(entry.path(), &new_path)?;
        warn!(partition_id, path = %new_path.display(), "unlisted partition expired");
        expired.push(new_path);
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LoopbackLog;
    use tempfile::tempdir;

    pub(crate) fn test_config(dir: &Path, start: u64, end: u64) -> MetaPartitionConfig {
        MetaPartitionConfig {
            partition_id: 1,
            vol_name: "vol1".into(),
            start,
            end,
            peers: vec![Peer {
                id: 1,
                addr: "127.0.0.1:17210".into(),
            }],
            learners: Vec::new(),
            store_type: StoreType::Memory,
            node_id: 1,
            root_dir: dir.join("partition_1"),
        }
    }

    pub(crate) fn attach_loopback(partition: &Arc<MetaPartition>) -> Arc<LoopbackLog> {
        let log = Arc::new(LoopbackLog::new(Arc::downgrade(partition)));
        partition.attach_log(log.clone());
        log
    }

    #[test]
    fn test_config_check() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), 0, 0);
        assert!(matches!(
            config.check(),
            Err(MetaError::ConfigInvalid(_))
        ));
        config.end = 100;
        config.check().unwrap();
        config.peers.clear();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_next_inode_id_boundary() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), 100, 110);
        config.partition_id = 5;
        let partition = MetaPartition::new(config).unwrap();
        // Drive the cursor to 109.
        while partition.cursor() < 109 {
            partition.next_inode_id().unwrap();
        }
        assert_eq!(partition.next_inode_id().unwrap(), 110);
        assert!(matches!(
            partition.next_inode_id(),
            Err(MetaError::InodeIdOutOfRange { cursor: 110, end: 110 })
        ));
    }

    #[test]
    fn test_persist_and_reload_metadata() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let root = config.root_dir.clone();
        {
            let partition = MetaPartition::new(config).unwrap();
            partition.persist_metadata().unwrap();
        }
        let partition = MetaPartition::load(&root, 1).unwrap();
        assert_eq!(partition.id(), 1);
        assert_eq!(partition.end(), 1000);
        assert_eq!(partition.vol_name(), "vol1");
    }

    #[test]
    fn test_store_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let root = config.root_dir.clone();
        {
            let partition = MetaPartition::new(config.clone()).unwrap();
            attach_loopback(&partition);
            let inode = Inode::new(7, tidefs_proto::MODE_REGULAR);
            partition
                .submit(MetaOp::CreateInode, bincode::serialize(&inode).unwrap())
                .unwrap();
            partition.store_snapshot().unwrap();
            partition.persist_metadata().unwrap();
        }
        let partition = MetaPartition::load(&root, 1).unwrap();
        assert!(partition.inodes.get(7).unwrap().is_some());
        assert_eq!(partition.cursor(), 7);
        assert!(partition.apply_id() >= 1);
    }

    #[test]
    fn test_snapshot_crc_mismatch_is_broken() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let root = config.root_dir.clone();
        {
            let partition = MetaPartition::new(config).unwrap();
            attach_loopback(&partition);
            let inode = Inode::new(7, tidefs_proto::MODE_REGULAR);
            partition
                .submit(MetaOp::CreateInode, bincode::serialize(&inode).unwrap())
                .unwrap();
            partition.store_snapshot().unwrap();
            partition.persist_metadata().unwrap();
        }
        // Corrupt the inode tree file.
        let inode_file = root.join(SNAPSHOT_DIR).join("inode");
        let mut raw = fs::read(&inode_file).unwrap();
        raw[0] ^= 0xFF;
        fs::write(&inode_file, raw).unwrap();
        assert!(matches!(
            MetaPartition::load(&root, 1),
            Err(MetaError::Broken(_))
        ));
    }

    #[test]
    fn test_leader_change_seeds_root() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let partition = MetaPartition::new(config).unwrap();
        attach_loopback(&partition);
        partition.handle_leader_change(true).unwrap();
        let root = partition.inodes.get(1).unwrap().expect("root inode seeded");
        assert!(root.is_dir());
        assert!(partition.store_ticks_enabled());

        partition.handle_leader_change(false).unwrap();
        assert!(!partition.store_ticks_enabled());
    }

    #[test]
    fn test_reset_cursor_reclaims_unused_ids() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let partition = MetaPartition::new(config).unwrap();
        attach_loopback(&partition);

        let inode = Inode::new(3, tidefs_proto::MODE_REGULAR);
        partition
            .submit(MetaOp::CreateInode, bincode::serialize(&inode).unwrap())
            .unwrap();
        // Burn ids past the highest committed inode.
        for _ in 0..5 {
            partition.next_inode_id().unwrap();
        }
        assert!(partition.cursor() > 3);
        assert_eq!(partition.reset_cursor().unwrap(), 3);
        assert_eq!(partition.cursor(), 3);
        // A second reset has nothing to reclaim.
        assert!(matches!(
            partition.reset_cursor(),
            Err(MetaError::ArgMismatch(_))
        ));
    }

    #[test]
    fn test_expired_rename() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 0, 1000);
        let partition = MetaPartition::new(config).unwrap();
        partition.persist_metadata().unwrap();
        let new_path = partition.expired().unwrap();
        assert!(new_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(EXPIRED_PARTITION_PREFIX));
        assert!(new_path.exists());
    }

    #[test]
    fn test_expire_unlisted_partitions() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("partition_1")).unwrap();
        fs::create_dir_all(dir.path().join("partition_2")).unwrap();
        let expired = expire_unlisted_partitions(dir.path(), &[1]).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(dir.path().join("partition_1").exists());
        assert!(!dir.path().join("partition_2").exists());
    }
}
