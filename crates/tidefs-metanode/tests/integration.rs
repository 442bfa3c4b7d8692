//! Integration tests for the metadata partition: the client-visible
//! operation flow, replica determinism, and the consensus snapshot.

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use tidefs_metanode::{
    fsm::MetaItem, Inode, LoopbackLog, MetaError, MetaOp, MetaPartition, MetaPartitionConfig,
    Peer, StoreType,
};
use tidefs_proto::{
    CreateDentryRequest, CreateInodeRequest, CreateMultipartRequest, DeleteInodeRequest,
    ExtentKey, GetExtentsRequest, GetMultipartRequest, InodeGetRequest, ListMultipartRequest,
    LookupRequest, ReadDirRequest, SetXAttrRequest, TruncateRequest, UpdateDentryRequest,
    AppendExtentKeyRequest, GetXAttrRequest, MODE_DIR, MODE_REGULAR,
};

fn config(dir: &Path, partition_id: u64, start: u64, end: u64) -> MetaPartitionConfig {
    MetaPartitionConfig {
        partition_id,
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
        root_dir: dir.join(format!("partition_{partition_id}")),
    }
}

fn leader_partition(dir: &Path) -> (Arc<MetaPartition>, Arc<LoopbackLog>) {
    let partition = MetaPartition::new(config(dir, 1, 0, 1 << 20)).unwrap();
    let log = Arc::new(LoopbackLog::new(Arc::downgrade(&partition)));
    partition.attach_log(log.clone());
    (partition, log)
}

fn create_inode(partition: &Arc<MetaPartition>, mode: u32) -> u64 {
    let response = partition
        .op_create_inode(&CreateInodeRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            mode,
            target: Vec::new(),
        })
        .unwrap();
    response.info.inode
}

fn extent_key(extent_id: u64, file_offset: u64, size: u32) -> ExtentKey {
    ExtentKey {
        partition_id: 1,
        extent_id,
        extent_offset: 0,
        size,
        file_offset,
    }
}

#[test]
fn test_create_lookup_readdir_flow() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());

    let parent = create_inode(&partition, MODE_DIR);
    let child = create_inode(&partition, MODE_REGULAR);
    partition
        .op_create_dentry(&CreateDentryRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            inode: child,
            name: "file.txt".into(),
            mode: MODE_REGULAR,
        })
        .unwrap();

    let found = partition
        .op_lookup(&LookupRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            name: "file.txt".into(),
        })
        .unwrap();
    assert_eq!(found.inode, child);

    let listing = partition
        .op_read_dir(&ReadDirRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
        })
        .unwrap();
    assert_eq!(listing.children.len(), 1);
    assert_eq!(listing.children[0].name, "file.txt");

    let info = partition
        .op_inode_get(&InodeGetRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: child,
        })
        .unwrap();
    assert_eq!(info.info.nlink, 1);
}

#[test]
fn test_rename_swaps_inodes_atomically() {
    // Scenario S4: dir 1/a → 10, dir 1/b → 11; updating (1, "a") to 11
    // returns old inode 10 and both names then resolve to 11.
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());

    let parent = create_inode(&partition, MODE_DIR);
    let a = create_inode(&partition, MODE_REGULAR);
    let b = create_inode(&partition, MODE_REGULAR);
    for (name, inode) in [("a", a), ("b", b)] {
        partition
            .op_create_dentry(&CreateDentryRequest {
                vol_name: "vol1".into(),
                partition_id: 1,
                parent_id: parent,
                inode,
                name: name.into(),
                mode: MODE_REGULAR,
            })
            .unwrap();
    }

    let swapped = partition
        .op_update_dentry(&UpdateDentryRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            name: "a".into(),
            inode: b,
        })
        .unwrap();
    assert_eq!(swapped.inode, a, "update returns the previous inode");

    let lookup_a = partition
        .op_lookup(&LookupRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            name: "a".into(),
        })
        .unwrap();
    let lookup_b = partition
        .op_lookup(&LookupRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            name: "b".into(),
        })
        .unwrap();
    assert_eq!(lookup_a.inode, b);
    assert_eq!(lookup_b.inode, b);
}

#[test]
fn test_inode_alloc_at_boundary_and_split() {
    // Scenario S5: cursor 109 in [100, 110) yields 110, then refuses.
    let dir = tempdir().unwrap();
    let partition = MetaPartition::new(config(dir.path(), 5, 100, 110)).unwrap();
    let log = Arc::new(LoopbackLog::new(Arc::downgrade(&partition)));
    partition.attach_log(log);

    while partition.cursor() < 109 {
        partition.next_inode_id().unwrap();
    }
    assert_eq!(partition.next_inode_id().unwrap(), 110);
    assert!(matches!(
        partition.next_inode_id(),
        Err(MetaError::InodeIdOutOfRange { .. })
    ));

    // Splitting lowers end through the log; the original partition still
    // refuses allocation because the cursor sits at the ceiling.
    let successor_start = partition.split().unwrap();
    assert_eq!(successor_start, partition.end() + 1);
    assert_eq!(partition.end(), 110, "end never rises");
    assert_eq!(partition.cursor(), 110);
    assert!(matches!(
        partition.next_inode_id(),
        Err(MetaError::InodeIdOutOfRange { .. })
    ));
}

#[test]
fn test_extents_append_order_generation_mtime() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let file = create_inode(&partition, MODE_REGULAR);

    for (i, (extent_id, offset)) in [(2u64, 0u64), (3, 131072), (4, 262144)].iter().enumerate() {
        partition
            .op_append_extent_key(&AppendExtentKeyRequest {
                vol_name: "vol1".into(),
                partition_id: 1,
                inode: file,
                extent: extent_key(*extent_id, *offset, 131072),
                modify_time: 1_700_000_000 + i as u64,
            })
            .unwrap();
    }

    let extents = partition
        .op_get_extents(&GetExtentsRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
        })
        .unwrap();
    let ids: Vec<u64> = extents.extents.iter().map(|k| k.extent_id).collect();
    assert_eq!(ids, [2, 3, 4], "insertion order preserved");
    assert_eq!(extents.generation, 3, "one bump per append");
    assert_eq!(extents.size, 262144 + 131072);

    let info = partition
        .op_inode_get(&InodeGetRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
        })
        .unwrap();
    assert_eq!(info.info.modify_time, 1_700_000_002, "request-supplied mtime");
}

#[test]
fn test_truncate_detaches_extents_to_free_list() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let file = create_inode(&partition, MODE_REGULAR);
    partition
        .op_append_extent_key(&AppendExtentKeyRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
            extent: extent_key(2, 0, 4096),
            modify_time: 1_700_000_000,
        })
        .unwrap();

    // Stale generation is refused.
    assert!(partition
        .op_truncate(&TruncateRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
            generation: 0,
        })
        .is_err());

    let truncated = partition
        .op_truncate(&TruncateRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
            generation: 1,
        })
        .unwrap();
    assert_eq!(truncated.extents.len(), 1);
    assert_eq!(truncated.extents[0].extent_id, 2);

    let info = partition
        .op_inode_get(&InodeGetRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
        })
        .unwrap();
    assert_eq!(info.info.size, 0);
    assert_eq!(info.info.generation, 2);
    // The tombstone carrying the detached extents waits on the free list.
    assert_eq!(partition.free_list().len(), 1);
    let tombstone = partition.free_list().pop().unwrap();
    assert!(tombstone.mark_delete);
    assert_eq!(tombstone.extents.len(), 1);
}

#[test]
fn test_unlink_to_zero_pushes_free_list() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let file = create_inode(&partition, MODE_REGULAR);

    let response = partition
        .op_unlink_inode(&DeleteInodeRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
        })
        .unwrap();
    assert_eq!(response.info.nlink, 0);
    assert_eq!(partition.free_list().len(), 1);
    // The tombstoned record reads as absent to clients.
    assert!(partition
        .op_inode_get(&InodeGetRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
        })
        .is_err());
}

#[test]
fn test_xattr_roundtrip() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let file = create_inode(&partition, MODE_REGULAR);

    partition
        .op_set_xattr(&SetXAttrRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
            key: "user.tag".into(),
            value: b"blue".to_vec(),
        })
        .unwrap();
    let fetched = partition
        .op_get_xattr(&GetXAttrRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            inode: file,
            key: "user.tag".into(),
        })
        .unwrap();
    assert_eq!(fetched.value, Some(b"blue".to_vec()));
}

#[test]
fn test_multipart_lifecycle() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());

    let created = partition
        .op_create_multipart(&CreateMultipartRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            path: "bucket/object".into(),
            extend: Default::default(),
        })
        .unwrap();
    let upload_id = created.info.id.clone();
    assert!(upload_id.starts_with("0000000000000001"));

    partition
        .op_append_multipart(
            "bucket/object",
            &upload_id,
            tidefs_metanode::Part {
                id: 1,
                inode: 42,
                md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
                size: 5 << 20,
                upload_time: 1_700_000_000,
            },
        )
        .unwrap();

    let fetched = partition
        .op_get_multipart(&GetMultipartRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            path: "bucket/object".into(),
            multipart_id: upload_id.clone(),
        })
        .unwrap();
    assert_eq!(fetched.info.parts.len(), 1);

    let listing = partition
        .op_list_multiparts(&ListMultipartRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            prefix: "bucket/".into(),
            marker: String::new(),
            multipart_id_marker: String::new(),
            max: 10,
        })
        .unwrap();
    assert_eq!(listing.multiparts.len(), 1);
}

#[test]
fn test_follower_rejects_mutations() {
    let dir = tempdir().unwrap();
    let (partition, log) = leader_partition(dir.path());
    log.set_leader(false);
    assert!(matches!(
        partition.op_create_inode(&CreateInodeRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            mode: MODE_REGULAR,
            target: Vec::new(),
        }),
        Err(MetaError::NotLeader { .. })
    ));
}

fn command(op: MetaOp, value: Vec<u8>) -> Vec<u8> {
    serde_json::to_vec(&MetaItem {
        op: op as u32,
        k: Vec::new(),
        v: value,
    })
    .unwrap()
}

#[test]
fn test_replicas_applying_same_log_converge() {
    // Invariant 5: two replicas applying the same log prefix hold equal
    // trees, cursor, and apply id.
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let replica_a = MetaPartition::new(config(dir_a.path(), 1, 0, 1 << 20)).unwrap();
    let replica_b = MetaPartition::new(config(dir_b.path(), 1, 0, 1 << 20)).unwrap();

    let mut log = Vec::new();
    let mut root = Inode::new(1, MODE_DIR);
    root.create_time = 1_700_000_000;
    root.access_time = 1_700_000_000;
    root.modify_time = 1_700_000_000;
    log.push(command(MetaOp::CreateInode, bincode::serialize(&root).unwrap()));
    let mut file = Inode::new(2, MODE_REGULAR);
    file.create_time = 1_700_000_001;
    file.access_time = 1_700_000_001;
    file.modify_time = 1_700_000_001;
    log.push(command(MetaOp::CreateInode, bincode::serialize(&file).unwrap()));
    let dentry = tidefs_metanode::Dentry {
        parent_id: 1,
        name: "f".into(),
        inode: 2,
        type_: MODE_REGULAR,
    };
    log.push(command(
        MetaOp::CreateDentry,
        bincode::serialize(&dentry).unwrap(),
    ));
    let mut append = Inode::new(2, MODE_REGULAR);
    append.extents.push(extent_key(7, 0, 4096));
    append.modify_time = 1_700_000_002;
    log.push(command(
        MetaOp::ExtentsAdd,
        bincode::serialize(&append).unwrap(),
    ));

    for (index, cmd) in log.iter().enumerate() {
        replica_a.apply(cmd, index as u64 + 1).unwrap();
        replica_b.apply(cmd, index as u64 + 1).unwrap();
    }

    let snap_a = replica_a.snapshot().unwrap();
    let snap_b = replica_b.snapshot().unwrap();
    assert_eq!(snap_a.len(), snap_b.len());
    for (a, b) in snap_a.iter().zip(snap_b.iter()) {
        assert_eq!(a.tree, b.tree);
        assert_eq!(a.k, b.k);
        assert_eq!(a.v, b.v);
    }
    assert_eq!(replica_a.cursor(), replica_b.cursor());
    assert_eq!(replica_a.apply_id(), replica_b.apply_id());
    assert_eq!(replica_a.free_list().len(), replica_b.free_list().len());
}

#[test]
fn test_snapshot_apply_is_idempotent() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let parent = create_inode(&partition, MODE_DIR);
    let child = create_inode(&partition, MODE_REGULAR);
    partition
        .op_create_dentry(&CreateDentryRequest {
            vol_name: "vol1".into(),
            partition_id: 1,
            parent_id: parent,
            inode: child,
            name: "x".into(),
            mode: MODE_REGULAR,
        })
        .unwrap();

    let records = partition.snapshot().unwrap();

    let dir2 = tempdir().unwrap();
    let replica = MetaPartition::new(config(dir2.path(), 1, 0, 1 << 20)).unwrap();
    replica.apply_snapshot(&records).unwrap();
    let first = replica.snapshot().unwrap();
    replica.apply_snapshot(&records).unwrap();
    let second = replica.snapshot().unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.k, b.k);
        assert_eq!(a.v, b.v);
    }
    assert_eq!(replica.cursor(), partition.cursor());
    assert_eq!(replica.apply_id(), partition.apply_id());
}

#[test]
fn test_apply_id_and_cursor_monotonic() {
    // Invariant 6: apply id never goes backwards, cursor never
    // decreases, cursor stays within the range end.
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let mut last_apply = 0;
    let mut last_cursor = 0;
    for _ in 0..16 {
        create_inode(&partition, MODE_REGULAR);
        assert!(partition.apply_id() >= last_apply);
        assert!(partition.cursor() >= last_cursor);
        assert!(partition.cursor() <= partition.end());
        last_apply = partition.apply_id();
        last_cursor = partition.cursor();
    }
}

#[test]
fn test_dentry_create_idempotent_and_type_guard() {
    let dir = tempdir().unwrap();
    let (partition, _log) = leader_partition(dir.path());
    let parent = create_inode(&partition, MODE_DIR);
    let child = create_inode(&partition, MODE_REGULAR);
    let request = CreateDentryRequest {
        vol_name: "vol1".into(),
        partition_id: 1,
        parent_id: parent,
        inode: child,
        name: "same".into(),
        mode: MODE_REGULAR,
    };
    partition.op_create_dentry(&request).unwrap();
    // An identical re-create is success.
    partition.op_create_dentry(&request).unwrap();

    // Same name pointing elsewhere is refused.
    let other = create_inode(&partition, MODE_REGULAR);
    let mut conflicting = request.clone();
    conflicting.inode = other;
    assert!(matches!(
        partition.op_create_dentry(&conflicting),
        Err(MetaError::Exists)
    ));

    // A directory never overwrites a file entry.
    let mut wrong_type = request;
    wrong_type.mode = MODE_DIR;
    assert!(matches!(
        partition.op_create_dentry(&wrong_type),
        Err(MetaError::ArgMismatch(_))
    ));
}
