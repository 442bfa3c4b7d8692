#![warn(missing_docs)]

//! TideFS metadata tier.
//!
//! A meta node mounts replicated meta partitions, each owning an inode
//! range `[start, end)` and four ordered trees (inodes, dentries,
//! extended attributes, multipart uploads). Every mutation flows
//! through the replicated log; orphaned inodes are reclaimed
//! asynchronously by the free-list workers, which deliver per-extent
//! deletes to the data tier before committing final removal.

pub mod dentry;
pub mod delete_worker;
pub mod error;
pub mod extend;
pub mod free_list;
pub mod fsm;
mod fsm_dentry;
mod fsm_extend;
mod fsm_inode;
mod fsm_multipart;
pub mod inode;
pub mod kvstore;
pub mod manager;
pub mod multipart;
pub mod ops;
pub mod partition;
pub mod raft;
pub mod service;
pub mod tree;
pub mod view;

pub use delete_worker::{
    delete_worker_pass, freelist_audit_pass, start_free_list_workers, ExtentDeleter,
    TcpExtentDeleter, ASYNC_DELETE_INTERVAL, BATCH_COUNT,
};
pub use dentry::Dentry;
pub use error::{MetaError, MetaResult};
pub use extend::Extend;
pub use free_list::FreeList;
pub use fsm::{FsmResponse, MetaItem, MetaOp, SnapshotRecord};
pub use inode::Inode;
pub use kvstore::KvBackend;
pub use manager::{start_snapshot_worker, MetadataManager};
pub use multipart::{create_multipart_id, Multipart, Part};
pub use partition::{
    expire_unlisted_partitions, Learner, MetaPartition, MetaPartitionConfig, PartitionLoadSummary,
    Peer, StoreType, EXPIRED_PARTITION_PREFIX, PARTITION_INODE_ID_STEP,
};
pub use raft::{LoopbackLog, ReplicatedLog};
pub use service::MetaNodeService;
pub use tree::{
    DentryTree, ExtendTree, InodeTree, MemoryBackend, MultipartTree, TreeBackend,
};
pub use view::{start_vol_view_worker, DataPartitionView, StaticDataView};
