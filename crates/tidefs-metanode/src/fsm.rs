//! The replicated state machine: command envelope, dispatch, and the
//! consensus snapshot.
//!
//! Every mutation reaches the trees exclusively through
//! [`MetaPartition::apply`], driven by the replicated log, so replicas
//! that apply the same log prefix hold identical trees, cursor, and
//! apply id.

use serde::{Deserialize, Serialize};

use tidefs_proto::ResultCode;

use crate::dentry::Dentry;
use crate::error::{MetaError, MetaResult};
use crate::inode::Inode;
use crate::multipart::Multipart;
use crate::partition::MetaPartition;

/// Command envelope proposed to the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaItem {
    /// Operation discriminant; see [`MetaOp`].
    pub op: u32,
    /// Optional key bytes; unused by most operations.
    #[serde(default)]
    pub k: Vec<u8>,
    /// Operation payload.
    #[serde(default)]
    pub v: Vec<u8>,
}

/// Operations the state machine applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MetaOp {
    /// Insert an inode record.
    CreateInode = 0,
    /// Decrement a link count; a regular file at zero links joins the
    /// free list.
    UnlinkInode = 1,
    /// Insert a dentry.
    CreateDentry = 2,
    /// Remove a dentry.
    DeleteDentry = 3,
    /// Swap a dentry's target inode (atomic same-parent rename).
    UpdateDentry = 4,
    /// Append extent keys to an inode.
    ExtentsAdd = 5,
    /// Detach an inode's extents into a tombstone.
    ExtentsTruncate = 6,
    /// Increment a link count.
    LinkInode = 7,
    /// Evict an inode whose links are gone.
    EvictInode = 8,
    /// Set inode attributes.
    SetAttr = 9,
    /// Remove fully-reclaimed inode records (deletion worker commit).
    InternalDeleteInode = 10,
    /// Lower the partition's range end (split workflow).
    UpdatePartitionEnd = 11,
    /// Set an extended attribute.
    SetXAttr = 12,
    /// Remove an extended attribute.
    RemoveXAttr = 13,
    /// Insert a multipart upload record.
    CreateMultipart = 14,
    /// Append a part to a multipart upload.
    AppendMultipart = 15,
    /// Remove a multipart upload record.
    RemoveMultipart = 16,
}

impl MetaOp {
    /// Decodes the discriminant carried in a command envelope.
    pub fn from_u32(raw: u32) -> MetaResult<Self> {
        use MetaOp::*;
        Ok(match raw {
            0 => CreateInode,
            1 => UnlinkInode,
            2 => CreateDentry,
            3 => DeleteDentry,
            4 => UpdateDentry,
            5 => ExtentsAdd,
            6 => ExtentsTruncate,
            7 => LinkInode,
            8 => EvictInode,
            9 => SetAttr,
            10 => InternalDeleteInode,
            11 => UpdatePartitionEnd,
            12 => SetXAttr,
            13 => RemoveXAttr,
            14 => CreateMultipart,
            15 => AppendMultipart,
            16 => RemoveMultipart,
            other => {
                return Err(MetaError::ArgMismatch(format!(
                    "unknown fsm op {other}"
                )))
            }
        })
    }
}

/// Response handed back through the log's submit path.
#[derive(Debug, Clone)]
pub enum FsmResponse {
    /// Bare status.
    Status(ResultCode),
    /// Status plus the inode the operation touched.
    Inode {
        /// Operation status.
        status: ResultCode,
        /// The touched inode, present on success.
        inode: Option<Inode>,
    },
    /// Status plus the dentry the operation touched.
    Dentry {
        /// Operation status.
        status: ResultCode,
        /// The touched dentry, present on success.
        dentry: Option<Dentry>,
    },
}

impl FsmResponse {
    /// The operation's status code.
    pub fn status(&self) -> ResultCode {
        match self {
            FsmResponse::Status(code) => *code,
            FsmResponse::Inode { status, .. } => *status,
            FsmResponse::Dentry { status, .. } => *status,
        }
    }
}

/// Payload of [`MetaOp::SetAttr`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAttrCommand {
    /// Target inode.
    pub inode: u64,
    /// New mode, if set.
    pub mode: Option<u32>,
    /// New access time, if set.
    pub access_time: Option<u64>,
    /// New modification time, if set.
    pub modify_time: Option<u64>,
}

/// Payload of [`MetaOp::ExtentsTruncate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateCommand {
    /// Target inode.
    pub inode: u64,
    /// Generation the caller observed; a mismatch fails the truncate.
    pub generation: u64,
    /// Modification time to stamp.
    pub modify_time: u64,
    /// Pre-allocated id for the tombstone inode that inherits the
    /// detached extents.
    pub tombstone_inode: u64,
}

/// Payload of [`MetaOp::SetXAttr`] and [`MetaOp::RemoveXAttr`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XAttrCommand {
    /// Target inode.
    pub inode: u64,
    /// Attribute name.
    pub key: String,
    /// Attribute value; empty for removal.
    #[serde(default)]
    pub value: Vec<u8>,
}

/// Payload of [`MetaOp::UpdatePartitionEnd`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePartitionEndRequest {
    /// New (lower) range end.
    pub end: u64,
}

/// Tree tag of a consensus snapshot record.
pub mod snapshot_tree {
    /// Trailing apply-id record.
    pub const APPLY_ID: u8 = 0;
    /// Inode tree record.
    pub const INODE: u8 = 1;
    /// Dentry tree record.
    pub const DENTRY: u8 = 2;
    /// Extended-attribute tree record.
    pub const EXTEND: u8 = 3;
    /// Multipart tree record.
    pub const MULTIPART: u8 = 4;
}

/// One record of a consensus snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Which tree the record belongs to; see [`snapshot_tree`].
    pub tree: u8,
    /// Marshaled key.
    pub k: Vec<u8>,
    /// Marshaled value.
    pub v: Vec<u8>,
}

impl MetaPartition {
    /// Applies one replicated command at `index`. The cursor advances
    /// past any inode id the command introduces before the tree mutates,
    /// and the apply id records `index` when the dispatch finishes.
    pub fn apply(&self, command: &[u8], index: u64) -> MetaResult<FsmResponse> {
        let item: MetaItem = serde_json::from_slice(command)?;
        let op = MetaOp::from_u32(item.op)?;
        let response = self.dispatch(op, &item.v);
        self.record_apply(index);
        response
    }

    fn dispatch(&self, op: MetaOp, value: &[u8]) -> MetaResult<FsmResponse> {
        match op {
            MetaOp::CreateInode => {
                let inode: Inode = bincode::deserialize(value)?;
                self.advance_cursor(inode.inode);
                Ok(self.fsm_create_inode(inode))
            }
            MetaOp::UnlinkInode => {
                let inode: Inode = bincode::deserialize(value)?;
                Ok(self.fsm_unlink_inode(inode.inode, inode.modify_time)?)
            }
            MetaOp::LinkInode => {
                let inode: Inode = bincode::deserialize(value)?;
                Ok(self.fsm_link_inode(inode.inode, inode.modify_time)?)
            }
            MetaOp::EvictInode => {
                let inode: Inode = bincode::deserialize(value)?;
                Ok(self.fsm_evict_inode(inode.inode)?)
            }
            MetaOp::SetAttr => {
                let cmd: SetAttrCommand = serde_json::from_slice(value)?;
                Ok(self.fsm_set_attr(&cmd)?)
            }
            MetaOp::ExtentsAdd => {
                let inode: Inode = bincode::deserialize(value)?;
                Ok(self.fsm_append_extents(inode)?)
            }
            MetaOp::ExtentsTruncate => {
                let cmd: TruncateCommand = serde_json::from_slice(value)?;
                self.advance_cursor(cmd.tombstone_inode);
                Ok(self.fsm_extents_truncate(&cmd)?)
            }
            MetaOp::InternalDeleteInode => Ok(self.fsm_internal_delete_inodes(value)?),
            MetaOp::CreateDentry => {
                let dentry: Dentry = bincode::deserialize(value)?;
                Ok(self.fsm_create_dentry(dentry)?)
            }
            MetaOp::DeleteDentry => {
                let dentry: Dentry = bincode::deserialize(value)?;
                Ok(self.fsm_delete_dentry(&dentry)?)
            }
            MetaOp::UpdateDentry => {
                let dentry: Dentry = bincode::deserialize(value)?;
                Ok(self.fsm_update_dentry(dentry)?)
            }
            MetaOp::UpdatePartitionEnd => {
                let req: UpdatePartitionEndRequest = serde_json::from_slice(value)?;
                self.set_end(req.end)?;
                Ok(FsmResponse::Status(ResultCode::Ok))
            }
            MetaOp::SetXAttr => {
                let cmd: XAttrCommand = serde_json::from_slice(value)?;
                Ok(self.fsm_set_xattr(&cmd)?)
            }
            MetaOp::RemoveXAttr => {
                let cmd: XAttrCommand = serde_json::from_slice(value)?;
                Ok(self.fsm_remove_xattr(&cmd)?)
            }
            MetaOp::CreateMultipart => {
                let multipart: Multipart = bincode::deserialize(value)?;
                Ok(self.fsm_create_multipart(multipart)?)
            }
            MetaOp::AppendMultipart => {
                let multipart: Multipart = bincode::deserialize(value)?;
                Ok(self.fsm_append_multipart(multipart)?)
            }
            MetaOp::RemoveMultipart => {
                let multipart: Multipart = bincode::deserialize(value)?;
                Ok(self.fsm_remove_multipart(&multipart)?)
            }
        }
    }

    /// Emits the consensus snapshot: every tree's records with their
    /// tree tag, then a trailing apply-id record.
    pub fn snapshot(&self) -> MetaResult<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        let trees = [
            (snapshot_tree::INODE, self.inodes.backend()),
            (snapshot_tree::DENTRY, self.dentries.backend()),
            (snapshot_tree::EXTEND, self.extends.backend()),
            (snapshot_tree::MULTIPART, self.multiparts.backend()),
        ];
        for (tag, backend) in trees {
            backend.range(&[], None, &mut |k, v| {
                records.push(SnapshotRecord {
                    tree: tag,
                    k: k.to_vec(),
                    v: v.to_vec(),
                });
                true
            })?;
        }
        records.push(SnapshotRecord {
            tree: snapshot_tree::APPLY_ID,
            k: Vec::new(),
            v: self.apply_id().to_be_bytes().to_vec(),
        });
        Ok(records)
    }

    /// Rebuilds the trees from a snapshot stream. Idempotent: applying
    /// the same snapshot twice yields identical state.
    pub fn apply_snapshot(&self, records: &[SnapshotRecord]) -> MetaResult<()> {
        self.inodes.backend().clear()?;
        self.dentries.backend().clear()?;
        self.extends.backend().clear()?;
        self.multiparts.backend().clear()?;

        let mut apply_id = 0;
        for record in records {
            match record.tree {
                snapshot_tree::APPLY_ID => {
                    if record.v.len() >= 8 {
                        apply_id = u64::from_be_bytes(record.v[..8].try_into().unwrap());
                    }
                }
                snapshot_tree::INODE => {
                    self.inodes
                        .backend()
                        .put(record.k.clone(), record.v.clone())?;
                }
                snapshot_tree::DENTRY => {
                    self.dentries
                        .backend()
                        .put(record.k.clone(), record.v.clone())?;
                }
                snapshot_tree::EXTEND => {
                    self.extends
                        .backend()
                        .put(record.k.clone(), record.v.clone())?;
                }
                snapshot_tree::MULTIPART => {
                    self.multiparts
                        .backend()
                        .put(record.k.clone(), record.v.clone())?;
                }
                other => {
                    return Err(MetaError::Broken(format!(
                        "unknown snapshot tree tag {other}"
                    )))
                }
            }
        }
        let max_inode = self.inodes.max_inode()?;
        self.advance_cursor(max_inode);
        self.record_apply(apply_id);
        Ok(())
    }
}
