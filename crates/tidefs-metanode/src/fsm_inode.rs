//! Inode operations applied by the state machine.

use tidefs_proto::ResultCode;

use crate::error::MetaResult;
use crate::fsm::{FsmResponse, SetAttrCommand, TruncateCommand};
use crate::inode::Inode;
use crate::partition::MetaPartition;

impl MetaPartition {
    /// Inserts an inode record; a duplicate id is `ExistErr`.
    pub(crate) fn fsm_create_inode(&self, inode: Inode) -> FsmResponse {
        match self.inodes.create(&inode) {
            Ok(true) => FsmResponse::Status(ResultCode::Ok),
            Ok(false) => FsmResponse::Status(ResultCode::ExistErr),
            Err(_) => FsmResponse::Status(ResultCode::Err),
        }
    }

    /// Increments a link count. Directories cannot be hard-linked and
    /// tombstoned inodes read as absent.
    pub(crate) fn fsm_link_inode(&self, inode_id: u64, modify_time: u64) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(inode_id)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        if inode.is_dir() {
            return Ok(FsmResponse::Status(ResultCode::ArgMismatchErr));
        }
        if inode.mark_delete {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        }
        inode.nlink += 1;
        inode.modify_time = modify_time;
        self.inodes.put(&inode)?;
        Ok(FsmResponse::Inode {
            status: ResultCode::Ok,
            inode: Some(inode),
        })
    }

    /// Decrements a link count. A regular file reaching zero links is
    /// tombstoned and queued for reclamation; a directory record is
    /// removed outright.
    pub(crate) fn fsm_unlink_inode(
        &self,
        inode_id: u64,
        modify_time: u64,
    ) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(inode_id)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        inode.modify_time = modify_time;
        if !inode.is_regular() {
            self.inodes.delete(inode_id)?;
            return Ok(FsmResponse::Inode {
                status: ResultCode::Ok,
                inode: Some(inode),
            });
        }
        if inode.nlink > 0 {
            inode.nlink -= 1;
        }
        if inode.nlink == 0 {
            inode.mark_delete = true;
            self.free_list.push(inode.clone());
        }
        self.inodes.put(&inode)?;
        Ok(FsmResponse::Inode {
            status: ResultCode::Ok,
            inode: Some(inode),
        })
    }

    /// Evicts an inode whose links are gone: directories with fewer than
    /// two links are removed; a regular file with no links is tombstoned
    /// and queued. Already-tombstoned inodes are a no-op.
    pub(crate) fn fsm_evict_inode(&self, inode_id: u64) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(inode_id)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        if inode.is_dir() {
            if inode.nlink < 2 {
                self.inodes.delete(inode_id)?;
            }
            return Ok(FsmResponse::Status(ResultCode::Ok));
        }
        if inode.mark_delete {
            return Ok(FsmResponse::Status(ResultCode::Ok));
        }
        if inode.nlink < 1 {
            inode.mark_delete = true;
            self.inodes.put(&inode)?;
            self.free_list.push(inode);
        }
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Applies a set-attr command.
    pub(crate) fn fsm_set_attr(&self, cmd: &SetAttrCommand) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(cmd.inode)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        if inode.mark_delete {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        }
        if let Some(mode) = cmd.mode {
            inode.mode = mode;
        }
        if let Some(access_time) = cmd.access_time {
            inode.access_time = access_time;
        }
        if let Some(modify_time) = cmd.modify_time {
            inode.modify_time = modify_time;
        }
        self.inodes.put(&inode)?;
        Ok(FsmResponse::Inode {
            status: ResultCode::Ok,
            inode: Some(inode),
        })
    }

    /// Appends the command inode's extent keys to the stored inode in
    /// request order, stamping the supplied mtime and bumping the
    /// generation once.
    pub(crate) fn fsm_append_extents(&self, request: Inode) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(request.inode)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        if inode.mark_delete {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        }
        for key in request.extents {
            inode.append_extent(key);
        }
        inode.modify_time = request.modify_time;
        inode.generation += 1;
        self.inodes.put(&inode)?;
        Ok(FsmResponse::Inode {
            status: ResultCode::Ok,
            inode: Some(inode),
        })
    }

    /// Detaches an inode's extents into a freshly-created tombstone
    /// inode that joins the free list; the original shrinks to zero
    /// size with a bumped generation.
    pub(crate) fn fsm_extents_truncate(&self, cmd: &TruncateCommand) -> MetaResult<FsmResponse> {
        let Some(mut inode) = self.inodes.get(cmd.inode)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        if inode.is_dir() {
            return Ok(FsmResponse::Status(ResultCode::ArgMismatchErr));
        }
        if inode.mark_delete {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        }
        if inode.generation != cmd.generation {
            return Ok(FsmResponse::Status(ResultCode::ArgMismatchErr));
        }
        let detached = std::mem::take(&mut inode.extents);
        inode.size = 0;
        inode.generation += 1;
        inode.modify_time = cmd.modify_time;
        self.inodes.put(&inode)?;

        // Times come from the command so replicas store identical bytes.
        let mut tombstone = Inode::new(cmd.tombstone_inode, inode.mode);
        tombstone.create_time = cmd.modify_time;
        tombstone.access_time = cmd.modify_time;
        tombstone.modify_time = cmd.modify_time;
        tombstone.mark_delete = true;
        tombstone.extents = detached;
        self.inodes.put(&tombstone)?;
        self.free_list.push(tombstone.clone());
        Ok(FsmResponse::Inode {
            status: ResultCode::Ok,
            inode: Some(tombstone),
        })
    }

    /// Removes fully-reclaimed inode records named by a packed stream of
    /// big-endian ids. Replaying the command is a no-op for ids already
    /// gone.
    pub(crate) fn fsm_internal_delete_inodes(&self, packed: &[u8]) -> MetaResult<FsmResponse> {
        let mut pos = 0;
        while pos + 8 <= packed.len() {
            let inode_id = u64::from_be_bytes(packed[pos..pos + 8].try_into().unwrap());
            self.inodes.delete(inode_id)?;
            pos += 8;
        }
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Whether the id is present at all, tombstoned included; the
    /// follower's free-list audit uses this.
    pub fn has_inode(&self, inode_id: u64) -> MetaResult<bool> {
        self.inodes.has(inode_id)
    }

    /// Fetches an inode, treating tombstoned records as absent.
    pub fn get_inode(&self, inode_id: u64) -> MetaResult<Option<Inode>> {
        match self.inodes.get(inode_id)? {
            Some(inode) if inode.mark_delete => Ok(None),
            other => Ok(other),
        }
    }
}
