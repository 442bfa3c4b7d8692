//! Dentry operations applied by the state machine.

use tidefs_proto::ResultCode;

use crate::dentry::Dentry;
use crate::error::MetaResult;
use crate::fsm::FsmResponse;
use crate::partition::MetaPartition;

impl MetaPartition {
    /// Inserts a dentry. Files and directories never overwrite each
    /// other, and re-creating an identical entry is treated as success
    /// so rename retries stay idempotent.
    pub(crate) fn fsm_create_dentry(&self, dentry: Dentry) -> MetaResult<FsmResponse> {
        if let Some(existing) = self.dentries.get(dentry.parent_id, &dentry.name)? {
            if existing.type_ != dentry.type_ {
                return Ok(FsmResponse::Status(ResultCode::ArgMismatchErr));
            }
            if existing.inode == dentry.inode {
                return Ok(FsmResponse::Status(ResultCode::Ok));
            }
            return Ok(FsmResponse::Status(ResultCode::ExistErr));
        }
        self.dentries.create(&dentry)?;
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Removes a dentry, returning what it pointed at.
    pub(crate) fn fsm_delete_dentry(&self, dentry: &Dentry) -> MetaResult<FsmResponse> {
        match self.dentries.delete(dentry.parent_id, &dentry.name)? {
            Some(removed) => Ok(FsmResponse::Dentry {
                status: ResultCode::Ok,
                dentry: Some(removed),
            }),
            None => Ok(FsmResponse::Status(ResultCode::NotExistErr)),
        }
    }

    /// Atomic same-parent rename: points the entry at the request's
    /// inode and returns the entry carrying the inode it previously
    /// pointed at. No intermediate state is observable, the swap happens
    /// inside one applied command.
    pub(crate) fn fsm_update_dentry(&self, request: Dentry) -> MetaResult<FsmResponse> {
        let Some(mut stored) = self.dentries.get(request.parent_id, &request.name)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        let old_inode = stored.inode;
        stored.inode = request.inode;
        self.dentries.put(&stored)?;
        let mut response = request;
        response.inode = old_inode;
        Ok(FsmResponse::Dentry {
            status: ResultCode::Ok,
            dentry: Some(response),
        })
    }

    /// Looks one entry up.
    pub fn lookup_dentry(&self, parent_id: u64, name: &str) -> MetaResult<Option<Dentry>> {
        self.dentries.get(parent_id, name)
    }

    /// Scans a directory's entries in name order.
    pub fn read_dir(&self, parent_id: u64) -> MetaResult<Vec<Dentry>> {
        self.dentries.read_dir(parent_id)
    }
}
