//! Extended-attribute operations applied by the state machine.

use tidefs_proto::ResultCode;

use crate::error::MetaResult;
use crate::extend::Extend;
use crate::fsm::{FsmResponse, XAttrCommand};
use crate::partition::MetaPartition;

impl MetaPartition {
    /// Sets one attribute, creating the inode's record on first use.
    pub(crate) fn fsm_set_xattr(&self, cmd: &XAttrCommand) -> MetaResult<FsmResponse> {
        let mut extend = self
            .extends
            .get(cmd.inode)?
            .unwrap_or_else(|| Extend::new(cmd.inode));
        extend.attrs.insert(cmd.key.clone(), cmd.value.clone());
        self.extends.put(&extend)?;
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Removes one attribute; the record stays (possibly empty) so the
    /// removal is idempotent.
    pub(crate) fn fsm_remove_xattr(&self, cmd: &XAttrCommand) -> MetaResult<FsmResponse> {
        if let Some(mut extend) = self.extends.get(cmd.inode)? {
            extend.attrs.remove(&cmd.key);
            self.extends.put(&extend)?;
        }
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Fetches one attribute value.
    pub fn get_xattr(&self, inode: u64, key: &str) -> MetaResult<Option<Vec<u8>>> {
        Ok(self
            .extends
            .get(inode)?
            .and_then(|extend| extend.attrs.get(key).cloned()))
    }

    /// Lists one inode's attribute names in sorted order.
    pub fn list_xattr(&self, inode: u64) -> MetaResult<Vec<String>> {
        Ok(self
            .extends
            .get(inode)?
            .map(|extend| extend.attrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Fetches the whole attribute record.
    pub fn get_extend(&self, inode: u64) -> MetaResult<Option<Extend>> {
        self.extends.get(inode)
    }
}
