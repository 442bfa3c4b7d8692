//! Request-level operations: marshal a client request, drive it through
//! the replicated log, and shape the reply. Reads are served from the
//! local trees on any replica.

use std::time::{SystemTime, UNIX_EPOCH};

use tidefs_proto::{
    AppendExtentKeyRequest, BatchGetXAttrRequest, BatchGetXAttrResponse, BatchInodeGetRequest,
    BatchInodeGetResponse, CreateDentryRequest, CreateInodeRequest, CreateInodeResponse,
    CreateMultipartRequest, CreateMultipartResponse, DeleteDentryRequest, DeleteDentryResponse,
    DeleteInodeRequest, DeleteInodeResponse, DentryItem, EvictInodeRequest, GetExtentsRequest,
    GetExtentsResponse, GetMultipartRequest, GetMultipartResponse, GetXAttrRequest,
    GetXAttrResponse, InodeGetRequest, InodeGetResponse, LinkInodeRequest, LinkInodeResponse,
    ListMultipartRequest, ListMultipartResponse, ListXAttrRequest, ListXAttrResponse,
    LookupRequest, LookupResponse, MultipartInfo, ReadDirRequest, ReadDirResponse,
    RemoveMultipartRequest, RemoveXAttrRequest, ResultCode, SetAttrRequest, SetXAttrRequest,
    TruncateRequest, TruncateResponse, UpdateDentryRequest, UpdateDentryResponse, XAttrInfo,
};

use crate::dentry::Dentry;
use crate::error::{MetaError, MetaResult};
use crate::fsm::{FsmResponse, MetaOp, SetAttrCommand, TruncateCommand, XAttrCommand};
use crate::inode::Inode;
use crate::multipart::{create_multipart_id, Multipart, Part};
use crate::partition::MetaPartition;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_inode_status(code: ResultCode, inode: u64) -> MetaResult<()> {
    match code {
        ResultCode::Ok => Ok(()),
        ResultCode::NotExistErr => Err(MetaError::InodeNotFound(inode)),
        ResultCode::ExistErr => Err(MetaError::Exists),
        ResultCode::ArgMismatchErr => {
            Err(MetaError::ArgMismatch(format!("inode {inode}")))
        }
        other => Err(MetaError::Again(format!("apply status {other}"))),
    }
}

fn check_multipart_status(code: ResultCode, path: &str, id: &str) -> MetaResult<()> {
    match code {
        ResultCode::Ok => Ok(()),
        ResultCode::NotExistErr => Err(MetaError::MultipartNotFound {
            path: path.to_string(),
            id: id.to_string(),
        }),
        ResultCode::ExistErr => Err(MetaError::Exists),
        other => Err(MetaError::Again(format!("apply status {other}"))),
    }
}

fn check_dentry_status(code: ResultCode, parent: u64, name: &str) -> MetaResult<()> {
    match code {
        ResultCode::Ok => Ok(()),
        ResultCode::NotExistErr => Err(MetaError::DentryNotFound {
            parent,
            name: name.to_string(),
        }),
        ResultCode::ExistErr => Err(MetaError::Exists),
        ResultCode::ArgMismatchErr => Err(MetaError::ArgMismatch(format!(
            "dentry ({parent}, {name})"
        ))),
        other => Err(MetaError::Again(format!("apply status {other}"))),
    }
}

impl MetaPartition {
    /// Creates an inode: allocates the next id from the cursor and
    /// commits the record through the log.
    pub fn op_create_inode(&self, req: &CreateInodeRequest) -> MetaResult<CreateInodeResponse> {
        let inode_id = self.next_inode_id()?;
        let mut inode = Inode::new(inode_id, req.mode);
        inode.target = req.target.clone();
        let response = self.submit(MetaOp::CreateInode, bincode::serialize(&inode)?)?;
        check_inode_status(response.status(), inode_id)?;
        Ok(CreateInodeResponse {
            info: inode.to_info(),
        })
    }

    /// Increments an inode's link count.
    pub fn op_link_inode(&self, req: &LinkInodeRequest) -> MetaResult<LinkInodeResponse> {
        let mut probe = Inode::new(req.inode, 0);
        probe.modify_time = unix_now();
        let response = self.submit(MetaOp::LinkInode, bincode::serialize(&probe)?)?;
        check_inode_status(response.status(), req.inode)?;
        match response {
            FsmResponse::Inode {
                inode: Some(inode), ..
            } => Ok(LinkInodeResponse {
                info: inode.to_info(),
            }),
            _ => Err(MetaError::Again("link applied without inode".into())),
        }
    }

    /// Decrements an inode's link count; at zero the inode joins the
    /// free list for reclamation.
    pub fn op_unlink_inode(&self, req: &DeleteInodeRequest) -> MetaResult<DeleteInodeResponse> {
        let mut probe = Inode::new(req.inode, 0);
        probe.modify_time = unix_now();
        let response = self.submit(MetaOp::UnlinkInode, bincode::serialize(&probe)?)?;
        check_inode_status(response.status(), req.inode)?;
        match response {
            FsmResponse::Inode {
                inode: Some(inode), ..
            } => Ok(DeleteInodeResponse {
                info: inode.to_info(),
            }),
            _ => Err(MetaError::Again("unlink applied without inode".into())),
        }
    }

    /// Evicts an inode whose links are gone.
    pub fn op_evict_inode(&self, req: &EvictInodeRequest) -> MetaResult<()> {
        let probe = Inode::new(req.inode, 0);
        let response = self.submit(MetaOp::EvictInode, bincode::serialize(&probe)?)?;
        check_inode_status(response.status(), req.inode)
    }

    /// Sets inode attributes.
    pub fn op_set_attr(&self, req: &SetAttrRequest) -> MetaResult<()> {
        let cmd = SetAttrCommand {
            inode: req.inode,
            mode: req.mode,
            access_time: req.access_time,
            modify_time: req.modify_time,
        };
        let response = self.submit(MetaOp::SetAttr, serde_json::to_vec(&cmd)?)?;
        check_inode_status(response.status(), req.inode)
    }

    /// Fetches one inode record.
    pub fn op_inode_get(&self, req: &InodeGetRequest) -> MetaResult<InodeGetResponse> {
        let inode = self
            .get_inode(req.inode)?
            .ok_or(MetaError::InodeNotFound(req.inode))?;
        Ok(InodeGetResponse {
            info: inode.to_info(),
        })
    }

    /// Fetches a batch of inode records, skipping missing ids.
    pub fn op_batch_inode_get(
        &self,
        req: &BatchInodeGetRequest,
    ) -> MetaResult<BatchInodeGetResponse> {
        let mut infos = Vec::with_capacity(req.inodes.len());
        for inode_id in &req.inodes {
            if let Some(inode) = self.get_inode(*inode_id)? {
                infos.push(inode.to_info());
            }
        }
        Ok(BatchInodeGetResponse { infos })
    }

    /// Creates a directory entry.
    pub fn op_create_dentry(&self, req: &CreateDentryRequest) -> MetaResult<()> {
        let dentry = Dentry {
            parent_id: req.parent_id,
            name: req.name.clone(),
            inode: req.inode,
            type_: req.mode,
        };
        let response = self.submit(MetaOp::CreateDentry, bincode::serialize(&dentry)?)?;
        check_dentry_status(response.status(), req.parent_id, &req.name)
    }

    /// Deletes a directory entry.
    pub fn op_delete_dentry(&self, req: &DeleteDentryRequest) -> MetaResult<DeleteDentryResponse> {
        let dentry = Dentry {
            parent_id: req.parent_id,
            name: req.name.clone(),
            inode: 0,
            type_: 0,
        };
        let response = self.submit(MetaOp::DeleteDentry, bincode::serialize(&dentry)?)?;
        check_dentry_status(response.status(), req.parent_id, &req.name)?;
        match response {
            FsmResponse::Dentry {
                dentry: Some(removed),
                ..
            } => Ok(DeleteDentryResponse {
                inode: removed.inode,
            }),
            _ => Err(MetaError::Again("delete applied without dentry".into())),
        }
    }

    /// Atomic same-parent rename: points the entry at a new inode and
    /// returns the inode it previously pointed at.
    pub fn op_update_dentry(&self, req: &UpdateDentryRequest) -> MetaResult<UpdateDentryResponse> {
        let dentry = Dentry {
            parent_id: req.parent_id,
            name: req.name.clone(),
            inode: req.inode,
            type_: 0,
        };
        let response = self.submit(MetaOp::UpdateDentry, bincode::serialize(&dentry)?)?;
        check_dentry_status(response.status(), req.parent_id, &req.name)?;
        match response {
            FsmResponse::Dentry {
                dentry: Some(old), ..
            } => Ok(UpdateDentryResponse { inode: old.inode }),
            _ => Err(MetaError::Again("update applied without dentry".into())),
        }
    }

    /// Looks a name up in a directory.
    pub fn op_lookup(&self, req: &LookupRequest) -> MetaResult<LookupResponse> {
        let dentry = self
            .lookup_dentry(req.parent_id, &req.name)?
            .ok_or_else(|| MetaError::DentryNotFound {
                parent: req.parent_id,
                name: req.name.clone(),
            })?;
        Ok(LookupResponse {
            inode: dentry.inode,
            mode: dentry.type_,
        })
    }

    /// Scans a directory.
    pub fn op_read_dir(&self, req: &ReadDirRequest) -> MetaResult<ReadDirResponse> {
        let children = self
            .read_dir(req.parent_id)?
            .into_iter()
            .map(|dentry| DentryItem {
                name: dentry.name,
                inode: dentry.inode,
                type_: dentry.type_,
            })
            .collect();
        Ok(ReadDirResponse { children })
    }

    /// Appends one extent key to an inode, stamping the request mtime.
    pub fn op_append_extent_key(&self, req: &AppendExtentKeyRequest) -> MetaResult<()> {
        let mut probe = Inode::new(req.inode, 0);
        probe.extents.push(req.extent);
        probe.modify_time = req.modify_time;
        let response = self.submit(MetaOp::ExtentsAdd, bincode::serialize(&probe)?)?;
        check_inode_status(response.status(), req.inode)
    }

    /// Lists an inode's extent keys in append order.
    pub fn op_get_extents(&self, req: &GetExtentsRequest) -> MetaResult<GetExtentsResponse> {
        let inode = self
            .get_inode(req.inode)?
            .ok_or(MetaError::InodeNotFound(req.inode))?;
        Ok(GetExtentsResponse {
            extents: inode.extents.clone(),
            size: inode.size,
            generation: inode.generation,
        })
    }

    /// Truncates an inode: its extents detach into a tombstone inode
    /// that joins the free list, and the caller receives the detached
    /// keys.
    pub fn op_truncate(&self, req: &TruncateRequest) -> MetaResult<TruncateResponse> {
        let tombstone_inode = self.next_inode_id()?;
        let cmd = TruncateCommand {
            inode: req.inode,
            generation: req.generation,
            modify_time: unix_now(),
            tombstone_inode,
        };
        let response = self.submit(MetaOp::ExtentsTruncate, serde_json::to_vec(&cmd)?)?;
        check_inode_status(response.status(), req.inode)?;
        match response {
            FsmResponse::Inode {
                inode: Some(tombstone),
                ..
            } => Ok(TruncateResponse {
                extents: tombstone.extents,
            }),
            _ => Err(MetaError::Again("truncate applied without inode".into())),
        }
    }

    /// Sets an extended attribute.
    pub fn op_set_xattr(&self, req: &SetXAttrRequest) -> MetaResult<()> {
        let cmd = XAttrCommand {
            inode: req.inode,
            key: req.key.clone(),
            value: req.value.clone(),
        };
        let response = self.submit(MetaOp::SetXAttr, serde_json::to_vec(&cmd)?)?;
        check_inode_status(response.status(), req.inode)
    }

    /// Fetches an extended attribute.
    pub fn op_get_xattr(&self, req: &GetXAttrRequest) -> MetaResult<GetXAttrResponse> {
        Ok(GetXAttrResponse {
            value: self.get_xattr(req.inode, &req.key)?,
        })
    }

    /// Lists extended attribute names.
    pub fn op_list_xattr(&self, req: &ListXAttrRequest) -> MetaResult<ListXAttrResponse> {
        Ok(ListXAttrResponse {
            keys: self.list_xattr(req.inode)?,
        })
    }

    /// Removes an extended attribute.
    pub fn op_remove_xattr(&self, req: &RemoveXAttrRequest) -> MetaResult<()> {
        let cmd = XAttrCommand {
            inode: req.inode,
            key: req.key.clone(),
            value: Vec::new(),
        };
        let response = self.submit(MetaOp::RemoveXAttr, serde_json::to_vec(&cmd)?)?;
        check_inode_status(response.status(), req.inode)
    }

    /// Fetches the requested attributes for a batch of inodes.
    pub fn op_batch_get_xattr(
        &self,
        req: &BatchGetXAttrRequest,
    ) -> MetaResult<BatchGetXAttrResponse> {
        let mut infos = Vec::new();
        for inode_id in &req.inodes {
            let Some(extend) = self.get_extend(*inode_id)? else {
                continue;
            };
            let mut attrs = std::collections::HashMap::new();
            for key in &req.keys {
                if let Some(value) = extend.attrs.get(key) {
                    attrs.insert(key.clone(), value.clone());
                }
            }
            if !attrs.is_empty() {
                infos.push(XAttrInfo {
                    inode: *inode_id,
                    attrs,
                });
            }
        }
        Ok(BatchGetXAttrResponse { infos })
    }

    /// Starts a multipart upload; the generated id embeds the partition.
    pub fn op_create_multipart(
        &self,
        req: &CreateMultipartRequest,
    ) -> MetaResult<CreateMultipartResponse> {
        let multipart_id = create_multipart_id(self.id());
        let multipart = Multipart::new(&req.path, &multipart_id, req.extend.clone());
        let response = self.submit(MetaOp::CreateMultipart, bincode::serialize(&multipart)?)?;
        check_multipart_status(response.status(), &req.path, &multipart_id)?;
        Ok(CreateMultipartResponse {
            info: MultipartInfo {
                id: multipart_id,
                path: req.path.clone(),
                init_time: multipart.init_time,
                parts: Vec::new(),
                extend: req.extend.clone(),
            },
        })
    }

    /// Records one uploaded part.
    pub fn op_append_multipart(
        &self,
        path: &str,
        multipart_id: &str,
        part: Part,
    ) -> MetaResult<()> {
        let mut request = Multipart::new(path, multipart_id, Default::default());
        request.parts.push(part);
        let response = self.submit(MetaOp::AppendMultipart, bincode::serialize(&request)?)?;
        check_multipart_status(response.status(), path, multipart_id)
    }

    /// Removes a multipart upload record.
    pub fn op_remove_multipart(&self, req: &RemoveMultipartRequest) -> MetaResult<()> {
        let request = Multipart::new(&req.path, &req.multipart_id, Default::default());
        let response = self.submit(MetaOp::RemoveMultipart, bincode::serialize(&request)?)?;
        check_multipart_status(response.status(), &req.path, &req.multipart_id)
    }

    /// Fetches one multipart upload record.
    pub fn op_get_multipart(&self, req: &GetMultipartRequest) -> MetaResult<GetMultipartResponse> {
        let multipart = self
            .get_multipart(&req.path, &req.multipart_id)?
            .ok_or_else(|| MetaError::MultipartNotFound {
                path: req.path.clone(),
                id: req.multipart_id.clone(),
            })?;
        Ok(GetMultipartResponse {
            info: multipart.to_info(),
        })
    }

    /// Lists multipart uploads by prefix with pagination.
    pub fn op_list_multiparts(
        &self,
        req: &ListMultipartRequest,
    ) -> MetaResult<ListMultipartResponse> {
        let matches = self.list_multiparts(
            &req.prefix,
            &req.marker,
            &req.multipart_id_marker,
            req.max.max(1) as usize,
        )?;
        Ok(ListMultipartResponse {
            multiparts: matches.iter().map(Multipart::to_info).collect(),
        })
    }
}
