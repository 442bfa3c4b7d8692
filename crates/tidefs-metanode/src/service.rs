//! Meta node packet service: dispatches the wire protocol's metadata
//! opcodes onto the mounted partitions.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tidefs_proto::{
    crc32, AdminTask, AppendMultipartRequest, BatchGetXAttrRequest, BatchInodeGetRequest,
    CreateDentryRequest, CreateInodeRequest, CreateMultipartRequest, DeleteDentryRequest,
    DeleteInodeRequest, EvictInodeRequest, GetExtentsRequest, GetMultipartRequest,
    GetXAttrRequest, InodeGetRequest, LinkInodeRequest, ListMultipartRequest, ListXAttrRequest,
    LookupRequest, Opcode, Packet, ReadDirRequest, RemoveMultipartRequest, RemoveXAttrRequest,
    SetAttrRequest, SetXAttrRequest, TruncateRequest, UpdateDentryRequest,
};

use crate::error::{MetaError, MetaResult};
use crate::manager::MetadataManager;
use crate::multipart::Part;

fn action_tag(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::MetaCreateInode => "OpMetaCreateInode",
        Opcode::MetaLinkInode => "OpMetaLinkInode",
        Opcode::MetaUnlinkInode => "OpMetaUnlinkInode",
        Opcode::MetaEvictInode => "OpMetaEvictInode",
        Opcode::MetaSetAttr => "OpMetaSetAttr",
        Opcode::MetaInodeGet => "OpMetaInodeGet",
        Opcode::MetaBatchInodeGet => "OpMetaBatchInodeGet",
        Opcode::MetaCreateDentry => "OpMetaCreateDentry",
        Opcode::MetaDeleteDentry => "OpMetaDeleteDentry",
        Opcode::MetaUpdateDentry => "OpMetaUpdateDentry",
        Opcode::MetaLookup => "OpMetaLookup",
        Opcode::MetaReadDir => "OpMetaReadDir",
        Opcode::MetaExtentsAdd => "OpMetaExtentsAdd",
        Opcode::MetaExtentsList => "OpMetaExtentsList",
        Opcode::MetaTruncate => "OpMetaTruncate",
        Opcode::MetaSetXAttr => "OpMetaSetXAttr",
        Opcode::MetaGetXAttr => "OpMetaGetXAttr",
        Opcode::MetaListXAttr => "OpMetaListXAttr",
        Opcode::MetaRemoveXAttr => "OpMetaRemoveXAttr",
        Opcode::MetaBatchGetXAttr => "OpMetaBatchGetXAttr",
        Opcode::MetaCreateMultipart => "OpMetaCreateMultipart",
        Opcode::MetaAppendMultipart => "OpMetaAppendMultipart",
        Opcode::MetaRemoveMultipart => "OpMetaRemoveMultipart",
        Opcode::MetaListMultiparts => "OpMetaListMultiparts",
        Opcode::MetaGetMultipart => "OpMetaGetMultipart",
        Opcode::MetaNodeHeartbeat => "OpMetaNodeHeartbeat",
        _ => "OpMetaUnknown",
    }
}

/// The meta node's packet dispatcher.
pub struct MetaNodeService {
    manager: Arc<MetadataManager>,
}

impl MetaNodeService {
    /// Creates a service over the node's metadata manager.
    pub fn new(manager: Arc<MetadataManager>) -> Self {
        Self { manager }
    }

    /// The node's metadata manager.
    pub fn manager(&self) -> &Arc<MetadataManager> {
        &self.manager
    }

    /// Accept loop: one task per connection. Returns when the stop
    /// signal fires.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let service = Arc::clone(self);
                            tokio::spawn(async move {
                                info!(%peer, "meta connection accepted");
                                service.serve_connection(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "meta accept failed"),
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one connection to completion, packets handled sequentially.
    pub async fn serve_connection(&self, mut stream: TcpStream) {
        loop {
            let mut pkt = match Packet::read_from(&mut stream).await {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!(error = %e, "meta connection drained");
                    return;
                }
            };
            self.process_packet(&mut pkt);
            if pkt.write_to(&mut stream).await.is_err() {
                return;
            }
        }
    }

    /// Executes one packet, mutating it into its reply.
    pub fn process_packet(&self, pkt: &mut Packet) {
        let opcode = pkt.opcode;
        match self.dispatch(pkt) {
            Ok(Some(body)) => {
                let crc = crc32(&body);
                pkt.pack_ok_with_body(body);
                pkt.crc = crc;
            }
            Ok(None) => pkt.pack_ok_reply(),
            Err(e) => {
                warn!(op = %opcode, request = %pkt.unique_id(), error = %e, "meta packet failed");
                pkt.pack_error_body(e.result_code(), action_tag(opcode), &e.to_string());
            }
        }
    }

    fn parse<T: DeserializeOwned>(pkt: &Packet) -> MetaResult<T> {
        Ok(serde_json::from_slice(&pkt.data)?)
    }

    fn reply<T: Serialize>(value: &T) -> MetaResult<Option<Vec<u8>>> {
        Ok(Some(serde_json::to_vec(value)?))
    }

    fn dispatch(&self, pkt: &Packet) -> MetaResult<Option<Vec<u8>>> {
        match pkt.opcode {
            Opcode::MetaCreateInode => {
                let req: CreateInodeRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_create_inode(&req)?)
            }
            Opcode::MetaLinkInode => {
                let req: LinkInodeRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_link_inode(&req)?)
            }
            Opcode::MetaUnlinkInode => {
                let req: DeleteInodeRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_unlink_inode(&req)?)
            }
            Opcode::MetaEvictInode => {
                let req: EvictInodeRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_evict_inode(&req)?;
                Ok(None)
            }
            Opcode::MetaSetAttr => {
                let req: SetAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_set_attr(&req)?;
                Ok(None)
            }
            Opcode::MetaInodeGet => {
                let req: InodeGetRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_inode_get(&req)?)
            }
            Opcode::MetaBatchInodeGet => {
                let req: BatchInodeGetRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_batch_inode_get(&req)?)
            }
            Opcode::MetaCreateDentry => {
                let req: CreateDentryRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_create_dentry(&req)?;
                Ok(None)
            }
            Opcode::MetaDeleteDentry => {
                let req: DeleteDentryRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_delete_dentry(&req)?)
            }
            Opcode::MetaUpdateDentry => {
                let req: UpdateDentryRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_update_dentry(&req)?)
            }
            Opcode::MetaLookup => {
                let req: LookupRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_lookup(&req)?)
            }
            Opcode::MetaReadDir => {
                let req: ReadDirRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_read_dir(&req)?)
            }
            Opcode::MetaExtentsAdd => {
                let req: tidefs_proto::AppendExtentKeyRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_append_extent_key(&req)?;
                Ok(None)
            }
            Opcode::MetaExtentsList => {
                let req: GetExtentsRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_get_extents(&req)?)
            }
            Opcode::MetaTruncate => {
                let req: TruncateRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_truncate(&req)?)
            }
            Opcode::MetaSetXAttr => {
                let req: SetXAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_set_xattr(&req)?;
                Ok(None)
            }
            Opcode::MetaGetXAttr => {
                let req: GetXAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_get_xattr(&req)?)
            }
            Opcode::MetaListXAttr => {
                let req: ListXAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_list_xattr(&req)?)
            }
            Opcode::MetaRemoveXAttr => {
                let req: RemoveXAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_remove_xattr(&req)?;
                Ok(None)
            }
            Opcode::MetaBatchGetXAttr => {
                let req: BatchGetXAttrRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_batch_get_xattr(&req)?)
            }
            Opcode::MetaCreateMultipart => {
                let req: CreateMultipartRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_create_multipart(&req)?)
            }
            Opcode::MetaAppendMultipart => {
                let req: AppendMultipartRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                let part = Part {
                    id: req.part.id,
                    inode: req.part.inode,
                    md5: req.part.md5.clone(),
                    size: req.part.size,
                    upload_time: req.part.upload_time,
                };
                partition.op_append_multipart(&req.path, &req.multipart_id, part)?;
                Ok(None)
            }
            Opcode::MetaRemoveMultipart => {
                let req: RemoveMultipartRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                partition.op_remove_multipart(&req)?;
                Ok(None)
            }
            Opcode::MetaListMultiparts => {
                let req: ListMultipartRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_list_multiparts(&req)?)
            }
            Opcode::MetaGetMultipart => {
                let req: GetMultipartRequest = Self::parse(pkt)?;
                let partition = self.manager.partition(req.partition_id)?;
                Self::reply(&partition.op_get_multipart(&req)?)
            }
            Opcode::MetaNodeHeartbeat => {
                let mut task: AdminTask = Self::parse(pkt)?;
                let summaries: Vec<_> = self
                    .manager
                    .partitions()
                    .iter()
                    .map(|p| p.load_summary())
                    .collect();
                task.set_response(&summaries)?;
                Self::reply(&task)
            }
            other => Err(MetaError::ArgMismatch(format!(
                "opcode {other} is not a metadata operation"
            ))),
        }
    }
}
