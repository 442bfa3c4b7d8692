//! JSON message bodies exchanged with the metadata tier.
//!
//! Field tags stay short on the wire; every request names its volume and
//! target partition so routing layers can dispatch without decoding the
//! rest of the body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::extent_key::ExtentKey;

/// Inode id of the volume root directory.
pub const ROOT_INODE: u64 = 1;

/// Regular file mode.
pub const MODE_REGULAR: u32 = 0;
/// Directory mode.
pub const MODE_DIR: u32 = 1;
/// Symbolic link mode.
pub const MODE_SYMLINK: u32 = 2;

/// Inode record as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode id.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// File mode (regular / dir / symlink).
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// File size in bytes.
    #[serde(rename = "sz")]
    pub size: u64,
    /// Generation counter, bumped on every extent append and truncate.
    #[serde(rename = "gen")]
    pub generation: u64,
    /// Modification time, seconds since epoch.
    #[serde(rename = "mt")]
    pub modify_time: u64,
    /// Creation time, seconds since epoch.
    #[serde(rename = "ct")]
    pub create_time: u64,
    /// Access time, seconds since epoch.
    #[serde(rename = "at")]
    pub access_time: u64,
    /// Symlink target, empty for other modes.
    #[serde(rename = "tgt")]
    pub target: Vec<u8>,
}

/// A directory entry as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DentryItem {
    /// Entry name.
    pub name: String,
    /// Child inode id.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Child file mode.
    #[serde(rename = "type")]
    pub type_: u32,
}

/// Create a new inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInodeRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// File mode.
    pub mode: u32,
    /// Symlink target, empty otherwise.
    #[serde(rename = "tgt")]
    pub target: Vec<u8>,
}

/// Response carrying the created inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInodeResponse {
    /// The created inode record.
    pub info: InodeInfo,
}

/// Increment an inode's link count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInodeRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Response carrying the linked inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInodeResponse {
    /// The updated inode record.
    pub info: InodeInfo,
}

/// Decrement an inode's link count (unlink).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInodeRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Response carrying the unlinked inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInodeResponse {
    /// The updated inode record.
    pub info: InodeInfo,
}

/// Evict an inode whose links are gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictInodeRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Set inode attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// New mode, if set.
    pub mode: Option<u32>,
    /// New modification time (seconds), if set.
    #[serde(rename = "mt")]
    pub modify_time: Option<u64>,
    /// New access time (seconds), if set.
    #[serde(rename = "at")]
    pub access_time: Option<u64>,
}

/// Create a directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDentryRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Parent directory inode.
    #[serde(rename = "pino")]
    pub parent_id: u64,
    /// Child inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Entry name.
    pub name: String,
    /// Child file mode.
    pub mode: u32,
}

/// Atomic rename at the same parent: point `name` at a new inode, return
/// the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDentryRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Parent directory inode.
    #[serde(rename = "pino")]
    pub parent_id: u64,
    /// Entry name.
    pub name: String,
    /// New child inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Response carrying the inode the entry pointed at before the update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDentryResponse {
    /// Old child inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Delete a directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDentryRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Parent directory inode.
    #[serde(rename = "pino")]
    pub parent_id: u64,
    /// Entry name.
    pub name: String,
}

/// Response carrying the removed entry's inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDentryResponse {
    /// Removed child inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Look a name up in a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Parent directory inode.
    #[serde(rename = "pino")]
    pub parent_id: u64,
    /// Entry name.
    pub name: String,
}

/// Lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Child inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Child file mode.
    pub mode: u32,
}

/// Fetch one inode record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeGetRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Response carrying one inode record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeGetResponse {
    /// The inode record.
    pub info: InodeInfo,
}

/// Fetch a batch of inode records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInodeGetRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inodes.
    #[serde(rename = "inos")]
    pub inodes: Vec<u64>,
}

/// Response carrying the found subset of the requested batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInodeGetResponse {
    /// Found inode records; missing ids are skipped.
    pub infos: Vec<InodeInfo>,
}

/// Scan a directory's dentries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDirRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Directory inode.
    #[serde(rename = "pino")]
    pub parent_id: u64,
}

/// Directory scan result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDirResponse {
    /// Entries in name order.
    pub children: Vec<DentryItem>,
}

/// Append one extent key to an inode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendExtentKeyRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// The extent key to attach.
    #[serde(rename = "ek")]
    pub extent: ExtentKey,
    /// Modification time to stamp, seconds since epoch.
    #[serde(rename = "mt")]
    pub modify_time: u64,
}

/// List an inode's extent keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExtentsRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Extent list result, in append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExtentsResponse {
    /// The inode's extent keys.
    #[serde(rename = "eks")]
    pub extents: Vec<ExtentKey>,
    /// Current file size.
    #[serde(rename = "sz")]
    pub size: u64,
    /// Current generation.
    #[serde(rename = "gen")]
    pub generation: u64,
}

/// Truncate an inode's extents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Generation the caller saw; mismatch fails the truncate.
    #[serde(rename = "gen")]
    pub generation: u64,
}

/// Truncate result carrying the detached extents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateResponse {
    /// Extent keys detached by the truncate.
    #[serde(rename = "eks")]
    pub extents: Vec<ExtentKey>,
}

/// An inode's extended attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XAttrInfo {
    /// Owning inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Attribute name → value.
    #[serde(rename = "xattrs")]
    pub attrs: HashMap<String, Vec<u8>>,
}

/// Set an extended attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetXAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Attribute name.
    pub key: String,
    /// Attribute value.
    pub value: Vec<u8>,
}

/// Get an extended attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetXAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Attribute name.
    pub key: String,
}

/// Extended-attribute lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetXAttrResponse {
    /// Attribute value; absent when the attribute is not set.
    pub value: Option<Vec<u8>>,
}

/// List extended attribute names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListXAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
}

/// Extended-attribute name list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListXAttrResponse {
    /// Attribute names in sorted order.
    pub keys: Vec<String>,
}

/// Remove an extended attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveXAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inode.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Attribute name.
    pub key: String,
}

/// Get extended attributes for a batch of inodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGetXAttrRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Target inodes.
    #[serde(rename = "inos")]
    pub inodes: Vec<u64>,
    /// Names to fetch for each inode.
    pub keys: Vec<String>,
}

/// Batched extended-attribute lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGetXAttrResponse {
    /// One record per inode that had at least one requested attribute.
    pub infos: Vec<XAttrInfo>,
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartPartInfo {
    /// Part number, 1-based.
    pub id: u16,
    /// Inode holding the part's data.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Hex digest of the part's content.
    pub md5: String,
    /// Part size in bytes.
    #[serde(rename = "sz")]
    pub size: u64,
    /// Upload time, seconds since epoch.
    #[serde(rename = "ut")]
    pub upload_time: u64,
}

/// A multipart upload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartInfo {
    /// Upload id.
    pub id: String,
    /// Object path the upload targets.
    pub path: String,
    /// Initiation time, seconds since epoch.
    #[serde(rename = "it")]
    pub init_time: u64,
    /// Uploaded parts in part-number order.
    pub parts: Vec<MultipartPartInfo>,
    /// User metadata attached at initiation.
    pub extend: HashMap<String, String>,
}

/// Start a multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Object path the upload targets.
    pub path: String,
    /// User metadata to attach.
    pub extend: HashMap<String, String>,
}

/// Response carrying the new upload's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartResponse {
    /// The created upload record (id and path populated).
    pub info: MultipartInfo,
}

/// Append a part to a multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendMultipartRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Object path the upload targets.
    pub path: String,
    /// Upload id.
    #[serde(rename = "uid")]
    pub multipart_id: String,
    /// The part to record.
    pub part: MultipartPartInfo,
}

/// Remove a multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMultipartRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Object path the upload targets.
    pub path: String,
    /// Upload id.
    #[serde(rename = "uid")]
    pub multipart_id: String,
}

/// Fetch one multipart upload record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMultipartRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Object path the upload targets.
    pub path: String,
    /// Upload id.
    #[serde(rename = "uid")]
    pub multipart_id: String,
}

/// Response carrying one multipart upload record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMultipartResponse {
    /// The upload record.
    pub info: MultipartInfo,
}

/// List multipart uploads by path prefix with pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMultipartRequest {
    /// Volume name.
    #[serde(rename = "vol")]
    pub vol_name: String,
    /// Target meta partition.
    #[serde(rename = "pid")]
    pub partition_id: u64,
    /// Path prefix filter; empty matches everything.
    pub prefix: String,
    /// Path marker to resume from.
    pub marker: String,
    /// Upload-id marker to resume from.
    #[serde(rename = "uidmarker")]
    pub multipart_id_marker: String,
    /// Maximum records to return.
    pub max: u64,
}

/// Multipart listing result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMultipartResponse {
    /// Matching upload records, at most `max`.
    pub multiparts: Vec<MultipartInfo>,
}
