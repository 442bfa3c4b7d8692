//! Ordered-tree abstraction behind the four metadata keyspaces.
//!
//! A backend supplies raw ordered byte-key storage with `{get, put,
//! create, delete, range, count, apply_id, flush, clear}`; the typed
//! wrappers layer record codecs and key layout on top. Two backends
//! exist: the in-memory ordered map (flushed wholesale by the store
//! snapshot) and the file-backed KV store with its own WAL.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dentry::Dentry;
use crate::error::MetaResult;
use crate::extend::Extend;
use crate::inode::Inode;
use crate::multipart::Multipart;

/// Raw ordered byte-key storage.
pub trait TreeBackend: Send + Sync {
    /// Fetches one value.
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>>;

    /// Inserts or replaces one value.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<()>;

    /// Inserts one value; returns false (without writing) when the key
    /// exists.
    fn create(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<bool>;

    /// Removes one key, returning its previous value.
    fn delete(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>>;

    /// Scans `[start, end)` in key order (to the tree's end when `end`
    /// is `None`); the callback returns false to stop.
    fn range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaResult<()>;

    /// Number of records.
    fn count(&self) -> u64;

    /// Records the highest applied log index.
    fn set_apply_id(&self, index: u64);

    /// The highest applied log index persisted with this tree.
    fn get_apply_id(&self) -> u64;

    /// Makes pending writes durable; a no-op for the memory backend.
    fn flush(&self) -> MetaResult<()>;

    /// Removes every record.
    fn clear(&self) -> MetaResult<()>;
}

/// In-memory ordered map backend.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    apply_id: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TreeBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<()> {
        self.data.write().unwrap().insert(key, value);
        Ok(())
    }

    fn create(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<bool> {
        let mut data = self.data.write().unwrap();
        if data.contains_key(&key) {
            return Ok(false);
        }
        data.insert(key, value);
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        Ok(self.data.write().unwrap().remove(key))
    }

    fn range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaResult<()> {
        let data = self.data.read().unwrap();
        let upper = match end {
            Some(end) => Bound::Excluded(end.to_vec()),
            None => Bound::Unbounded,
        };
        for (k, v) in data.range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper)) {
            if !cb(k, v) {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }

    fn set_apply_id(&self, index: u64) {
        self.apply_id.store(index, Ordering::SeqCst);
    }

    fn get_apply_id(&self) -> u64 {
        self.apply_id.load(Ordering::SeqCst)
    }

    fn flush(&self) -> MetaResult<()> {
        Ok(())
    }

    fn clear(&self) -> MetaResult<()> {
        self.data.write().unwrap().clear();
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> MetaResult<T> {
    Ok(bincode::deserialize(raw)?)
}

fn encode<T: Serialize>(value: &T) -> MetaResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// The inode keyspace.
#[derive(Clone)]
pub struct InodeTree {
    backend: Arc<dyn TreeBackend>,
}

impl InodeTree {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn TreeBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn TreeBackend> {
        &self.backend
    }

    /// Fetches one inode.
    pub fn get(&self, inode: u64) -> MetaResult<Option<Inode>> {
        match self.backend.get(&Inode::key(inode))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces one inode.
    pub fn put(&self, inode: &Inode) -> MetaResult<()> {
        self.backend
            .put(Inode::key(inode.inode).to_vec(), encode(inode)?)
    }

    /// Inserts one inode; false when the id exists.
    pub fn create(&self, inode: &Inode) -> MetaResult<bool> {
        self.backend
            .create(Inode::key(inode.inode).to_vec(), encode(inode)?)
    }

    /// Removes one inode.
    pub fn delete(&self, inode: u64) -> MetaResult<bool> {
        Ok(self.backend.delete(&Inode::key(inode))?.is_some())
    }

    /// Whether the id is present, tombstoned or not.
    pub fn has(&self, inode: u64) -> MetaResult<bool> {
        Ok(self.backend.get(&Inode::key(inode))?.is_some())
    }

    /// Scans every inode in id order.
    pub fn ascend(&self, cb: &mut dyn FnMut(&Inode) -> bool) -> MetaResult<()> {
        let mut failure = None;
        self.backend.range(&[], None, &mut |_, raw| {
            match decode::<Inode>(raw) {
                Ok(inode) => cb(&inode),
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Highest inode id present.
    pub fn max_inode(&self) -> MetaResult<u64> {
        let mut max = 0;
        self.ascend(&mut |inode| {
            max = max.max(inode.inode);
            true
        })?;
        Ok(max)
    }

    /// Number of inodes.
    pub fn count(&self) -> u64 {
        self.backend.count()
    }
}

/// The dentry keyspace.
#[derive(Clone)]
pub struct DentryTree {
    backend: Arc<dyn TreeBackend>,
}

impl DentryTree {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn TreeBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn TreeBackend> {
        &self.backend
    }

    /// Fetches one entry.
    pub fn get(&self, parent_id: u64, name: &str) -> MetaResult<Option<Dentry>> {
        match self.backend.get(&Dentry::key(parent_id, name))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces one entry.
    pub fn put(&self, dentry: &Dentry) -> MetaResult<()> {
        self.backend.put(
            Dentry::key(dentry.parent_id, &dentry.name),
            encode(dentry)?,
        )
    }

    /// Inserts one entry; false when `(parent, name)` exists.
    pub fn create(&self, dentry: &Dentry) -> MetaResult<bool> {
        self.backend.create(
            Dentry::key(dentry.parent_id, &dentry.name),
            encode(dentry)?,
        )
    }

    /// Removes one entry, returning it.
    pub fn delete(&self, parent_id: u64, name: &str) -> MetaResult<Option<Dentry>> {
        match self.backend.delete(&Dentry::key(parent_id, name))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Scans one directory's entries in name order.
    pub fn read_dir(&self, parent_id: u64) -> MetaResult<Vec<Dentry>> {
        let (start, end) = Dentry::dir_range(parent_id);
        let mut children = Vec::new();
        let mut failure = None;
        self.backend.range(&start, Some(&end), &mut |_, raw| {
            match decode::<Dentry>(raw) {
                Ok(dentry) => {
                    children.push(dentry);
                    true
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(children),
        }
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.backend.count()
    }
}

/// The extended-attribute keyspace.
#[derive(Clone)]
pub struct ExtendTree {
    backend: Arc<dyn TreeBackend>,
}

impl ExtendTree {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn TreeBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn TreeBackend> {
        &self.backend
    }

    /// Fetches one inode's attribute record.
    pub fn get(&self, inode: u64) -> MetaResult<Option<Extend>> {
        match self.backend.get(&Extend::key(inode))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces one attribute record.
    pub fn put(&self, extend: &Extend) -> MetaResult<()> {
        self.backend
            .put(Extend::key(extend.inode).to_vec(), encode(extend)?)
    }

    /// Removes one attribute record.
    pub fn delete(&self, inode: u64) -> MetaResult<bool> {
        Ok(self.backend.delete(&Extend::key(inode))?.is_some())
    }

    /// Number of records.
    pub fn count(&self) -> u64 {
        self.backend.count()
    }
}

/// The multipart keyspace.
#[derive(Clone)]
pub struct MultipartTree {
    backend: Arc<dyn TreeBackend>,
}

impl MultipartTree {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn TreeBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn TreeBackend> {
        &self.backend
    }

    /// Fetches one upload.
    pub fn get(&self, path: &str, id: &str) -> MetaResult<Option<Multipart>> {
        match self.backend.get(&Multipart::key(path, id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces one upload.
    pub fn put(&self, multipart: &Multipart) -> MetaResult<()> {
        self.backend.put(
            Multipart::key(&multipart.path, &multipart.id),
            encode(multipart)?,
        )
    }

    /// Inserts one upload; false when `(path, id)` exists.
    pub fn create(&self, multipart: &Multipart) -> MetaResult<bool> {
        self.backend.create(
            Multipart::key(&multipart.path, &multipart.id),
            encode(multipart)?,
        )
    }

    /// Removes one upload.
    pub fn delete(&self, path: &str, id: &str) -> MetaResult<bool> {
        Ok(self.backend.delete(&Multipart::key(path, id))?.is_some())
    }

    /// Lists uploads path-ordered from the `(marker, id marker)` key,
    /// keeping those whose path starts with `prefix`, at most `max`.
    pub fn list(
        &self,
        prefix: &str,
        marker: &str,
        id_marker: &str,
        max: usize,
    ) -> MetaResult<Vec<Multipart>> {
        let start = Multipart::key(marker, id_marker);
        let mut matches = Vec::new();
        let mut failure = None;
        self.backend.range(&start, None, &mut |_, raw| {
            match decode::<Multipart>(raw) {
                Ok(upload) => {
                    if !prefix.is_empty() && !upload.path.starts_with(prefix) {
                        return true;
                    }
                    matches.push(upload);
                    matches.len() < max
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(matches),
        }
    }

    /// Number of uploads.
    pub fn count(&self) -> u64 {
        self.backend.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidefs_proto::MODE_REGULAR;

    fn memory_inode_tree() -> InodeTree {
        InodeTree::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn test_inode_tree_create_get_delete() {
        let tree = memory_inode_tree();
        let inode = Inode::new(10, MODE_REGULAR);
        assert!(tree.create(&inode).unwrap());
        assert!(!tree.create(&inode).unwrap(), "duplicate create refused");
        assert_eq!(tree.get(10).unwrap().unwrap().inode, 10);
        assert!(tree.delete(10).unwrap());
        assert!(tree.get(10).unwrap().is_none());
    }

    #[test]
    fn test_inode_tree_max() {
        let tree = memory_inode_tree();
        for id in [5u64, 300, 42] {
            tree.put(&Inode::new(id, MODE_REGULAR)).unwrap();
        }
        assert_eq!(tree.max_inode().unwrap(), 300);
        assert_eq!(tree.count(), 3);
    }

    #[test]
    fn test_dentry_read_dir_scoped_to_parent() {
        let tree = DentryTree::new(Arc::new(MemoryBackend::new()));
        for (parent, name, inode) in [(1u64, "b", 11u64), (1, "a", 10), (2, "c", 12)] {
            tree.put(&Dentry {
                parent_id: parent,
                name: name.into(),
                inode,
                type_: MODE_REGULAR,
            })
            .unwrap();
        }
        let children = tree.read_dir(1).unwrap();
        let names: Vec<&str> = children.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_multipart_list_prefix_and_max() {
        let tree = MultipartTree::new(Arc::new(MemoryBackend::new()));
        for (path, id) in [("a/1", "x"), ("a/2", "y"), ("b/1", "z")] {
            tree.put(&Multipart::new(path, id, Default::default()))
                .unwrap();
        }
        let matches = tree.list("a/", "", "", 10).unwrap();
        assert_eq!(matches.len(), 2);
        let limited = tree.list("", "", "", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_apply_id_tracked() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get_apply_id(), 0);
        backend.set_apply_id(42);
        assert_eq!(backend.get_apply_id(), 42);
    }

    #[test]
    fn test_range_stops_on_false() {
        let backend = MemoryBackend::new();
        for i in 0u8..10 {
            backend.put(vec![i], vec![i]).unwrap();
        }
        let mut seen = 0;
        backend
            .range(&[], None, &mut |_, _| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
    }
}
