//! File-backed tree backend: an in-memory ordered map fronted by a
//! write-ahead log, checkpointed wholesale for fast recovery. This is
//! the embedded-KV realization of [`TreeBackend`]; the store snapshot
//! mechanism of the meta partition simply calls [`TreeBackend::flush`]
//! on it instead of rewriting tree files.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};
use crate::tree::TreeBackend;

const WAL_FILE: &str = "wal.bin";
const CHECKPOINT_FILE: &str = "checkpoint.bin";
const APPLY_FILE: &str = "applyid.bin";

#[derive(Debug, Serialize, Deserialize)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Clear,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
}

impl WalWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn append(&mut self, op: &WalOp) -> MetaResult<()> {
        let encoded = bincode::serialize(op)?;
        self.file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        self.file.write_all(&encoded)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()
    }
}

/// File-backed ordered key-value backend.
pub struct KvBackend {
    dir: PathBuf,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalWriter>,
    apply_id: AtomicU64,
}

impl KvBackend {
    /// Opens (creating if needed) the backend at `dir`, loading the last
    /// checkpoint and replaying whatever the WAL holds past it.
    pub fn open(dir: &Path) -> MetaResult<Self> {
        fs::create_dir_all(dir)?;
        let wal = WalWriter::open(&dir.join(WAL_FILE))?;
        let backend = Self {
            dir: dir.to_path_buf(),
            data: RwLock::new(BTreeMap::new()),
            wal: Mutex::new(wal),
            apply_id: AtomicU64::new(0),
        };
        backend.load_checkpoint()?;
        backend.replay_wal()?;
        backend.load_apply_id()?;
        Ok(backend)
    }

    fn load_checkpoint(&self) -> MetaResult<()> {
        let path = self.dir.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(());
        }
        let mut contents = Vec::new();
        File::open(&path)?.read_to_end(&mut contents)?;
        if contents.is_empty() {
            return Ok(());
        }
        let checkpoint: Checkpoint = bincode::deserialize(&contents)
            .map_err(|e| MetaError::Broken(format!("checkpoint: {e}")))?;
        let mut data = self.data.write().unwrap();
        for (k, v) in checkpoint.entries {
            data.insert(k, v);
        }
        Ok(())
    }

    fn replay_wal(&self) -> MetaResult<()> {
        let path = self.dir.join(WAL_FILE);
        let mut file = File::open(&path)?;
        let mut data = self.data.write().unwrap();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut op_buf = vec![0u8; len];
            file.read_exact(&mut op_buf)?;
            let op: WalOp = bincode::deserialize(&op_buf)
                .map_err(|e| MetaError::Broken(format!("wal record: {e}")))?;
            match op {
                WalOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WalOp::Delete { key } => {
                    data.remove(&key);
                }
                WalOp::Clear => data.clear(),
            }
        }
        Ok(())
    }

    fn load_apply_id(&self) -> MetaResult<()> {
        let path = self.dir.join(APPLY_FILE);
        if !path.exists() {
            return Ok(());
        }
        let mut buf = [0u8; 8];
        let mut file = File::open(&path)?;
        if file.read_exact(&mut buf).is_ok() {
            self.apply_id
                .store(u64::from_be_bytes(buf), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Writes a checkpoint of the whole map and truncates the WAL.
    pub fn checkpoint(&self) -> MetaResult<()> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let data = self.data.read().unwrap();
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let encoded = bincode::serialize(&Checkpoint { entries })?;
        let final_path = self.dir.join(CHECKPOINT_FILE);
        let tmp_path = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        self.wal.lock().unwrap().truncate()?;
        Ok(())
    }

    fn persist_apply_id(&self) -> MetaResult<()> {
        let path = self.dir.join(APPLY_FILE);
        let tmp = self.dir.join(format!("{APPLY_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.apply_id.load(Ordering::SeqCst).to_be_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl TreeBackend for KvBackend {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<()> {
        self.wal.lock().unwrap().append(&WalOp::Put {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.data.write().unwrap().insert(key, value);
        Ok(())
    }

    fn create(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<bool> {
        {
            let data = self.data.read().unwrap();
            if data.contains_key(&key) {
                return Ok(false);
            }
        }
        self.put(key, value)?;
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        self.wal
            .lock()
            .unwrap()
            .append(&WalOp::Delete { key: key.to_vec() })?;
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
        self.checkpoint()?;
        self.persist_apply_id()
    }

    fn clear(&self) -> MetaResult<()> {
        self.wal.lock().unwrap().append(&WalOp::Clear)?;
        self.data.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let backend = KvBackend::open(dir.path()).unwrap();
        backend.put(b"k1".to_vec(), b"v1".to_vec()).unwrap();
        assert_eq!(backend.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.delete(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_create_refuses_duplicates() {
        let dir = tempdir().unwrap();
        let backend = KvBackend::open(dir.path()).unwrap();
        assert!(backend.create(b"k".to_vec(), b"v1".to_vec()).unwrap());
        assert!(!backend.create(b"k".to_vec(), b"v2".to_vec()).unwrap());
        assert_eq!(backend.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_wal_replay_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = KvBackend::open(dir.path()).unwrap();
            backend.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            backend.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            backend.delete(b"a").unwrap();
        }
        let backend = KvBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(b"a").unwrap(), None);
        assert_eq!(backend.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_flush_checkpoints_and_persists_apply_id() {
        let dir = tempdir().unwrap();
        {
            let backend = KvBackend::open(dir.path()).unwrap();
            backend.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            backend.set_apply_id(99);
            backend.flush().unwrap();
        }
        // WAL was truncated; state comes back from the checkpoint.
        assert_eq!(fs::metadata(dir.path().join(WAL_FILE)).unwrap().len(), 0);
        let backend = KvBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get_apply_id(), 99);
    }

    #[test]
    fn test_clear_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = KvBackend::open(dir.path()).unwrap();
            backend.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            backend.clear().unwrap();
        }
        let backend = KvBackend::open(dir.path()).unwrap();
        assert_eq!(backend.count(), 0);
    }

    #[test]
    fn test_range_bounds() {
        let dir = tempdir().unwrap();
        let backend = KvBackend::open(dir.path()).unwrap();
        for key in [b"a", b"b", b"c", b"d"] {
            backend.put(key.to_vec(), key.to_vec()).unwrap();
        }
        let mut seen = Vec::new();
        backend
            .range(b"b", Some(b"d"), &mut |k, _| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
