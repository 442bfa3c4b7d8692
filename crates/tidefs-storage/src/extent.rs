//! Extent entry files.
//!
//! A normal extent keeps its owner inode stamp, a 1024-entry per-block CRC
//! table, and a tombstone byte in a fixed header ahead of the data body.
//! Tiny extents have no header: writes land at the raw offset and the
//! data watermark rounds up to the 4 KiB page the hole puncher works in.
//!
//! The store does not serialize concurrent writes to the same byte range;
//! an extent is single-writer in practice because clients stream
//! sequentially, and that precondition is owned by the caller.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use tidefs_proto::crc32;
use crate::{
    BLOCK_SIZE, EXTENT_HEADER_SIZE, EXTENT_SIZE_LIMIT, HEADER_CRC_OFFSET, HEADER_INO_SIZE,
    MARK_DELETE, MARK_DELETE_INDEX, PAGE_SIZE, PER_BLOCK_CRC_SIZE,
};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn round_up_page(v: u64) -> u64 {
    if v % PAGE_SIZE == 0 {
        v
    } else {
        v + (PAGE_SIZE - v % PAGE_SIZE)
    }
}

struct ExtentInner {
    header: Vec<u8>,
    data_size: u64,
    modified: u64,
}

/// One extent entry file.
pub struct Extent {
    extent_id: u64,
    path: PathBuf,
    file: File,
    tiny: bool,
    inner: RwLock<ExtentInner>,
}

impl Extent {
    /// Creates (or, with `overwrite`, re-opens) the entry file and
    /// initializes the header: inode stamp, then the empty-block CRC
    /// repeated for every block; fsyncs before returning.
    pub fn create(path: &Path, extent_id: u64, inode: u64, overwrite: bool) -> StorageResult<Self> {
        let file = if overwrite {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?
        } else {
            OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        StorageError::ExtentExists(extent_id)
                    } else {
                        StorageError::Io(e)
                    }
                })?
        };
        let tiny = tidefs_proto::is_tiny_extent(extent_id);
        let extent = Self {
            extent_id,
            path: path.to_path_buf(),
            file,
            tiny,
            inner: RwLock::new(ExtentInner {
                header: vec![0u8; if tiny { 0 } else { EXTENT_HEADER_SIZE }],
                data_size: 0,
                modified: unix_now(),
            }),
        };
        if let Err(e) = extent.init_header(inode) {
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(extent)
    }

    fn init_header(&self, inode: u64) -> StorageResult<()> {
        if self.tiny {
            return Ok(());
        }
        self.file.set_len(EXTENT_HEADER_SIZE as u64)?;
        let empty_crc = crc32(&vec![0u8; BLOCK_SIZE as usize]);
        {
            let mut inner = self.inner.write().unwrap();
            inner.header[..HEADER_INO_SIZE].copy_from_slice(&inode.to_be_bytes());
            for block_no in 0..crate::BLOCK_COUNT as usize {
                let start = HEADER_CRC_OFFSET + block_no * PER_BLOCK_CRC_SIZE;
                inner.header[start..start + PER_BLOCK_CRC_SIZE]
                    .copy_from_slice(&empty_crc.to_be_bytes());
            }
            self.file.write_all_at(&inner.header, 0)?;
            inner.data_size = 0;
            inner.modified = unix_now();
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Opens an existing entry file, failing with `BrokenExtent` when a
    /// normal extent is shorter than its header. Loads the header on
    /// request and records `data_size = file size - header size`.
    pub fn open(path: &Path, extent_id: u64, load_header: bool) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let tiny = tidefs_proto::is_tiny_extent(extent_id);
        if tiny {
            return Ok(Self {
                extent_id,
                path: path.to_path_buf(),
                file,
                tiny,
                inner: RwLock::new(ExtentInner {
                    header: Vec::new(),
                    data_size: len,
                    modified: unix_now(),
                }),
            });
        }
        if len < EXTENT_HEADER_SIZE as u64 {
            return Err(StorageError::BrokenExtent {
                extent_id,
                size: len,
            });
        }
        let mut header = vec![0u8; EXTENT_HEADER_SIZE];
        if load_header {
            file.read_exact_at(&mut header, 0)?;
        }
        let modified = file
            .metadata()?
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_else(unix_now);
        Ok(Self {
            extent_id,
            path: path.to_path_buf(),
            file,
            tiny,
            inner: RwLock::new(ExtentInner {
                header,
                data_size: len - EXTENT_HEADER_SIZE as u64,
                modified,
            }),
        })
    }

    /// The extent id.
    pub fn id(&self) -> u64 {
        self.extent_id
    }

    /// Whether this is a tiny-pool extent.
    pub fn is_tiny(&self) -> bool {
        self.tiny
    }

    /// The owner inode stamped in the header; zero for tiny extents.
    pub fn ino(&self) -> u64 {
        if self.tiny {
            return 0;
        }
        let inner = self.inner.read().unwrap();
        u64::from_be_bytes(inner.header[..HEADER_INO_SIZE].try_into().unwrap())
    }

    /// Restamps the owner inode in the header and on disk.
    pub fn modify_ino(&self, inode: u64) -> StorageResult<()> {
        if self.tiny {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        inner.header[..HEADER_INO_SIZE].copy_from_slice(&inode.to_be_bytes());
        self.file
            .write_all_at(&inner.header[..HEADER_INO_SIZE], 0)?;
        Ok(())
    }

    /// Data length in bytes, excluding the header.
    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().data_size
    }

    /// Last modification, seconds since epoch.
    pub fn modified(&self) -> u64 {
        self.inner.read().unwrap().modified
    }

    fn check_offset_and_size(&self, offset: u64, size: u64) -> StorageResult<()> {
        if offset + size > EXTENT_SIZE_LIMIT
            || offset >= EXTENT_SIZE_LIMIT
            || size == 0
            || size > BLOCK_SIZE
        {
            return Err(StorageError::ParamMismatch { offset, size });
        }
        Ok(())
    }

    /// Writes `data` at `offset`. Whole-block aligned writes store the
    /// client-supplied CRC directly; partial writes re-read every touched
    /// block and recompute its CRC. Advances `data_size` to
    /// `max(data_size, offset + size)`.
    pub fn write(&self, data: &[u8], offset: u64, size: u64, crc: u32) -> StorageResult<()> {
        if self.tiny {
            return self.write_tiny(data, offset, size);
        }
        self.check_offset_and_size(offset, size)?;
        let mut inner = self.inner.write().unwrap();
        self.file
            .write_all_at(&data[..size as usize], offset + EXTENT_HEADER_SIZE as u64)?;
        let block_no = offset / BLOCK_SIZE;
        let offset_in_block = offset % BLOCK_SIZE;
        inner.data_size = inner.data_size.max(offset + size);
        inner.modified = unix_now();
        if offset_in_block == 0 && size == BLOCK_SIZE {
            return self.update_block_crc(&mut inner, block_no as usize, crc);
        }
        self.recompute_block_crcs(&mut inner, block_no, offset_in_block + size)
    }

    fn write_tiny(&self, data: &[u8], offset: u64, size: u64) -> StorageResult<()> {
        if offset + size >= u32::MAX as u64 {
            return Err(StorageError::ExtentFull(self.extent_id));
        }
        let mut inner = self.inner.write().unwrap();
        self.file.write_all_at(&data[..size as usize], offset)?;
        inner.data_size = round_up_page(offset + size);
        inner.modified = unix_now();
        Ok(())
    }

    /// Repair-path tiny write: lands the bytes and sets `data_size` to
    /// exactly `offset + size`, without page rounding.
    pub fn write_tiny_recover(&self, data: &[u8], offset: u64, size: u64) -> StorageResult<()> {
        if !self.tiny {
            return Err(StorageError::NotTinyExtent(self.extent_id));
        }
        if offset + size >= u32::MAX as u64 {
            return Err(StorageError::ExtentFull(self.extent_id));
        }
        let mut inner = self.inner.write().unwrap();
        self.file.write_all_at(&data[..size as usize], offset)?;
        inner.data_size = offset + size;
        inner.modified = unix_now();
        Ok(())
    }

    fn update_block_crc(
        &self,
        inner: &mut ExtentInner,
        block_no: usize,
        crc: u32,
    ) -> StorageResult<()> {
        let start = HEADER_CRC_OFFSET + block_no * PER_BLOCK_CRC_SIZE;
        let end = start + PER_BLOCK_CRC_SIZE;
        inner.header[start..end].copy_from_slice(&crc.to_be_bytes());
        self.file
            .write_all_at(&inner.header[start..end], start as u64)?;
        inner.modified = unix_now();
        Ok(())
    }

    fn recompute_block_crcs(
        &self,
        inner: &mut ExtentInner,
        mut block_no: u64,
        mut remain: u64,
    ) -> StorageResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        loop {
            let read_n =
                self.read_at_most(&mut buf, block_no * BLOCK_SIZE + EXTENT_HEADER_SIZE as u64)?;
            if read_n == 0 {
                break;
            }
            let crc = crc32(&buf[..read_n]);
            self.update_block_crc(inner, block_no as usize, crc)?;
            if (read_n as u64) < BLOCK_SIZE || remain <= read_n as u64 {
                break;
            }
            remain -= read_n as u64;
            block_no += 1;
        }
        Ok(())
    }

    fn read_at_most(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Reads `size` bytes at `offset` into `buf` and returns the CRC32 of
    /// what was read, so callers can verify end to end.
    pub fn read(&self, buf: &mut [u8], offset: u64, size: u64) -> StorageResult<u32> {
        if self.tiny {
            self.file.read_exact_at(&mut buf[..size as usize], offset)?;
            return Ok(crc32(&buf[..size as usize]));
        }
        self.check_offset_and_size(offset, size)?;
        let _inner = self.inner.read().unwrap();
        self.file
            .read_exact_at(&mut buf[..size as usize], offset + EXTENT_HEADER_SIZE as u64)?;
        Ok(crc32(&buf[..size as usize]))
    }

    /// Sets the tombstone byte and fsyncs the header. Irreversible; tiny
    /// extents are never tombstoned.
    pub fn mark_delete(&self) -> StorageResult<()> {
        if self.tiny {
            return Ok(());
        }
        {
            let mut inner = self.inner.write().unwrap();
            inner.header[MARK_DELETE_INDEX] = MARK_DELETE;
            self.file.write_all_at(&inner.header, 0)?;
            inner.modified = unix_now();
        }
        self.file.sync_all()?;
        debug!(extent_id = self.extent_id, "extent tombstoned");
        Ok(())
    }

    /// Whether the tombstone byte is set; always false for tiny extents.
    pub fn is_mark_delete(&self) -> bool {
        if self.tiny {
            return false;
        }
        let inner = self.inner.read().unwrap();
        inner.header[MARK_DELETE_INDEX] == MARK_DELETE
    }

    /// Punches a hole over `[offset, offset + size)`. The offset must be
    /// page aligned; the size rounds up to a page multiple.
    pub fn delete_tiny(&self, offset: u64, size: u64) -> StorageResult<()> {
        if !self.tiny {
            return Err(StorageError::NotTinyExtent(self.extent_id));
        }
        if offset % PAGE_SIZE != 0 {
            return Err(StorageError::ParamMismatch { offset, size });
        }
        let size = round_up_page(size);
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                size as libc::off_t,
            )
        };
        if rc != 0 {
            return Err(StorageError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Fsyncs the entry file.
    pub fn flush(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// CRC32 over the populated portion of the block-CRC table, covering
    /// every block the current data length touches.
    pub fn header_checksum(&self) -> u32 {
        if self.tiny {
            return 0;
        }
        let inner = self.inner.read().unwrap();
        let mut blocks = inner.data_size / BLOCK_SIZE;
        if inner.data_size % BLOCK_SIZE != 0 {
            blocks += 1;
        }
        let end = HEADER_CRC_OFFSET + blocks as usize * PER_BLOCK_CRC_SIZE;
        crc32(&inner.header[HEADER_CRC_OFFSET..end])
    }

    /// Raw CRC table entry for one block.
    pub fn block_crc(&self, block_no: usize) -> u32 {
        let inner = self.inner.read().unwrap();
        let start = HEADER_CRC_OFFSET + block_no * PER_BLOCK_CRC_SIZE;
        u32::from_be_bytes(
            inner.header[start..start + PER_BLOCK_CRC_SIZE]
                .try_into()
                .unwrap(),
        )
    }

    /// Whether the entry file still exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Filesystem path of the entry file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read_whole_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2");
        let extent = Extent::create(&path, 2, 1000, false).unwrap();

        let data = vec![0xAA; BLOCK_SIZE as usize];
        let crc = crc32(&data);
        extent.write(&data, 0, BLOCK_SIZE, crc).unwrap();
        assert_eq!(extent.size(), BLOCK_SIZE);
        assert_eq!(extent.block_crc(0), crc);

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let read_crc = extent.read(&mut buf, 0, BLOCK_SIZE).unwrap();
        assert_eq!(read_crc, crc);
        assert_eq!(buf, data);
        assert_eq!(extent.ino(), 1000);
    }

    #[test]
    fn test_partial_write_recomputes_crc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3");
        let extent = Extent::create(&path, 3, 1, false).unwrap();

        let data = vec![0x5A; 1000];
        extent.write(&data, 100, 1000, 0).unwrap();
        assert_eq!(extent.size(), 1100);

        // The stored CRC must cover the block as read back, not the write.
        let mut block = vec![0u8; 1100];
        extent.read(&mut block, 0, 1100).unwrap();
        assert_eq!(extent.block_crc(0), crc32(&block));
    }

    #[test]
    fn test_write_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("4");
        let extent = Extent::create(&path, 4, 1, false).unwrap();
        let data = vec![0u8; BLOCK_SIZE as usize + 1];

        assert!(matches!(
            extent.write(&data, 0, BLOCK_SIZE + 1, 0),
            Err(StorageError::ParamMismatch { .. })
        ));
        assert!(matches!(
            extent.write(&data, EXTENT_SIZE_LIMIT, 1, 0),
            Err(StorageError::ParamMismatch { .. })
        ));
        assert!(matches!(
            extent.write(&data, 0, 0, 0),
            Err(StorageError::ParamMismatch { .. })
        ));
    }

    #[test]
    fn test_data_size_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("5");
        let extent = Extent::create(&path, 5, 1, false).unwrap();
        let data = vec![1u8; 4096];
        extent.write(&data, 8192, 4096, 0).unwrap();
        assert_eq!(extent.size(), 12288);
        extent.write(&data, 0, 4096, 0).unwrap();
        assert_eq!(extent.size(), 12288);
    }

    #[test]
    fn test_mark_delete_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("6");
        let extent = Extent::create(&path, 6, 1, false).unwrap();
        assert!(!extent.is_mark_delete());
        extent.mark_delete().unwrap();
        assert!(extent.is_mark_delete());
        extent.mark_delete().unwrap();
        assert!(extent.is_mark_delete());
    }

    #[test]
    fn test_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7");
        let data = vec![0xCC; BLOCK_SIZE as usize];
        let crc = crc32(&data);
        {
            let extent = Extent::create(&path, 7, 77, false).unwrap();
            extent.write(&data, 0, BLOCK_SIZE, crc).unwrap();
            extent.flush().unwrap();
        }
        let extent = Extent::open(&path, 7, true).unwrap();
        assert_eq!(extent.size(), BLOCK_SIZE);
        assert_eq!(extent.ino(), 77);
        assert_eq!(extent.block_crc(0), crc);
    }

    #[test]
    fn test_restore_broken_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("8");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            Extent::open(&path, 8, true),
            Err(StorageError::BrokenExtent { extent_id: 8, size: 5 })
        ));
    }

    #[test]
    fn test_tiny_write_rounds_watermark() {
        let dir = tempdir().unwrap();
        let id = tidefs_proto::TINY_EXTENT_START_ID;
        let path = dir.path().join(id.to_string());
        let extent = Extent::create(&path, id, 0, false).unwrap();
        assert!(extent.is_tiny());

        let data = vec![0x11; 100];
        extent.write(&data, 0, 100, 0).unwrap();
        assert_eq!(extent.size(), PAGE_SIZE);

        extent.write(&data, PAGE_SIZE, 100, 0).unwrap();
        assert_eq!(extent.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_tiny_recover_sets_exact_size() {
        let dir = tempdir().unwrap();
        let id = tidefs_proto::TINY_EXTENT_START_ID + 1;
        let path = dir.path().join(id.to_string());
        let extent = Extent::create(&path, id, 0, false).unwrap();
        let data = vec![0x22; 100];
        extent.write_tiny_recover(&data, 0, 100).unwrap();
        assert_eq!(extent.size(), 100);
    }

    #[test]
    fn test_tiny_recover_rejects_normal_extent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("9");
        let extent = Extent::create(&path, 9, 1, false).unwrap();
        assert!(matches!(
            extent.write_tiny_recover(&[0u8; 8], 0, 8),
            Err(StorageError::NotTinyExtent(9))
        ));
    }

    #[test]
    fn test_delete_tiny_alignment() {
        let dir = tempdir().unwrap();
        let id = tidefs_proto::TINY_EXTENT_START_ID + 2;
        let path = dir.path().join(id.to_string());
        let extent = Extent::create(&path, id, 0, false).unwrap();
        let data = vec![0x33; 2 * PAGE_SIZE as usize];
        extent.write(&data, 0, 2 * PAGE_SIZE, 0).unwrap();

        // Misaligned offset fails before touching the file.
        assert!(matches!(
            extent.delete_tiny(1, PAGE_SIZE),
            Err(StorageError::ParamMismatch { offset: 1, .. })
        ));
        // Aligned offset with an unaligned size rounds the size up.
        extent.delete_tiny(0, PAGE_SIZE + 1).unwrap();
    }

    #[test]
    fn test_create_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("10");
        let _extent = Extent::create(&path, 10, 1, false).unwrap();
        assert!(matches!(
            Extent::create(&path, 10, 1, false),
            Err(StorageError::ExtentExists(10))
        ));
        // Overwrite mode re-opens without error.
        let again = Extent::create(&path, 10, 2, true).unwrap();
        assert_eq!(again.ino(), 2);
    }

    #[test]
    fn test_header_checksum_tracks_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("11");
        let extent = Extent::create(&path, 11, 1, false).unwrap();
        let data = vec![0x44; BLOCK_SIZE as usize];
        let crc = crc32(&data);
        extent.write(&data, 0, BLOCK_SIZE, crc).unwrap();
        let one_block = extent.header_checksum();
        extent.write(&data, BLOCK_SIZE, BLOCK_SIZE, crc).unwrap();
        assert_ne!(extent.header_checksum(), 0);
        assert_ne!(extent.header_checksum(), one_block);
    }
}
