//! Growable memory-mapped file
//!
//! Thin read-write wrapper over `memmap2`. The file is mapped in full and
//! regrown (extend + remap) in fixed steps when an append needs more room.
//! All multi-byte accessors are little-endian, matching the on-disk formats
//! in `log` and `index::btree`.

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Growth step for the mapped region. Appends extend the file by whole
/// steps so remaps stay rare.
const GROW_STEP: u64 = 64 * 1024;

/// A file mapped read-write in full.
#[derive(Debug)]
pub(crate) struct MappedFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
}

impl MappedFile {
    /// Open or create the file and map it.
    ///
    /// A fresh or short file is extended to `min_len` first, so headers can
    /// be written without an immediate regrow. Creates parent directories if
    /// they don't exist.
    pub(crate) fn open(path: &Path, min_len: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len < min_len {
            file.set_len(min_len)?;
        }

        // SAFETY: the mapping is private to this process for the lifetime of
        // the store; the store layer serializes all mutation behind one lock.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MappedFile {
            file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Currently mapped length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Make sure at least `required` bytes are addressable, regrowing the
    /// file and remapping if they are not.
    pub(crate) fn ensure_len(&mut self, required: u64) -> Result<()> {
        if required <= self.mmap.len() as u64 {
            return Ok(());
        }
        let new_len = (required + GROW_STEP - 1) / GROW_STEP * GROW_STEP;
        debug!(path = %self.path.display(), old = self.mmap.len(), new = new_len, "Growing mapped file");

        self.mmap.flush()?;
        self.file.set_len(new_len)?;
        // SAFETY: same justification as in `open`; the old mapping is
        // dropped by the assignment after the new one is established.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Flush mapped pages to disk (msync).
    pub(crate) fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.mmap[offset..offset + 4])
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.mmap[offset..offset + 4], value);
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.mmap[offset..offset + len]
    }

    pub(crate) fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.mmap[offset..offset + len]
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file_at_min_len() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        let mapped = MappedFile::open(&path, 128).unwrap();
        assert!(path.exists());
        assert_eq!(mapped.len(), 128);
    }

    #[test]
    fn test_u32_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        {
            let mut mapped = MappedFile::open(&path, 64).unwrap();
            mapped.write_u32(8, 0xDEAD_BEEF);
            mapped.flush().unwrap();
        }

        let mapped = MappedFile::open(&path, 64).unwrap();
        assert_eq!(mapped.read_u32(8), 0xDEAD_BEEF);
    }

    #[test]
    fn test_ensure_len_grows_and_preserves_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        let mut mapped = MappedFile::open(&path, 64).unwrap();
        mapped.write_u32(0, 77);

        mapped.ensure_len(GROW_STEP + 1).unwrap();
        assert!(mapped.len() as u64 >= GROW_STEP + 1);
        assert_eq!(mapped.len() as u64 % GROW_STEP, 0);
        assert_eq!(mapped.read_u32(0), 77);
    }

    #[test]
    fn test_ensure_len_noop_when_already_large_enough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        let mut mapped = MappedFile::open(&path, 256).unwrap();
        mapped.ensure_len(100).unwrap();
        assert_eq!(mapped.len(), 256);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("data");

        MappedFile::open(&path, 64).unwrap();
        assert!(path.exists());
    }
}
