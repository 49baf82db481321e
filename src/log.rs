//! Append-only fixed-slot record log
//!
//! The log is a single memory-mapped file holding every enumerated hash in
//! slot order. Slot `k` holds the `k`-th distinct hash ever enumerated, so
//! the log alone answers the id → hash direction, the full traversal, and
//! the record count; the dedup index (hash → id) lives elsewhere.
//!
//! # File Format (Version 1)
//!
//! ```text
//! [magic "CHEL" 4B]
//! [version u32 LE]
//! [signature_len u32 LE]
//! [record_width u32 LE]
//! [records_count u32 LE]   — committed records; slots beyond it are unpublished
//! [state u32 LE]           — 0 = closed cleanly, 1 = dirty
//! [reserved 32B]
//! [header_crc u32 LE]      — crc32 of bytes 0..16 (the immutable prefix)
//! [reserved 4B]
//! [record slots: records_count * record_width, see `record`]
//! ```
//!
//! `records_count` is bumped only after a record's bytes are fully written,
//! so readers never observe a partially-written record. The crc covers only
//! the immutable prefix: the mutable fields change on every append and a
//! crash between field and checksum updates must not brick the store.
//!
//! The `state` flag is set dirty on the first mutation after open and reset
//! on `flush`/`close`. A dirty flag on open means the previous session did
//! not close cleanly; committed records are still intact, but any derived
//! index must be rebuilt by a full scan.

use std::path::Path;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::record;

const MAGIC: &[u8; 4] = b"CHEL";
const VERSION: u32 = 1;

pub(crate) const HEADER_SIZE: usize = 64;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_SIGNATURE_LEN: usize = 8;
const OFFSET_RECORD_WIDTH: usize = 12;
const OFFSET_RECORDS_COUNT: usize = 16;
const OFFSET_STATE: usize = 20;
const OFFSET_HEADER_CRC: usize = 56;

/// Length of the header prefix covered by the crc
const IMMUTABLE_PREFIX: usize = 16;

const STATE_CLEAN: u32 = 0;
const STATE_DIRTY: u32 = 1;

/// Append-only log of fixed-width hash records over a memory-mapped file.
#[derive(Debug)]
pub(crate) struct RecordLog {
    file: MappedFile,
    signature_len: usize,
    record_width: usize,
    records_count: u32,
    /// State flag found on open, before this session touched anything
    was_clean: bool,
    /// Whether this session already stamped the dirty flag
    dirty: bool,
}

impl RecordLog {
    /// Open or create a log at `path` for hashes of `signature_len` bytes.
    ///
    /// A fresh file is initialized with zero records. An existing file is
    /// validated: magic word, version, signature length, header crc, and
    /// that the file actually holds `records_count` slots.
    pub(crate) fn open(path: &Path, signature_len: usize, initial_capacity: u32) -> Result<Self> {
        let record_width = record::record_width(signature_len);
        let min_len = HEADER_SIZE as u64 + initial_capacity as u64 * record_width as u64;
        let mut file = MappedFile::open(path, min_len)?;

        let fresh = file.slice(OFFSET_MAGIC, 4) == [0u8; 4];
        if fresh {
            file.slice_mut(OFFSET_MAGIC, 4).copy_from_slice(MAGIC);
            file.write_u32(OFFSET_VERSION, VERSION);
            file.write_u32(OFFSET_SIGNATURE_LEN, signature_len as u32);
            file.write_u32(OFFSET_RECORD_WIDTH, record_width as u32);
            file.write_u32(OFFSET_RECORDS_COUNT, 0);
            file.write_u32(OFFSET_STATE, STATE_CLEAN);
            let crc = crc32fast::hash(file.slice(0, IMMUTABLE_PREFIX));
            file.write_u32(OFFSET_HEADER_CRC, crc);
            file.flush()?;

            debug!(path = %path.display(), signature_len, "Initialized fresh record log");
            return Ok(RecordLog {
                file,
                signature_len,
                record_width,
                records_count: 0,
                was_clean: true,
                dirty: false,
            });
        }

        if file.slice(OFFSET_MAGIC, 4) != MAGIC {
            return Err(Error::Corrupted(format!(
                "{}: not a record log (bad magic word)",
                path.display()
            )));
        }
        let version = file.read_u32(OFFSET_VERSION);
        if version != VERSION {
            return Err(Error::Corrupted(format!(
                "{}: unsupported log version {version} (expected {VERSION})",
                path.display()
            )));
        }
        let stored_signature_len = file.read_u32(OFFSET_SIGNATURE_LEN) as usize;
        if stored_signature_len != signature_len {
            return Err(Error::Corrupted(format!(
                "{}: signature length {stored_signature_len} != configured {signature_len}",
                path.display()
            )));
        }
        let stored_width = file.read_u32(OFFSET_RECORD_WIDTH) as usize;
        if stored_width != record_width {
            return Err(Error::Corrupted(format!(
                "{}: record width {stored_width} != expected {record_width}",
                path.display()
            )));
        }
        let crc = crc32fast::hash(file.slice(0, IMMUTABLE_PREFIX));
        let stored_crc = file.read_u32(OFFSET_HEADER_CRC);
        if crc != stored_crc {
            return Err(Error::Corrupted(format!(
                "{}: header crc mismatch (stored {stored_crc:#x}, computed {crc:#x})",
                path.display()
            )));
        }

        let records_count = file.read_u32(OFFSET_RECORDS_COUNT);
        let needed = HEADER_SIZE as u64 + records_count as u64 * record_width as u64;
        if needed > file.len() as u64 {
            return Err(Error::Corrupted(format!(
                "{}: header claims {records_count} records but file holds fewer",
                path.display()
            )));
        }

        let was_clean = file.read_u32(OFFSET_STATE) == STATE_CLEAN;
        debug!(
            path = %path.display(),
            records_count,
            was_clean,
            "Opened existing record log"
        );

        Ok(RecordLog {
            file,
            signature_len,
            record_width,
            records_count,
            was_clean,
            dirty: false,
        })
    }

    /// Number of committed records. O(1): maintained in the header.
    pub(crate) fn records_count(&self) -> u32 {
        self.records_count
    }

    /// Whether the previous session closed this log cleanly.
    pub(crate) fn was_clean(&self) -> bool {
        self.was_clean
    }

    pub(crate) fn signature_len(&self) -> usize {
        self.signature_len
    }

    pub(crate) fn record_width(&self) -> usize {
        self.record_width
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    /// Append a record and return its slot index (0-based).
    ///
    /// The record bytes are fully written before `records_count` is bumped,
    /// so the new slot becomes visible only as a complete record.
    pub(crate) fn append(&mut self, hash: &[u8], link: u32) -> Result<u32> {
        record::check_signature(hash, self.signature_len)?;
        self.mark_dirty();

        let slot = self.records_count;
        let offset = self.slot_offset(slot);
        self.file
            .ensure_len(offset as u64 + self.record_width as u64)?;

        let width = self.record_width;
        record::encode(hash, link, self.file.slice_mut(offset, width));

        self.records_count = slot + 1;
        self.file.write_u32(OFFSET_RECORDS_COUNT, self.records_count);
        trace!(slot, "Appended record");
        Ok(slot)
    }

    /// Read the record at `slot`. The slot must be `< records_count()`.
    pub(crate) fn record(&self, slot: u32) -> (&[u8], u32) {
        debug_assert!(slot < self.records_count);
        let buf = self.file.slice(self.slot_offset(slot), self.record_width);
        record::decode(buf, self.signature_len)
    }

    /// Lazy traversal of all committed records in slot order.
    ///
    /// Each call starts over from slot 0.
    pub(crate) fn iter(&self) -> RecordIter<'_> {
        RecordIter { log: self, slot: 0 }
    }

    /// Flush mapped pages and mark the log cleanly synced.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        if self.dirty {
            self.file.write_u32(OFFSET_STATE, STATE_CLEAN);
            self.file.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Flush and release the mapping.
    pub(crate) fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn mark_dirty(&mut self) {
        if !self.dirty {
            self.file.write_u32(OFFSET_STATE, STATE_DIRTY);
            self.dirty = true;
        }
    }

    fn slot_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + slot as usize * self.record_width
    }
}

/// Iterator over `(slot, hash)` pairs of a [`RecordLog`].
pub(crate) struct RecordIter<'a> {
    log: &'a RecordLog,
    slot: u32,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot >= self.log.records_count {
            return None;
        }
        let slot = self.slot;
        self.slot += 1;
        let (hash, _link) = self.log.record(slot);
        Some((slot, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(seed: u8) -> Vec<u8> {
        (0..20).map(|i| seed.wrapping_add(i)).collect()
    }

    #[test]
    fn test_fresh_log_is_empty_and_clean() {
        let dir = TempDir::new().unwrap();
        let log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();
        assert_eq!(log.records_count(), 0);
        assert!(log.was_clean());
        assert_eq!(log.record_width(), 24);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();

        let slot_a = log.append(&hash(1), 0).unwrap();
        let slot_b = log.append(&hash(2), slot_a + 1).unwrap();
        assert_eq!(slot_a, 0);
        assert_eq!(slot_b, 1);
        assert_eq!(log.records_count(), 2);

        let (h, link) = log.record(0);
        assert_eq!(h, &hash(1)[..]);
        assert_eq!(link, 0);

        let (h, link) = log.record(1);
        assert_eq!(h, &hash(2)[..]);
        assert_eq!(link, 1);
    }

    #[test]
    fn test_append_rejects_wrong_length_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();

        let err = log.append(&[0u8; 19], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidSignatureLength { .. }));
        assert_eq!(log.records_count(), 0);
    }

    #[test]
    fn test_reopen_restores_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");

        {
            let mut log = RecordLog::open(&path, 20, 16).unwrap();
            for seed in 0..10 {
                log.append(&hash(seed), 0).unwrap();
            }
            log.close().unwrap();
        }

        let log = RecordLog::open(&path, 20, 16).unwrap();
        assert_eq!(log.records_count(), 10);
        assert!(log.was_clean());
        for (slot, h) in log.iter() {
            assert_eq!(h, &hash(slot as u8)[..]);
        }
        assert_eq!(log.iter().count(), 10);
    }

    #[test]
    fn test_unflushed_session_leaves_dirty_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");

        {
            let mut log = RecordLog::open(&path, 20, 16).unwrap();
            log.append(&hash(1), 0).unwrap();
            std::mem::forget(log); // simulate a crash: no close, no flush
        }

        let log = RecordLog::open(&path, 20, 16).unwrap();
        assert!(!log.was_clean());
        // Committed records survive regardless
        assert_eq!(log.records_count(), 1);
    }

    #[test]
    fn test_flush_clears_dirty_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");

        {
            let mut log = RecordLog::open(&path, 20, 16).unwrap();
            log.append(&hash(1), 0).unwrap();
            log.flush().unwrap();
            std::mem::forget(log);
        }

        let log = RecordLog::open(&path, 20, 16).unwrap();
        assert!(log.was_clean());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, vec![0x42u8; 128]).unwrap();

        let err = RecordLog::open(&path, 20, 16).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn test_open_rejects_signature_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");

        {
            let log = RecordLog::open(&path, 20, 16).unwrap();
            log.close().unwrap();
        }

        let err = RecordLog::open(&path, 32, 16).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");

        {
            let mut log = RecordLog::open(&path, 20, 4).unwrap();
            for seed in 0..100 {
                log.append(&hash(seed), 0).unwrap();
            }
            log.close().unwrap();
        }

        // Chop the file below what the header claims
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_SIZE as u64 + 24).unwrap();

        let err = RecordLog::open(&path, 20, 4).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn test_iter_restarts_from_beginning() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();
        log.append(&hash(1), 0).unwrap();
        log.append(&hash(2), 0).unwrap();

        let first: Vec<u32> = log.iter().map(|(slot, _)| slot).collect();
        let second: Vec<u32> = log.iter().map(|(slot, _)| slot).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_append_grows_past_initial_capacity() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 2).unwrap();
        for seed in 0..50 {
            log.append(&hash(seed), 0).unwrap();
        }
        assert_eq!(log.records_count(), 50);
        let (h, _) = log.record(49);
        assert_eq!(h, &hash(49)[..]);
    }
}
