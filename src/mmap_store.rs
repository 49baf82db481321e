//! Durable memory-mapped enumerator backend
//!
//! A [`RecordLog`] holds the records; a [`HashTableIndex`] rebuilt on every
//! open answers the hash → id direction. Internally this backend numbers
//! records by the 4-byte-word offset of their slot ("enumerator ids", the
//! durable-log numbering); the stable hash ids handed out publicly are the
//! dense 1-based slot numbering. The two are related by a reversible affine
//! transform whose stride depends on the signature length:
//!
//! ```text
//! stride_words     = record_width / 4          (record slots are word-aligned)
//! enumerator_id    = slot * stride_words + 1
//! hash_id          = slot + 1
//! ```
//!
//! so `hash_id_to_enumerator_id(h) = (h - 1) * stride + 1` and its inverse
//! divides exactly; a value that does not divide exactly is not a valid
//! enumerator id and is rejected rather than aliased to a neighbor.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::hashtable::HashTableIndex;
use crate::log::RecordLog;
use crate::record;
use crate::store::{HashId, HashStore, Visit, NULL_ID};

/// Highest slot the i32 id space can address for a given stride.
fn max_slot(stride_words: u32) -> u32 {
    (i32::MAX as u32 - 1) / stride_words
}

/// Map a dense hash id to the word-offset enumerator id.
pub(crate) fn hash_id_to_enumerator_id(hash_id: HashId, stride_words: u32) -> HashId {
    debug_assert!(hash_id > 0);
    (hash_id - 1) * stride_words as HashId + 1
}

/// Inverse of [`hash_id_to_enumerator_id`]. `None` for values that are not
/// on the stride grid and therefore not valid enumerator ids.
pub(crate) fn enumerator_id_to_hash_id(enumerator_id: HashId, stride_words: u32) -> Option<HashId> {
    if enumerator_id <= 0 {
        return None;
    }
    let word = enumerator_id - 1;
    if word % stride_words as HashId != 0 {
        return None;
    }
    Some(word / stride_words as HashId + 1)
}

/// Memory-mapped durable enumerator: append-only log + rebuilt hash index.
pub(crate) struct MmapHashStore {
    log: RecordLog,
    index: HashTableIndex,
    stride_words: u32,
    path: PathBuf,
}

impl MmapHashStore {
    /// Open or create the store at `path`.
    ///
    /// The dedup index is rebuilt from the log by a full scan on every open;
    /// a dirty flag left by a crash therefore costs nothing extra.
    pub(crate) fn open(path: &Path, signature_len: usize, initial_capacity: u32) -> Result<Self> {
        let log = RecordLog::open(path, signature_len, initial_capacity)?;
        if !log.was_clean() {
            debug!(path = %path.display(), "Previous session did not close cleanly");
        }
        let index = HashTableIndex::rebuild(&log);
        let stride_words = (log.record_width() / 4) as u32;

        info!(
            path = %path.display(),
            records = log.records_count(),
            "Opened mmap hash store"
        );
        Ok(MmapHashStore {
            log,
            index,
            stride_words,
            path: path.to_path_buf(),
        })
    }

    /// Word-offset numbering of a record slot (the durable-log id space).
    fn slot_to_enumerator_id(&self, slot: u32) -> HashId {
        // Fits in i32: enumerate() refuses appends past max_slot
        (slot as i64 * self.stride_words as i64 + 1) as HashId
    }

    /// Dense public id of a record slot, via the enumerator id space.
    fn slot_to_id(&self, slot: u32) -> Result<HashId> {
        enumerator_id_to_hash_id(self.slot_to_enumerator_id(slot), self.stride_words).ok_or_else(
            || {
                Error::Corrupted(format!(
                    "{}: slot {slot} maps off the stride grid",
                    self.path.display()
                ))
            },
        )
    }

    fn id_to_slot(&self, id: HashId) -> Result<u32> {
        if id <= 0 || id as u32 > self.log.records_count() {
            return Err(Error::UnknownHashId(id));
        }
        let enumerator_id = hash_id_to_enumerator_id(id, self.stride_words);
        Ok((enumerator_id as u32 - 1) / self.stride_words)
    }
}

impl HashStore for MmapHashStore {
    fn enumerate(&mut self, hash: &[u8]) -> Result<HashId> {
        record::check_signature(hash, self.log.signature_len())?;
        if let Some(slot) = self.index.lookup(&self.log, hash) {
            return self.slot_to_id(slot);
        }
        if self.log.records_count() > max_slot(self.stride_words) {
            return Err(Error::Corrupted(format!(
                "{}: id space exhausted at {} records",
                self.path.display(),
                self.log.records_count()
            )));
        }
        let link = self.index.chain_head(hash);
        let slot = self.log.append(hash, link)?;
        self.index.set_head(hash, slot + 1);
        self.slot_to_id(slot)
    }

    fn try_enumerate(&mut self, hash: &[u8]) -> Result<HashId> {
        record::check_signature(hash, self.log.signature_len())?;
        match self.index.lookup(&self.log, hash) {
            Some(slot) => self.slot_to_id(slot),
            None => Ok(NULL_ID),
        }
    }

    fn value_of(&mut self, id: HashId) -> Result<Vec<u8>> {
        let slot = self.id_to_slot(id)?;
        let (hash, _link) = self.log.record(slot);
        Ok(hash.to_vec())
    }

    fn for_each(&mut self, visitor: &mut dyn FnMut(HashId, &[u8]) -> Visit) -> Result<()> {
        for (slot, hash) in self.log.iter() {
            let id = self.slot_to_id(slot)?;
            if visitor(id, hash).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn records_count(&self) -> u32 {
        self.log.records_count()
    }

    fn flush(&mut self) -> Result<()> {
        self.log.flush()
    }

    fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.log.close()?;
        info!(path = %this.path.display(), "Closed mmap hash store");
        Ok(())
    }

    fn close_and_clean(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.log.close()?;
        std::fs::remove_file(&this.path)?;
        info!(path = %this.path.display(), "Closed and cleaned mmap hash store");
        Ok(())
    }
}
