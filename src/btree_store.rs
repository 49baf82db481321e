//! B-tree enumerator backend
//!
//! The same append-only [`RecordLog`] answers the id → hash direction,
//! traversal and the record count; the hash → id direction lives in a
//! durable on-disk [`BTreeIndex`] next to the log (`<path>.btx`), so reopen
//! needs no index rebuild in the common case.
//!
//! A new hash is appended to the log first and inserted into the tree
//! second. A crash in between leaves the tree behind the log; the entry
//! count cross-check on open detects that (as does a dirty log flag) and
//! rebuilds the tree from the log, which is always the source of truth.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::btree::BTreeIndex;
use crate::log::RecordLog;
use crate::record;
use crate::store::{HashId, HashStore, Visit, NULL_ID};

/// Extension appended to the log path for the index file.
const INDEX_EXTENSION: &str = ".btx";

fn index_path(log_path: &Path) -> PathBuf {
    let mut os: OsString = log_path.as_os_str().to_os_string();
    os.push(INDEX_EXTENSION);
    PathBuf::from(os)
}

/// B-tree backed enumerator: record log + durable tree index.
pub(crate) struct BTreeHashStore {
    log: RecordLog,
    index: BTreeIndex,
}

impl BTreeHashStore {
    /// Open or create the store at `path` (log) and `path.btx` (index).
    pub(crate) fn open(path: &Path, signature_len: usize, initial_capacity: u32) -> Result<Self> {
        let log = RecordLog::open(path, signature_len, initial_capacity)?;
        let mut index = BTreeIndex::open(&index_path(path), signature_len)?;

        let out_of_sync = !log.was_clean() || index.entry_count() != log.records_count();
        if out_of_sync {
            debug!(
                path = %path.display(),
                log_records = log.records_count(),
                index_entries = index.entry_count(),
                "B-tree index out of sync with log, rebuilding"
            );
            index.clear()?;
            for (slot, hash) in log.iter() {
                index.insert(hash, Self::slot_to_id(slot))?;
            }
            index.flush()?;
        }

        info!(
            path = %path.display(),
            records = log.records_count(),
            rebuilt = out_of_sync,
            "Opened B-tree hash store"
        );
        Ok(BTreeHashStore { log, index })
    }

    fn slot_to_id(slot: u32) -> HashId {
        (slot + 1) as HashId
    }
}

impl HashStore for BTreeHashStore {
    fn enumerate(&mut self, hash: &[u8]) -> Result<HashId> {
        record::check_signature(hash, self.log.signature_len())?;
        if let Some(id) = self.index.lookup(hash)? {
            return Ok(id);
        }
        if self.log.records_count() >= i32::MAX as u32 {
            return Err(Error::Corrupted(format!(
                "{}: id space exhausted at {} records",
                self.log.path().display(),
                self.log.records_count()
            )));
        }
        // Log first: the tree can always be rebuilt from it, never the
        // other way around
        let slot = self.log.append(hash, 0)?;
        let id = Self::slot_to_id(slot);
        self.index.insert(hash, id)?;
        Ok(id)
    }

    fn try_enumerate(&mut self, hash: &[u8]) -> Result<HashId> {
        record::check_signature(hash, self.log.signature_len())?;
        Ok(self.index.lookup(hash)?.unwrap_or(NULL_ID))
    }

    fn value_of(&mut self, id: HashId) -> Result<Vec<u8>> {
        if id <= 0 || id as u32 > self.log.records_count() {
            return Err(Error::UnknownHashId(id));
        }
        let (hash, _link) = self.log.record(id as u32 - 1);
        Ok(hash.to_vec())
    }

    fn for_each(&mut self, visitor: &mut dyn FnMut(HashId, &[u8]) -> Visit) -> Result<()> {
        for (slot, hash) in self.log.iter() {
            if visitor(Self::slot_to_id(slot), hash).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn records_count(&self) -> u32 {
        self.log.records_count()
    }

    fn flush(&mut self) -> Result<()> {
        self.log.flush()?;
        self.index.flush()
    }

    fn close(self: Box<Self>) -> Result<()> {
        let BTreeHashStore { log, index } = *self;
        let path = log.path().to_path_buf();
        log.close()?;
        index.close()?;
        info!(path = %path.display(), "Closed B-tree hash store");
        Ok(())
    }

    fn close_and_clean(self: Box<Self>) -> Result<()> {
        let BTreeHashStore { log, index } = *self;
        let log_path = log.path().to_path_buf();
        let idx_path = index.path().to_path_buf();
        log.close()?;
        index.close()?;
        std::fs::remove_file(&log_path)?;
        std::fs::remove_file(&idx_path)?;
        info!(path = %log_path.display(), "Closed and cleaned B-tree hash store");
        Ok(())
    }
}
