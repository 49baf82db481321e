//! Public content-hash enumerator
//!
//! [`ContentHashEnumerator`] is the single entry point clients use. It is
//! an explicitly constructed handle over one of the two backend variants
//! selected through [`StoreOptions`]; there is no ambient global store.
//!
//! All operations are synchronous. The backend sits behind one
//! `parking_lot::Mutex`, so a shared reference can be used from several
//! threads: the check-then-insert sequence of `enumerate` runs as a single
//! critical section, which is what guarantees exactly one id per distinct
//! hash.

use parking_lot::Mutex;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::btree_store::BTreeHashStore;
use crate::error::{Error, Result};
use crate::mmap_store::MmapHashStore;
use crate::record::DEFAULT_SIGNATURE_LENGTH;
use crate::store::{HashId, HashStore, NULL_ID};

/// Largest signature length the backends accept. Bounded so a B-tree page
/// always holds a sane number of entries.
const MAX_SIGNATURE_LENGTH: usize = 256;

/// Which backing store variant to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Append-only log over a memory-mapped file; the dedup index is
    /// rebuilt in memory by a scan on every open.
    #[default]
    Mmap,
    /// Append-only log plus a durable on-disk B-tree index; reopen without
    /// a scan unless the index is out of sync.
    BTree,
}

/// Construction options for [`ContentHashEnumerator::open`].
///
/// # Example
///
/// ```
/// use hashdex::{BackendKind, StoreOptions};
///
/// let options = StoreOptions::default()
///     .with_backend(BackendKind::BTree)
///     .with_signature_len(32);
/// assert_eq!(options.signature_len(), 32);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    signature_len: usize,
    backend: BackendKind,
    initial_capacity: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            signature_len: DEFAULT_SIGNATURE_LENGTH,
            backend: BackendKind::default(),
            initial_capacity: 1024,
        }
    }
}

impl StoreOptions {
    /// Digest width in bytes every enumerated hash must have.
    pub fn with_signature_len(mut self, signature_len: usize) -> Self {
        self.signature_len = signature_len;
        self
    }

    /// Select the backing store variant.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Number of record slots to pre-size the log file for.
    pub fn with_initial_capacity(mut self, initial_capacity: u32) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Configured signature length.
    pub fn signature_len(&self) -> usize {
        self.signature_len
    }

    /// Configured backend variant.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

/// Durable mapping from content hashes to stable integer ids.
///
/// Assigns a 1-based id to each distinct hash on first sight, in strictly
/// increasing order, and answers lookups in both directions. Reopening a
/// closed store at the same path restores the exact id ↔ hash mapping.
pub struct ContentHashEnumerator {
    inner: Mutex<Option<Box<dyn HashStore + Send>>>,
    path: PathBuf,
    signature_len: usize,
}

impl std::fmt::Debug for ContentHashEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHashEnumerator")
            .field("path", &self.path)
            .field("signature_len", &self.signature_len)
            .finish_non_exhaustive()
    }
}

impl ContentHashEnumerator {
    /// Open or create a store at `path`.
    ///
    /// Fails with an I/O error if the path is inaccessible and with
    /// [`Error::Corrupted`] if the on-disk format does not check out.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if options.signature_len == 0 || options.signature_len > MAX_SIGNATURE_LENGTH {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "signature length {} not in 1..={MAX_SIGNATURE_LENGTH}",
                    options.signature_len
                ),
            )));
        }

        let backend: Box<dyn HashStore + Send> = match options.backend {
            BackendKind::Mmap => Box::new(MmapHashStore::open(
                path,
                options.signature_len,
                options.initial_capacity,
            )?),
            BackendKind::BTree => Box::new(BTreeHashStore::open(
                path,
                options.signature_len,
                options.initial_capacity,
            )?),
        };

        Ok(ContentHashEnumerator {
            inner: Mutex::new(Some(backend)),
            path: path.to_path_buf(),
            signature_len: options.signature_len,
        })
    }

    /// Return the id for `hash`, assigning and durably persisting a new one
    /// if this hash was never seen before. Idempotent.
    pub fn enumerate(&self, hash: &[u8]) -> Result<HashId> {
        self.with_store(|store| store.enumerate(hash))
    }

    /// Like [`enumerate`](Self::enumerate), but the sign of the result says
    /// whether the hash was new: a brand-new hash gets its (positive) id, an
    /// already-known hash gets the negated id it already had.
    pub fn enumerate_ex(&self, hash: &[u8]) -> Result<HashId> {
        self.with_store(|store| {
            let existing = store.try_enumerate(hash)?;
            if existing != NULL_ID {
                Ok(-existing)
            } else {
                store.enumerate(hash)
            }
        })
    }

    /// Return the id for `hash` if it is already known, [`NULL_ID`]
    /// otherwise. Never inserts.
    pub fn try_enumerate(&self, hash: &[u8]) -> Result<HashId> {
        self.with_store(|store| store.try_enumerate(hash))
    }

    /// Return the hash bytes assigned `id`, or [`Error::UnknownHashId`] for
    /// an id no record ever got.
    pub fn value_of(&self, id: HashId) -> Result<Vec<u8>> {
        self.with_store(|store| store.value_of(id))
    }

    /// Visit all stored `(id, hash)` pairs in id order. Each call rescans
    /// from the first record; the visitor returns `Break` to stop early.
    ///
    /// The store lock is held for the whole traversal.
    pub fn for_each(
        &self,
        mut visitor: impl FnMut(HashId, &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.with_store(|store| store.for_each(&mut visitor))
    }

    /// Number of distinct hashes stored, equal to the highest assigned id.
    pub fn records_count(&self) -> Result<u32> {
        self.with_store(|store| Ok(store.records_count()))
    }

    /// Whether no hash was enumerated yet.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.records_count()? == 0)
    }

    /// Flush everything written so far to disk without closing.
    pub fn flush(&self) -> Result<()> {
        self.with_store(|store| store.flush())
    }

    /// Flush and release all resources. The data stays on disk; a later
    /// [`open`](Self::open) at the same path restores the full state.
    pub fn close(mut self) -> Result<()> {
        match self.inner.get_mut().take() {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    /// Close the store and delete its backing files. Irreversible; meant
    /// for scratch stores.
    pub fn close_and_clean(mut self) -> Result<()> {
        match self.inner.get_mut().take() {
            Some(store) => store.close_and_clean(),
            None => Ok(()),
        }
    }

    /// Path this store was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signature length this store was opened with.
    pub fn signature_len(&self) -> usize {
        self.signature_len
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn HashStore + Send>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(store) => f(store),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "store is closed",
            ))),
        }
    }
}

impl Drop for ContentHashEnumerator {
    fn drop(&mut self) {
        // Best-effort final sync when the handle is dropped without close
        if let Some(mut store) = self.inner.get_mut().take() {
            let _ = store.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_options() {
        let options = StoreOptions::default();
        assert_eq!(options.signature_len(), DEFAULT_SIGNATURE_LENGTH);
        assert_eq!(options.backend(), BackendKind::Mmap);
    }

    #[test]
    fn test_open_rejects_zero_signature_length() {
        let dir = TempDir::new().unwrap();
        let err = ContentHashEnumerator::open(
            dir.path().join("hashes"),
            StoreOptions::default().with_signature_len(0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_open_rejects_oversized_signature_length() {
        let dir = TempDir::new().unwrap();
        let err = ContentHashEnumerator::open(
            dir.path().join("hashes"),
            StoreOptions::default().with_signature_len(MAX_SIGNATURE_LENGTH + 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_accessors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashes");
        let store = ContentHashEnumerator::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.path(), path);
        assert_eq!(store.signature_len(), DEFAULT_SIGNATURE_LENGTH);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_drop_without_close_flushes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashes");
        {
            let store = ContentHashEnumerator::open(&path, StoreOptions::default()).unwrap();
            store.enumerate(&[7u8; 20]).unwrap();
            // dropped here without close()
        }
        let store = ContentHashEnumerator::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records_count().unwrap(), 1);
        assert_eq!(store.try_enumerate(&[7u8; 20]).unwrap(), 1);
    }
}
