//! Backend contract for hash stores
//!
//! Two interchangeable backends implement this trait: the memory-mapped
//! durable enumerator (`mmap_store`) and the B-tree enumerator
//! (`btree_store`). The public [`crate::ContentHashEnumerator`] selects one
//! at construction and delegates; it never depends on backend internals.

use std::ops::ControlFlow;

use crate::error::Result;

/// Externally visible id of a stored hash.
///
/// Ids are 1-based and issued in strictly increasing order as new distinct
/// hashes are first seen; they are never reused or reassigned, even across
/// reopen. Kept signed so `enumerate_ex` can report a dedup hit as the
/// negated id.
pub type HashId = i32;

/// Sentinel meaning "no such record".
pub const NULL_ID: HashId = 0;

/// Visitor outcome alias for [`HashStore::for_each`]: `Continue(())` keeps
/// scanning, `Break(())` stops early.
pub type Visit = ControlFlow<()>;

/// Common contract of the two backend variants.
///
/// All operations are synchronous and blocking; serialization across
/// threads is the caller's concern (the public enumerator wraps the backend
/// in a mutex).
pub(crate) trait HashStore {
    /// Return the existing id for `hash`, or durably persist a new record
    /// and return a freshly minted id. Idempotent per distinct hash.
    fn enumerate(&mut self, hash: &[u8]) -> Result<HashId>;

    /// Return the id for `hash` if it is already known, [`NULL_ID`]
    /// otherwise. Never inserts.
    fn try_enumerate(&mut self, hash: &[u8]) -> Result<HashId>;

    /// Return the hash bytes previously assigned `id`.
    fn value_of(&mut self, id: HashId) -> Result<Vec<u8>>;

    /// Visit every stored `(id, hash)` pair in id order, restarting from the
    /// first record. The visitor stops the scan by returning `Break`.
    fn for_each(&mut self, visitor: &mut dyn FnMut(HashId, &[u8]) -> Visit) -> Result<()>;

    /// Number of distinct hashes stored. O(1): persisted metadata, not a scan.
    fn records_count(&self) -> u32;

    /// Flush everything written so far to disk.
    fn flush(&mut self) -> Result<()>;

    /// Flush and release resources; the data stays on disk.
    fn close(self: Box<Self>) -> Result<()>;

    /// Close and delete the backing files. Irreversible.
    fn close_and_clean(self: Box<Self>) -> Result<()>;
}
