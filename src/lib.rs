//! Durable content-hash enumerator
//!
//! A crash-tolerant store assigning a stable, monotonically-issued integer
//! id to each distinct fixed-length content hash, with O(1)-ish lookup in
//! both directions:
//!
//! - `enumerate`: hash → id, inserting on first sight
//! - `enumerate_ex`: same, but a dedup hit comes back as the negated id
//! - `try_enumerate`: hash → id without inserting
//! - `value_of`: id → hash
//! - `for_each`: full traversal in id order with early stop
//!
//! Records are append-only; there is no update or delete. Closing and
//! reopening a store at the same path restores the exact id ↔ hash mapping
//! and record count.
//!
//! Two interchangeable backends implement the same contract, selected at
//! construction:
//!
//! - [`BackendKind::Mmap`]: an append-only log of fixed-size records over a
//!   memory-mapped file; the dedup index is rebuilt in memory on open.
//! - [`BackendKind::BTree`]: the same log plus a durable on-disk B-tree
//!   index, so reopen needs no scan unless the index is out of sync.
//!
//! # Example
//!
//! ```no_run
//! use hashdex::{ContentHashEnumerator, StoreOptions};
//!
//! # fn main() -> hashdex::Result<()> {
//! let store = ContentHashEnumerator::open("/tmp/hashes", StoreOptions::default())?;
//!
//! let digest = [0u8; 20];
//! let id = store.enumerate(&digest)?;            // 1 on first sight
//! assert_eq!(store.enumerate_ex(&digest)?, -id); // negative: already known
//! assert_eq!(store.value_of(id)?, digest);
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod btree_store; // B-tree enumerator backend
mod enumerator; // Public handle and construction options
mod error; // Error taxonomy
mod index; // Dedup indexes (hash-table with chains, on-disk B-tree)
mod log; // Append-only fixed-slot record log
mod mapped_file; // Growable read-write mmap wrapper
mod mmap_store; // Memory-mapped enumerator backend
mod record; // Fixed-size record codec
mod store; // Backend contract

pub use enumerator::{BackendKind, ContentHashEnumerator, StoreOptions};
pub use error::{Error, Result};
pub use record::DEFAULT_SIGNATURE_LENGTH;
pub use store::{HashId, NULL_ID};
