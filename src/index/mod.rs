//! Dedup indexes answering the hash → id direction
//!
//! - [`hashtable`]: in-memory prefix map with collision chains threaded
//!   through the record log; rebuilt by a full scan on open.
//! - [`btree`]: on-disk page B-tree keyed by the full hash bytes; durable
//!   across opens, rebuilt from the log only when out of sync.

pub(crate) mod btree;
pub(crate) mod hashtable;
