//! In-memory dedup index with in-file collision chains
//!
//! Maps a folded 64-bit prefix of the hash to the head of a collision
//! chain. The chain itself is threaded through the records' `link` fields
//! in the log, so the in-memory side stays at one map entry per bucket
//! while distinct hashes sharing a prefix are resolved by walking the chain
//! and comparing full hash bytes.
//!
//! Nothing here is persisted on its own: the index is rebuilt losslessly
//! from the log by a full scan on every open. Records are appended with a
//! link to the previous bucket head, so replaying appends in slot order
//! reproduces exactly the chains the previous session had.

use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashMap;

use crate::log::RecordLog;

/// Chain heads, keyed by folded hash prefix. Values are 1-based slots
/// (0 is "no chain", matching the `link` encoding in records).
#[derive(Default)]
pub(crate) struct HashTableIndex {
    heads: FxHashMap<u64, u32>,
}

/// Fold a hash into the 64-bit bucket key.
///
/// Content hashes are uniformly distributed digests, so the leading bytes
/// are as good a bucket key as any rehash of the full value.
fn fold_key(hash: &[u8]) -> u64 {
    let take = hash.len().min(8);
    let mut buf = [0u8; 8];
    buf[..take].copy_from_slice(&hash[..take]);
    LittleEndian::read_u64(&buf)
}

impl HashTableIndex {
    /// Rebuild the index from the log by scanning all committed records.
    ///
    /// This is the recovery driver for the mmap backend: it runs on every
    /// open and makes lookups consistent with everything durably written.
    pub(crate) fn rebuild(log: &RecordLog) -> Self {
        let mut index = HashTableIndex::default();
        for (slot, hash) in log.iter() {
            index.set_head(hash, slot + 1);
        }
        index
    }

    /// 1-based slot of the chain head for this hash's bucket, 0 if empty.
    ///
    /// A new record stores this value as its `link` before becoming the
    /// head itself.
    pub(crate) fn chain_head(&self, hash: &[u8]) -> u32 {
        self.heads.get(&fold_key(hash)).copied().unwrap_or(0)
    }

    /// Make `slot1` (1-based) the new chain head for this hash's bucket.
    pub(crate) fn set_head(&mut self, hash: &[u8], slot1: u32) {
        self.heads.insert(fold_key(hash), slot1);
    }

    /// Find the 0-based slot holding exactly `hash`, if any.
    ///
    /// Walks the collision chain through the log, comparing full hash bytes.
    pub(crate) fn lookup(&self, log: &RecordLog, hash: &[u8]) -> Option<u32> {
        let mut cur = self.chain_head(hash);
        while cur != 0 {
            let (stored, link) = log.record(cur - 1);
            if stored == hash {
                return Some(cur - 1);
            }
            cur = link;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(seed: u8) -> Vec<u8> {
        (0..20).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect()
    }

    /// Two distinct hashes sharing the first 8 bytes, i.e. one bucket.
    fn colliding_pair() -> (Vec<u8>, Vec<u8>) {
        let mut a = vec![7u8; 20];
        let mut b = vec![7u8; 20];
        a[19] = 1;
        b[19] = 2;
        (a, b)
    }

    fn append_indexed(log: &mut RecordLog, index: &mut HashTableIndex, hash: &[u8]) -> u32 {
        let link = index.chain_head(hash);
        let slot = log.append(hash, link).unwrap();
        index.set_head(hash, slot + 1);
        slot
    }

    #[test]
    fn test_lookup_finds_inserted_hashes() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();
        let mut index = HashTableIndex::default();

        for seed in 0..30 {
            append_indexed(&mut log, &mut index, &hash(seed));
        }
        for seed in 0..30 {
            assert_eq!(index.lookup(&log, &hash(seed)), Some(seed as u32));
        }
        assert_eq!(index.lookup(&log, &hash(200)), None);
    }

    #[test]
    fn test_collision_chain_resolves_by_full_hash() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();
        let mut index = HashTableIndex::default();

        let (a, b) = colliding_pair();
        assert_eq!(fold_key(&a), fold_key(&b));

        let slot_a = append_indexed(&mut log, &mut index, &a);
        let slot_b = append_indexed(&mut log, &mut index, &b);

        assert_eq!(index.lookup(&log, &a), Some(slot_a));
        assert_eq!(index.lookup(&log, &b), Some(slot_b));

        // A third hash in the same bucket but never inserted is not found
        let mut c = a.clone();
        c[19] = 3;
        assert_eq!(index.lookup(&log, &c), None);
    }

    #[test]
    fn test_rebuild_reproduces_chains() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("log"), 20, 16).unwrap();
        let mut index = HashTableIndex::default();

        let (a, b) = colliding_pair();
        append_indexed(&mut log, &mut index, &a);
        append_indexed(&mut log, &mut index, &b);
        for seed in 0..10 {
            append_indexed(&mut log, &mut index, &hash(seed));
        }

        let rebuilt = HashTableIndex::rebuild(&log);
        assert_eq!(rebuilt.lookup(&log, &a), index.lookup(&log, &a));
        assert_eq!(rebuilt.lookup(&log, &b), index.lookup(&log, &b));
        for seed in 0..10 {
            assert_eq!(rebuilt.lookup(&log, &hash(seed)), Some(2 + seed as u32));
        }
    }

    #[test]
    fn test_fold_key_short_hash() {
        // Signature lengths below 8 zero-pad the bucket key
        assert_eq!(fold_key(&[1, 2, 3]), fold_key(&[1, 2, 3, 0, 0, 0, 0, 0]));
        assert_ne!(fold_key(&[1, 2, 3]), fold_key(&[1, 2, 4]));
    }
}
