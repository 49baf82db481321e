//! On-disk B-tree index keyed by hash bytes
//!
//! Durable hash → id mapping for the B-tree backend. Fixed-width entries
//! make every page a sorted array that can be binary-searched and split by
//! plain byte moves. There is no delete operation anywhere in the store, so
//! the tree only ever grows: no merging, no rebalancing.
//!
//! # File Format (Version 1)
//!
//! Page size is 4 KiB; page 0 is the header, pages 1.. are tree nodes.
//!
//! ```text
//! header page:
//!   [magic "CHBT" 4B] [version u32 LE] [signature_len u32 LE]
//!   [root u32 LE] [page_count u32 LE] [entry_count u32 LE]
//!   [header_crc u32 LE]   — crc32 of bytes 0..12 (the immutable prefix)
//!
//! node page:
//!   [count u32 LE] [kind u32 LE: 0 = leaf, 1 = branch] [right_child u32 LE]
//!   [reserved 4B]
//!   [entries: count * (signature_len + 4) bytes]
//! ```
//!
//! A leaf entry is `(key, id)`. A branch entry is `(key, child)` where
//! `child` covers keys strictly below `key`; keys at or above the last
//! separator go to `right_child`.
//!
//! Writes go through an unbounded write-back page cache and reach disk on
//! `flush`. The owning store cross-checks `entry_count` against the record
//! log on open and rebuilds the whole tree from the log when they disagree,
//! so a crash between a log append and the matching tree flush loses
//! nothing.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::store::HashId;

const MAGIC: &[u8; 4] = b"CHBT";
const VERSION: u32 = 1;
pub(crate) const PAGE_SIZE: usize = 4096;

const NODE_HEADER_SIZE: usize = 16;
const KIND_LEAF: u32 = 0;
const KIND_BRANCH: u32 = 1;

const OFFSET_ROOT: usize = 12;
const OFFSET_PAGE_COUNT: usize = 16;
const OFFSET_ENTRY_COUNT: usize = 20;
const OFFSET_HEADER_CRC: usize = 24;
const IMMUTABLE_PREFIX: usize = 12;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Page-based B-tree over `(hash, u32)` entries with a write-back cache.
#[derive(Debug)]
pub(crate) struct BTreeIndex {
    file: File,
    path: PathBuf,
    signature_len: usize,
    entry_width: usize,
    /// Entries per node page
    capacity: usize,
    root: u32,
    page_count: u32,
    entry_count: u32,
    cache: FxHashMap<u32, Vec<u8>>,
    dirty: FxHashSet<u32>,
}

impl BTreeIndex {
    /// Open or create the index file, validating the header of an existing
    /// one.
    pub(crate) fn open(path: &Path, signature_len: usize) -> Result<Self> {
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

        let entry_width = signature_len + 4;
        let capacity = (PAGE_SIZE - NODE_HEADER_SIZE) / entry_width;

        let mut index = BTreeIndex {
            file,
            path: path.to_path_buf(),
            signature_len,
            entry_width,
            capacity,
            root: 1,
            page_count: 2,
            entry_count: 0,
            cache: FxHashMap::default(),
            dirty: FxHashSet::default(),
        };

        let file_len = index.file.metadata()?.len();
        if file_len == 0 {
            index.init_empty()?;
            debug!(path = %path.display(), "Initialized fresh B-tree index");
            return Ok(index);
        }

        if file_len < PAGE_SIZE as u64 {
            return Err(Error::Corrupted(format!(
                "{}: B-tree file shorter than one page",
                path.display()
            )));
        }

        let mut header = vec![0u8; PAGE_SIZE];
        index.file.seek(SeekFrom::Start(0))?;
        index.file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(Error::Corrupted(format!(
                "{}: not a B-tree index (bad magic word)",
                path.display()
            )));
        }
        let version = read_u32(&header, 4);
        if version != VERSION {
            return Err(Error::Corrupted(format!(
                "{}: unsupported B-tree version {version} (expected {VERSION})",
                path.display()
            )));
        }
        let stored_signature_len = read_u32(&header, 8) as usize;
        if stored_signature_len != signature_len {
            return Err(Error::Corrupted(format!(
                "{}: signature length {stored_signature_len} != configured {signature_len}",
                path.display()
            )));
        }
        let crc = crc32fast::hash(&header[..IMMUTABLE_PREFIX]);
        let stored_crc = read_u32(&header, OFFSET_HEADER_CRC);
        if crc != stored_crc {
            return Err(Error::Corrupted(format!(
                "{}: B-tree header crc mismatch",
                path.display()
            )));
        }

        index.root = read_u32(&header, OFFSET_ROOT);
        index.page_count = read_u32(&header, OFFSET_PAGE_COUNT);
        index.entry_count = read_u32(&header, OFFSET_ENTRY_COUNT);

        if index.root == 0 || index.root >= index.page_count {
            return Err(Error::Corrupted(format!(
                "{}: B-tree root {} out of range (page_count {})",
                path.display(),
                index.root,
                index.page_count
            )));
        }
        if index.page_count as u64 * PAGE_SIZE as u64 > file_len {
            return Err(Error::Corrupted(format!(
                "{}: B-tree header claims {} pages but file holds fewer",
                path.display(),
                index.page_count
            )));
        }

        debug!(
            path = %path.display(),
            entries = index.entry_count,
            pages = index.page_count,
            "Opened existing B-tree index"
        );
        Ok(index)
    }

    fn init_empty(&mut self) -> Result<()> {
        self.cache.clear();
        self.dirty.clear();
        self.root = 1;
        self.page_count = 2;
        self.entry_count = 0;

        let mut root = vec![0u8; PAGE_SIZE];
        write_u32(&mut root, 0, 0);
        write_u32(&mut root, 4, KIND_LEAF);
        self.cache.insert(1, root);
        self.dirty.insert(1);
        self.flush()
    }

    /// Number of `(hash, id)` entries stored. Cross-checked against the
    /// record log by the owning store.
    pub(crate) fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the id stored for `hash`, if any.
    pub(crate) fn lookup(&mut self, hash: &[u8]) -> Result<Option<HashId>> {
        let mut page_id = self.root;
        loop {
            self.load(page_id)?;
            let (count, kind) = self.node_meta(page_id);

            if kind == KIND_LEAF {
                let page = &self.cache[&page_id];
                return Ok(match self.search(page, count, hash) {
                    Ok(idx) => Some(self.entry_value(page, idx) as HashId),
                    Err(_) => None,
                });
            }

            let page = &self.cache[&page_id];
            let next = self.descend_target(page, count, hash);
            if next == 0 || next >= self.page_count {
                return Err(Error::Corrupted(format!(
                    "{}: branch points at invalid page {next}",
                    self.path.display()
                )));
            }
            page_id = next;
        }
    }

    /// Insert `(hash, id)`. An already-present key has its value
    /// overwritten; the caller is expected to `lookup` first.
    ///
    /// Full nodes are split preemptively on the way down, so a split never
    /// has to propagate back up.
    pub(crate) fn insert(&mut self, hash: &[u8], id: HashId) -> Result<()> {
        debug_assert_eq!(hash.len(), self.signature_len);

        // A full root gets a fresh parent before descent
        self.load(self.root)?;
        if self.node_is_full(self.root) {
            let old_root = self.root;
            let new_root = self.alloc_page(KIND_BRANCH);
            {
                let page = self.cache.get_mut(&new_root).expect("just allocated");
                write_u32(page, 8, old_root);
            }
            self.split_child(new_root, old_root)?;
            self.root = new_root;
        }

        let mut page_id = self.root;
        loop {
            self.load(page_id)?;
            let (count, kind) = self.node_meta(page_id);

            if kind == KIND_LEAF {
                let found = {
                    let page = &self.cache[&page_id];
                    self.search(page, count, hash)
                };
                match found {
                    Ok(idx) => {
                        let off = self.entry_offset(idx) + self.signature_len;
                        let page = self.cache.get_mut(&page_id).expect("loaded above");
                        write_u32(page, off, id as u32);
                        self.dirty.insert(page_id);
                    }
                    Err(idx) => {
                        self.leaf_insert_at(page_id, idx, hash, id as u32);
                        self.entry_count += 1;
                    }
                }
                trace!(id, "B-tree insert");
                return Ok(());
            }

            let child = {
                let page = &self.cache[&page_id];
                self.descend_target(page, count, hash)
            };
            if child == 0 || child >= self.page_count {
                return Err(Error::Corrupted(format!(
                    "{}: branch points at invalid page {child}",
                    self.path.display()
                )));
            }
            self.load(child)?;
            if self.node_is_full(child) {
                self.split_child(page_id, child)?;
                // Re-descend from the same branch: the separator inserted by
                // the split decides which half the key belongs to
                continue;
            }
            page_id = child;
        }
    }

    /// Write back all dirty pages and the header, then fsync.
    ///
    /// The header is always rewritten: root, page_count and entry_count
    /// change without marking any node page dirty.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let mut pages: Vec<u32> = self.dirty.iter().copied().collect();
        pages.sort_unstable();
        for page_id in pages {
            let page = &self.cache[&page_id];
            self.file
                .seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
            self.file.write_all(page)?;
        }
        self.dirty.clear();

        let mut header = vec![0u8; PAGE_SIZE];
        header[0..4].copy_from_slice(MAGIC);
        write_u32(&mut header, 4, VERSION);
        write_u32(&mut header, 8, self.signature_len as u32);
        write_u32(&mut header, OFFSET_ROOT, self.root);
        write_u32(&mut header, OFFSET_PAGE_COUNT, self.page_count);
        write_u32(&mut header, OFFSET_ENTRY_COUNT, self.entry_count);
        let crc = crc32fast::hash(&header[..IMMUTABLE_PREFIX]);
        write_u32(&mut header, OFFSET_HEADER_CRC, crc);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Drop everything and start over with an empty tree. Used when the
    /// index is out of sync with the record log.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.init_empty()
    }

    pub(crate) fn close(mut self) -> Result<()> {
        self.flush()
    }

    // --- page primitives ---

    fn load(&mut self, page_id: u32) -> Result<()> {
        if self.cache.contains_key(&page_id) {
            return Ok(());
        }
        let mut page = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut page)?;
        self.cache.insert(page_id, page);
        Ok(())
    }

    fn alloc_page(&mut self, kind: u32) -> u32 {
        let page_id = self.page_count;
        self.page_count += 1;
        let mut page = vec![0u8; PAGE_SIZE];
        write_u32(&mut page, 4, kind);
        self.cache.insert(page_id, page);
        self.dirty.insert(page_id);
        page_id
    }

    /// `(entry count, node kind)` of a cached page.
    fn node_meta(&self, page_id: u32) -> (usize, u32) {
        let page = &self.cache[&page_id];
        (read_u32(page, 0) as usize, read_u32(page, 4))
    }

    fn node_is_full(&self, page_id: u32) -> bool {
        let page = &self.cache[&page_id];
        read_u32(page, 0) as usize >= self.capacity
    }

    fn entry_offset(&self, idx: usize) -> usize {
        NODE_HEADER_SIZE + idx * self.entry_width
    }

    fn entry_key<'a>(&self, page: &'a [u8], idx: usize) -> &'a [u8] {
        let off = self.entry_offset(idx);
        &page[off..off + self.signature_len]
    }

    fn entry_value(&self, page: &[u8], idx: usize) -> u32 {
        read_u32(page, self.entry_offset(idx) + self.signature_len)
    }

    /// Binary search for `hash` among the page's entry keys.
    fn search(&self, page: &[u8], count: usize, hash: &[u8]) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.entry_key(page, mid).cmp(hash) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Child page a lookup for `hash` descends into from a branch page.
    fn descend_target(&self, page: &[u8], count: usize, hash: &[u8]) -> u32 {
        match self.search(page, count, hash) {
            // Separator keys live in the right sibling, so an exact match
            // descends right of the separator
            Ok(idx) | Err(idx) if idx < count => {
                if self.entry_key(page, idx) > hash {
                    self.entry_value(page, idx)
                } else if idx + 1 < count {
                    self.entry_value(page, idx + 1)
                } else {
                    read_u32(page, 8)
                }
            }
            _ => read_u32(page, 8),
        }
    }

    fn leaf_insert_at(&mut self, page_id: u32, idx: usize, hash: &[u8], value: u32) {
        let entry_width = self.entry_width;
        let off = self.entry_offset(idx);
        let page = self.cache.get_mut(&page_id).expect("page loaded");
        let count = read_u32(page, 0) as usize;
        debug_assert!(count < self.capacity);

        let tail = NODE_HEADER_SIZE + count * entry_width;
        page.copy_within(off..tail, off + entry_width);
        page[off..off + hash.len()].copy_from_slice(hash);
        write_u32(page, off + hash.len(), value);
        write_u32(page, 0, (count + 1) as u32);
        self.dirty.insert(page_id);
    }

    /// Insert `(key, child)` into a branch page at `idx`, shifting entries
    /// right.
    fn branch_insert_at(&mut self, page_id: u32, idx: usize, key: &[u8], child: u32) {
        // Same layout as a leaf entry, different value meaning
        self.leaf_insert_at(page_id, idx, key, child);
    }

    /// Split a full `child` of `parent`, pushing one separator key into
    /// `parent`. The child keeps its lower half (so existing references to
    /// it stay valid for keys below the separator); the upper half moves to
    /// a fresh page.
    fn split_child(&mut self, parent_id: u32, child_id: u32) -> Result<()> {
        let (kind, count) = {
            let child = &self.cache[&child_id];
            (read_u32(child, 4), read_u32(child, 0) as usize)
        };
        debug_assert!(count >= self.capacity);
        let mid = count / 2;

        let right_id = self.alloc_page(kind);
        let entry_width = self.entry_width;

        let (separator, right_count) = if kind == KIND_LEAF {
            // Right leaf takes entries[mid..]; separator = its first key
            let (sep, moved) = {
                let child = &self.cache[&child_id];
                let sep = self.entry_key(child, mid).to_vec();
                let from = self.entry_offset(mid);
                let to = self.entry_offset(count);
                (sep, child[from..to].to_vec())
            };
            let right = self.cache.get_mut(&right_id).expect("just allocated");
            right[NODE_HEADER_SIZE..NODE_HEADER_SIZE + moved.len()].copy_from_slice(&moved);
            write_u32(right, 0, (count - mid) as u32);
            (sep, count - mid)
        } else {
            // Branch split: entry[mid] moves up; its child becomes the left
            // half's right_child, the old right_child goes to the new page
            let (sep, mid_child, old_right, moved) = {
                let child = &self.cache[&child_id];
                let sep = self.entry_key(child, mid).to_vec();
                let mid_child = self.entry_value(child, mid);
                let old_right = read_u32(child, 8);
                let from = self.entry_offset(mid + 1);
                let to = self.entry_offset(count);
                (sep, mid_child, old_right, child[from..to].to_vec())
            };
            let right = self.cache.get_mut(&right_id).expect("just allocated");
            right[NODE_HEADER_SIZE..NODE_HEADER_SIZE + moved.len()].copy_from_slice(&moved);
            write_u32(right, 0, (count - mid - 1) as u32);
            write_u32(right, 8, old_right);

            let left = self.cache.get_mut(&child_id).expect("loaded by caller");
            write_u32(left, 8, mid_child);
            (sep, count - mid - 1)
        };

        // Shrink the left half
        {
            let left = self.cache.get_mut(&child_id).expect("loaded by caller");
            write_u32(left, 0, mid as u32);
            self.dirty.insert(child_id);
        }

        // Hook the separator into the parent: the entry or right_child slot
        // that pointed at `child` keeps covering the upper half, while a new
        // entry (separator, child) covers the lower half
        let (parent_count, slot) = {
            let parent = &self.cache[&parent_id];
            let parent_count = read_u32(parent, 0) as usize;
            let mut slot = None;
            for i in 0..parent_count {
                if self.entry_value(parent, i) == child_id {
                    slot = Some(i);
                    break;
                }
            }
            (parent_count, slot)
        };

        match slot {
            Some(idx) => {
                // Entry idx now covers [separator, old upper bound) via the
                // new right page
                {
                    let parent = self.cache.get_mut(&parent_id).expect("loaded");
                    let off = NODE_HEADER_SIZE + idx * entry_width + self.signature_len;
                    write_u32(parent, off, right_id);
                }
                self.branch_insert_at(parent_id, idx, &separator, child_id);
            }
            None => {
                // Child was the parent's right_child
                debug_assert_eq!(read_u32(&self.cache[&parent_id], 8), child_id);
                {
                    let parent = self.cache.get_mut(&parent_id).expect("loaded");
                    write_u32(parent, 8, right_id);
                }
                self.branch_insert_at(parent_id, parent_count, &separator, child_id);
            }
        }

        trace!(
            parent = parent_id,
            left = child_id,
            right = right_id,
            right_count,
            "Split B-tree node"
        );
        Ok(())
    }
}
