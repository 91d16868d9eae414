//! The in-memory, latched tree node.
//!
//! A node is one tree page plus transient state: a split descriptor
//! while a split is unfinished, a dirty flag, and a version counter
//! that cursors use to revalidate their bindings after releasing the
//! latch.
//!
//! # Page layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       1   type byte (leaf/internal/stub + extremity bits)
//!   1       1   reserved
//!   2       2   garbage (reclaimable bytes in the entry area)
//!   4       2   search vector start (always the header size)
//!   6       2   search vector end (exclusive)
//!   8       2   tail used (bytes occupied by entries at the page tail)
//!  10       2   reserved
//!  12       8   leftmost child page id (internal nodes only)
//!  20      ..   search vector: 2-byte entry offsets, ascending key order
//!  ..      ..   free space
//!  ..     end   entries, packed toward the page tail
//! ```
//!
//! A leaf entry is `(key field, value field)`; an internal entry is
//! `(key field, child page id)` where the child holds keys at or after
//! the separator. Each field is a 2-byte little-endian length whose
//! high bit marks a fragmented field, followed by the inline bytes or,
//! when fragmented, by `(full length u64, first page u64)` referencing
//! an out-of-line chain.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use keel_common::constants::NODE_HEADER_SIZE;
use keel_common::error::KeelResult;
use keel_common::sync::RawLatch;
use keel_common::types::PageId;

use crate::frag::FragmentStore;

const OFF_TYPE: usize = 0;
const OFF_GARBAGE: usize = 2;
const OFF_VEC_START: usize = 4;
const OFF_VEC_END: usize = 6;
const OFF_TAIL_USED: usize = 8;
const OFF_LEFTMOST: usize = 12;

/// Leaf node bit.
pub const TYPE_LEAF: u8 = 0x01;
/// Internal node bit.
pub const TYPE_INTERNAL: u8 = 0x02;
/// Stub bit: a sentinel left behind by a root shrink.
pub const TYPE_STUB: u8 = 0x04;
/// Set on every node of the leftmost path.
pub const LOW_EXTREMITY: u8 = 0x10;
/// Set on every node of the rightmost path.
pub const HIGH_EXTREMITY: u8 = 0x20;

/// High bit of a field length: the field is stored out of line.
pub const FRAGMENTED: u16 = 0x8000;

/// Payload size of a fragmented field: full length plus first page id.
pub const FRAGMENT_REF_SIZE: usize = 16;

/// A key or value field, borrowed from a node page.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    /// Stored inline.
    Inline(&'a [u8]),
    /// Stored in an out-of-line chain.
    Fragmented {
        /// Total length of the out-of-line bytes.
        len: u64,
        /// First page of the chain.
        first_page: PageId,
    },
}

impl<'a> Field<'a> {
    /// Returns the logical length of the field.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Field::Inline(bytes) => bytes.len() as u64,
            Field::Fragmented { len, .. } => *len,
        }
    }

    /// Returns true if the field is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializes the field, reading the chain when fragmented.
    pub fn to_vec(&self, frags: &FragmentStore) -> KeelResult<Vec<u8>> {
        match self {
            Field::Inline(bytes) => Ok(bytes.to_vec()),
            Field::Fragmented { len, first_page } => frags.read_all(*first_page, *len),
        }
    }
}

/// Parses the field at `off`, returning it and the offset just past it.
pub fn parse_field(page: &[u8], off: usize) -> (Field<'_>, usize) {
    let hdr = u16::from_le_bytes([page[off], page[off + 1]]);
    let len = (hdr & !FRAGMENTED) as usize;
    let body = &page[off + 2..off + 2 + len];
    let next = off + 2 + len;
    if hdr & FRAGMENTED == 0 {
        (Field::Inline(body), next)
    } else {
        debug_assert_eq!(len, FRAGMENT_REF_SIZE);
        let full = u64::from_le_bytes(body[0..8].try_into().unwrap());
        let first = u64::from_le_bytes(body[8..16].try_into().unwrap());
        (
            Field::Fragmented {
                len: full,
                first_page: PageId::new(first),
            },
            next,
        )
    }
}

/// Returns the raw encoded bytes of the field at `off` (header included).
pub fn raw_field(page: &[u8], off: usize) -> &[u8] {
    let hdr = u16::from_le_bytes([page[off], page[off + 1]]);
    let len = (hdr & !FRAGMENTED) as usize;
    &page[off..off + 2 + len]
}

/// Encodes an inline field: 2-byte header plus the bytes.
#[must_use]
pub fn encode_inline(bytes: &[u8]) -> Vec<u8> {
    debug_assert!(bytes.len() < FRAGMENTED as usize);
    let mut field = Vec::with_capacity(2 + bytes.len());
    field.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    field.extend_from_slice(bytes);
    field
}

/// Encodes a fragmented field referencing an out-of-line chain.
#[must_use]
pub fn encode_fragmented(len: u64, first_page: PageId) -> Vec<u8> {
    let mut field = Vec::with_capacity(2 + FRAGMENT_REF_SIZE);
    field.extend_from_slice(&(FRAGMENTED | FRAGMENT_REF_SIZE as u16).to_le_bytes());
    field.extend_from_slice(&len.to_le_bytes());
    field.extend_from_slice(&first_page.as_u64().to_le_bytes());
    field
}

/// Compares an encoded key field against a plain key, loading the
/// fragment chain when necessary.
pub fn compare_field_key(
    page: &[u8],
    off: usize,
    key: &[u8],
    frags: &FragmentStore,
) -> KeelResult<Ordering> {
    let (field, _) = parse_field(page, off);
    match field {
        Field::Inline(bytes) => Ok(bytes.cmp(key)),
        Field::Fragmented { len, first_page } => {
            let stored = frags.read_all(first_page, len)?;
            Ok(stored.as_slice().cmp(key))
        }
    }
}

/// An unfinished split: the sibling exists and holds half the entries,
/// but the parent does not reference it yet. Descent routes through the
/// descriptor until the parent absorbs the split.
pub struct Split {
    /// The newly created sibling node.
    pub sibling: Arc<Node>,
    /// Encoded key field separating the halves. Keys at or after the
    /// separator live on the right.
    pub separator: Vec<u8>,
    /// True when the sibling holds the low half.
    pub sibling_on_left: bool,
}

/// Node state guarded by the latch.
pub struct NodeInner {
    page: Box<[u8]>,
    /// Present while a split awaits absorption by the parent.
    pub split: Option<Split>,
    /// True when the page buffer differs from its on-disk page.
    pub dirty: bool,
    /// Bumped on every mutation; cursors revalidate against it.
    pub version: u64,
}

/// A latched tree node. The page id is atomic because dirtying a clean
/// node moves it to a fresh page (copy-on-write).
pub struct Node {
    id: AtomicU64,
    used: AtomicBool,
    latch: RawLatch,
    inner: UnsafeCell<NodeInner>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    /// Creates a node over an initialized page buffer.
    #[must_use]
    pub fn new(id: PageId, page: Box<[u8]>, dirty: bool) -> Arc<Node> {
        Arc::new(Node {
            id: AtomicU64::new(id.as_u64()),
            used: AtomicBool::new(false),
            latch: RawLatch::new(),
            inner: UnsafeCell::new(NodeInner {
                page,
                split: None,
                dirty,
                version: 0,
            }),
        })
    }

    /// Creates an empty leaf node.
    #[must_use]
    pub fn new_leaf(id: PageId, page_size: usize, type_bits: u8) -> Arc<Node> {
        let mut page = vec![0u8; page_size].into_boxed_slice();
        NodeInner::format(&mut page, TYPE_LEAF | type_bits);
        Node::new(id, page, true)
    }

    /// Returns the backing page id.
    pub fn id(&self) -> PageId {
        PageId::new(self.id.load(AtomicOrdering::Acquire))
    }

    /// Swaps the backing page id (copy-on-write move).
    pub fn set_id(&self, id: PageId) {
        self.id.store(id.as_u64(), AtomicOrdering::Release);
    }

    /// Marks the node recently used, for the cache's clock pass.
    pub fn touch(&self) {
        self.used.store(true, AtomicOrdering::Relaxed);
    }

    /// Clears and returns the used bit.
    pub fn take_used(&self) -> bool {
        self.used.swap(false, AtomicOrdering::Relaxed)
    }

    /// Acquires the node latch shared.
    pub fn read(self: &Arc<Self>) -> NodeReadGuard {
        self.latch.acquire_shared();
        NodeReadGuard {
            node: Arc::clone(self),
        }
    }

    /// Acquires the node latch exclusively.
    pub fn write(self: &Arc<Self>) -> NodeWriteGuard {
        self.latch.acquire_exclusive();
        NodeWriteGuard {
            node: Arc::clone(self),
        }
    }

    /// Tries to acquire the node latch exclusively without blocking.
    pub fn try_write(self: &Arc<Self>) -> Option<NodeWriteGuard> {
        if self.latch.try_acquire_exclusive() {
            Some(NodeWriteGuard {
                node: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id()).finish()
    }
}

/// Shared guard over a node. Owns an `Arc`, so lock-coupling works:
/// acquire the child's guard before dropping the parent's.
pub struct NodeReadGuard {
    node: Arc<Node>,
}

impl NodeReadGuard {
    /// Returns the guarded node.
    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Deref for NodeReadGuard {
    type Target = NodeInner;

    fn deref(&self) -> &NodeInner {
        unsafe { &*self.node.inner.get() }
    }
}

impl Drop for NodeReadGuard {
    fn drop(&mut self) {
        self.node.latch.release_shared();
    }
}

/// Exclusive guard over a node.
pub struct NodeWriteGuard {
    node: Arc<Node>,
}

impl NodeWriteGuard {
    /// Returns the guarded node.
    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Deref for NodeWriteGuard {
    type Target = NodeInner;

    fn deref(&self) -> &NodeInner {
        unsafe { &*self.node.inner.get() }
    }
}

impl DerefMut for NodeWriteGuard {
    fn deref_mut(&mut self) -> &mut NodeInner {
        unsafe { &mut *self.node.inner.get() }
    }
}

impl Drop for NodeWriteGuard {
    fn drop(&mut self) {
        self.node.latch.release_exclusive();
    }
}

impl NodeInner {
    /// Formats a page buffer as an empty node.
    pub fn format(page: &mut [u8], type_byte: u8) {
        page[..NODE_HEADER_SIZE].fill(0);
        page[OFF_TYPE] = type_byte;
        write_u16(page, OFF_VEC_START, NODE_HEADER_SIZE as u16);
        write_u16(page, OFF_VEC_END, NODE_HEADER_SIZE as u16);
        write_u16(page, OFF_TAIL_USED, 0);
    }

    /// Reformats this node in place.
    pub fn reformat(&mut self, type_byte: u8) {
        Self::format(&mut self.page, type_byte);
        self.version += 1;
    }

    /// Returns the raw page bytes.
    #[must_use]
    pub fn page(&self) -> &[u8] {
        &self.page
    }

    /// Replaces the page buffer, adopting another node's content.
    pub fn replace_page(&mut self, page: Box<[u8]>) {
        self.page = page;
        self.version += 1;
    }

    /// Takes the page buffer, leaving a stub page behind.
    pub fn take_page_leaving_stub(&mut self) -> Box<[u8]> {
        let mut stub = vec![0u8; self.page.len()].into_boxed_slice();
        Self::format(&mut stub, TYPE_STUB);
        self.version += 1;
        std::mem::replace(&mut self.page, stub)
    }

    #[must_use]
    fn type_byte(&self) -> u8 {
        self.page[OFF_TYPE]
    }

    /// Returns true for leaf nodes.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.type_byte() & TYPE_LEAF != 0
    }

    /// Returns true for internal nodes.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.type_byte() & TYPE_INTERNAL != 0
    }

    /// Returns true for stubs left behind by a root shrink.
    #[must_use]
    pub fn is_stub(&self) -> bool {
        self.type_byte() & TYPE_STUB != 0
    }

    /// Returns true if this node lies on the leftmost path.
    #[must_use]
    pub fn has_low_extremity(&self) -> bool {
        self.type_byte() & LOW_EXTREMITY != 0
    }

    /// Returns true if this node lies on the rightmost path.
    #[must_use]
    pub fn has_high_extremity(&self) -> bool {
        self.type_byte() & HIGH_EXTREMITY != 0
    }

    /// Sets type bits.
    pub fn set_type_bits(&mut self, bits: u8) {
        self.page[OFF_TYPE] |= bits;
    }

    /// Clears type bits.
    pub fn clear_type_bits(&mut self, bits: u8) {
        self.page[OFF_TYPE] &= !bits;
    }

    fn vec_start(&self) -> usize {
        read_u16(&self.page, OFF_VEC_START) as usize
    }

    fn vec_end(&self) -> usize {
        read_u16(&self.page, OFF_VEC_END) as usize
    }

    fn tail_used(&self) -> usize {
        read_u16(&self.page, OFF_TAIL_USED) as usize
    }

    fn entry_low(&self) -> usize {
        self.page.len() - self.tail_used()
    }

    /// Returns the garbage byte count (reclaimable by compaction).
    #[must_use]
    pub fn garbage(&self) -> usize {
        read_u16(&self.page, OFF_GARBAGE) as usize
    }

    fn add_garbage(&mut self, bytes: usize) {
        let total = self.garbage() + bytes;
        write_u16(&mut self.page, OFF_GARBAGE, total as u16);
    }

    /// Number of entries (leaf) or separator keys (internal).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        (self.vec_end() - self.vec_start()) / 2
    }

    /// Contiguous free bytes between the search vector and the entries.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.entry_low() - self.vec_end()
    }

    /// Free bytes counting fragmentation reclaimable by compaction.
    #[must_use]
    pub fn usable_space(&self) -> usize {
        self.free_space() + self.garbage()
    }

    fn slot(&self, i: usize) -> usize {
        read_u16(&self.page, self.vec_start() + i * 2) as usize
    }

    fn set_slot(&mut self, i: usize, off: usize) {
        let at = self.vec_start() + i * 2;
        write_u16(&mut self.page, at, off as u16);
    }

    /// The leftmost child of an internal node (before the first key).
    #[must_use]
    pub fn leftmost_child(&self) -> PageId {
        PageId::new(read_u64(&self.page, OFF_LEFTMOST))
    }

    /// Sets the leftmost child.
    pub fn set_leftmost_child(&mut self, id: PageId) {
        write_u64(&mut self.page, OFF_LEFTMOST, id.as_u64());
    }

    /// Returns the key field of entry `i`.
    #[must_use]
    pub fn key_at(&self, i: usize) -> Field<'_> {
        parse_field(&self.page, self.slot(i)).0
    }

    /// Returns the raw encoded key field of entry `i`.
    #[must_use]
    pub fn raw_key_at(&self, i: usize) -> &[u8] {
        raw_field(&self.page, self.slot(i))
    }

    /// Returns the value field of leaf entry `i`.
    #[must_use]
    pub fn value_at(&self, i: usize) -> Field<'_> {
        debug_assert!(self.is_leaf());
        let off = self.slot(i);
        let (_, value_off) = parse_field(&self.page, off);
        parse_field(&self.page, value_off).0
    }

    /// Returns the child page id to the right of separator `i`.
    #[must_use]
    pub fn child_after(&self, i: usize) -> PageId {
        debug_assert!(self.is_internal());
        let off = self.slot(i);
        let (_, child_off) = parse_field(&self.page, off);
        PageId::new(read_u64(&self.page, child_off))
    }

    /// Returns the child page id at descent position `pos` in
    /// `[0, entry_count()]`: position 0 is the leftmost child.
    #[must_use]
    pub fn child_at(&self, pos: usize) -> PageId {
        if pos == 0 {
            self.leftmost_child()
        } else {
            self.child_after(pos - 1)
        }
    }

    /// Rewrites the child page id at descent position `pos`.
    pub fn set_child_at(&mut self, pos: usize, id: PageId) {
        if pos == 0 {
            self.set_leftmost_child(id);
        } else {
            let off = self.slot(pos - 1);
            let (_, child_off) = parse_field(&self.page, off);
            write_u64(&mut self.page, child_off, id.as_u64());
        }
    }

    /// Compares the key of entry `i` against `key`.
    pub fn compare_key_at(
        &self,
        i: usize,
        key: &[u8],
        frags: &FragmentStore,
    ) -> KeelResult<Ordering> {
        compare_field_key(&self.page, self.slot(i), key, frags)
    }

    /// Binary search over the search vector under unsigned
    /// lexicographic order. `Ok` is an exact match; `Err` is the
    /// insertion point.
    pub fn binary_search(
        &self,
        key: &[u8],
        frags: &FragmentStore,
    ) -> KeelResult<Result<usize, usize>> {
        let mut low = 0usize;
        let mut high = self.entry_count();
        while low < high {
            let mid = (low + high) / 2;
            match compare_field_key(&self.page, self.slot(mid), key, frags)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// Maps a search result to the child descent position: keys equal
    /// to a separator descend to its right subtree.
    #[must_use]
    pub fn internal_pos(search: Result<usize, usize>) -> usize {
        match search {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Bytes needed to store an entry with the given encoded fields,
    /// slot included.
    #[must_use]
    pub fn entry_cost(key_field: &[u8], rest: usize) -> usize {
        2 + key_field.len() + rest
    }

    /// Returns true if an entry of `size` bytes (slot excluded) fits
    /// without compaction.
    #[must_use]
    pub fn fits(&self, size: usize) -> bool {
        self.free_space() >= size + 2
    }

    /// Returns true if an entry of `size` bytes could fit after
    /// compaction.
    #[must_use]
    pub fn could_fit(&self, size: usize) -> bool {
        self.usable_space() >= size + 2
    }

    /// Compacts the entry area in place, squeezing out garbage.
    pub fn compact(&mut self) {
        let count = self.entry_count();
        let page_len = self.page.len();
        let mut scratch = vec![0u8; page_len];
        let mut tail = page_len;

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let off = self.slot(i);
            let size = self.entry_size_at(off);
            tail -= size;
            scratch[tail..tail + size].copy_from_slice(&self.page[off..off + size]);
            offsets.push(tail);
        }

        self.page[tail..].copy_from_slice(&scratch[tail..]);
        write_u16(&mut self.page, OFF_TAIL_USED, (page_len - tail) as u16);
        write_u16(&mut self.page, OFF_GARBAGE, 0);
        for (i, off) in offsets.into_iter().enumerate() {
            self.set_slot(i, off);
        }
        self.version += 1;
    }

    /// Total encoded size of entry `i`, slot excluded.
    #[must_use]
    pub fn entry_size(&self, i: usize) -> usize {
        self.entry_size_at(self.slot(i))
    }

    /// Total encoded size of the entry starting at `off`.
    fn entry_size_at(&self, off: usize) -> usize {
        let (_, after_key) = parse_field(&self.page, off);
        if self.is_leaf() {
            let (_, end) = parse_field(&self.page, after_key);
            end - off
        } else {
            after_key + 8 - off
        }
    }

    fn alloc_entry(&mut self, size: usize) -> usize {
        debug_assert!(self.fits(size));
        let off = self.entry_low() - size;
        let new_tail_used = (self.tail_used() + size) as u16;
        write_u16(&mut self.page, OFF_TAIL_USED, new_tail_used);
        off
    }

    fn open_slot(&mut self, i: usize) {
        let start = self.vec_start() + i * 2;
        let end = self.vec_end();
        self.page.copy_within(start..end, start + 2);
        write_u16(&mut self.page, OFF_VEC_END, (end + 2) as u16);
    }

    fn close_slot(&mut self, i: usize) {
        let start = self.vec_start() + i * 2;
        let end = self.vec_end();
        self.page.copy_within(start + 2..end, start);
        write_u16(&mut self.page, OFF_VEC_END, (end - 2) as u16);
    }

    /// Inserts a leaf entry at position `i` from encoded fields. The
    /// caller has checked `fits`.
    pub fn leaf_insert(&mut self, i: usize, key_field: &[u8], value_field: &[u8]) {
        debug_assert!(self.is_leaf());
        let size = key_field.len() + value_field.len();
        let off = self.alloc_entry(size);
        self.page[off..off + key_field.len()].copy_from_slice(key_field);
        self.page[off + key_field.len()..off + size].copy_from_slice(value_field);
        self.open_slot(i);
        self.set_slot(i, off);
        self.version += 1;
    }

    /// Replaces the value of leaf entry `i`, reusing the key field. The
    /// caller has checked that `usable_space` plus the old entry covers
    /// the new one.
    pub fn leaf_replace_value(&mut self, i: usize, value_field: &[u8]) {
        debug_assert!(self.is_leaf());
        let key_field = self.raw_key_at(i).to_vec();
        self.delete_entry(i);
        let size = key_field.len() + value_field.len();
        if !self.fits(size) {
            self.compact();
        }
        let off = self.alloc_entry(size);
        self.page[off..off + key_field.len()].copy_from_slice(&key_field);
        self.page[off + key_field.len()..off + size].copy_from_slice(value_field);
        self.open_slot(i);
        self.set_slot(i, off);
        self.version += 1;
    }

    /// Inserts separator `key_field` at key index `i` with the child to
    /// its right. The caller has checked `fits` with an 8-byte rest.
    pub fn internal_insert(&mut self, i: usize, key_field: &[u8], child: PageId) {
        debug_assert!(self.is_internal());
        let size = key_field.len() + 8;
        let off = self.alloc_entry(size);
        self.page[off..off + key_field.len()].copy_from_slice(key_field);
        write_u64(&mut self.page, off + key_field.len(), child.as_u64());
        self.open_slot(i);
        self.set_slot(i, off);
        self.version += 1;
    }

    /// Deletes entry `i`, leaving its bytes as garbage.
    pub fn delete_entry(&mut self, i: usize) {
        let off = self.slot(i);
        let size = self.entry_size_at(off);
        // Entries at the low-water mark shrink the tail directly.
        if off == self.entry_low() {
            let new_tail_used = (self.tail_used() - size) as u16;
            write_u16(&mut self.page, OFF_TAIL_USED, new_tail_used);
        } else {
            self.add_garbage(size);
        }
        self.close_slot(i);
        self.version += 1;
    }

    /// Splits a leaf around an insertion of `incoming` bytes at
    /// `insert_pos`. Entries move into `sibling` (the new right node);
    /// the returned separator is the right half's first key field.
    ///
    /// The split point tracks the byte midpoint, then shifts until the
    /// insertion side can absorb the incoming entry.
    pub fn split_leaf(
        &mut self,
        sibling: &mut NodeInner,
        insert_pos: usize,
        incoming: usize,
    ) -> Vec<u8> {
        debug_assert!(self.is_leaf());
        let count = self.entry_count();
        debug_assert!(count >= 2);

        let sizes: Vec<usize> = (0..count)
            .map(|i| self.entry_size_at(self.slot(i)) + 2)
            .collect();
        let total: usize = sizes.iter().sum();

        // Byte midpoint first.
        let mut split_at = 1;
        let mut left_bytes = sizes[0];
        while split_at < count - 1 && left_bytes + sizes[split_at] <= total / 2 {
            left_bytes += sizes[split_at];
            split_at += 1;
        }
        // Shift so the insertion side has room for the incoming entry.
        let capacity = self.page.len() - NODE_HEADER_SIZE;
        loop {
            let right_bytes = total - left_bytes;
            if insert_pos < split_at {
                if left_bytes + incoming + 2 <= capacity || split_at <= 1 {
                    break;
                }
                split_at -= 1;
                left_bytes -= sizes[split_at];
            } else {
                if right_bytes + incoming + 2 <= capacity || split_at >= count - 1 {
                    break;
                }
                left_bytes += sizes[split_at];
                split_at += 1;
            }
        }

        sibling.reformat(TYPE_LEAF | (self.type_byte() & HIGH_EXTREMITY));
        self.clear_type_bits(HIGH_EXTREMITY);
        self.move_entries(split_at, count, sibling);
        sibling.raw_key_at(0).to_vec()
    }

    /// Splits an internal node. The middle separator is removed and
    /// returned; `sibling` (the new right node) takes the keys after it
    /// and its right child as the leftmost child.
    pub fn split_internal(&mut self, sibling: &mut NodeInner) -> Vec<u8> {
        debug_assert!(self.is_internal());
        let count = self.entry_count();
        debug_assert!(count >= 3);
        let mid = count / 2;

        let separator = self.raw_key_at(mid).to_vec();
        let right_of_mid = self.child_after(mid);

        sibling.reformat(TYPE_INTERNAL | (self.type_byte() & HIGH_EXTREMITY));
        self.clear_type_bits(HIGH_EXTREMITY);
        sibling.set_leftmost_child(right_of_mid);
        self.move_entries(mid + 1, count, sibling);
        self.delete_entry(mid);
        separator
    }

    /// Moves entries `[from, to)` into `sibling`, appending in order,
    /// and deletes them here.
    fn move_entries(&mut self, from: usize, to: usize, sibling: &mut NodeInner) {
        for i in from..to {
            let off = self.slot(i);
            let size = self.entry_size_at(off);
            let dst_pos = sibling.entry_count();
            let dst = sibling.alloc_entry(size);
            sibling.page[dst..dst + size].copy_from_slice(&self.page[off..off + size]);
            sibling.open_slot(dst_pos);
            sibling.set_slot(dst_pos, dst);
        }
        for i in (from..to).rev() {
            self.delete_entry(i);
        }
        sibling.version += 1;
        self.version += 1;
    }

    /// Appends every entry of `right` (a leaf) onto this leaf and
    /// adopts its high extremity bit.
    pub fn merge_leaf_from(&mut self, right: &mut NodeInner) {
        debug_assert!(self.is_leaf() && right.is_leaf());
        right.move_entries(0, right.entry_count(), self);
        // move_entries appends in order, so the merged order holds.
        self.set_type_bits(right.type_byte() & HIGH_EXTREMITY);
    }

    /// Merges `right` (an internal sibling) into this node with the
    /// separator between them.
    pub fn merge_internal_from(&mut self, separator_field: &[u8], right: &mut NodeInner) {
        debug_assert!(self.is_internal() && right.is_internal());
        let pos = self.entry_count();
        self.internal_insert(pos, separator_field, right.leftmost_child());
        right.move_entries(0, right.entry_count(), self);
        self.set_type_bits(right.type_byte() & HIGH_EXTREMITY);
    }

    /// Bytes of entry data in use, for rebalance decisions.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.tail_used() - self.garbage() + (self.vec_end() - self.vec_start())
    }
}

fn read_u16(page: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([page[off], page[off + 1]])
}

fn write_u16(page: &mut [u8], off: usize, value: u16) {
    page[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(page: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(page[off..off + 8].try_into().unwrap())
}

fn write_u64(page: &mut [u8], off: usize, value: u64) {
    page[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frag::FragmentStore;
    use keel_common::config::DbConfig;
    use keel_store::PageDb;
    use tempfile::tempdir;

    fn test_frags() -> (tempfile::TempDir, FragmentStore) {
        let dir = tempdir().unwrap();
        let config = DbConfig {
            page_size: 512,
            ..DbConfig::default()
        };
        let db = PageDb::open(dir.path().join("frag.db"), &config, false).unwrap();
        (dir, FragmentStore::new(std::sync::Arc::new(db)))
    }

    fn leaf(page_size: usize) -> NodeInner {
        let mut page = vec![0u8; page_size].into_boxed_slice();
        NodeInner::format(&mut page, TYPE_LEAF | LOW_EXTREMITY | HIGH_EXTREMITY);
        NodeInner {
            page,
            split: None,
            dirty: true,
            version: 0,
        }
    }

    fn internal(page_size: usize) -> NodeInner {
        let mut page = vec![0u8; page_size].into_boxed_slice();
        NodeInner::format(&mut page, TYPE_INTERNAL);
        NodeInner {
            page,
            split: None,
            dirty: true,
            version: 0,
        }
    }

    fn insert_kv(node: &mut NodeInner, frags: &FragmentStore, key: &[u8], value: &[u8]) {
        let pos = node.binary_search(key, frags).unwrap().unwrap_err();
        node.leaf_insert(pos, &encode_inline(key), &encode_inline(value));
    }

    #[test]
    fn test_format_empty_leaf() {
        let node = leaf(512);
        assert!(node.is_leaf());
        assert!(!node.is_internal());
        assert!(node.has_low_extremity() && node.has_high_extremity());
        assert_eq!(node.entry_count(), 0);
        assert_eq!(node.free_space(), 512 - NODE_HEADER_SIZE);
    }

    #[test]
    fn test_leaf_insert_keeps_order() {
        let (_dir, frags) = test_frags();
        let mut node = leaf(512);

        insert_kv(&mut node, &frags, b"cherry", b"3");
        insert_kv(&mut node, &frags, b"apple", b"1");
        insert_kv(&mut node, &frags, b"banana", b"2");

        assert_eq!(node.entry_count(), 3);
        let keys: Vec<Vec<u8>> = (0..3)
            .map(|i| node.key_at(i).to_vec(&frags).unwrap())
            .collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]);

        // Strictly increasing under unsigned comparison.
        for i in 1..keys.len() {
            assert!(keys[i - 1] < keys[i]);
        }
    }

    #[test]
    fn test_binary_search_hits_and_misses() {
        let (_dir, frags) = test_frags();
        let mut node = leaf(512);
        for key in [b"b".as_ref(), b"d", b"f"] {
            insert_kv(&mut node, &frags, key, b"v");
        }

        assert_eq!(node.binary_search(b"d", &frags).unwrap(), Ok(1));
        assert_eq!(node.binary_search(b"a", &frags).unwrap(), Err(0));
        assert_eq!(node.binary_search(b"c", &frags).unwrap(), Err(1));
        assert_eq!(node.binary_search(b"z", &frags).unwrap(), Err(3));
    }

    #[test]
    fn test_internal_pos_rounds_up() {
        assert_eq!(NodeInner::internal_pos(Ok(0)), 1);
        assert_eq!(NodeInner::internal_pos(Err(0)), 0);
        assert_eq!(NodeInner::internal_pos(Ok(2)), 3);
        assert_eq!(NodeInner::internal_pos(Err(3)), 3);
    }

    #[test]
    fn test_delete_and_garbage() {
        let (_dir, frags) = test_frags();
        let mut node = leaf(512);
        insert_kv(&mut node, &frags, b"a", b"1");
        insert_kv(&mut node, &frags, b"b", b"2");
        insert_kv(&mut node, &frags, b"c", b"3");

        let free_before = node.free_space();
        // "a" is not at the low-water mark, so its bytes turn to garbage.
        node.delete_entry(0);
        assert_eq!(node.entry_count(), 2);
        assert!(node.garbage() > 0);

        node.compact();
        assert_eq!(node.garbage(), 0);
        assert!(node.free_space() > free_before);
        assert_eq!(node.key_at(0).to_vec(&frags).unwrap(), b"b");
        assert_eq!(node.value_at(1).to_vec(&frags).unwrap(), b"3");
    }

    #[test]
    fn test_replace_value() {
        let (_dir, frags) = test_frags();
        let mut node = leaf(512);
        insert_kv(&mut node, &frags, b"k", b"old");
        node.leaf_replace_value(0, &encode_inline(b"brand-new-value"));
        assert_eq!(node.value_at(0).to_vec(&frags).unwrap(), b"brand-new-value");
        assert_eq!(node.key_at(0).to_vec(&frags).unwrap(), b"k");
    }

    #[test]
    fn test_leaf_split_partitions_keys() {
        let (_dir, frags) = test_frags();
        let mut node = leaf(512);
        for i in 0..16u8 {
            insert_kv(&mut node, &frags, &[b'a' + i], &[b'0'; 16]);
        }

        let mut sibling = leaf(512);
        let separator = node.split_leaf(&mut sibling, 0, 20);
        let (sep_key, _) = parse_field(&separator, 0);
        let sep = match sep_key {
            Field::Inline(bytes) => bytes.to_vec(),
            _ => panic!("separator should be inline"),
        };

        assert!(node.entry_count() > 0 && sibling.entry_count() > 0);
        assert_eq!(node.entry_count() + sibling.entry_count(), 16);

        // Left keys < separator <= right keys.
        let last_left = node.key_at(node.entry_count() - 1).to_vec(&frags).unwrap();
        let first_right = sibling.key_at(0).to_vec(&frags).unwrap();
        assert!(last_left < sep);
        assert_eq!(first_right, sep);

        // Extremity bits follow the halves.
        assert!(node.has_low_extremity() && !node.has_high_extremity());
        assert!(!sibling.has_low_extremity() && sibling.has_high_extremity());
    }

    #[test]
    fn test_internal_insert_and_children() {
        let mut node = internal(512);
        node.set_leftmost_child(PageId::new(10));
        node.internal_insert(0, &encode_inline(b"m"), PageId::new(20));
        node.internal_insert(1, &encode_inline(b"t"), PageId::new(30));

        assert_eq!(node.entry_count(), 2);
        assert_eq!(node.child_at(0), PageId::new(10));
        assert_eq!(node.child_at(1), PageId::new(20));
        assert_eq!(node.child_at(2), PageId::new(30));

        node.set_child_at(1, PageId::new(21));
        assert_eq!(node.child_at(1), PageId::new(21));
    }

    #[test]
    fn test_internal_split_promotes_middle() {
        let (_dir, frags) = test_frags();
        let mut node = internal(512);
        node.set_leftmost_child(PageId::new(100));
        for i in 0..5u8 {
            node.internal_insert(i as usize, &encode_inline(&[b'c' + i * 2]), PageId::new(101 + i as u64));
        }

        let mut sibling = internal(512);
        let separator = node.split_internal(&mut sibling);
        let (sep, _) = parse_field(&separator, 0);
        let sep = sep.to_vec(&frags).unwrap();

        // Separator vanished from both halves and partitions them.
        let left_last = node.key_at(node.entry_count() - 1).to_vec(&frags).unwrap();
        let right_first = sibling.key_at(0).to_vec(&frags).unwrap();
        assert!(left_last < sep);
        assert!(sep < right_first);
        assert_eq!(node.entry_count() + sibling.entry_count(), 4);

        // k keys come with k+1 children on each side.
        assert!(sibling.leftmost_child().is_valid());
    }

    #[test]
    fn test_leaf_merge() {
        let (_dir, frags) = test_frags();
        let mut left = leaf(512);
        left.clear_type_bits(HIGH_EXTREMITY);
        let mut right = leaf(512);
        right.clear_type_bits(LOW_EXTREMITY);

        insert_kv(&mut left, &frags, b"a", b"1");
        insert_kv(&mut left, &frags, b"b", b"2");
        insert_kv(&mut right, &frags, b"c", b"3");
        insert_kv(&mut right, &frags, b"d", b"4");

        left.merge_leaf_from(&mut right);
        assert_eq!(left.entry_count(), 4);
        assert!(left.has_high_extremity());
        let keys: Vec<Vec<u8>> = (0..4)
            .map(|i| left.key_at(i).to_vec(&frags).unwrap())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_fragmented_field_encoding() {
        let field = encode_fragmented(100_000, PageId::new(77));
        let (parsed, next) = parse_field(&field, 0);
        assert_eq!(next, field.len());
        match parsed {
            Field::Fragmented { len, first_page } => {
                assert_eq!(len, 100_000);
                assert_eq!(first_page, PageId::new(77));
            }
            Field::Inline(_) => panic!("expected fragmented"),
        }
    }

    #[test]
    fn test_stub_takeover() {
        let mut node = leaf(512);
        let page = node.take_page_leaving_stub();
        assert!(node.is_stub());
        assert_eq!(node.entry_count(), 0);
        // The taken page still holds the old content.
        assert_eq!(page[OFF_TYPE] & TYPE_LEAF, TYPE_LEAF);
    }
}
