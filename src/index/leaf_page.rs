use std::marker::PhantomData;

use crate::common::{PageId, RecordId, PAGE_SIZE};

use super::key::IndexKey;
use super::tree_page::{
    check_page_type, init_header, read_max_size, read_page_id, read_page_id_field, read_parent,
    read_size, read_u32, write_page_id, write_parent, write_size, write_u32, PageType,
    TREE_PAGE_HEADER_SIZE,
};

const NEXT_PAGE_OFFSET: usize = TREE_PAGE_HEADER_SIZE;
const PREV_PAGE_OFFSET: usize = TREE_PAGE_HEADER_SIZE + 4;
const NUM_TOMBSTONES_OFFSET: usize = TREE_PAGE_HEADER_SIZE + 8;
const TOMBSTONES_OFFSET: usize = TREE_PAGE_HEADER_SIZE + 12;

// After the tombstone array: the deleted-first-key memory (4-byte valid
// flag + one encoded key), then the key and rid arrays.

fn old_first_flag_offset(tomb_cap: usize) -> usize {
    TOMBSTONES_OFFSET + 4 * tomb_cap
}

fn old_first_key_offset(tomb_cap: usize) -> usize {
    old_first_flag_offset(tomb_cap) + 4
}

fn keys_offset<K: IndexKey>(tomb_cap: usize) -> usize {
    old_first_key_offset(tomb_cap) + K::ENCODED_LEN
}

fn key_offset<K: IndexKey>(tomb_cap: usize, i: usize) -> usize {
    keys_offset::<K>(tomb_cap) + i * K::ENCODED_LEN
}

fn rid_offset<K: IndexKey>(tomb_cap: usize, max_size: usize, i: usize) -> usize {
    keys_offset::<K>(tomb_cap) + max_size * K::ENCODED_LEN + i * RecordId::ENCODED_LEN
}

/// Maximum number of entries a leaf page can hold for key type `K` and the
/// given tombstone buffer capacity.
pub fn leaf_slot_capacity<K: IndexKey>(tomb_cap: usize) -> usize {
    (PAGE_SIZE - keys_offset::<K>(tomb_cap)) / (K::ENCODED_LEN + RecordId::ENCODED_LEN)
}

/// Outcome of a leaf-level insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafInsert {
    /// The key is present and live; nothing changed.
    Duplicate,
    /// A new entry was placed at `slot`.
    Inserted { slot: usize },
    /// The key was tombstoned; the tombstone was cleared and the value
    /// overwritten in place.
    Resurrected { slot: usize },
}

/// Outcome of a leaf-level delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafDelete<K> {
    /// Key absent (or already tombstoned); no-op.
    NotFound,
    /// Deletion recorded as a tombstone; physical size unchanged.
    Tombstoned,
    /// Eager physical removal (`TOMB_CAP == 0`). `old_first` carries the
    /// pre-delete minimum when slot 0 was removed.
    Removed { old_first: Option<K> },
    /// The buffer was full: the oldest tombstone was applied physically
    /// before the new deletion was recorded.
    AppliedOldest { old_first: Option<K> },
}

macro_rules! leaf_read_api {
    () => {
        pub fn page_id(&self) -> PageId {
            read_page_id_field(self.data)
        }

        pub fn parent_page_id(&self) -> PageId {
            read_parent(self.data)
        }

        pub fn next_page_id(&self) -> PageId {
            read_page_id(self.data, NEXT_PAGE_OFFSET)
        }

        pub fn prev_page_id(&self) -> PageId {
            read_page_id(self.data, PREV_PAGE_OFFSET)
        }

        /// Physical size: every stored entry, tombstoned ones included.
        pub fn size(&self) -> usize {
            read_size(self.data)
        }

        pub fn max_size(&self) -> usize {
            read_max_size(self.data)
        }

        pub fn min_size(&self) -> usize {
            (self.max_size() + 1) / 2
        }

        pub fn num_tombstones(&self) -> usize {
            read_u32(self.data, NUM_TOMBSTONES_OFFSET) as usize
        }

        /// Logical size: entries visible to lookups and iteration.
        pub fn logical_size(&self) -> usize {
            self.size() - self.num_tombstones()
        }

        /// The `index`-th tombstone in arrival (FIFO) order, as a slot
        /// index into the key/rid arrays.
        pub fn tombstone_at(&self, index: usize) -> usize {
            debug_assert!(index < self.num_tombstones());
            read_u32(self.data, TOMBSTONES_OFFSET + 4 * index) as usize
        }

        pub fn is_tombstoned(&self, slot: usize) -> bool {
            (0..self.num_tombstones()).any(|t| self.tombstone_at(t) == slot)
        }

        /// The tombstoned keys in arrival order. Test introspection.
        pub fn tombstoned_keys(&self) -> Vec<K> {
            (0..self.num_tombstones())
                .map(|t| self.key_at(self.tombstone_at(t)))
                .collect()
        }

        pub fn key_at(&self, index: usize) -> K {
            debug_assert!(index < self.size());
            K::decode_from(&self.data[key_offset::<K>(TOMB_CAP, index)..])
        }

        pub fn rid_at(&self, index: usize) -> RecordId {
            debug_assert!(index < self.size());
            RecordId::decode_from(&self.data[rid_offset::<K>(TOMB_CAP, self.max_size(), index)..])
        }

        pub fn first_key(&self) -> Option<K> {
            (self.size() > 0).then(|| self.key_at(0))
        }

        /// First slot holding a key >= `key`, or `size` if none.
        pub fn lower_bound(&self, key: &K) -> usize {
            let mut left = 0;
            let mut right = self.size();
            while left < right {
                let mid = left + (right - left) / 2;
                if self.key_at(mid) < *key {
                    left = mid + 1;
                } else {
                    right = mid;
                }
            }
            left
        }

        /// The slot of `key` iff it exists and is not tombstoned.
        pub fn find(&self, key: &K) -> Option<usize> {
            let pos = self.lower_bound(key);
            (pos < self.size() && self.key_at(pos) == *key && !self.is_tombstoned(pos))
                .then_some(pos)
        }

        /// Pushes the matching value iff the key is present and live.
        pub fn find_and_push(&self, key: &K, result: &mut Vec<RecordId>) {
            if let Some(slot) = self.find(key) {
                result.push(self.rid_at(slot));
            }
        }
    };
}

/// Read-only view of a B+ tree leaf page with a bounded tombstone buffer.
pub struct LeafPageRef<'a, K: IndexKey, const TOMB_CAP: usize> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey, const TOMB_CAP: usize> LeafPageRef<'a, K, TOMB_CAP> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        check_page_type(data, PageType::Leaf);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    leaf_read_api!();
}

/// Mutable view of a B+ tree leaf page.
pub struct LeafPage<'a, K: IndexKey, const TOMB_CAP: usize> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey, const TOMB_CAP: usize> LeafPage<'a, K, TOMB_CAP> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        check_page_type(data, PageType::Leaf);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Lays a fresh leaf page over the bytes.
    pub fn init(data: &'a mut [u8], page_id: PageId, max_size: usize) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        assert!(max_size >= 2 && max_size <= leaf_slot_capacity::<K>(TOMB_CAP));
        init_header(data, PageType::Leaf, page_id, max_size);
        let mut page = Self {
            data,
            _marker: PhantomData,
        };
        page.set_next_page_id(crate::common::INVALID_PAGE_ID);
        page.set_prev_page_id(crate::common::INVALID_PAGE_ID);
        page.set_num_tombstones(0);
        write_u32(page.data, old_first_flag_offset(TOMB_CAP), 0);
        page
    }

    leaf_read_api!();

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        write_parent(self.data, parent);
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        write_page_id(self.data, NEXT_PAGE_OFFSET, next);
    }

    pub fn set_prev_page_id(&mut self, prev: PageId) {
        write_page_id(self.data, PREV_PAGE_OFFSET, prev);
    }

    fn set_size(&mut self, size: usize) {
        write_size(self.data, size);
    }

    fn set_num_tombstones(&mut self, num: usize) {
        debug_assert!(num <= TOMB_CAP);
        write_u32(self.data, NUM_TOMBSTONES_OFFSET, num as u32);
    }

    fn set_tombstone_at(&mut self, index: usize, slot: usize) {
        debug_assert!(index < TOMB_CAP);
        write_u32(self.data, TOMBSTONES_OFFSET + 4 * index, slot as u32);
    }

    fn set_key_at(&mut self, index: usize, key: &K) {
        let off = key_offset::<K>(TOMB_CAP, index);
        key.encode_into(&mut self.data[off..off + K::ENCODED_LEN]);
    }

    fn set_rid_at(&mut self, index: usize, rid: RecordId) {
        let off = rid_offset::<K>(TOMB_CAP, self.max_size(), index);
        rid.encode_into(&mut self.data[off..off + RecordId::ENCODED_LEN]);
    }

    /// Remembers the pre-deletion minimum so rebalancing can fix parent
    /// separators after the physical first key changed.
    fn record_old_first(&mut self, key: &K) {
        write_u32(self.data, old_first_flag_offset(TOMB_CAP), 1);
        let off = old_first_key_offset(TOMB_CAP);
        key.encode_into(&mut self.data[off..off + K::ENCODED_LEN]);
    }

    /// Takes (reads and clears) the deleted-first-key memory.
    pub fn take_old_first_key(&mut self) -> Option<K> {
        if read_u32(self.data, old_first_flag_offset(TOMB_CAP)) == 0 {
            return None;
        }
        write_u32(self.data, old_first_flag_offset(TOMB_CAP), 0);
        Some(K::decode_from(&self.data[old_first_key_offset(TOMB_CAP)..]))
    }

    /// Position of `slot` in the tombstone FIFO, if tombstoned.
    fn tombstone_entry_for_slot(&self, slot: usize) -> Option<usize> {
        (0..self.num_tombstones()).find(|&t| self.tombstone_at(t) == slot)
    }

    /// Drops the `entry`-th tombstone, preserving arrival order of the
    /// rest.
    fn remove_tombstone_entry(&mut self, entry: usize) {
        let num = self.num_tombstones();
        debug_assert!(entry < num);
        for t in entry + 1..num {
            let slot = self.tombstone_at(t);
            self.set_tombstone_at(t - 1, slot);
        }
        self.set_num_tombstones(num - 1);
    }

    /// Physically removes the entry at `slot`: shifts the arrays down and
    /// re-indexes tombstones past it. The caller must have dropped any
    /// tombstone pointing *at* `slot` beforehand.
    fn remove_slot(&mut self, slot: usize) {
        let size = self.size();
        debug_assert!(slot < size);
        debug_assert!(self.tombstone_entry_for_slot(slot).is_none());

        if slot == 0 {
            let old = self.key_at(0);
            self.record_old_first(&old);
        }

        for i in slot + 1..size {
            let k = self.key_at(i);
            let r = self.rid_at(i);
            self.set_key_at(i - 1, &k);
            self.set_rid_at(i - 1, r);
        }
        self.set_size(size - 1);

        for t in 0..self.num_tombstones() {
            let idx = self.tombstone_at(t);
            debug_assert!(idx != slot);
            if idx > slot {
                self.set_tombstone_at(t, idx - 1);
            }
        }
    }

    /// Inserts `key` with `rid`. A live duplicate is refused; a tombstoned
    /// duplicate is resurrected with the new value.
    pub fn insert(&mut self, key: &K, rid: RecordId) -> LeafInsert {
        let size = self.size();
        let pos = self.lower_bound(key);

        if pos < size && self.key_at(pos) == *key {
            return match self.tombstone_entry_for_slot(pos) {
                Some(entry) => {
                    self.remove_tombstone_entry(entry);
                    self.set_rid_at(pos, rid);
                    LeafInsert::Resurrected { slot: pos }
                }
                None => LeafInsert::Duplicate,
            };
        }

        debug_assert!(size < self.max_size());
        for i in (pos..size).rev() {
            let k = self.key_at(i);
            let r = self.rid_at(i);
            self.set_key_at(i + 1, &k);
            self.set_rid_at(i + 1, r);
        }
        self.set_key_at(pos, key);
        self.set_rid_at(pos, rid);
        self.set_size(size + 1);

        for t in 0..self.num_tombstones() {
            let idx = self.tombstone_at(t);
            if idx >= pos {
                self.set_tombstone_at(t, idx + 1);
            }
        }

        LeafInsert::Inserted { slot: pos }
    }

    /// Deletes `key` per the bounded-tombstone design; see `LeafDelete`.
    pub fn delete(&mut self, key: &K) -> LeafDelete<K> {
        let Some(slot) = self.find(key) else {
            return LeafDelete::NotFound;
        };

        if TOMB_CAP == 0 {
            let old_first = (slot == 0).then(|| self.key_at(0));
            self.remove_slot(slot);
            return LeafDelete::Removed { old_first };
        }

        let num = self.num_tombstones();
        if num < TOMB_CAP {
            self.set_tombstone_at(num, slot);
            self.set_num_tombstones(num + 1);
            if slot == 0 {
                self.record_old_first(key);
            }
            return LeafDelete::Tombstoned;
        }

        // Buffer full: apply the oldest deletion physically, then record
        // the new one.
        let oldest = self.tombstone_at(0);
        self.remove_tombstone_entry(0);
        let old_first = (oldest == 0).then(|| self.key_at(0));
        self.remove_slot(oldest);

        let slot = if oldest < slot { slot - 1 } else { slot };
        let num = self.num_tombstones();
        self.set_tombstone_at(num, slot);
        self.set_num_tombstones(num + 1);
        if slot == 0 {
            self.record_old_first(key);
        }
        LeafDelete::AppliedOldest { old_first }
    }

    /// Compacts the page, physically removing every tombstoned slot.
    pub fn cleanup_tombs(&mut self) {
        let num = self.num_tombstones();
        if num == 0 {
            return;
        }
        let old_first = self.key_at(0);
        self.record_old_first(&old_first);

        let mut slots: Vec<usize> = (0..num).map(|t| self.tombstone_at(t)).collect();
        self.set_num_tombstones(0);
        // Remove from the highest slot down so earlier removals do not
        // shift the later targets.
        slots.sort_unstable_by(|a, b| b.cmp(a));
        for slot in slots {
            self.remove_slot(slot);
        }
    }

    /// Moves the upper `size / 2` entries (and their tombstones,
    /// re-indexed) into the empty page `new_page`, and links it into the
    /// leaf list after this page. The caller fixes the old successor's
    /// `prev` pointer.
    pub fn split_into(&mut self, new_page: &mut LeafPage<'_, K, TOMB_CAP>) {
        debug_assert_eq!(new_page.size(), 0);
        let size = self.size();
        let moved = size / 2;
        let start = size - moved;

        for i in start..size {
            let k = self.key_at(i);
            let r = self.rid_at(i);
            new_page.set_key_at(i - start, &k);
            new_page.set_rid_at(i - start, r);
        }
        new_page.set_size(moved);

        let mut kept = 0;
        let mut shipped = 0;
        for t in 0..self.num_tombstones() {
            let idx = self.tombstone_at(t);
            if idx >= start {
                new_page.set_tombstone_at(shipped, idx - start);
                shipped += 1;
            } else {
                self.set_tombstone_at(kept, idx);
                kept += 1;
            }
        }
        self.set_num_tombstones(kept);
        new_page.set_num_tombstones(shipped);

        self.set_size(start);

        new_page.set_next_page_id(self.next_page_id());
        new_page.set_prev_page_id(self.page_id());
        self.set_next_page_id(new_page.page_id());
    }

    /// Appends all of `other`'s entries and re-indexed tombstones to this
    /// page, unlinks `other` from the leaf list on this side, and resets
    /// it. Returns `other`'s first key. If the combined tombstones would
    /// overrun the buffer, the oldest are applied physically until they
    /// fit. The caller fixes `other`'s old successor's `prev` pointer.
    pub fn absorb(&mut self, other: &mut LeafPage<'_, K, TOMB_CAP>) -> K {
        debug_assert_eq!(self.next_page_id(), other.page_id());
        let other_size = other.size();
        debug_assert!(other_size > 0);
        debug_assert!(self.size() + other_size <= self.max_size());

        let first_key = other.key_at(0);
        let base = self.size();

        for i in 0..other_size {
            let k = other.key_at(i);
            let r = other.rid_at(i);
            self.set_key_at(base + i, &k);
            self.set_rid_at(base + i, r);
        }
        self.set_size(base + other_size);

        let mut combined: Vec<usize> = (0..self.num_tombstones())
            .map(|t| self.tombstone_at(t))
            .collect();
        combined.extend((0..other.num_tombstones()).map(|t| other.tombstone_at(t) + base));

        self.set_num_tombstones(0);
        while combined.len() > TOMB_CAP {
            let oldest = combined.remove(0);
            self.remove_slot(oldest);
            for idx in combined.iter_mut() {
                if *idx > oldest {
                    *idx -= 1;
                }
            }
        }
        for (t, idx) in combined.iter().enumerate() {
            self.set_tombstone_at(t, *idx);
        }
        self.set_num_tombstones(combined.len());

        self.set_next_page_id(other.next_page_id());

        other.set_size(0);
        other.set_num_tombstones(0);
        other.set_next_page_id(crate::common::INVALID_PAGE_ID);
        other.set_prev_page_id(crate::common::INVALID_PAGE_ID);

        first_key
    }

    /// Pops the first live entry, discarding any dead slots in front of it
    /// (their tombstones are resolved for free).
    pub fn pop_front(&mut self) -> (K, RecordId) {
        loop {
            debug_assert!(self.size() > 0);
            match self.tombstone_entry_for_slot(0) {
                Some(entry) => {
                    self.remove_tombstone_entry(entry);
                    self.remove_slot(0);
                }
                None => break,
            }
        }
        let pair = (self.key_at(0), self.rid_at(0));
        self.remove_slot(0);
        pair
    }

    /// Pops the last live entry, discarding trailing dead slots.
    pub fn pop_back(&mut self) -> (K, RecordId) {
        loop {
            let last = self.size() - 1;
            match self.tombstone_entry_for_slot(last) {
                Some(entry) => {
                    self.remove_tombstone_entry(entry);
                    self.remove_slot(last);
                }
                None => break,
            }
        }
        let last = self.size() - 1;
        let pair = (self.key_at(last), self.rid_at(last));
        self.remove_slot(last);
        pair
    }

    /// Places an entry before slot 0. The key must sort below everything
    /// stored here.
    pub fn insert_front(&mut self, pair: (K, RecordId)) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        debug_assert!(size == 0 || pair.0 < self.key_at(0));

        for i in (0..size).rev() {
            let k = self.key_at(i);
            let r = self.rid_at(i);
            self.set_key_at(i + 1, &k);
            self.set_rid_at(i + 1, r);
        }
        self.set_key_at(0, &pair.0);
        self.set_rid_at(0, pair.1);
        self.set_size(size + 1);

        for t in 0..self.num_tombstones() {
            let idx = self.tombstone_at(t);
            self.set_tombstone_at(t, idx + 1);
        }
    }

    /// Appends an entry. The key must sort above everything stored here.
    pub fn insert_back(&mut self, pair: (K, RecordId)) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        debug_assert!(size == 0 || self.key_at(size - 1) < pair.0);
        self.set_key_at(size, &pair.0);
        self.set_rid_at(size, pair.1);
        self.set_size(size + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{SlotId, INVALID_PAGE_ID};

    fn rid(n: u32) -> RecordId {
        RecordId::new(PageId::new(n), SlotId::new(n))
    }

    fn leaf_with<'a, const CAP: usize>(
        data: &'a mut [u8],
        keys: &[u32],
    ) -> LeafPage<'a, u32, CAP> {
        let mut page = LeafPage::<u32, CAP>::init(data, PageId::new(1), 8);
        for &k in keys {
            let expected_slot = page.size();
            assert_eq!(page.insert(&k, rid(k)), LeafInsert::Inserted { slot: expected_slot });
        }
        page
    }

    #[test]
    fn test_leaf_insert_sorted_and_duplicate() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = LeafPage::<u32, 2>::init(&mut data, PageId::new(1), 4);

        assert_eq!(page.insert(&20, rid(20)), LeafInsert::Inserted { slot: 0 });
        assert_eq!(page.insert(&10, rid(10)), LeafInsert::Inserted { slot: 0 });
        assert_eq!(page.insert(&30, rid(30)), LeafInsert::Inserted { slot: 2 });
        assert_eq!(page.insert(&20, rid(99)), LeafInsert::Duplicate);

        assert_eq!(page.size(), 3);
        let keys: Vec<u32> = (0..3).map(|i| page.key_at(i)).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(page.rid_at(1), rid(20));
    }

    #[test]
    fn test_leaf_tombstone_delete_and_find() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 20, 30]);

        assert_eq!(page.delete(&20), LeafDelete::Tombstoned);
        assert_eq!(page.size(), 3, "physical size unchanged");
        assert_eq!(page.logical_size(), 2);
        assert_eq!(page.find(&20), None);
        assert_eq!(page.find(&10), Some(0));
        assert!(page.is_tombstoned(1));
        assert_eq!(page.tombstoned_keys(), vec![20]);

        // Deleting a tombstoned key again is a no-op.
        assert_eq!(page.delete(&20), LeafDelete::NotFound);

        let mut out = Vec::new();
        page.find_and_push(&20, &mut out);
        assert!(out.is_empty());
        page.find_and_push(&30, &mut out);
        assert_eq!(out, vec![rid(30)]);
    }

    #[test]
    fn test_leaf_eager_delete_cap_zero() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<0>(&mut data, &[10, 20, 30]);

        assert_eq!(page.delete(&10), LeafDelete::Removed { old_first: Some(10) });
        assert_eq!(page.size(), 2);
        assert_eq!(page.key_at(0), 20);
        assert_eq!(page.take_old_first_key(), Some(10));
        assert_eq!(page.take_old_first_key(), None);

        assert_eq!(page.delete(&30), LeafDelete::Removed { old_first: None });
        assert_eq!(page.delete(&99), LeafDelete::NotFound);
    }

    #[test]
    fn test_leaf_full_buffer_applies_oldest() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 20, 30, 40, 50]);

        assert_eq!(page.delete(&20), LeafDelete::Tombstoned);
        assert_eq!(page.delete(&40), LeafDelete::Tombstoned);
        assert_eq!(page.num_tombstones(), 2);

        // Third delete: 20 (the oldest) is applied physically, 30 joins
        // the buffer. FIFO order must be preserved.
        assert_eq!(page.delete(&30), LeafDelete::AppliedOldest { old_first: None });
        assert_eq!(page.size(), 4);
        let keys: Vec<u32> = (0..4).map(|i| page.key_at(i)).collect();
        assert_eq!(keys, vec![10, 30, 40, 50]);
        assert_eq!(page.tombstoned_keys(), vec![40, 30]);
        assert_eq!(page.logical_size(), 2);
    }

    #[test]
    fn test_leaf_resurrection_clears_tombstone() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 20, 30]);

        page.delete(&20);
        assert_eq!(page.insert(&20, rid(77)), LeafInsert::Resurrected { slot: 1 });
        assert_eq!(page.num_tombstones(), 0);
        assert_eq!(page.find(&20), Some(1));
        assert_eq!(page.rid_at(1), rid(77));
        assert_eq!(page.size(), 3);
    }

    #[test]
    fn test_leaf_insert_shifts_tombstone_indices() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 30, 40]);

        page.delete(&30); // tombstone at slot 1
        assert_eq!(page.insert(&5, rid(5)), LeafInsert::Inserted { slot: 0 });

        // 30 now lives at slot 2; its tombstone must have followed it.
        assert_eq!(page.key_at(2), 30);
        assert!(page.is_tombstoned(2));
        assert!(!page.is_tombstoned(1));
    }

    #[test]
    fn test_leaf_cleanup_tombs() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<3>(&mut data, &[10, 20, 30, 40]);

        page.delete(&10);
        page.delete(&30);
        page.cleanup_tombs();

        assert_eq!(page.size(), 2);
        assert_eq!(page.num_tombstones(), 0);
        let keys: Vec<u32> = (0..2).map(|i| page.key_at(i)).collect();
        assert_eq!(keys, vec![20, 40]);
        assert_eq!(page.take_old_first_key(), Some(10));
    }

    #[test]
    fn test_leaf_split_translates_tombstones() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 20, 30, 40]);
        page.set_next_page_id(PageId::new(9));

        page.delete(&10);
        page.delete(&30);

        let mut new_data = vec![0u8; PAGE_SIZE];
        let mut new_page = LeafPage::<u32, 2>::init(&mut new_data, PageId::new(5), 8);
        page.split_into(&mut new_page);

        // 4 entries: upper 2 move right.
        assert_eq!(page.size(), 2);
        assert_eq!(new_page.size(), 2);
        assert_eq!(page.tombstoned_keys(), vec![10]);
        assert_eq!(new_page.tombstoned_keys(), vec![30]);
        assert!(new_page.is_tombstoned(0));

        assert_eq!(page.next_page_id(), PageId::new(5));
        assert_eq!(new_page.prev_page_id(), PageId::new(1));
        assert_eq!(new_page.next_page_id(), PageId::new(9));
    }

    #[test]
    fn test_leaf_absorb_reindexes_tombstones() {
        let mut left_data = vec![0u8; PAGE_SIZE];
        let mut right_data = vec![0u8; PAGE_SIZE];
        let mut left = leaf_with::<2>(&mut left_data, &[10, 20]);
        let mut right = LeafPage::<u32, 2>::init(&mut right_data, PageId::new(2), 8);
        for &k in &[30u32, 40] {
            right.insert(&k, rid(k));
        }
        left.set_next_page_id(PageId::new(2));
        right.set_prev_page_id(PageId::new(1));
        right.set_next_page_id(PageId::new(7));

        left.delete(&20);
        right.delete(&30);

        let first = left.absorb(&mut right);
        assert_eq!(first, 30);
        assert_eq!(left.size(), 4);
        assert_eq!(right.size(), 0);
        assert_eq!(left.tombstoned_keys(), vec![20, 30]);
        assert_eq!(left.next_page_id(), PageId::new(7));
        assert_eq!(left.logical_size(), 2);
    }

    #[test]
    fn test_leaf_absorb_overflowing_tombstones() {
        let mut left_data = vec![0u8; PAGE_SIZE];
        let mut right_data = vec![0u8; PAGE_SIZE];
        let mut left = leaf_with::<1>(&mut left_data, &[10, 20]);
        let mut right = LeafPage::<u32, 1>::init(&mut right_data, PageId::new(2), 8);
        for &k in &[30u32, 40] {
            right.insert(&k, rid(k));
        }
        left.set_next_page_id(PageId::new(2));

        left.delete(&20);
        right.delete(&30);

        // Combined tombstones (2) exceed the buffer (1): the oldest is
        // applied physically during the merge.
        let first = left.absorb(&mut right);
        assert_eq!(first, 30);
        assert_eq!(left.size(), 3);
        assert_eq!(left.tombstoned_keys(), vec![30]);
        let keys: Vec<u32> = (0..3).map(|i| left.key_at(i)).collect();
        assert_eq!(keys, vec![10, 30, 40]);
    }

    #[test]
    fn test_leaf_pops_skip_dead_slots() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[10, 20, 30, 40]);

        page.delete(&10);
        page.delete(&40);

        assert_eq!(page.pop_front(), (20, rid(20)));
        assert_eq!(page.pop_back(), (30, rid(30)));
        assert_eq!(page.size(), 0);
        assert_eq!(page.num_tombstones(), 0);
    }

    #[test]
    fn test_leaf_insert_front_back() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = leaf_with::<2>(&mut data, &[20, 30]);
        page.delete(&20);

        page.insert_front((10, rid(10)));
        assert_eq!(page.key_at(0), 10);
        // The tombstone on 20 must have moved with it.
        assert!(page.is_tombstoned(1));

        page.insert_back((40, rid(40)));
        assert_eq!(page.key_at(3), 40);
        assert_eq!(page.size(), 4);
    }

    #[test]
    fn test_leaf_init_state() {
        let mut data = vec![0u8; PAGE_SIZE];
        let page = LeafPage::<u32, 2>::init(&mut data, PageId::new(3), 8);
        assert_eq!(page.size(), 0);
        assert_eq!(page.num_tombstones(), 0);
        assert_eq!(page.next_page_id(), INVALID_PAGE_ID);
        assert_eq!(page.prev_page_id(), INVALID_PAGE_ID);
        assert_eq!(page.first_key(), None);
        assert_eq!(page.min_size(), 4);
    }
}
