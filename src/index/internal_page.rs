use std::marker::PhantomData;

use crate::common::{PageId, PAGE_SIZE};

use super::key::IndexKey;
use super::tree_page::{
    check_page_type, init_header, read_max_size, read_page_id_field, read_parent, read_size,
    write_parent, write_size, PageType, TREE_PAGE_HEADER_SIZE,
};

/// Maximum number of children an internal page can hold for key type `K`.
pub fn internal_slot_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - TREE_PAGE_HEADER_SIZE) / (K::ENCODED_LEN + 4)
}

// Internal pages store `size` parallel (key, child) pairs: `keys[i]` is the
// first key of the subtree under `children[i]`. `keys[0]` is the sentinel
// slot; lookups only ever route on keys at indices 1..size, but the slot is
// kept up to date so a parent's fence for this page can always be read off
// `keys[0]`.
//
// Layout after the shared header:
//   keys:     max_size * K::ENCODED_LEN bytes
//   children: max_size * 4 bytes

fn key_offset<K: IndexKey>(i: usize) -> usize {
    TREE_PAGE_HEADER_SIZE + i * K::ENCODED_LEN
}

fn child_offset<K: IndexKey>(max_size: usize, i: usize) -> usize {
    TREE_PAGE_HEADER_SIZE + max_size * K::ENCODED_LEN + i * 4
}

macro_rules! internal_read_api {
    () => {
        pub fn page_id(&self) -> PageId {
            read_page_id_field(self.data)
        }

        pub fn parent_page_id(&self) -> PageId {
            read_parent(self.data)
        }

        pub fn size(&self) -> usize {
            read_size(self.data)
        }

        pub fn max_size(&self) -> usize {
            read_max_size(self.data)
        }

        pub fn min_size(&self) -> usize {
            (self.max_size() + 1) / 2
        }

        pub fn key_at(&self, index: usize) -> K {
            debug_assert!(index < self.size());
            K::decode_from(&self.data[key_offset::<K>(index)..])
        }

        pub fn child_at(&self, index: usize) -> PageId {
            debug_assert!(index < self.size());
            let off = child_offset::<K>(self.max_size(), index);
            PageId::new(u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap()))
        }

        /// Position where `key` would insert: the first slot holding a key
        /// >= `key`, or `size` if every stored key is smaller.
        pub fn binary_search(&self, key: &K) -> usize {
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

        /// Routing: the child whose subtree covers `key`, i.e. the last
        /// slot whose fence key is <= `key` (slot 0 when `key` sorts below
        /// every fence).
        pub fn find_child(&self, key: &K) -> (usize, PageId) {
            let pos = self.binary_search(key);
            let slot = if pos < self.size() && self.key_at(pos) == *key {
                pos
            } else {
                pos.saturating_sub(1)
            };
            (slot, self.child_at(slot))
        }

        /// Slot whose key equals `key`, if any.
        pub fn match_key(&self, key: &K) -> Option<usize> {
            let pos = self.binary_search(key);
            (pos < self.size() && self.key_at(pos) == *key).then_some(pos)
        }

        /// Slot of the entry pointing at `pid`, if any.
        pub fn value_index_by_pid(&self, pid: PageId) -> Option<usize> {
            (0..self.size()).find(|&i| self.child_at(i) == pid)
        }
    };
}

/// Read-only view of an internal B+ tree page.
pub struct InternalPageRef<'a, K: IndexKey> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPageRef<'a, K> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        check_page_type(data, PageType::Internal);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    internal_read_api!();
}

/// Mutable view of an internal B+ tree page.
pub struct InternalPage<'a, K: IndexKey> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPage<'a, K> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        check_page_type(data, PageType::Internal);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Lays a fresh internal page over the bytes.
    pub fn init(data: &'a mut [u8], page_id: PageId, max_size: usize) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        assert!(max_size >= 3 && max_size <= internal_slot_capacity::<K>());
        init_header(data, PageType::Internal, page_id, max_size);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    internal_read_api!();

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        write_parent(self.data, parent);
    }

    fn set_size(&mut self, size: usize) {
        write_size(self.data, size);
    }

    fn set_key_at(&mut self, index: usize, key: &K) {
        let off = key_offset::<K>(index);
        key.encode_into(&mut self.data[off..off + K::ENCODED_LEN]);
    }

    fn set_child_at(&mut self, index: usize, child: PageId) {
        let off = child_offset::<K>(self.max_size(), index);
        self.data[off..off + 4].copy_from_slice(&child.as_u32().to_le_bytes());
    }

    /// In-place fence replacement.
    pub fn update_key(&mut self, index: usize, key: &K) {
        debug_assert!(index < self.size());
        self.set_key_at(index, key);
    }

    /// Populates an empty page with a two-child split result.
    pub fn first_insert(&mut self, left_key: &K, right_key: &K, left: PageId, right: PageId) {
        debug_assert_eq!(self.size(), 0);
        self.set_key_at(0, left_key);
        self.set_key_at(1, right_key);
        self.set_child_at(0, left);
        self.set_child_at(1, right);
        self.set_size(2);
    }

    /// Inserts a (fence, child) pair keeping keys sorted. Refuses a
    /// duplicate key; duplicates within a level never arise in a
    /// well-formed tree.
    pub fn insert(&mut self, key: &K, child: PageId) -> bool {
        let size = self.size();
        debug_assert!(size < self.max_size());
        let pos = self.binary_search(key);
        if pos < size && self.key_at(pos) == *key {
            return false;
        }
        for i in (pos..size).rev() {
            let k = self.key_at(i);
            let c = self.child_at(i);
            self.set_key_at(i + 1, &k);
            self.set_child_at(i + 1, c);
        }
        self.set_key_at(pos, key);
        self.set_child_at(pos, child);
        self.set_size(size + 1);
        true
    }

    /// Removes the pair at `index`, shifting the rest down.
    pub fn delete_pair(&mut self, index: usize) {
        let size = self.size();
        debug_assert!(index < size);
        for i in index + 1..size {
            let k = self.key_at(i);
            let c = self.child_at(i);
            self.set_key_at(i - 1, &k);
            self.set_child_at(i - 1, c);
        }
        self.set_size(size - 1);
    }

    pub fn pop_front(&mut self) -> (K, PageId) {
        debug_assert!(self.size() > 0);
        let pair = (self.key_at(0), self.child_at(0));
        self.delete_pair(0);
        pair
    }

    pub fn pop_back(&mut self) -> (K, PageId) {
        let size = self.size();
        debug_assert!(size > 0);
        let pair = (self.key_at(size - 1), self.child_at(size - 1));
        self.set_size(size - 1);
        pair
    }

    pub fn insert_front(&mut self, pair: (K, PageId)) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        for i in (0..size).rev() {
            let k = self.key_at(i);
            let c = self.child_at(i);
            self.set_key_at(i + 1, &k);
            self.set_child_at(i + 1, c);
        }
        self.set_key_at(0, &pair.0);
        self.set_child_at(0, pair.1);
        self.set_size(size + 1);
    }

    pub fn insert_back(&mut self, pair: (K, PageId)) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        self.set_key_at(size, &pair.0);
        self.set_child_at(size, pair.1);
        self.set_size(size + 1);
    }

    /// Moves the upper half (entries from `min_size` on) into the empty
    /// page `new_page`. Returns the separator (the moved run's first key)
    /// and the moved child ids so the caller can rewrite their parent
    /// pointers.
    pub fn split_into(&mut self, new_page: &mut InternalPage<'_, K>) -> (K, Vec<PageId>) {
        debug_assert_eq!(new_page.size(), 0);
        let size = self.size();
        let split_at = self.min_size();
        debug_assert!(split_at < size);

        let separator = self.key_at(split_at);
        let mut moved = Vec::with_capacity(size - split_at);
        for i in split_at..size {
            let k = self.key_at(i);
            let c = self.child_at(i);
            new_page.insert_back((k, c));
            moved.push(c);
        }
        self.set_size(split_at);
        (separator, moved)
    }

    /// Appends all of `other`'s entries to this page and empties `other`.
    /// Returns `other`'s first key (the separator the caller deletes from
    /// the grandparent) and the absorbed child ids for reparenting.
    pub fn absorb(&mut self, other: &mut InternalPage<'_, K>) -> (K, Vec<PageId>) {
        let other_size = other.size();
        debug_assert!(other_size > 0);
        debug_assert!(self.size() + other_size <= self.max_size());

        let first_key = other.key_at(0);
        let mut moved = Vec::with_capacity(other_size);
        for i in 0..other_size {
            let k = other.key_at(i);
            let c = other.child_at(i);
            self.insert_back((k, c));
            moved.push(c);
        }
        other.set_size(0);
        (first_key, moved)
    }
}
