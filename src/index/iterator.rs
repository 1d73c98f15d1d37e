use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{PageId, RecordId, Result, SiloError, INVALID_PAGE_ID};

use super::key::IndexKey;
use super::leaf_page::LeafPageRef;

/// Single-pass forward iterator over the live entries of a B+ tree.
///
/// Holds a read guard on the current leaf and a slot index; tombstoned
/// slots are skipped, and leaf boundaries are crossed via `next_page_id`,
/// releasing the old leaf's guard before taking the next one. The end
/// sentinel is an invalid page id; position equality is `(page_id, slot)`.
///
/// Behavior under concurrent modification of the tree is undefined; wrap
/// iteration in an external snapshotting mechanism if that matters.
pub struct TreeIterator<K: IndexKey, const TOMB_CAP: usize> {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    page_id: PageId,
    slot: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey, const TOMB_CAP: usize> TreeIterator<K, TOMB_CAP> {
    /// Positions the iterator at the first live entry at or after
    /// (`page_id`, `slot`).
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        slot: usize,
    ) -> Result<Self> {
        let page_id = guard.page_id();
        let mut iter = Self {
            bpm,
            guard: Some(guard),
            page_id,
            slot,
            _marker: PhantomData,
        };
        iter.skip_dead()?;
        Ok(iter)
    }

    /// The past-the-end iterator.
    pub(crate) fn end_sentinel(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            page_id: INVALID_PAGE_ID,
            slot: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// Current position as `(page_id, slot)`.
    pub fn position(&self) -> (PageId, usize) {
        (self.page_id, self.slot)
    }

    /// The entry under the cursor, if not at the end.
    pub fn entry(&self) -> Option<(K, RecordId)> {
        let guard = self.guard.as_ref()?;
        let leaf = LeafPageRef::<K, TOMB_CAP>::new(guard.data());
        debug_assert!(self.slot < leaf.size() && !leaf.is_tombstoned(self.slot));
        Some((leaf.key_at(self.slot), leaf.rid_at(self.slot)))
    }

    /// Steps to the next live entry.
    pub fn advance(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.slot += 1;
        self.skip_dead()
    }

    /// Moves the cursor forward past tombstones and exhausted leaves until
    /// it rests on a live entry or reaches the end.
    fn skip_dead(&mut self) -> Result<()> {
        loop {
            let Some(guard) = self.guard.as_ref() else {
                self.page_id = INVALID_PAGE_ID;
                return Ok(());
            };
            let (size, next, dead) = {
                let leaf = LeafPageRef::<K, TOMB_CAP>::new(guard.data());
                (
                    leaf.size(),
                    leaf.next_page_id(),
                    self.slot < leaf.size() && leaf.is_tombstoned(self.slot),
                )
            };

            if self.slot >= size {
                // Release the current leaf before touching its successor.
                self.guard = None;
                if !next.is_valid() {
                    self.page_id = INVALID_PAGE_ID;
                    return Ok(());
                }
                let guard = self
                    .bpm
                    .checked_read_page(next)?
                    .ok_or(SiloError::PoolExhausted)?;
                self.page_id = next;
                self.slot = 0;
                self.guard = Some(guard);
                continue;
            }
            if dead {
                self.slot += 1;
                continue;
            }
            return Ok(());
        }
    }
}

impl<K: IndexKey, const TOMB_CAP: usize> Iterator for TreeIterator<K, TOMB_CAP> {
    type Item = Result<(K, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let entry = self.entry()?;
        match self.advance() {
            Ok(()) => Some(Ok(entry)),
            Err(e) => {
                self.guard = None;
                self.page_id = INVALID_PAGE_ID;
                Some(Err(e))
            }
        }
    }
}

impl<K: IndexKey, const TOMB_CAP: usize> PartialEq for TreeIterator<K, TOMB_CAP> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.slot == other.slot
    }
}
