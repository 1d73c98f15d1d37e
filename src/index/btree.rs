use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{PageId, RecordId, Result, SiloError, INVALID_PAGE_ID};

use super::header_page::{HeaderPage, HeaderPageRef};
use super::internal_page::{internal_slot_capacity, InternalPage, InternalPageRef};
use super::iterator::TreeIterator;
use super::key::IndexKey;
use super::leaf_page::{leaf_slot_capacity, LeafDelete, LeafInsert, LeafPage, LeafPageRef};
use super::tree_page::{page_type, write_parent, PageType};

/// Concurrent B+ tree index over the buffer pool.
///
/// Every node access goes through page guards; the tree itself holds no
/// page memory. Writers first try an optimistic pass that read-couples to
/// the target leaf's parent and write-latches only the leaf, falling back
/// to a pessimistic descent that keeps a write-guard chain from the
/// deepest ancestor the operation could touch. The header page is
/// write-latched whenever the root may change.
///
/// Deletions are buffered: each leaf carries up to `TOMB_CAP` tombstones,
/// applied physically in FIFO order once the buffer is full. `TOMB_CAP ==
/// 0` degrades to classical eager deletion.
pub struct BPlusTree<K: IndexKey, const TOMB_CAP: usize> {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    leaf_max: usize,
    internal_max: usize,
    _marker: std::marker::PhantomData<K>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Insert,
    Remove,
}

/// One level of the retained write-guard chain.
struct StackEntry {
    guard: WritePageGuard,
    pid: PageId,
}

/// Guards retained by a pessimistic descent: the header (while the root
/// may still change) and the path from the deepest ancestor the operation
/// can affect down to the leaf.
struct Context {
    header: Option<WritePageGuard>,
    stack: Vec<StackEntry>,
}

enum Descent {
    /// The tree has no root; the header write guard is handed back.
    EmptyTree { header: WritePageGuard },
    Reached(Context),
}

impl<K: IndexKey, const TOMB_CAP: usize> BPlusTree<K, TOMB_CAP> {
    /// Creates a tree over a freshly allocated header page.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max: usize,
        internal_max: usize,
    ) -> Result<Self> {
        assert!(leaf_max >= 3 && leaf_max <= leaf_slot_capacity::<K>(TOMB_CAP));
        assert!(internal_max >= 3 && internal_max <= internal_slot_capacity::<K>());

        let tree = Self {
            bpm,
            header_page_id,
            leaf_max,
            internal_max,
            _marker: std::marker::PhantomData,
        };
        let mut header = tree.acquire_write(header_page_id)?;
        HeaderPage::init(header.data_mut());
        Ok(tree)
    }

    /// Re-opens a tree whose header page already exists on disk.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max: usize,
        internal_max: usize,
    ) -> Self {
        Self {
            bpm,
            header_page_id,
            leaf_max,
            internal_max,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.get_root_page_id()?.is_valid())
    }

    pub fn get_root_page_id(&self) -> Result<PageId> {
        let header = self.acquire_read(self.header_page_id)?;
        Ok(HeaderPageRef::new(header.data()).root_page_id())
    }

    /// Point lookup. Under unique keys the result holds at most one RID.
    pub fn get_value(&self, key: &K) -> Result<Vec<RecordId>> {
        let mut result = Vec::new();
        let header = self.acquire_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(result);
        }

        let mut guard = self.acquire_read(root_id)?;
        drop(header);
        loop {
            if page_type(guard.data()) == PageType::Leaf {
                LeafPageRef::<K, TOMB_CAP>::new(guard.data()).find_and_push(key, &mut result);
                return Ok(result);
            }
            let (_, child) = InternalPageRef::<K>::new(guard.data()).find_child(key);
            let next = self.acquire_read(child)?;
            guard = next;
        }
    }

    /// Inserts a key/RID pair. Returns false on a duplicate key, and also
    /// when the buffer pool cannot supply the pages a split would need
    /// (allocation failure is recoverable, never fatal).
    pub fn insert(&self, key: K, rid: RecordId) -> Result<bool> {
        match self.insert_inner(&key, rid) {
            Err(SiloError::PoolExhausted) => Ok(false),
            other => other,
        }
    }

    fn insert_inner(&self, key: &K, rid: RecordId) -> Result<bool> {
        if let Some(done) = self.insert_optimistic(key, rid)? {
            return Ok(done);
        }
        self.insert_pessimistic(key, rid)
    }

    /// Removes a key. Absent keys are a silent no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        if self.remove_optimistic(key)?.is_some() {
            return Ok(());
        }
        self.remove_pessimistic(key)
    }

    /// Iterator over the whole tree in key order.
    pub fn begin(&self) -> Result<TreeIterator<K, TOMB_CAP>> {
        let Some(guard) = self.leftmost_leaf()? else {
            return Ok(TreeIterator::end_sentinel(Arc::clone(&self.bpm)));
        };
        TreeIterator::new(Arc::clone(&self.bpm), guard, 0)
    }

    /// Iterator starting at the first live entry with key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K, TOMB_CAP>> {
        let header = self.acquire_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(TreeIterator::end_sentinel(Arc::clone(&self.bpm)));
        }

        let mut guard = self.acquire_read(root_id)?;
        drop(header);
        loop {
            if page_type(guard.data()) == PageType::Leaf {
                let slot = LeafPageRef::<K, TOMB_CAP>::new(guard.data()).lower_bound(key);
                return TreeIterator::new(Arc::clone(&self.bpm), guard, slot);
            }
            let (_, child) = InternalPageRef::<K>::new(guard.data()).find_child(key);
            let next = self.acquire_read(child)?;
            guard = next;
        }
    }

    /// The past-the-end iterator.
    pub fn end(&self) -> TreeIterator<K, TOMB_CAP> {
        TreeIterator::end_sentinel(Arc::clone(&self.bpm))
    }

    /// Page id of the leftmost leaf; invalid when the tree is empty.
    /// Lets tests walk the leaf chain directly.
    pub fn first_leaf_page_id(&self) -> Result<PageId> {
        match self.leftmost_leaf()? {
            Some(guard) => Ok(guard.page_id()),
            None => Ok(INVALID_PAGE_ID),
        }
    }

    fn leftmost_leaf(&self) -> Result<Option<ReadPageGuard>> {
        let header = self.acquire_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(None);
        }

        let mut guard = self.acquire_read(root_id)?;
        drop(header);
        loop {
            if page_type(guard.data()) == PageType::Leaf {
                return Ok(Some(guard));
            }
            let child = InternalPageRef::<K>::new(guard.data()).child_at(0);
            let next = self.acquire_read(child)?;
            guard = next;
        }
    }

    // ---------------------------------------------------------------
    // Guard plumbing
    // ---------------------------------------------------------------

    fn acquire_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        self.bpm
            .checked_read_page(page_id)?
            .ok_or(SiloError::PoolExhausted)
    }

    fn acquire_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        self.bpm
            .checked_write_page(page_id)?
            .ok_or(SiloError::PoolExhausted)
    }

    fn allocate_page(&self) -> Result<PageId> {
        self.bpm.new_page()?.ok_or(SiloError::PoolExhausted)
    }

    /// Allocates `count` pages or none: on exhaustion mid-way the already
    /// allocated pages are returned to the pool.
    fn allocate_pages(&self, count: usize) -> Result<Vec<PageId>> {
        let mut pids = Vec::with_capacity(count);
        for _ in 0..count {
            match self.bpm.new_page()? {
                Some(pid) => pids.push(pid),
                None => {
                    for pid in pids {
                        let _ = self.bpm.delete_page(pid);
                    }
                    return Err(SiloError::PoolExhausted);
                }
            }
        }
        Ok(pids)
    }

    // ---------------------------------------------------------------
    // Crabbing
    // ---------------------------------------------------------------

    /// Whether a structure change at this node can propagate to its
    /// parent. Safe nodes end the retained chain.
    fn node_safe(&self, data: &[u8], is_leaf: bool, is_root: bool, op: Op) -> bool {
        match (op, is_leaf) {
            (Op::Insert, true) => {
                let leaf = LeafPageRef::<K, TOMB_CAP>::new(data);
                leaf.size() + 1 < self.leaf_max
            }
            (Op::Insert, false) => InternalPageRef::<K>::new(data).size() < self.internal_max,
            (Op::Remove, true) => {
                let leaf = LeafPageRef::<K, TOMB_CAP>::new(data);
                let buffered = TOMB_CAP > 0 && leaf.num_tombstones() < TOMB_CAP;
                let floor = if is_root { 1 } else { leaf.min_size() };
                buffered || leaf.size() > floor
            }
            (Op::Remove, false) => {
                let node = InternalPageRef::<K>::new(data);
                if is_root {
                    node.size() > 2
                } else {
                    node.size() > node.min_size()
                }
            }
        }
    }

    /// Pessimistic descent: walks root-to-leaf under write guards,
    /// releasing ancestors that the operation provably cannot touch. A
    /// node's ancestors stay retained while the node is unsafe (a split or
    /// merge could propagate) or while it was entered through slot 0 (a
    /// first-key change could propagate).
    fn descend_write(&self, key: &K, op: Op) -> Result<Descent> {
        let header = self.acquire_write(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(Descent::EmptyTree { header });
        }

        let mut ctx = Context {
            header: Some(header),
            stack: Vec::new(),
        };
        let mut current = root_id;
        let mut slot_in_parent = 0usize;

        loop {
            let guard = self.acquire_write(current)?;
            let is_leaf = page_type(guard.data()) == PageType::Leaf;
            let is_root = ctx.stack.is_empty();
            let safe = self.node_safe(guard.data(), is_leaf, is_root, op);

            let next = if is_leaf {
                None
            } else {
                Some(InternalPageRef::<K>::new(guard.data()).find_child(key))
            };

            ctx.stack.push(StackEntry {
                guard,
                pid: current,
            });

            if safe {
                if is_root {
                    ctx.header = None;
                } else if slot_in_parent != 0 {
                    // Nothing above the parent can be affected anymore.
                    ctx.header = None;
                    let keep_from = ctx.stack.len() - 2;
                    ctx.stack.drain(..keep_from);
                }
            }

            match next {
                None => break,
                Some((slot, child)) => {
                    current = child;
                    slot_in_parent = slot;
                }
            }
        }

        Ok(Descent::Reached(ctx))
    }

    /// After the first key of `ctx.stack[level]` changed, refreshes parent
    /// fences upward. Each update rewrites the child's fence in its
    /// parent; the walk continues only while the updated slot is 0 (i.e.
    /// while the parent's own first key keeps changing).
    fn propagate_first_key(&self, ctx: &mut Context, mut level: usize) {
        while level > 0 {
            let child_pid = ctx.stack[level].pid;
            let Some(first_key) = first_key_of::<K, TOMB_CAP>(ctx.stack[level].guard.data())
            else {
                return;
            };
            let parent_entry = &mut ctx.stack[level - 1];
            let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
            let Some(slot) = parent.value_index_by_pid(child_pid) else {
                debug_assert!(false, "child {} missing from parent", child_pid);
                return;
            };
            parent.update_key(slot, &first_key);
            if slot != 0 {
                return;
            }
            level -= 1;
        }
    }

    // ---------------------------------------------------------------
    // Insert
    // ---------------------------------------------------------------

    /// Optimistic insert: read-couple to the leaf's parent, write-latch
    /// the leaf, and apply the insert iff it is provably local (no split,
    /// no new minimum). Returns None when the pessimistic path is needed.
    fn insert_optimistic(&self, key: &K, rid: RecordId) -> Result<Option<bool>> {
        let header = self.acquire_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(None);
        }

        let mut parent: ReadPageGuard = header;
        let mut current = root_id;
        loop {
            let child = self.acquire_read(current)?;
            if page_type(child.data()) != PageType::Leaf {
                let (_, next) = InternalPageRef::<K>::new(child.data()).find_child(key);
                parent = child;
                current = next;
                continue;
            }
            drop(child);

            // The parent's read guard keeps this leaf from being split,
            // merged or deleted while we swap to a write latch.
            let mut leaf_guard = self.acquire_write(current)?;
            drop(parent);

            let local = {
                let leaf = LeafPageRef::<K, TOMB_CAP>::new(leaf_guard.data());
                let pos = leaf.lower_bound(key);
                let exact = pos < leaf.size() && leaf.key_at(pos) == *key;
                // In-place updates are always local; fresh inserts must
                // neither fill the leaf nor become its new minimum.
                exact || (pos > 0 && leaf.size() + 1 < self.leaf_max)
            };
            if !local {
                return Ok(None);
            }

            let mut leaf = LeafPage::<K, TOMB_CAP>::new(leaf_guard.data_mut());
            return Ok(Some(!matches!(leaf.insert(key, rid), LeafInsert::Duplicate)));
        }
    }

    fn insert_pessimistic(&self, key: &K, rid: RecordId) -> Result<bool> {
        let mut ctx = match self.descend_write(key, Op::Insert)? {
            Descent::EmptyTree { mut header } => {
                let root_pid = self.allocate_page()?;
                let mut root_guard = self.acquire_write(root_pid)?;
                let mut leaf =
                    LeafPage::<K, TOMB_CAP>::init(root_guard.data_mut(), root_pid, self.leaf_max);
                leaf.insert(key, rid);
                HeaderPage::new(header.data_mut()).set_root_page_id(root_pid);
                debug!(root = root_pid.as_u32(), "started new tree");
                return Ok(true);
            }
            Descent::Reached(ctx) => ctx,
        };

        let leaf_level = ctx.stack.len() - 1;
        let (pos, exact, leaf_size) = {
            let leaf = LeafPageRef::<K, TOMB_CAP>::new(ctx.stack[leaf_level].guard.data());
            let pos = leaf.lower_bound(key);
            (
                pos,
                pos < leaf.size() && leaf.key_at(pos) == *key,
                leaf.size(),
            )
        };

        if exact {
            // Duplicate or resurrection; both are in-place.
            let entry = ctx.stack.last_mut().expect("descent reached no leaf");
            let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
            return Ok(!matches!(leaf.insert(key, rid), LeafInsert::Duplicate));
        }

        // Pre-allocate every page the split chain will need so allocation
        // failure can be reported before the tree is modified at all.
        let new_pids = if leaf_size + 1 == self.leaf_max {
            let mut count = 1;
            for level in (0..leaf_level).rev() {
                let node = InternalPageRef::<K>::new(ctx.stack[level].guard.data());
                if node.size() == self.internal_max {
                    count += 1;
                } else {
                    break;
                }
            }
            let root_splits = count == ctx.stack.len();
            self.allocate_pages(count + usize::from(root_splits))?
        } else {
            Vec::new()
        };

        {
            let entry = ctx.stack.last_mut().expect("descent reached no leaf");
            let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
            let outcome = leaf.insert(key, rid);
            debug_assert_eq!(outcome, LeafInsert::Inserted { slot: pos });
        }
        if pos == 0 {
            self.propagate_first_key(&mut ctx, leaf_level);
        }

        if !new_pids.is_empty() {
            self.split_and_push_up(&mut ctx, new_pids)?;
        }
        Ok(true)
    }

    /// Splits the (full) leaf at the bottom of the chain and pushes
    /// separator fences upward, splitting full internal nodes along the
    /// way; grows a new root if the chain reaches it.
    fn split_and_push_up(&self, ctx: &mut Context, new_pids: Vec<PageId>) -> Result<()> {
        let mut pids = new_pids.into_iter();

        // Leaf split.
        let (mut pending, old_next) = {
            let right_pid = pids.next().expect("missing preallocated leaf page");
            let mut right_guard = self.acquire_write(right_pid)?;
            let entry = ctx.stack.last_mut().expect("split with empty chain");
            let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
            let mut right =
                LeafPage::<K, TOMB_CAP>::init(right_guard.data_mut(), right_pid, self.leaf_max);
            leaf.split_into(&mut right);
            right.set_parent_page_id(leaf.parent_page_id());
            let sep = right.first_key().expect("split produced empty sibling");
            trace!(
                left = entry.pid.as_u32(),
                right = right_pid.as_u32(),
                "leaf split"
            );
            ((sep, right_pid), right.next_page_id())
        };
        if old_next.is_valid() {
            let mut next_guard = self.acquire_write(old_next)?;
            LeafPage::<K, TOMB_CAP>::new(next_guard.data_mut()).set_prev_page_id(pending.1);
        }

        // Push the separator up the retained chain.
        let mut level = ctx.stack.len() - 1;
        loop {
            let (sep, right_pid) = pending;
            if level == 0 {
                // The chain reached the root: grow the tree by one level.
                let root_pid = pids.next().expect("missing preallocated root page");
                let mut root_guard = self.acquire_write(root_pid)?;
                let old_root = ctx.stack.first_mut().expect("split with empty chain");
                let left_first = first_key_of::<K, TOMB_CAP>(old_root.guard.data())
                    .expect("old root has no keys");
                let mut root =
                    InternalPage::<K>::init(root_guard.data_mut(), root_pid, self.internal_max);
                root.first_insert(&left_first, &sep, old_root.pid, right_pid);
                write_parent(old_root.guard.data_mut(), root_pid);
                {
                    let mut right_guard = self.acquire_write(right_pid)?;
                    write_parent(right_guard.data_mut(), root_pid);
                }
                let header = ctx
                    .header
                    .as_mut()
                    .expect("root split without header guard");
                HeaderPage::new(header.data_mut()).set_root_page_id(root_pid);
                debug!(root = root_pid.as_u32(), "tree grew a level");
                return Ok(());
            }

            level -= 1;
            let parent_size = InternalPageRef::<K>::new(ctx.stack[level].guard.data()).size();
            if parent_size < self.internal_max {
                let entry = &mut ctx.stack[level];
                let mut parent = InternalPage::<K>::new(entry.guard.data_mut());
                parent.insert(&sep, right_pid);
                return Ok(());
            }

            // Parent is full: split it, then place the fence on the
            // correct side.
            let new_pid = pids.next().expect("missing preallocated internal page");
            let mut new_guard = self.acquire_write(new_pid)?;
            let (moved_sep, moved_children, went_right) = {
                let entry = &mut ctx.stack[level];
                let mut parent = InternalPage::<K>::new(entry.guard.data_mut());
                let mut new_node =
                    InternalPage::<K>::init(new_guard.data_mut(), new_pid, self.internal_max);
                let (moved_sep, moved_children) = parent.split_into(&mut new_node);
                new_node.set_parent_page_id(parent.parent_page_id());
                let went_right = sep >= moved_sep;
                if went_right {
                    new_node.insert(&sep, right_pid);
                } else {
                    parent.insert(&sep, right_pid);
                }
                trace!(
                    left = entry.pid.as_u32(),
                    right = new_pid.as_u32(),
                    "internal split"
                );
                (moved_sep, moved_children, went_right)
            };
            for child in moved_children {
                let mut child_guard = self.acquire_write(child)?;
                write_parent(child_guard.data_mut(), new_pid);
            }
            if went_right {
                let mut right_guard = self.acquire_write(right_pid)?;
                write_parent(right_guard.data_mut(), new_pid);
            }
            pending = (moved_sep, new_pid);
        }
    }

    // ---------------------------------------------------------------
    // Remove
    // ---------------------------------------------------------------

    /// Optimistic remove: applies iff the deletion is provably local to
    /// the leaf (no physical shrink below the floor, no first-key change
    /// visible to the parent).
    fn remove_optimistic(&self, key: &K) -> Result<Option<()>> {
        let header = self.acquire_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(Some(())); // empty tree: nothing to remove
        }

        let mut at_root = true;
        let mut parent: ReadPageGuard = header;
        let mut current = root_id;
        loop {
            let child = self.acquire_read(current)?;
            if page_type(child.data()) != PageType::Leaf {
                let (_, next) = InternalPageRef::<K>::new(child.data()).find_child(key);
                parent = child;
                at_root = false;
                current = next;
                continue;
            }
            drop(child);

            let mut leaf_guard = self.acquire_write(current)?;
            drop(parent);

            let local = {
                let leaf = LeafPageRef::<K, TOMB_CAP>::new(leaf_guard.data());
                match leaf.find(key) {
                    None => return Ok(Some(())), // absent: silent no-op
                    Some(slot) => {
                        if TOMB_CAP > 0 && leaf.num_tombstones() < TOMB_CAP {
                            // Pure tombstoning never moves bytes.
                            true
                        } else {
                            let removed_slot = if TOMB_CAP == 0 {
                                slot
                            } else {
                                leaf.tombstone_at(0)
                            };
                            let size_ok = if at_root {
                                leaf.size() > 1
                            } else {
                                leaf.size() > leaf.min_size()
                            };
                            size_ok && (at_root || removed_slot != 0)
                        }
                    }
                }
            };
            if !local {
                return Ok(None);
            }

            let mut leaf = LeafPage::<K, TOMB_CAP>::new(leaf_guard.data_mut());
            leaf.delete(key);
            return Ok(Some(()));
        }
    }

    fn remove_pessimistic(&self, key: &K) -> Result<()> {
        let mut ctx = match self.descend_write(key, Op::Remove)? {
            Descent::EmptyTree { .. } => return Ok(()),
            Descent::Reached(ctx) => ctx,
        };

        let leaf_level = ctx.stack.len() - 1;
        let outcome = {
            let entry = ctx.stack.last_mut().expect("descent reached no leaf");
            let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
            leaf.delete(key)
        };

        match outcome {
            LeafDelete::NotFound | LeafDelete::Tombstoned => Ok(()),
            LeafDelete::Removed { old_first } | LeafDelete::AppliedOldest { old_first } => {
                if old_first.is_some() {
                    self.propagate_first_key(&mut ctx, leaf_level);
                }
                self.handle_leaf_underflow(&mut ctx)
            }
        }
    }

    /// Called after a physical removal shrank the leaf at the bottom of
    /// the chain; rebalances and walks mergers up the tree.
    fn handle_leaf_underflow(&self, ctx: &mut Context) -> Result<()> {
        let (size, tombs) = {
            let entry = ctx.stack.last().expect("underflow with empty chain");
            let leaf = LeafPageRef::<K, TOMB_CAP>::new(entry.guard.data());
            (leaf.size(), leaf.num_tombstones())
        };

        if ctx.stack.len() == 1 {
            // Root leaf: collapse the tree when it physically empties.
            if size == 0 && tombs == 0 {
                let header = ctx
                    .header
                    .as_mut()
                    .expect("root emptied without header guard");
                HeaderPage::new(header.data_mut()).set_root_page_id(INVALID_PAGE_ID);
                let entry = ctx.stack.pop().expect("underflow with empty chain");
                let pid = entry.pid;
                drop(entry.guard);
                let _ = self.bpm.delete_page(pid)?;
                debug!("tree emptied");
            }
            return Ok(());
        }

        let min = (self.leaf_max + 1) / 2;
        if size >= min {
            return Ok(());
        }

        let coalesced = self.rebalance_leaf(ctx)?;
        if coalesced {
            self.handle_internal_underflow(ctx)?;
        }
        Ok(())
    }

    /// Redistributes from a same-parent sibling with surplus, else
    /// coalesces with one (preferring the left). Returns true when pages
    /// were merged and the parent lost a child.
    fn rebalance_leaf(&self, ctx: &mut Context) -> Result<bool> {
        let leaf_level = ctx.stack.len() - 1;
        let parent_level = leaf_level - 1;
        let leaf_pid = ctx.stack[leaf_level].pid;

        let (slot, left_pid, right_pid) = {
            let parent = InternalPageRef::<K>::new(ctx.stack[parent_level].guard.data());
            let slot = parent
                .value_index_by_pid(leaf_pid)
                .expect("leaf missing from parent");
            let left = (slot > 0).then(|| parent.child_at(slot - 1));
            let right = (slot + 1 < parent.size()).then(|| parent.child_at(slot + 1));
            (slot, left, right)
        };

        // Borrow from the left sibling.
        let mut left_guard = match left_pid {
            Some(pid) => Some(self.acquire_write(pid)?),
            None => None,
        };
        if let Some(lg) = left_guard.as_mut() {
            let can_donate = {
                let left = LeafPageRef::<K, TOMB_CAP>::new(lg.data());
                left.size() > left.min_size() && left.logical_size() > 0
            };
            if can_donate {
                let pair = LeafPage::<K, TOMB_CAP>::new(lg.data_mut()).pop_back();
                let entry = &mut ctx.stack[leaf_level];
                let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
                leaf.insert_front((pair.0, pair.1));
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.update_key(slot, &pair.0);
                trace!(leaf = leaf_pid.as_u32(), "redistributed from left sibling");
                return Ok(false);
            }
        }

        // Borrow from the right sibling.
        let mut right_guard = match right_pid {
            Some(pid) => Some(self.acquire_write(pid)?),
            None => None,
        };
        if let Some(rg) = right_guard.as_mut() {
            let can_donate = {
                let right = LeafPageRef::<K, TOMB_CAP>::new(rg.data());
                right.size() > right.min_size() && right.logical_size() > 0
            };
            if can_donate {
                let mut right = LeafPage::<K, TOMB_CAP>::new(rg.data_mut());
                let pair = right.pop_front();
                let new_first = right.first_key().expect("donor emptied by pop");
                {
                    let entry = &mut ctx.stack[leaf_level];
                    let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
                    leaf.insert_back((pair.0, pair.1));
                }
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.update_key(slot + 1, &new_first);
                trace!(leaf = leaf_pid.as_u32(), "redistributed from right sibling");
                return Ok(false);
            }
        }

        // Coalesce, preferring the left sibling.
        if let Some(mut lg) = left_guard {
            let all_dead = {
                let left = LeafPageRef::<K, TOMB_CAP>::new(lg.data());
                left.size() > left.min_size() && left.logical_size() == 0
            };
            if all_dead {
                // An oversized but fully tombstoned sibling cannot donate
                // and will not fit in a merge; compacting empties it.
                return self.drop_emptied_sibling(ctx, lg, slot - 1);
            }

            let old_next = {
                let entry = &mut ctx.stack[leaf_level];
                let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
                let mut left = LeafPage::<K, TOMB_CAP>::new(lg.data_mut());
                left.absorb(&mut leaf);
                left.next_page_id()
            };
            if old_next.is_valid() {
                let left_pid = lg.page_id();
                let mut next_guard = self.acquire_write(old_next)?;
                LeafPage::<K, TOMB_CAP>::new(next_guard.data_mut()).set_prev_page_id(left_pid);
            }
            drop(lg);
            {
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.delete_pair(slot);
            }
            let entry = ctx.stack.pop().expect("coalesce with empty chain");
            drop(entry.guard);
            let _ = self.bpm.delete_page(leaf_pid)?;
            trace!(absorbed = leaf_pid.as_u32(), "coalesced leaf into left sibling");
            return Ok(true);
        }

        let mut rg = right_guard.expect("leaf has neither sibling");
        let all_dead = {
            let right = LeafPageRef::<K, TOMB_CAP>::new(rg.data());
            right.size() > right.min_size() && right.logical_size() == 0
        };
        if all_dead {
            return self.drop_emptied_sibling(ctx, rg, slot + 1);
        }

        let right_page_id = rg.page_id();
        let old_next = {
            let entry = &mut ctx.stack[leaf_level];
            let mut leaf = LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut());
            let mut right = LeafPage::<K, TOMB_CAP>::new(rg.data_mut());
            leaf.absorb(&mut right);
            leaf.next_page_id()
        };
        if old_next.is_valid() {
            let mut next_guard = self.acquire_write(old_next)?;
            LeafPage::<K, TOMB_CAP>::new(next_guard.data_mut()).set_prev_page_id(leaf_pid);
        }
        drop(rg);
        {
            let parent_entry = &mut ctx.stack[parent_level];
            let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
            parent.delete_pair(slot + 1);
        }
        let entry = ctx.stack.pop().expect("coalesce with empty chain");
        drop(entry.guard);
        let _ = self.bpm.delete_page(right_page_id)?;
        trace!(absorbed = right_page_id.as_u32(), "coalesced right sibling into leaf");
        Ok(true)
    }

    /// Compacts a fully tombstoned, oversized sibling into nothing and
    /// unlinks it. The underflowing leaf stays small; its next deletion
    /// retries rebalancing.
    fn drop_emptied_sibling(
        &self,
        ctx: &mut Context,
        mut sibling_guard: WritePageGuard,
        sibling_slot: usize,
    ) -> Result<bool> {
        let leaf_level = ctx.stack.len() - 1;
        let parent_level = leaf_level - 1;
        let sibling_pid = sibling_guard.page_id();

        let (prev, next) = {
            let mut sib = LeafPage::<K, TOMB_CAP>::new(sibling_guard.data_mut());
            sib.cleanup_tombs();
            debug_assert_eq!(sib.size(), 0);
            (sib.prev_page_id(), sib.next_page_id())
        };

        {
            let parent_entry = &mut ctx.stack[parent_level];
            let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
            // Dropping child 0 would raise the parent's own low fence and
            // force an update in every ancestor along a slot-0 chain; a
            // low fence may lag below the subtree minimum, so keep the old
            // one instead.
            let old_low_fence = (sibling_slot == 0).then(|| parent.key_at(0));
            parent.delete_pair(sibling_slot);
            if let Some(fence) = old_low_fence {
                parent.update_key(0, &fence);
            }
        }
        // Release the emptied page before latching its chain neighbors;
        // holding it while reaching leftward could close a lock cycle with
        // a rightward-walking writer.
        drop(sibling_guard);

        // Unlink from the leaf chain. One neighbor is the leaf we hold.
        let leaf_pid = ctx.stack[leaf_level].pid;
        if prev.is_valid() {
            if prev == leaf_pid {
                let entry = &mut ctx.stack[leaf_level];
                LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut()).set_next_page_id(next);
            } else {
                let mut g = self.acquire_write(prev)?;
                LeafPage::<K, TOMB_CAP>::new(g.data_mut()).set_next_page_id(next);
            }
        }
        if next.is_valid() {
            if next == leaf_pid {
                let entry = &mut ctx.stack[leaf_level];
                LeafPage::<K, TOMB_CAP>::new(entry.guard.data_mut()).set_prev_page_id(prev);
            } else {
                let mut g = self.acquire_write(next)?;
                LeafPage::<K, TOMB_CAP>::new(g.data_mut()).set_prev_page_id(prev);
            }
        }

        let _ = self.bpm.delete_page(sibling_pid)?;
        ctx.stack.pop();
        trace!(page = sibling_pid.as_u32(), "dropped fully tombstoned sibling");
        Ok(true)
    }

    /// Walks mergers upward: after a child was removed from the node at
    /// the bottom of the chain, rebalance it, and keep going while nodes
    /// coalesce.
    fn handle_internal_underflow(&self, ctx: &mut Context) -> Result<()> {
        loop {
            let level = ctx.stack.len() - 1;
            let (size, min) = {
                let entry = ctx.stack.last().expect("underflow with empty chain");
                let node = InternalPageRef::<K>::new(entry.guard.data());
                (node.size(), node.min_size())
            };

            if level == 0 {
                if size == 1 {
                    // The root holds a single child: demote the tree.
                    let child_pid = {
                        let entry = ctx.stack.last().expect("underflow with empty chain");
                        InternalPageRef::<K>::new(entry.guard.data()).child_at(0)
                    };
                    let header = ctx
                        .header
                        .as_mut()
                        .expect("root collapse without header guard");
                    HeaderPage::new(header.data_mut()).set_root_page_id(child_pid);
                    {
                        let mut child_guard = self.acquire_write(child_pid)?;
                        write_parent(child_guard.data_mut(), INVALID_PAGE_ID);
                    }
                    let entry = ctx.stack.pop().expect("underflow with empty chain");
                    let pid = entry.pid;
                    drop(entry.guard);
                    let _ = self.bpm.delete_page(pid)?;
                    debug!(new_root = child_pid.as_u32(), "tree lost a level");
                }
                return Ok(());
            }

            if size >= min {
                return Ok(());
            }

            if !self.rebalance_internal(ctx)? {
                return Ok(());
            }
        }
    }

    /// Internal-node version of `rebalance_leaf`. Returns true when the
    /// node coalesced with a sibling (so the parent lost a child).
    fn rebalance_internal(&self, ctx: &mut Context) -> Result<bool> {
        let level = ctx.stack.len() - 1;
        let parent_level = level - 1;
        let node_pid = ctx.stack[level].pid;

        let (slot, left_pid, right_pid) = {
            let parent = InternalPageRef::<K>::new(ctx.stack[parent_level].guard.data());
            let slot = parent
                .value_index_by_pid(node_pid)
                .expect("node missing from parent");
            let left = (slot > 0).then(|| parent.child_at(slot - 1));
            let right = (slot + 1 < parent.size()).then(|| parent.child_at(slot + 1));
            (slot, left, right)
        };

        let mut left_guard = match left_pid {
            Some(pid) => Some(self.acquire_write(pid)?),
            None => None,
        };
        if let Some(lg) = left_guard.as_mut() {
            let can_donate =
                { InternalPageRef::<K>::new(lg.data()).size() > (self.internal_max + 1) / 2 };
            if can_donate {
                let pair = InternalPage::<K>::new(lg.data_mut()).pop_back();
                {
                    let entry = &mut ctx.stack[level];
                    let mut node = InternalPage::<K>::new(entry.guard.data_mut());
                    node.insert_front(pair);
                }
                {
                    let mut child_guard = self.acquire_write(pair.1)?;
                    write_parent(child_guard.data_mut(), node_pid);
                }
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.update_key(slot, &pair.0);
                trace!(node = node_pid.as_u32(), "internal redistribute from left");
                return Ok(false);
            }
        }

        let mut right_guard = match right_pid {
            Some(pid) => Some(self.acquire_write(pid)?),
            None => None,
        };
        if let Some(rg) = right_guard.as_mut() {
            let can_donate =
                { InternalPageRef::<K>::new(rg.data()).size() > (self.internal_max + 1) / 2 };
            if can_donate {
                let (pair, new_first) = {
                    let mut right = InternalPage::<K>::new(rg.data_mut());
                    let pair = right.pop_front();
                    (pair, right.key_at(0))
                };
                {
                    let entry = &mut ctx.stack[level];
                    let mut node = InternalPage::<K>::new(entry.guard.data_mut());
                    node.insert_back(pair);
                }
                {
                    let mut child_guard = self.acquire_write(pair.1)?;
                    write_parent(child_guard.data_mut(), node_pid);
                }
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.update_key(slot + 1, &new_first);
                trace!(node = node_pid.as_u32(), "internal redistribute from right");
                return Ok(false);
            }
        }

        // Coalesce, preferring the left sibling.
        if let Some(mut lg) = left_guard {
            let left_page_id = lg.page_id();
            let moved = {
                let entry = &mut ctx.stack[level];
                let mut node = InternalPage::<K>::new(entry.guard.data_mut());
                let mut left = InternalPage::<K>::new(lg.data_mut());
                let (_, moved) = left.absorb(&mut node);
                moved
            };
            for child in moved {
                let mut child_guard = self.acquire_write(child)?;
                write_parent(child_guard.data_mut(), left_page_id);
            }
            drop(lg);
            {
                let parent_entry = &mut ctx.stack[parent_level];
                let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
                parent.delete_pair(slot);
            }
            let entry = ctx.stack.pop().expect("coalesce with empty chain");
            drop(entry.guard);
            let _ = self.bpm.delete_page(node_pid)?;
            trace!(absorbed = node_pid.as_u32(), "coalesced internal into left sibling");
            return Ok(true);
        }

        let mut rg = right_guard.expect("internal node has neither sibling");
        let right_page_id = rg.page_id();
        let moved = {
            let entry = &mut ctx.stack[level];
            let mut node = InternalPage::<K>::new(entry.guard.data_mut());
            let mut right = InternalPage::<K>::new(rg.data_mut());
            let (_, moved) = node.absorb(&mut right);
            moved
        };
        for child in moved {
            let mut child_guard = self.acquire_write(child)?;
            write_parent(child_guard.data_mut(), node_pid);
        }
        drop(rg);
        {
            let parent_entry = &mut ctx.stack[parent_level];
            let mut parent = InternalPage::<K>::new(parent_entry.guard.data_mut());
            parent.delete_pair(slot + 1);
        }
        let entry = ctx.stack.pop().expect("coalesce with empty chain");
        drop(entry.guard);
        let _ = self.bpm.delete_page(right_page_id)?;
        trace!(absorbed = right_page_id.as_u32(), "coalesced right sibling into internal");
        Ok(true)
    }
}

/// First key stored on a tree page of either kind.
fn first_key_of<K: IndexKey, const TOMB_CAP: usize>(data: &[u8]) -> Option<K> {
    match page_type(data) {
        PageType::Leaf => LeafPageRef::<K, TOMB_CAP>::new(data).first_key(),
        PageType::Internal => {
            let node = InternalPageRef::<K>::new(data);
            (node.size() > 0).then(|| node.key_at(0))
        }
        PageType::Invalid => None,
    }
}
