use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::common::{FrameId, PageId, Result, SiloError, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{ArcReplacer, FrameHeader, ReadPageGuard, WritePageGuard};

/// Bookkeeping protected by the pool latch: the page table, the free list,
/// and (transitively) every pin-count and evictability transition.
struct PoolInner {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that currently hold no page
    free_list: VecDeque<FrameId>,
}

/// Shared pool state. Page guards hold an `Arc` to this so their release
/// path can reach the pool latch and the disk scheduler after the manager
/// handle itself has moved on.
pub(crate) struct PoolCore {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// Pool latch
    inner: Mutex<PoolInner>,
    /// ARC replacer for eviction decisions; its internal latch is only ever
    /// taken from under the pool latch
    replacer: ArcReplacer,
    /// Disk scheduler for page I/O
    disk_scheduler: DiskScheduler,
}

impl PoolCore {
    /// Guard release path: propagate dirtiness to the frame, unpin, and
    /// re-enable eviction at pin count zero. The caller must have released
    /// the frame's rw-latch already.
    pub(crate) fn release_frame(&self, frame: &FrameHeader, dirty: bool) {
        let _inner = self.inner.lock();
        if dirty {
            frame.set_dirty(true);
        }
        if frame.release_pin() == 0 {
            self.replacer.set_evictable(frame.frame_id(), true);
        }
    }

    /// Synchronous write-through used by guard `flush()`.
    pub(crate) fn write_through(&self, page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<()> {
        self.disk_scheduler.schedule_write_sync(page_id, data)
    }
}

/// BufferPoolManager caches fixed-size disk pages in a fixed set of frames,
/// pins them while guards are live, and evicts with the ARC policy under
/// memory pressure.
///
/// Locking discipline: the pool latch is never held across disk I/O or a
/// contended frame-latch acquisition. Page loads take the frame's write
/// latch *before* publishing the page-table mapping, so concurrent
/// requesters of the same page block on the frame latch until the bytes
/// have arrived.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    num_frames: usize,
    /// Monotonic page id allocator; ids are never reused in-process
    next_page_id: AtomicU32,
    /// Shared state
    core: Arc<PoolCore>,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given number of frames on
    /// top of the disk manager.
    pub fn new(num_frames: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_list = VecDeque::with_capacity(num_frames);

        for i in 0..num_frames {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let core = Arc::new(PoolCore {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: ArcReplacer::new(num_frames),
            disk_scheduler: DiskScheduler::new(disk_manager),
        });

        Self {
            num_frames,
            next_page_id: AtomicU32::new(0),
            core,
        }
    }

    /// Returns the number of frames in the pool.
    pub fn size(&self) -> usize {
        self.num_frames
    }

    /// Allocates a new page id and installs the zero-filled page in a
    /// frame. Returns `Ok(None)` when every frame is pinned. The page
    /// starts unpinned and evictable; take a guard to work with it.
    pub fn new_page(&self) -> Result<Option<PageId>> {
        let Some(frame_id) = self.acquire_free_frame()? else {
            return Ok(None);
        };

        let page_id = PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst));
        let frame = &self.core.frames[frame_id.as_usize()];
        frame.set_page_id(page_id);

        {
            let mut inner = self.core.inner.lock();
            inner.page_table.insert(page_id, frame_id);
            self.core.replacer.record_access(frame_id, page_id);
            self.core.replacer.set_evictable(frame_id, true);
        }

        debug!(page_id = page_id.as_u32(), frame_id = frame_id.as_u32(), "allocated page");
        Ok(Some(page_id))
    }

    /// Deletes a page from the pool and asks the disk layer to release its
    /// storage. Succeeds trivially when the page is not cached; refuses
    /// (`Ok(false)`) while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        {
            let mut inner = self.core.inner.lock();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                let frame = &self.core.frames[frame_id.as_usize()];
                if frame.pin_count() > 0 {
                    return Ok(false);
                }
                inner.page_table.remove(&page_id);
                self.core.replacer.remove(frame_id);
                frame.reset();
                inner.free_list.push_back(frame_id);
            }
        }

        self.core.disk_scheduler.disk_manager().deallocate_page(page_id);
        debug!(page_id = page_id.as_u32(), "deleted page");
        Ok(true)
    }

    /// Acquires the page for shared access. `Ok(None)` when the page is
    /// not cached and no frame can be freed.
    pub fn checked_read_page(&self, page_id: PageId) -> Result<Option<ReadPageGuard>> {
        if !page_id.is_valid() {
            return Err(SiloError::InvalidPageId(page_id));
        }

        loop {
            if let Some(frame) = self.try_pin_cached(page_id) {
                // Blocks here (not under the pool latch) while a loader or
                // writer holds the frame latch.
                let lock = frame.data.read();
                let guard = unsafe {
                    ReadPageGuard::new(page_id, Arc::clone(&frame), Arc::clone(&self.core), lock)
                };
                return Ok(Some(guard));
            }

            match self.load_page(page_id)? {
                LoadOutcome::Loaded(frame, wlock) => {
                    let rlock = RwLockWriteGuard::downgrade(wlock);
                    let guard = unsafe {
                        ReadPageGuard::new(page_id, frame, Arc::clone(&self.core), rlock)
                    };
                    return Ok(Some(guard));
                }
                LoadOutcome::Exhausted => return Ok(None),
                LoadOutcome::Raced => continue,
            }
        }
    }

    /// Acquires the page for exclusive access. `Ok(None)` when the page is
    /// not cached and no frame can be freed.
    pub fn checked_write_page(&self, page_id: PageId) -> Result<Option<WritePageGuard>> {
        if !page_id.is_valid() {
            return Err(SiloError::InvalidPageId(page_id));
        }

        loop {
            if let Some(frame) = self.try_pin_cached(page_id) {
                let lock = frame.data.write();
                let guard = unsafe {
                    WritePageGuard::new(page_id, Arc::clone(&frame), Arc::clone(&self.core), lock)
                };
                return Ok(Some(guard));
            }

            match self.load_page(page_id)? {
                LoadOutcome::Loaded(frame, wlock) => {
                    let guard = unsafe {
                        WritePageGuard::new(page_id, frame, Arc::clone(&self.core), wlock)
                    };
                    return Ok(Some(guard));
                }
                LoadOutcome::Exhausted => return Ok(None),
                LoadOutcome::Raced => continue,
            }
        }
    }

    /// Writes a cached page to disk and clears its dirty bit.
    /// Returns false if the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.flush_cached(page_id, false)
    }

    /// Writes every dirty cached page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.core.inner.lock();
            inner.page_table.keys().copied().collect()
        };

        for page_id in page_ids {
            self.flush_cached(page_id, true)?;
        }
        Ok(())
    }

    /// Pins the page, snapshots its bytes outside the pool latch (the read
    /// latch also serializes against an in-flight load), and writes them
    /// through the scheduler. The write is enqueued while the pin is still
    /// held so a later eviction of the same page cannot order its
    /// write-back behind this older snapshot.
    fn flush_cached(&self, page_id: PageId, only_dirty: bool) -> Result<bool> {
        let Some(frame) = self.try_pin_cached(page_id) else {
            return Ok(false);
        };

        let enqueued = {
            let lock = frame.data.read();
            if only_dirty && !frame.is_dirty() {
                Ok(None)
            } else {
                let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
                buf.copy_from_slice(&lock[..]);
                frame.set_dirty(false);
                self.core.disk_scheduler.schedule_write(page_id, buf).map(Some)
            }
        };
        self.core.release_frame(&frame, false);

        if let Some(rx) = enqueued? {
            rx.recv()
                .map_err(|e| SiloError::DiskScheduler(format!("flush completion lost: {}", e)))??;
            trace!(page_id = page_id.as_u32(), "flushed page");
        }
        Ok(true)
    }

    /// Returns the pin count for a cached page. Introspection for tests.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.core.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.core.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.core.inner.lock().free_list.len()
    }

    /// Fast path: pin the frame if the page is cached. The pin, access
    /// recording and evictability change happen atomically under the pool
    /// latch; the frame latch is acquired by the caller afterwards.
    fn try_pin_cached(&self, page_id: PageId) -> Option<Arc<FrameHeader>> {
        let inner = self.core.inner.lock();
        let &frame_id = inner.page_table.get(&page_id)?;
        let frame = &self.core.frames[frame_id.as_usize()];
        frame.bump_pin();
        self.core.replacer.record_access(frame_id, page_id);
        self.core.replacer.set_evictable(frame_id, false);
        Some(Arc::clone(frame))
    }

    /// Miss path: obtain a frame, publish the mapping while already holding
    /// the frame's write latch, then read the page in from disk outside the
    /// pool latch.
    fn load_page(&self, page_id: PageId) -> Result<LoadOutcome> {
        let Some(frame_id) = self.acquire_free_frame()? else {
            return Ok(LoadOutcome::Exhausted);
        };

        let frame = Arc::clone(&self.core.frames[frame_id.as_usize()]);
        // Uncontended: the frame is reachable by no other thread yet.
        let mut wlock = frame.data.write();

        {
            let mut inner = self.core.inner.lock();
            if inner.page_table.contains_key(&page_id) {
                // Another thread installed the page while we were acquiring
                // a frame. Give ours back and retry the fast path.
                inner.free_list.push_back(frame_id);
                return Ok(LoadOutcome::Raced);
            }
            inner.page_table.insert(page_id, frame_id);
            frame.set_page_id(page_id);
            frame.bump_pin();
            self.core.replacer.record_access(frame_id, page_id);
            self.core.replacer.set_evictable(frame_id, false);
        }

        match self.core.disk_scheduler.schedule_read_sync(page_id) {
            Ok(buf) => {
                wlock.copy_from_slice(&buf[..]);
                frame.set_dirty(false);
                // Safety: the frame lives in `self.core.frames` for the
                // pool's lifetime and is also kept alive by the Arc that
                // travels alongside the guard.
                let wlock: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
                    unsafe { std::mem::transmute(wlock) };
                Ok(LoadOutcome::Loaded(frame, wlock))
            }
            Err(e) => {
                // Undo the installation before propagating the fatal error.
                drop(wlock);
                let mut inner = self.core.inner.lock();
                if frame.pin_count() == 1 {
                    inner.page_table.remove(&page_id);
                    self.core.replacer.remove(frame_id);
                    frame.reset();
                    inner.free_list.push_back(frame_id);
                } else {
                    // Concurrent requesters already pinned the mapping and
                    // are parked on the frame latch; just drop our pin and
                    // let the zeroed page age out.
                    frame.release_pin();
                }
                Err(e)
            }
        }
    }

    /// Gets a reusable frame from the free list, or evicts one. A dirty
    /// victim is snapshotted and its write-back enqueued under the pool
    /// latch (enqueueing never blocks), which keeps the scheduler's
    /// per-page FIFO ordering ahead of any re-read of the evicted page;
    /// completion is awaited outside the latch.
    fn acquire_free_frame(&self) -> Result<Option<FrameId>> {
        let (frame_id, pending) = {
            let mut inner = self.core.inner.lock();
            if let Some(frame_id) = inner.free_list.pop_front() {
                (frame_id, None)
            } else if let Some(frame_id) = self.core.replacer.evict() {
                let frame = &self.core.frames[frame_id.as_usize()];
                let old_page_id = frame.page_id();
                inner.page_table.remove(&old_page_id);

                let pending = if frame.is_dirty() {
                    trace!(
                        page_id = old_page_id.as_u32(),
                        frame_id = frame_id.as_u32(),
                        "evicting dirty page"
                    );
                    // The victim has pin count zero, so its latch is free.
                    let buf = frame.snapshot();
                    Some(self.core.disk_scheduler.schedule_write(old_page_id, buf)?)
                } else {
                    trace!(
                        page_id = old_page_id.as_u32(),
                        frame_id = frame_id.as_u32(),
                        "evicting clean page"
                    );
                    None
                };
                frame.reset();
                (frame_id, pending)
            } else {
                return Ok(None);
            }
        };

        if let Some(rx) = pending {
            rx.recv()
                .map_err(|e| SiloError::DiskScheduler(format!("flush completion lost: {}", e)))??;
        }
        Ok(Some(frame_id))
    }
}

enum LoadOutcome {
    /// Page loaded; the frame's write latch is still held.
    Loaded(Arc<FrameHeader>, RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>),
    /// No cached frame and no evictable frame.
    Exhausted,
    /// Another thread installed the page concurrently; retry.
    Raced,
}
