use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, Result, PAGE_SIZE};

use super::buffer_pool_manager::PoolCore;
use super::FrameHeader;

type DataReadGuard = RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>;
type DataWriteGuard = RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>;

/// RAII guard for shared read access to a page.
///
/// While alive it holds the frame's rw-latch in read mode and contributes
/// one pin. Releasing (drop or `drop_guard`) first releases the latch and
/// then, under the pool latch, unpins the frame and re-enables eviction at
/// pin count zero. Guards are movable, not copyable; a move transfers the
/// latch, the pin, and the release obligation in one step.
pub struct ReadPageGuard {
    page_id: PageId,
    /// Keeps the frame alive for the lifetime of the transmuted lock guard
    frame: Arc<FrameHeader>,
    pool: Arc<PoolCore>,
    data_guard: Option<DataReadGuard>,
}

impl ReadPageGuard {
    /// Creates a new ReadPageGuard from a held read latch.
    ///
    /// # Safety
    /// `lock` must guard `frame.data`; the frame is kept alive via the Arc,
    /// which makes extending the guard's lifetime to `'static` sound.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        pool: Arc<PoolCore>,
        lock: RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>>,
    ) -> Self {
        let data_guard: DataReadGuard = std::mem::transmute(lock);
        Self {
            page_id,
            frame,
            pool,
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a read-only view of the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns whether the underlying frame is dirty.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Writes the page through the disk scheduler and clears the dirty bit.
    pub fn flush(&self) -> Result<()> {
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(&self.data_guard.as_ref().unwrap()[..]);
        self.pool.write_through(self.page_id, buf)?;
        self.frame.set_dirty(false);
        Ok(())
    }

    /// Releases this guard early.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch first, pool bookkeeping second; the reverse order inverts
        // the lock hierarchy against concurrent acquirers.
        self.data_guard.take();
        self.pool.release_frame(&self.frame, false);
    }
}

/// RAII guard for exclusive write access to a page.
///
/// Everything said for [`ReadPageGuard`] applies, plus: the first call to
/// `data_mut` marks the guard dirty, and release propagates that to the
/// frame so the page is written back at eviction or an explicit flush.
pub struct WritePageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    pool: Arc<PoolCore>,
    data_guard: Option<DataWriteGuard>,
    dirty: bool,
}

impl WritePageGuard {
    /// Creates a new WritePageGuard from a held write latch.
    ///
    /// # Safety
    /// Same contract as [`ReadPageGuard::new`].
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        pool: Arc<PoolCore>,
        lock: RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>>,
    ) -> Self {
        let data_guard: DataWriteGuard = std::mem::transmute(lock);
        Self {
            page_id,
            frame,
            pool,
            data_guard: Some(data_guard),
            dirty: false,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a read-only view of the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns a writable view of the page data and marks the guard dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Returns whether this guard or the underlying frame is dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.frame.is_dirty()
    }

    /// Writes the page through the disk scheduler and clears the dirty bit.
    pub fn flush(&mut self) -> Result<()> {
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(&self.data_guard.as_ref().unwrap()[..]);
        self.pool.write_through(self.page_id, buf)?;
        self.frame.set_dirty(false);
        self.dirty = false;
        Ok(())
    }

    /// Releases this guard early.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.data_guard.take();
        self.pool.release_frame(&self.frame, self.dirty);
    }
}
