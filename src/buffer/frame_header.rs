use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// One slot of the buffer pool: the page bytes behind a rw-latch plus the
/// metadata the pool keeps per frame.
///
/// Every metadata transition (page id, pin count, dirty bit) is made under
/// the pool latch, which is what keeps "evictable iff pin count is zero"
/// in step with the replacer; the atomics only exist so introspection can
/// read them without taking that latch. There is consequently no need for
/// compare-and-swap loops here, and the rw-latch over the bytes is taken
/// by page guards, never by the pool itself (apart from snapshotting
/// unpinned victims, where it is uncontended).
pub struct FrameHeader {
    /// Stable index of this frame within the pool
    frame_id: FrameId,
    /// Raw id of the cached page; `INVALID_PAGE_ID` while free
    page_id: AtomicU32,
    /// Number of live guards referencing this frame
    pin_count: AtomicU32,
    /// Set when the cached page has unwritten modifications
    is_dirty: AtomicBool,
    /// The page bytes (pub(crate) so guards can latch them)
    pub(crate) data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.as_u32()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.as_u32(), Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Adds a guard's pin; returns the new count.
    pub fn bump_pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a guard's pin; returns the new count. A release with no pins
    /// outstanding is an accounting bug.
    pub fn release_pin(&self) -> u32 {
        let previous = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpinned frame released");
        previous - 1
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Copies the frame's bytes into an owned buffer, for write-back of
    /// frames with no live write guard.
    pub fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        let guard = self.data.read();
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(&**guard);
        buf
    }

    /// Returns the frame to its free state: no page, no pins, clean,
    /// zeroed bytes.
    pub fn reset(&self) {
        self.page_id
            .store(INVALID_PAGE_ID.as_u32(), Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_frame_is_free() {
        let frame = FrameHeader::new(FrameId::new(3));
        assert_eq!(frame.frame_id(), FrameId::new(3));
        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(frame.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pin_accounting() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert_eq!(frame.bump_pin(), 1);
        assert_eq!(frame.bump_pin(), 2);
        assert_eq!(frame.release_pin(), 1);
        assert_eq!(frame.release_pin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_snapshot_sees_latched_writes() {
        let frame = FrameHeader::new(FrameId::new(0));

        {
            let mut bytes = frame.data.write();
            bytes[0] = 42;
            bytes[PAGE_SIZE - 1] = 7;
        }

        let snap = frame.snapshot();
        assert_eq!(snap[0], 42);
        assert_eq!(snap[PAGE_SIZE - 1], 7);
    }

    #[test]
    fn test_reset_clears_everything() {
        let frame = FrameHeader::new(FrameId::new(0));

        frame.set_page_id(PageId::new(5));
        frame.bump_pin();
        frame.set_dirty(true);
        frame.data.write().fill(0xCC);

        frame.reset();

        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(frame.snapshot().iter().all(|&b| b == 0));
    }
}
