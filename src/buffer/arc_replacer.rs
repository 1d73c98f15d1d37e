use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, PageId};

/// Which of the four ARC lists an entry currently lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcStatus {
    Mru,
    Mfu,
    MruGhost,
    MfuGhost,
}

/// Per-resident-frame bookkeeping.
#[derive(Debug)]
struct FrameStatus {
    page_id: PageId,
    evictable: bool,
    status: ArcStatus,
}

/// Per-ghost bookkeeping: the bytes are gone, only the page id remains.
#[derive(Debug)]
struct GhostStatus {
    status: ArcStatus,
}

struct ArcState {
    /// Resident frames seen once, front = most recent
    mru: VecDeque<FrameId>,
    /// Resident frames seen again, front = most recent
    mfu: VecDeque<FrameId>,
    /// Page ids evicted from `mru`, front = most recent
    mru_ghost: VecDeque<PageId>,
    /// Page ids evicted from `mfu`, front = most recent
    mfu_ghost: VecDeque<PageId>,
    /// Side table for resident entries
    alive: HashMap<FrameId, FrameStatus>,
    /// Side table for ghost entries
    ghost: HashMap<PageId, GhostStatus>,
    /// Target size of the MRU resident list ("p" in the ARC literature)
    mru_target_size: usize,
    /// Number of evictable resident frames
    num_evictable: usize,
}

/// Adaptive Replacement Cache eviction policy.
///
/// Four lists: resident MRU/MFU plus their ghost shadows, which remember
/// recently evicted page ids. A hit in a ghost list is evidence the cache
/// is tuned wrong, so the MRU target size `p` adapts toward whichever side
/// the workload keeps re-touching. Eviction victimizes MRU while it
/// overshoots `p`, MFU otherwise.
pub struct ArcReplacer {
    /// Total number of frames the replacer tracks
    capacity: usize,
    state: Mutex<ArcState>,
}

impl ArcReplacer {
    /// Creates a new ArcReplacer with all lists empty and target size 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ArcState {
                mru: VecDeque::new(),
                mfu: VecDeque::new(),
                mru_ghost: VecDeque::new(),
                mfu_ghost: VecDeque::new(),
                alive: HashMap::new(),
                ghost: HashMap::new(),
                mru_target_size: 0,
                num_evictable: 0,
            }),
        }
    }

    /// Records an access to `page_id` now cached in `frame_id`.
    /// Called by the pool on every hit, install, and resurrection.
    pub fn record_access(&self, frame_id: FrameId, page_id: PageId) {
        let mut s = self.state.lock();

        if let Some(info) = s.alive.get(&frame_id) {
            match info.status {
                ArcStatus::Mru => {
                    // Second touch: promote to the frequent side.
                    remove_from(&mut s.mru, &frame_id);
                    s.mfu.push_front(frame_id);
                    if let Some(info) = s.alive.get_mut(&frame_id) {
                        info.status = ArcStatus::Mfu;
                    }
                }
                ArcStatus::Mfu => {
                    remove_from(&mut s.mfu, &frame_id);
                    s.mfu.push_front(frame_id);
                }
                _ => unreachable!("alive entry on a ghost list"),
            }
            return;
        }

        if let Some(ghost) = s.ghost.get(&page_id) {
            let status = ghost.status;
            s.adapt_target(status, self.capacity);
            // Resurrect: the page is resident again, on the MFU side.
            match status {
                ArcStatus::MruGhost => remove_from(&mut s.mru_ghost, &page_id),
                ArcStatus::MfuGhost => remove_from(&mut s.mfu_ghost, &page_id),
                _ => unreachable!("ghost entry on a resident list"),
            }
            s.ghost.remove(&page_id);
            s.mfu.push_front(frame_id);
            s.alive.insert(
                frame_id,
                FrameStatus {
                    page_id,
                    evictable: false,
                    status: ArcStatus::Mfu,
                },
            );
            return;
        }

        // Full miss: new entry at the MRU front, trimming ghost history to
        // keep |mru| + |mru_ghost| <= capacity and the four-list total
        // <= 2 * capacity.
        if s.mru.len() + s.mru_ghost.len() == self.capacity {
            if let Some(old) = s.mru_ghost.pop_back() {
                s.ghost.remove(&old);
            }
        } else if s.total_len() == 2 * self.capacity {
            if let Some(old) = s.mfu_ghost.pop_back() {
                s.ghost.remove(&old);
            }
        }
        s.mru.push_front(frame_id);
        s.alive.insert(
            frame_id,
            FrameStatus {
                page_id,
                evictable: false,
                status: ArcStatus::Mru,
            },
        );
    }

    /// Chooses a victim frame, moves its page id onto the matching ghost
    /// list, and returns the frame id. None if nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut s = self.state.lock();

        let mru_victim = s.lru_evictable(ArcStatus::Mru);
        let mfu_victim = s.lru_evictable(ArcStatus::Mfu);

        let from_mru = match (mru_victim, mfu_victim) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(_), Some(_)) => s.mru.len() > s.mru_target_size,
        };

        let victim = if from_mru { mru_victim } else { mfu_victim }?;
        let info = s.alive.remove(&victim)?;
        debug_assert!(info.evictable);
        s.num_evictable -= 1;

        if from_mru {
            remove_from(&mut s.mru, &victim);
            s.mru_ghost.push_front(info.page_id);
            s.ghost.insert(
                info.page_id,
                GhostStatus {
                    status: ArcStatus::MruGhost,
                },
            );
        } else {
            remove_from(&mut s.mfu, &victim);
            s.mfu_ghost.push_front(info.page_id);
            s.ghost.insert(
                info.page_id,
                GhostStatus {
                    status: ArcStatus::MfuGhost,
                },
            );
        }

        Some(victim)
    }

    /// Marks a frame evictable or pinned. O(1); called on 0<->1 pin
    /// transitions under the pool latch.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut s = self.state.lock();
        if let Some(info) = s.alive.get_mut(&frame_id) {
            if info.evictable != evictable {
                info.evictable = evictable;
                if evictable {
                    s.num_evictable += 1;
                } else {
                    s.num_evictable -= 1;
                }
            }
        }
    }

    /// Forgets a resident frame entirely (page deleted from the pool).
    pub fn remove(&self, frame_id: FrameId) {
        let mut s = self.state.lock();
        let Some(info) = s.alive.remove(&frame_id) else {
            return;
        };
        if info.evictable {
            s.num_evictable -= 1;
        }
        match info.status {
            ArcStatus::Mru => remove_from(&mut s.mru, &frame_id),
            ArcStatus::Mfu => remove_from(&mut s.mfu, &frame_id),
            _ => unreachable!("alive entry on a ghost list"),
        }
    }

    /// Number of currently evictable resident frames.
    pub fn size(&self) -> usize {
        self.state.lock().num_evictable
    }

    /// Current MRU target size. Introspection for tests.
    pub fn mru_target_size(&self) -> usize {
        self.state.lock().mru_target_size
    }
}

impl ArcState {
    fn total_len(&self) -> usize {
        self.mru.len() + self.mfu.len() + self.mru_ghost.len() + self.mfu_ghost.len()
    }

    /// Ghost hit: tune `p` toward the side that was re-touched.
    /// Integer floor division; the +-1 branch covers the empty-denominator
    /// cases, and the result saturates into [0, capacity].
    fn adapt_target(&mut self, ghost_status: ArcStatus, capacity: usize) {
        match ghost_status {
            ArcStatus::MruGhost => {
                let delta = if self.mru_ghost.len() >= self.mfu_ghost.len() {
                    1
                } else {
                    self.mfu_ghost.len() / self.mru_ghost.len()
                };
                self.mru_target_size = self.mru_target_size.saturating_add(delta).min(capacity);
            }
            ArcStatus::MfuGhost => {
                let delta = if self.mfu_ghost.len() >= self.mru_ghost.len() {
                    1
                } else {
                    self.mru_ghost.len() / self.mfu_ghost.len()
                };
                self.mru_target_size = self.mru_target_size.saturating_sub(delta);
            }
            _ => unreachable!("resident status in ghost adaptation"),
        }
    }

    /// The least-recently-used evictable entry of the given resident list.
    fn lru_evictable(&self, which: ArcStatus) -> Option<FrameId> {
        let list = match which {
            ArcStatus::Mru => &self.mru,
            ArcStatus::Mfu => &self.mfu,
            _ => unreachable!(),
        };
        list.iter()
            .rev()
            .find(|fid| self.alive.get(fid).is_some_and(|i| i.evictable))
            .copied()
    }
}

fn remove_from<T: PartialEq>(list: &mut VecDeque<T>, item: &T) {
    if let Some(pos) = list.iter().position(|x| x == item) {
        list.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(id: u32) -> FrameId {
        FrameId::new(id)
    }

    fn pid(id: u32) -> PageId {
        PageId::new(id)
    }

    #[test]
    fn test_arc_new_empty() {
        let replacer = ArcReplacer::new(10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.mru_target_size(), 0);
    }

    #[test]
    fn test_arc_miss_then_evict_lru() {
        let replacer = ArcReplacer::new(3);

        for i in 0..3 {
            replacer.record_access(fid(i), pid(i));
            replacer.set_evictable(fid(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // All on MRU, never re-touched: evict in arrival order.
        assert_eq!(replacer.evict(), Some(fid(0)));
        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), Some(fid(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_arc_hit_promotes_to_mfu() {
        let replacer = ArcReplacer::new(3);

        replacer.record_access(fid(0), pid(0));
        replacer.record_access(fid(1), pid(1));
        // Re-touch frame 0: it moves to MFU and outlives frame 1.
        replacer.record_access(fid(0), pid(0));

        replacer.set_evictable(fid(0), true);
        replacer.set_evictable(fid(1), true);

        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), Some(fid(0)));
    }

    #[test]
    fn test_arc_pinned_frame_skipped() {
        let replacer = ArcReplacer::new(3);

        replacer.record_access(fid(0), pid(0));
        replacer.record_access(fid(1), pid(1));
        replacer.set_evictable(fid(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_arc_ghost_hit_raises_target() {
        let replacer = ArcReplacer::new(4);

        for i in 0..4 {
            replacer.record_access(fid(i), pid(i));
            replacer.set_evictable(fid(i), true);
        }
        // Evict 0: its page id becomes an MRU ghost.
        assert_eq!(replacer.evict(), Some(fid(0)));
        assert_eq!(replacer.mru_target_size(), 0);

        // Re-access page 0 in a fresh frame: ghost hit, p += 1, lands on MFU.
        replacer.record_access(fid(7), pid(0));
        assert_eq!(replacer.mru_target_size(), 1);
        replacer.set_evictable(fid(7), true);

        // Now MRU (1,2,3) overshoots p=1, so MRU is victimized first.
        assert_eq!(replacer.evict(), Some(fid(1)));
    }

    #[test]
    fn test_arc_mfu_ghost_hit_lowers_target() {
        let replacer = ArcReplacer::new(2);

        // Build an MFU resident entry and evict it into the MFU ghost list.
        replacer.record_access(fid(0), pid(0));
        replacer.record_access(fid(0), pid(0));
        replacer.set_evictable(fid(0), true);

        // Raise p first via an MRU ghost hit.
        replacer.record_access(fid(1), pid(1));
        replacer.set_evictable(fid(1), true);
        assert_eq!(replacer.evict(), Some(fid(1))); // mru ghost: page 1
        replacer.record_access(fid(1), pid(1)); // ghost hit: p = 1
        assert_eq!(replacer.mru_target_size(), 1);

        // Evict the MFU entry (frame 0) into the MFU ghost list.
        assert_eq!(replacer.evict(), Some(fid(0)));
        // MFU ghost hit: p drops back.
        replacer.record_access(fid(2), pid(0));
        assert_eq!(replacer.mru_target_size(), 0);
    }

    #[test]
    fn test_arc_remove() {
        let replacer = ArcReplacer::new(3);

        replacer.record_access(fid(0), pid(0));
        replacer.set_evictable(fid(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.remove(fid(0));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // Removing an unknown frame is a no-op.
        replacer.remove(fid(9));
    }

    #[test]
    fn test_arc_ghost_capacity_bounded() {
        let n = 3;
        let replacer = ArcReplacer::new(n);

        // Cycle many distinct pages through a tiny replacer; the ghost
        // lists must not grow past the ARC directory bound.
        for i in 0..(10 * n as u32) {
            replacer.record_access(fid(i), pid(i));
            replacer.set_evictable(fid(i), true);
            if replacer.size() == n {
                replacer.evict();
            }
        }

        let s = replacer.state.lock();
        assert!(s.mru.len() + s.mru_ghost.len() <= n);
        assert!(s.total_len() <= 2 * n);
        assert_eq!(s.alive.len(), s.mru.len() + s.mfu.len());
        assert_eq!(s.ghost.len(), s.mru_ghost.len() + s.mfu_ghost.len());
    }

    #[test]
    fn test_arc_toggle_evictable() {
        let replacer = ArcReplacer::new(2);

        replacer.record_access(fid(0), pid(0));
        replacer.set_evictable(fid(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(fid(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(fid(0), true);
        assert_eq!(replacer.evict(), Some(fid(0)));
    }
}
