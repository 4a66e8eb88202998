use std::collections::VecDeque;

use crate::common::{FrameId, Timestamp};

#[derive(Debug, Default)]
struct FrameHistory {
    /// Last k access timestamps, most recent at the back
    accesses: VecDeque<Timestamp>,
    tracked: bool,
    evictable: bool,
}

impl FrameHistory {
    /// Timestamp of the k-th most recent access, `None` if there were fewer
    /// than k accesses (infinite backward distance).
    fn kth_access(&self, k: usize) -> Option<Timestamp> {
        if self.accesses.len() < k {
            None
        } else {
            Some(self.accesses[self.accesses.len() - k])
        }
    }
}

/// LRU-K replacement policy over a fixed set of cache frames.
///
/// The victim is the evictable frame with the largest backward k-distance.
/// Frames with fewer than k accesses count as infinitely distant; ties among
/// them go to the least recently first-touched frame.
///
/// The replacer does no locking of its own: the disk cache keeps it inside
/// the same mutex as its page table, so pinning a frame and hiding it from
/// eviction happen in one step.
pub struct LruKReplacer {
    k: usize,
    clock: Timestamp,
    frames: Vec<FrameHistory>,
    evictable: usize,
}

impl LruKReplacer {
    pub fn new(k: usize, num_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        frames.resize_with(num_frames, FrameHistory::default);
        Self {
            k: k.max(1),
            clock: 0,
            frames,
            evictable: 0,
        }
    }

    pub fn record_access(&mut self, frame_id: FrameId) {
        let k = self.k;
        let now = self.clock;
        let Some(history) = self.frames.get_mut(frame_id.as_usize()) else {
            return;
        };
        self.clock += 1;

        history.tracked = true;
        history.accesses.push_back(now);
        while history.accesses.len() > k {
            history.accesses.pop_front();
        }
    }

    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        let Some(history) = self.frames.get_mut(frame_id.as_usize()) else {
            return;
        };
        if !history.tracked {
            if !evictable {
                return;
            }
            history.tracked = true;
        }
        if history.evictable != evictable {
            history.evictable = evictable;
            if evictable {
                self.evictable += 1;
            } else {
                self.evictable -= 1;
            }
        }
    }

    /// Picks a victim and forgets its history.
    pub fn evict(&mut self) -> Option<FrameId> {
        if self.evictable == 0 {
            return None;
        }

        // (has k accesses, k-th access or first access) -- smaller wins
        let mut victim: Option<(usize, (bool, Timestamp))> = None;
        for (index, history) in self.frames.iter().enumerate() {
            if !history.tracked || !history.evictable {
                continue;
            }
            let rank = match history.kth_access(self.k) {
                None => (false, history.accesses.front().copied().unwrap_or(0)),
                Some(kth) => (true, kth),
            };
            if victim.map_or(true, |(_, best)| rank < best) {
                victim = Some((index, rank));
            }
        }

        let (index, _) = victim?;
        self.forget(index);
        Some(FrameId::new(index as u32))
    }

    /// Drops the history of a frame whose page left the cache.
    pub fn remove(&mut self, frame_id: FrameId) {
        if frame_id.as_usize() < self.frames.len() {
            self.forget(frame_id.as_usize());
        }
    }

    fn forget(&mut self, index: usize) {
        let history = &mut self.frames[index];
        if history.evictable {
            self.evictable -= 1;
        }
        *history = FrameHistory::default();
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.evictable
    }

    pub fn k(&self) -> usize {
        self.k
    }
}
