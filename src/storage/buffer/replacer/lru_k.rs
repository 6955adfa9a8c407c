use std::collections::{HashMap, VecDeque};

use crate::common::types::FrameId;

/// Per-frame access record: the last K access timestamps plus the
/// evictability flag.
#[derive(Debug)]
struct LruKNode {
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        }
    }

    /// Fewer than K recorded accesses means the backward K-distance is +inf.
    fn has_infinite_distance(&self, k: usize) -> bool {
        self.history.len() < k
    }

    /// With the history truncated to the last K entries, the front is the
    /// K-th most recent access of a complete record, and the first access
    /// ever of an incomplete one.
    fn front_timestamp(&self) -> u64 {
        *self.history.front().expect("access record is never empty")
    }
}

/// LRU-K replacement policy: evicts the frame whose K-th most recent access
/// is furthest in the past, treating frames with fewer than K accesses as
/// infinitely distant (and ordering those by their first access).
#[derive(Debug)]
pub struct LruKReplacer {
    node_store: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    evictable_count: usize,
    num_frames: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k >= 1");
        Self {
            node_store: HashMap::new(),
            current_timestamp: 0,
            evictable_count: 0,
            num_frames,
            k,
        }
    }

    /// Record an access to a frame at the current timestamp, tracking the
    /// frame if it is new. New frames start out non-evictable.
    pub fn record_access(&mut self, frame_id: FrameId) {
        assert!(frame_id < self.num_frames, "frame id out of range");
        self.current_timestamp += 1;
        let k = self.k;
        let node = self
            .node_store
            .entry(frame_id)
            .or_insert_with(|| LruKNode::new(k));
        node.history.push_back(self.current_timestamp);
        if node.history.len() > k {
            node.history.pop_front();
        }
    }

    /// Toggle a frame's evictability. Untracked frames are ignored.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        assert!(frame_id < self.num_frames, "frame id out of range");
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            if node.is_evictable != evictable {
                node.is_evictable = evictable;
                if evictable {
                    self.evictable_count += 1;
                } else {
                    self.evictable_count -= 1;
                }
            }
        }
    }

    /// Evict the evictable frame with the largest backward K-distance and
    /// drop its access history. Frames with fewer than K accesses win over
    /// frames with full histories; ties fall to the earliest front
    /// timestamp.
    pub fn evict(&mut self) -> Option<FrameId> {
        let victim = self
            .node_store
            .iter()
            .filter(|(_, node)| node.is_evictable)
            .min_by_key(|(frame_id, node)| {
                (
                    !node.has_infinite_distance(self.k),
                    node.front_timestamp(),
                    **frame_id,
                )
            })
            .map(|(frame_id, _)| *frame_id)?;
        self.node_store.remove(&victim);
        self.evictable_count -= 1;
        log::debug!("lru-k evicted frame {}", victim);
        Some(victim)
    }

    /// Stop tracking an evictable frame. Calling this on a tracked frame
    /// that is not evictable is a programmer error.
    pub fn remove(&mut self, frame_id: FrameId) {
        match self.node_store.get(&frame_id) {
            Some(node) if !node.is_evictable => {
                panic!("LruKReplacer::remove called on a non-evictable frame")
            }
            Some(_) => {
                self.node_store.remove(&frame_id);
                self.evictable_count -= 1;
            }
            None => {}
        }
    }

    /// Number of evictable frames currently tracked.
    pub fn size(&self) -> usize {
        self.evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_k_distance_ordering() {
        // K = 2, access sequence f0, f1, f2, f1, f0. Frame 2 has a single
        // access (infinite distance) and goes first; frames 0 and 1 are
        // complete and leave in backward-K-distance order.
        let mut replacer = LruKReplacer::new(8, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(1);
        replacer.record_access(0);
        for f in 0..3 {
            replacer.set_evictable(f, true);
        }
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_incomplete_histories_leave_first() {
        let mut replacer = LruKReplacer::new(8, 3);
        // Frame 1 gets a full history of three accesses, frame 2 only one.
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_incomplete_ties_break_on_first_access() {
        let mut replacer = LruKReplacer::new(8, 3);
        // t1..t9: 1,2,3,4,1,2,3,1,2; frames 3 and 4 stay incomplete.
        for f in [1, 2, 3, 4, 1, 2, 3, 1, 2] {
            replacer.record_access(f);
        }
        for f in 1..=4 {
            replacer.set_evictable(f, true);
        }
        // Frame 3 (first access t3) precedes frame 4 (first access t4).
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        // Complete records: frame 1 (t1, t5, t8) is K-distance-older than
        // frame 2 (t2, t6, t9).
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn test_only_evictable_frames_returned() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(2);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(2, true);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_pin_unpin_cycle() {
        let mut replacer = LruKReplacer::new(8, 2);
        for f in 0..4 {
            replacer.record_access(f);
            replacer.set_evictable(f, true);
        }
        assert_eq!(replacer.size(), 4);

        replacer.set_evictable(1, false);
        replacer.set_evictable(3, false);
        assert_eq!(replacer.size(), 2);

        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(1, true);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(3));
    }

    #[test]
    fn test_remove_untracked_is_noop() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.remove(3);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_remove_pinned_frame_panics() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(1);
        replacer.remove(1);
    }

    #[test]
    fn test_remove_drops_history() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        replacer.remove(0);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
    }
}
