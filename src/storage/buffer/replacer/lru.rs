use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;
use crate::storage::buffer::replacer::Replacer;

/// LRU page replacement policy.
///
/// Eligible frames are kept in a hash-linked list ordered by unpin recency:
/// the front is the least-recently unpinned frame, so every operation is
/// O(1) amortized. The set never grows past the pool size.
pub struct LruReplacer {
    capacity: usize,
    inner: Mutex<LinkedHashMap<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            capacity: pool_size,
            inner: Mutex::new(LinkedHashMap::with_capacity(pool_size)),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.inner.lock().pop_front().map(|(frame_id, _)| frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        self.inner.lock().remove(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut list = self.inner.lock();
        if list.contains_key(&frame_id) {
            return;
        }
        if list.len() >= self.capacity {
            return;
        }
        list.insert(frame_id, ());
    }

    fn size(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_is_least_recently_unpinned() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        // pinning an absent frame is a no-op
        replacer.pin(5);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_unpin_is_idempotent() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(4);
        replacer.unpin(4);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.victim(), Some(4));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_capacity_bound() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(2);
        // full: further unpins are dropped
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }
}
