pub mod lru;

pub use lru::LruReplacer;

use crate::common::types::FrameId;

/// Replacement policy over unpinned buffer pool frames.
///
/// All operations are internally serialized by the implementation.
pub trait Replacer: Send + Sync {
    /// Evict and return the frame least eligible to stay, or `None` if no
    /// frame is currently evictable
    fn victim(&self) -> Option<FrameId>;

    /// Remove a frame from eviction eligibility (no-op if absent)
    fn pin(&self, frame_id: FrameId);

    /// Mark a frame evictable at the most-recent end (no-op if present)
    fn unpin(&self, frame_id: FrameId);

    /// Number of frames currently eligible for eviction
    fn size(&self) -> usize;
}
