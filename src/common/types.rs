use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel page ID denoting "no page"
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Page 0 is reserved for the header page recording index roots
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type, always in `[0, pool_size)`
pub type FrameId = usize;

/// Transaction ID type; larger IDs belong to younger transactions
pub type TxnId = u32;

/// Record ID: the location of a tuple, `(page, slot)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Page structure: a page-sized byte buffer tagged with its page ID
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the page contents
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}

/// Smart pointer to a page; the `RwLock` is the per-frame page latch
pub type PagePtr = Arc<RwLock<Page>>;

/// Buffer pool frame: a page buffer plus residency metadata.
///
/// Frame metadata (pin count, dirty flag, resident page id) lives behind the
/// frame's own lock, distinct from the page latch inside `page`.
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub page_id: PageId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            frame_id,
            page_id: INVALID_PAGE_ID,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
