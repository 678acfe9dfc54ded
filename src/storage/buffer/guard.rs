use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use log::warn;
use parking_lot::RawRwLock;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};

use crate::common::types::{Page, PageId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::BufferPoolManager;

type ReadLatch = ArcRwLockReadGuard<RawRwLock, Page>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Scoped lease on a pinned, read-latched page.
///
/// Dropping the guard releases the page latch first and then unpins the
/// frame, so the frame never becomes evictable while still latched.
pub struct PageReadGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<ReadLatch>,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_deref().expect("page latch already released")
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        drop(self.latch.take());
        if let Err(e) = self.bpm.unpin_page(self.page_id, false) {
            warn!("failed to unpin page {}: {}", self.page_id, e);
        }
    }
}

/// Scoped lease on a pinned, write-latched page.
///
/// The unpin performed on drop carries the dirty flag accumulated through
/// `mark_dirty`.
pub struct PageWriteGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    dirty: bool,
    latch: Option<WriteLatch>,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Record that the page bytes were modified under this guard
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Deref for PageWriteGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_deref().expect("page latch already released")
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Page {
        self.latch.as_deref_mut().expect("page latch already released")
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        drop(self.latch.take());
        if let Err(e) = self.bpm.unpin_page(self.page_id, self.dirty) {
            warn!("failed to unpin page {}: {}", self.page_id, e);
        }
    }
}

impl BufferPoolManager {
    /// Fetch a page and acquire its read latch
    pub fn fetch_page_read(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<PageReadGuard, BufferPoolError> {
        let page_ptr = self.fetch_page(page_id)?;
        let latch = page_ptr.read_arc();
        Ok(PageReadGuard {
            bpm: Arc::clone(self),
            page_id,
            latch: Some(latch),
        })
    }

    /// Fetch a page and acquire its write latch
    pub fn fetch_page_write(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<PageWriteGuard, BufferPoolError> {
        let page_ptr = self.fetch_page(page_id)?;
        let latch = page_ptr.write_arc();
        Ok(PageWriteGuard {
            bpm: Arc::clone(self),
            page_id,
            dirty: false,
            latch: Some(latch),
        })
    }

    /// Allocate a new page and acquire its write latch
    pub fn new_page_write(
        self: &Arc<Self>,
    ) -> Result<(PageWriteGuard, PageId), BufferPoolError> {
        let (page_ptr, page_id) = self.new_page()?;
        let latch = page_ptr.write_arc();
        Ok((
            PageWriteGuard {
                bpm: Arc::clone(self),
                page_id,
                dirty: false,
                latch: Some(latch),
            },
            page_id,
        ))
    }
}
