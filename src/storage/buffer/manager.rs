use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::types::{Frame, FramePtr, FrameId, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::{LruReplacer, Replacer};
use crate::storage::disk::DiskManager;

/// Page table and free list, guarded together by the pool latch
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool manager: maps page IDs to in-memory frames, pins and unpins
/// them, and reads/writes through the disk manager.
///
/// The pool latch protects the page table, the free list, and the pin
/// counters. Disk I/O is performed inside the critical section; the target
/// workloads keep eviction off the hot path, and no frame can be claimed
/// twice because a victim leaves the replacer before its latch is released.
///
/// When used as one shard of a sharded pool, the instance allocates page IDs
/// from the arithmetic progression `{instance_index + k * num_instances}`,
/// offset past the reserved header page, so every allocated ID routes back
/// to the allocating instance.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    state: Mutex<PoolState>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
    next_page_id: AtomicU32,
    num_instances: u32,
    instance_index: u32,
}

impl BufferPoolManager {
    /// Create a standalone buffer pool over a database file
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, 1, 0, disk_manager))
    }

    /// Create one instance of a sharded pool over a shared disk manager
    pub fn with_disk_manager(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0, "pool must have at least one instance");
        assert!(instance_index < num_instances, "instance index out of range");

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
            // Page 0 is the header page; the progression starts past it
            next_page_id: AtomicU32::new(instance_index + num_instances),
            num_instances,
            instance_index,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn instance_index(&self) -> u32 {
        self.instance_index
    }

    /// Fetch a page, pinning its frame; reads from disk on a miss
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        // Hit: bump the pin count and withdraw the frame from the replacer
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let mut frame = self.frames[frame_id].write();
            frame.pin_count += 1;
            self.replacer.pin(frame_id);
            debug!(
                "fetch page {}: hit frame {}, pin_count = {}",
                page_id, frame_id, frame.pin_count
            );
            return Ok(frame.page.clone());
        }

        // Miss: claim a frame and read the page in from disk
        let frame_id = self.find_victim(&mut state)?;
        let frame = &self.frames[frame_id];
        let page_ptr = {
            let mut frame = frame.write();

            {
                let mut page = frame.page.write();
                if let Err(e) = self.disk_manager.read_page(page_id, &mut page) {
                    // The read failed; hand the frame back before bailing out
                    drop(page);
                    state.free_list.push_back(frame_id);
                    return Err(e.into());
                }
            }

            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
            frame.page.clone()
        };

        state.page_table.insert(page_id, frame_id);
        debug!("fetch page {}: miss, loaded into frame {}", page_id, frame_id);
        Ok(page_ptr)
    }

    /// Allocate a fresh page ID and pin a zeroed frame for it
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = self.find_victim(&mut state)?;
        let page_id = self.allocate_page();

        let frame = &self.frames[frame_id];
        let page_ptr = {
            let mut frame = frame.write();
            {
                let mut page = frame.page.write();
                page.reset();
                page.page_id = page_id;
            }
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = true;
            frame.page.clone()
        };

        state.page_table.insert(page_id, frame_id);
        debug!("new page {} in frame {}", page_id, frame_id);
        Ok((page_ptr, page_id))
    }

    /// Unpin a page, optionally marking it dirty.
    ///
    /// A `dirty = false` unpin never clears a previously set dirty flag.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let mut frame = self.frames[frame_id].write();
        if frame.pin_count == 0 {
            warn!("unpin page {}: pin count already 0", page_id);
            return Err(BufferPoolError::PageNotPinned(page_id));
        }

        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        Ok(())
    }

    /// Write a page's bytes through to disk and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let mut frame = self.frames[frame_id].write();
        {
            let page = frame.page.read();
            self.disk_manager.write_page(&page)?;
        }
        frame.is_dirty = false;
        Ok(())
    }

    /// Flush every resident dirty page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        for (&page_id, &frame_id) in state.page_table.iter() {
            let mut frame = self.frames[frame_id].write();
            if frame.is_dirty {
                let page = frame.page.read();
                self.disk_manager.write_page(&page)?;
                drop(page);
                frame.is_dirty = false;
            }
            debug!("flush_all: page {} done", page_id);
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk.
    ///
    /// Fails while the page is pinned; succeeds trivially if not resident.
    /// Dirty content is flushed before the frame is freed.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => {
                self.disk_manager.deallocate_page(page_id);
                return Ok(());
            }
        };

        {
            let mut frame = self.frames[frame_id].write();
            if frame.pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }

            if frame.is_dirty {
                let page = frame.page.read();
                self.disk_manager.write_page(&page)?;
            }

            let mut page = frame.page.write();
            page.reset();
            page.page_id = INVALID_PAGE_ID;
            drop(page);

            frame.page_id = INVALID_PAGE_ID;
            frame.is_dirty = false;
            frame.pin_count = 0;
        }

        state.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        state.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        debug!("delete page {}: frame {} freed", page_id, frame_id);
        Ok(())
    }

    /// Number of frames currently evictable (test hook)
    pub fn replacer_size(&self) -> usize {
        self.replacer.size()
    }

    /// Claim a frame: free list first, else evict a replacer victim.
    ///
    /// The returned frame is unmapped, clean, and owned by the caller.
    fn find_victim(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match self.replacer.victim() {
            Some(id) => id,
            None => return Err(BufferPoolError::NoFreeFrames),
        };

        let mut frame = self.frames[frame_id].write();
        debug_assert_eq!(frame.pin_count, 0, "victim frame must be unpinned");

        if frame.is_dirty {
            let page = frame.page.read();
            self.disk_manager.write_page(&page)?;
            drop(page);
            frame.is_dirty = false;
        }
        if frame.page_id != INVALID_PAGE_ID {
            debug!("evict page {} from frame {}", frame.page_id, frame_id);
            state.page_table.remove(&frame.page_id);
            frame.page_id = INVALID_PAGE_ID;
        }

        Ok(frame_id)
    }

    /// Next page ID in this instance's arithmetic progression
    fn allocate_page(&self) -> PageId {
        let page_id = self.next_page_id.fetch_add(self.num_instances, Ordering::SeqCst);
        debug_assert_eq!(page_id % self.num_instances, self.instance_index);
        page_id
    }
}
