use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::types::{PageId, PagePtr};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::disk::DiskManager;

/// Sharded buffer pool: N instance pools over one disk manager, routing
/// page IDs by `page_id % N`.
///
/// Each instance allocates page IDs from its own arithmetic progression, so
/// an allocated ID always routes back to the allocating instance. Sharding
/// only spreads latch contention; per-instance semantics are unchanged.
pub struct ShardedBufferPool {
    instances: Vec<Arc<BufferPoolManager>>,
    next_instance: AtomicUsize,
}

impl ShardedBufferPool {
    pub fn new(
        num_instances: u32,
        pool_size_per_instance: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        assert!(num_instances > 0, "pool must have at least one instance");
        let disk_manager = Arc::new(DiskManager::new(db_path)?);

        let instances = (0..num_instances)
            .map(|i| {
                Arc::new(BufferPoolManager::with_disk_manager(
                    pool_size_per_instance,
                    num_instances,
                    i,
                    Arc::clone(&disk_manager),
                ))
            })
            .collect();

        Ok(Self {
            instances,
            next_instance: AtomicUsize::new(0),
        })
    }

    /// Total frame count across all instances
    pub fn pool_size(&self) -> usize {
        self.instances.iter().map(|i| i.pool_size()).sum()
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// The instance responsible for a page ID
    pub fn instance_for(&self, page_id: PageId) -> &Arc<BufferPoolManager> {
        &self.instances[(page_id as usize) % self.instances.len()]
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Allocate a new page from the next instance in round-robin order.
    ///
    /// The starting instance advances on every call; each instance is tried
    /// once before giving up with "no free frames".
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let n = self.instances.len();
        let start = self.next_instance.fetch_add(1, Ordering::SeqCst);

        for k in 0..n {
            match self.instances[(start + k) % n].new_page() {
                Ok(result) => return Ok(result),
                Err(BufferPoolError::NoFreeFrames) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BufferPoolError::NoFreeFrames)
    }

    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_allocated_ids_route_home() {
        let file = NamedTempFile::new().unwrap();
        let pool = ShardedBufferPool::new(4, 2, file.path()).unwrap();

        let mut page_ids = Vec::new();
        for _ in 0..6 {
            let (_, page_id) = pool.new_page().unwrap();
            pool.unpin_page(page_id, false).unwrap();
            page_ids.push(page_id);
        }

        for page_id in page_ids {
            let instance = pool.instance_for(page_id);
            assert_eq!(
                (page_id as usize) % pool.num_instances(),
                instance.instance_index() as usize
            );
            // the owning instance can fetch it back
            let _page = pool.fetch_page(page_id).unwrap();
            pool.unpin_page(page_id, false).unwrap();
        }
    }

    #[test]
    fn test_round_robin_spreads_allocations() {
        let file = NamedTempFile::new().unwrap();
        let pool = ShardedBufferPool::new(2, 2, file.path()).unwrap();

        let (_, a) = pool.new_page().unwrap();
        let (_, b) = pool.new_page().unwrap();
        pool.unpin_page(a, false).unwrap();
        pool.unpin_page(b, false).unwrap();

        assert_ne!(
            (a as usize) % pool.num_instances(),
            (b as usize) % pool.num_instances()
        );
    }
}
