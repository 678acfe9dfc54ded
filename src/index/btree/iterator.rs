use std::sync::Arc;
use log::warn;
use serde::de::DeserializeOwned;

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::deserialize_node;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard};

/// Forward iterator over the leaf chain.
///
/// Holds one pinned, read-latched leaf at a time. Crossing to the next leaf
/// releases the current latch before acquiring the next one, so the iterator
/// never holds two page latches at once.
pub struct TreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    current: Option<(PageReadGuard, BTreeNode<K>)>,
    index: usize,
}

impl<K> TreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        guard: PageReadGuard,
        node: BTreeNode<K>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            current: Some((guard, node)),
            index,
        }
    }

    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            current: None,
            index: 0,
        }
    }
}

impl<K> Iterator for TreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let (_, node) = self.current.as_ref()?;

            if self.index < node.keys.len() {
                let item = (node.keys[self.index].clone(), node.values[self.index]);
                self.index += 1;
                return Some(item);
            }

            let next_leaf = node.next_leaf;
            // unlatch and unpin the exhausted leaf before touching the next
            self.current = None;
            if next_leaf == INVALID_PAGE_ID {
                return None;
            }

            let guard = match self.buffer_pool.fetch_page_read(next_leaf) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("iterator stopped at leaf {}: {}", next_leaf, e);
                    return None;
                }
            };
            let node = match deserialize_node(&guard) {
                Ok(node) => node,
                Err(e) => {
                    warn!("iterator stopped at leaf {}: {}", next_leaf, e);
                    return None;
                }
            };
            self.current = Some((guard, node));
            self.index = 0;
        }
    }
}
