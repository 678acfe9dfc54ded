use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::{RawRwLock, RwLock};
use parking_lot::lock_api::ArcRwLockWriteGuard;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::codec::{default_btree_order, deserialize_node, serialize_node};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use crate::storage::page::HeaderPage;

type RootLatchGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// Latches accumulated by one mutating traversal.
///
/// The stack holds write guards from the root down to the current node's
/// parent; they are all released at once when the current node is proven
/// safe for the operation. The tree-level root latch is treated as the
/// topmost rung of the same ladder.
struct Context<K> {
    root_guard: Option<RootLatchGuard>,
    stack: Vec<(PageWriteGuard, BTreeNode<K>)>,
}

impl<K> Context<K> {
    fn new() -> Self {
        Self {
            root_guard: None,
            stack: Vec::new(),
        }
    }

    /// Release every ancestor latch; the ancestors were not modified, so the
    /// guards unpin clean.
    fn release_ancestors(&mut self) {
        self.stack.clear();
        self.root_guard = None;
    }
}

/// Concurrent B+Tree index over buffer-pool pages.
///
/// Keys are unique and ordered by `K: Ord`. Readers descend with read-latch
/// crabbing; insert and remove descend with write-latch crabbing, releasing
/// ancestor latches as soon as the current node cannot split or underflow.
/// The current root page ID is cached under a small tree latch and persisted
/// in the header page on every root change.
pub struct BPlusTree<K> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_latch: Arc<RwLock<PageId>>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _phantom: PhantomData<K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open (or register) the index named `name`, loading its root page ID
    /// from the header page.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        debug_assert!(leaf_max_size >= 2, "leaf fan-out too small");
        debug_assert!(internal_max_size >= 3, "internal fan-out too small");
        let index_name = name.into();

        let mut header_guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::from_page(&header_guard);
        let root_page_id = match header.get_record(&index_name) {
            Some(id) => id,
            None => {
                header.insert_record(&index_name, INVALID_PAGE_ID);
                header.write_to(&mut header_guard);
                header_guard.mark_dirty();
                INVALID_PAGE_ID
            }
        };
        drop(header_guard);

        Ok(Self {
            index_name,
            buffer_pool,
            root_latch: Arc::new(RwLock::new(root_page_id)),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Open the index with the fan-out a page can hold for this key type
    pub fn with_default_order(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Result<Self, BTreeError> {
        let order = default_btree_order::<K>();
        Self::new(name, buffer_pool, order, order)
    }

    pub fn is_empty(&self) -> bool {
        *self.root_latch.read() == INVALID_PAGE_ID
    }

    /// Point lookup
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let guard = match self.find_leaf_read(Some(key))? {
            Some(guard) => guard,
            None => return Ok(None),
        };
        let node: BTreeNode<K> = deserialize_node(&guard)?;
        Ok(node.lookup(key))
    }

    /// Insert a key/rid pair; duplicate keys return `false` and change
    /// nothing.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = Context::new();
        let root_guard = self.root_latch.write_arc();
        if *root_guard == INVALID_PAGE_ID {
            self.start_new_tree(root_guard, key, rid)?;
            return Ok(true);
        }
        let root_id = *root_guard;
        ctx.root_guard = Some(root_guard);

        let mut guard = self.buffer_pool.fetch_page_write(root_id)?;
        let mut node: BTreeNode<K> = deserialize_node(&guard)?;
        loop {
            // safe for insert: this node absorbs one more entry without
            // splitting, so nothing above it can change
            let safe = if node.is_leaf {
                node.size() + 1 < self.leaf_max_size
            } else {
                node.size() + 1 <= self.internal_max_size
            };
            if safe {
                ctx.release_ancestors();
            }
            if node.is_leaf {
                break;
            }
            let child_id = node.children[node.child_index(&key)];
            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let child_node = deserialize_node(&child_guard)?;
            ctx.stack.push((guard, node));
            guard = child_guard;
            node = child_node;
        }

        if !node.insert_into_leaf(key, rid) {
            debug!("insert: duplicate key in leaf {}", node.page_id);
            return Ok(false);
        }

        if node.size() >= self.leaf_max_size {
            self.split_leaf(&mut ctx, guard, node)?;
        } else {
            self.write_node(&mut guard, &node)?;
        }
        Ok(true)
    }

    /// Remove a key; absent keys are a no-op
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = Context::new();
        let root_guard = self.root_latch.write_arc();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(());
        }
        let root_id = *root_guard;
        ctx.root_guard = Some(root_guard);

        let mut guard = self.buffer_pool.fetch_page_write(root_id)?;
        let mut node: BTreeNode<K> = deserialize_node(&guard)?;
        loop {
            // safe for delete: losing one entry keeps this node (or the
            // root's shape) legal
            let safe = if node.is_root() {
                if node.is_leaf {
                    node.size() > 1
                } else {
                    node.size() > 2
                }
            } else {
                node.size() > node.min_size()
            };
            if safe {
                ctx.release_ancestors();
            }
            if node.is_leaf {
                break;
            }
            let child_id = node.children[node.child_index(key)];
            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let child_node = deserialize_node(&child_guard)?;
            ctx.stack.push((guard, node));
            guard = child_guard;
            node = child_node;
        }

        if !node.remove_from_leaf(key) {
            debug!("remove: key not found in leaf {}", node.page_id);
            return Ok(());
        }
        self.coalesce_or_redistribute(&mut ctx, guard, node)
    }

    /// Iterator over all pairs in key order
    pub fn iter(&self) -> Result<TreeIterator<K>, BTreeError> {
        match self.find_leaf_read(None)? {
            None => Ok(TreeIterator::empty(Arc::clone(&self.buffer_pool))),
            Some(guard) => {
                let node = deserialize_node(&guard)?;
                Ok(TreeIterator::new(
                    Arc::clone(&self.buffer_pool),
                    guard,
                    node,
                    0,
                ))
            }
        }
    }

    /// Iterator positioned at the first key greater than or equal to `key`
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(TreeIterator::empty(Arc::clone(&self.buffer_pool))),
            Some(guard) => {
                let node: BTreeNode<K> = deserialize_node(&guard)?;
                let index = node.key_index(key);
                Ok(TreeIterator::new(
                    Arc::clone(&self.buffer_pool),
                    guard,
                    node,
                    index,
                ))
            }
        }
    }

    /// Page ID of the leaf that holds (or would hold) `key`; with
    /// `left_most` the first leaf in the chain. Test hook.
    pub fn find_leaf_page(&self, key: &K, left_most: bool) -> Result<Option<PageId>, BTreeError> {
        let key = if left_most { None } else { Some(key) };
        Ok(self.find_leaf_read(key)?.map(|guard| guard.page_id()))
    }

    /// Current root page ID (test hook)
    pub fn root_page_id(&self) -> PageId {
        *self.root_latch.read()
    }

    /// Descend to a leaf with read-latch crabbing.
    ///
    /// `key = None` follows the leftmost child at every level.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<PageReadGuard>, BTreeError> {
        let mut guard = loop {
            let root_id = *self.root_latch.read();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let guard = self.buffer_pool.fetch_page_read(root_id)?;
            // the root may have moved between reading the ID and latching
            // the page; re-validate and retry if it did
            if *self.root_latch.read() == root_id {
                break guard;
            }
        };

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            if node.is_leaf {
                return Ok(Some(guard));
            }
            let child_id = match key {
                Some(key) => node.children[node.child_index(key)],
                None => node.children[0],
            };
            // crab: latch the child before releasing the parent
            let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    fn start_new_tree(
        &self,
        mut root_guard: RootLatchGuard,
        key: K,
        rid: Rid,
    ) -> Result<(), BTreeError> {
        let (mut guard, page_id) = self.buffer_pool.new_page_write()?;
        let mut leaf = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert_into_leaf(key, rid);
        self.write_node(&mut guard, &leaf)?;

        *root_guard = page_id;
        self.update_root_page_id(page_id)?;
        debug!("start new tree, root page = {}", page_id);
        Ok(())
    }

    fn split_leaf(
        &self,
        ctx: &mut Context<K>,
        guard: PageWriteGuard,
        mut node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        let (new_guard, new_page_id) = self.buffer_pool.new_page_write()?;
        let right = node.split_leaf(new_page_id);
        let popup = right.keys[0].clone();
        debug!("split leaf {} -> new leaf {}", node.page_id, new_page_id);
        self.insert_into_parent(ctx, guard, node, popup, new_guard, right)
    }

    fn split_internal(
        &self,
        ctx: &mut Context<K>,
        guard: PageWriteGuard,
        mut node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        let (new_guard, new_page_id) = self.buffer_pool.new_page_write()?;
        let (right, popup) = node.split_internal(new_page_id);
        // the moved subtrees now hang off the new page
        for &child_id in &right.children {
            self.reparent(child_id, new_page_id)?;
        }
        debug!("split internal {} -> new internal {}", node.page_id, new_page_id);
        self.insert_into_parent(ctx, guard, node, popup, new_guard, right)
    }

    /// Hook a split's popup key into the parent, growing a new root if the
    /// split reached the top.
    fn insert_into_parent(
        &self,
        ctx: &mut Context<K>,
        mut left_guard: PageWriteGuard,
        mut left_node: BTreeNode<K>,
        popup: K,
        mut right_guard: PageWriteGuard,
        mut right_node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        if left_node.is_root() {
            let (mut new_root_guard, new_root_id) = self.buffer_pool.new_page_write()?;
            let mut new_root =
                BTreeNode::new_internal(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
            new_root.populate_new_root(left_node.page_id, popup, right_node.page_id);
            left_node.parent_page_id = new_root_id;
            right_node.parent_page_id = new_root_id;

            self.write_node(&mut left_guard, &left_node)?;
            self.write_node(&mut right_guard, &right_node)?;
            self.write_node(&mut new_root_guard, &new_root)?;
            drop(left_guard);
            drop(right_guard);
            drop(new_root_guard);

            let mut root_latch = ctx
                .root_guard
                .take()
                .expect("root latch is held while the root splits");
            *root_latch = new_root_id;
            self.update_root_page_id(new_root_id)?;
            debug!("grew new root {}", new_root_id);
            return Ok(());
        }

        let (mut parent_guard, mut parent_node) = ctx
            .stack
            .pop()
            .expect("parent latched on the descent path");
        parent_node.insert_child_after(left_node.page_id, popup, right_node.page_id);

        self.write_node(&mut left_guard, &left_node)?;
        self.write_node(&mut right_guard, &right_node)?;
        drop(left_guard);
        drop(right_guard);

        if parent_node.size() > self.internal_max_size {
            self.split_internal(ctx, parent_guard, parent_node)
        } else {
            self.write_node(&mut parent_guard, &parent_node)
        }
    }

    /// Restore a node that fell below its minimum, recursing up as parents
    /// lose separators.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut Context<K>,
        mut guard: PageWriteGuard,
        mut node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        if node.is_root() {
            return self.adjust_root(ctx, guard, node);
        }
        if node.size() >= node.min_size() {
            return self.write_node(&mut guard, &node);
        }

        let (mut parent_guard, mut parent_node) = ctx
            .stack
            .pop()
            .expect("parent latched on the descent path");
        let idx = parent_node
            .child_index_of(node.page_id)
            .ok_or(BTreeError::InvalidPageFormat)?;

        // prefer the right sibling (for leaves that is the next_leaf with
        // the same parent), else fall back to the left
        let use_right = idx + 1 < parent_node.size();
        let sibling_idx = if use_right { idx + 1 } else { idx - 1 };
        let sibling_id = parent_node.children[sibling_idx];
        let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;
        let mut sibling_node: BTreeNode<K> = deserialize_node(&sibling_guard)?;

        let combined = node.size() + sibling_node.size();
        let fits_in_one = if node.is_leaf {
            combined < self.leaf_max_size
        } else {
            combined <= self.internal_max_size
        };

        if !fits_in_one {
            // redistribute one boundary entry and patch the separator
            if use_right {
                let separator = parent_node.keys[idx].clone();
                let new_separator = node.steal_from_right(&mut sibling_node, separator);
                parent_node.keys[idx] = new_separator;
                if !node.is_leaf {
                    let moved = node.children[node.children.len() - 1];
                    self.reparent(moved, node.page_id)?;
                }
            } else {
                let separator = parent_node.keys[idx - 1].clone();
                let new_separator = node.steal_from_left(&mut sibling_node, separator);
                parent_node.keys[idx - 1] = new_separator;
                if !node.is_leaf {
                    let moved = node.children[0];
                    self.reparent(moved, node.page_id)?;
                }
            }
            debug!("redistributed between {} and {}", node.page_id, sibling_id);
            self.write_node(&mut guard, &node)?;
            self.write_node(&mut sibling_guard, &sibling_node)?;
            return self.write_node(&mut parent_guard, &parent_node);
        }

        // coalesce: merge the right page into the left page
        let (mut left_guard, mut left_node, right_guard, right_node, right_idx) = if use_right {
            (guard, node, sibling_guard, sibling_node, idx + 1)
        } else {
            (sibling_guard, sibling_node, guard, node, idx)
        };
        let separator = parent_node.keys[right_idx - 1].clone();

        if !left_node.is_leaf {
            for &child_id in &right_node.children {
                self.reparent(child_id, left_node.page_id)?;
            }
        }
        left_node.merge_from_right(right_node, separator);
        parent_node.remove_child_at(right_idx);
        debug!("coalesced page into {}", left_node.page_id);

        self.write_node(&mut left_guard, &left_node)?;
        drop(left_guard);

        let right_page_id = right_guard.page_id();
        drop(right_guard);
        if let Err(e) = self.buffer_pool.delete_page(right_page_id) {
            debug!("delete of merged page {} deferred: {}", right_page_id, e);
        }

        self.coalesce_or_redistribute(ctx, parent_guard, parent_node)
    }

    /// Apply the two root special cases after deletion
    fn adjust_root(
        &self,
        ctx: &mut Context<K>,
        mut guard: PageWriteGuard,
        node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        if !node.is_leaf && node.size() == 1 {
            // the root kept a single child; promote it
            let child_id = node.children[0];
            self.reparent(child_id, INVALID_PAGE_ID)?;

            let mut root_latch = ctx
                .root_guard
                .take()
                .expect("root latch is held while the root collapses");
            *root_latch = child_id;
            self.update_root_page_id(child_id)?;
            drop(root_latch);

            let old_root_id = guard.page_id();
            drop(guard);
            if let Err(e) = self.buffer_pool.delete_page(old_root_id) {
                debug!("delete of old root {} deferred: {}", old_root_id, e);
            }
            debug!("root collapsed, new root = {}", child_id);
            return Ok(());
        }

        if node.is_leaf && node.size() == 0 {
            // the last pair is gone; the tree is empty again
            let mut root_latch = ctx
                .root_guard
                .take()
                .expect("root latch is held while the root empties");
            *root_latch = INVALID_PAGE_ID;
            self.update_root_page_id(INVALID_PAGE_ID)?;
            drop(root_latch);

            let old_root_id = guard.page_id();
            drop(guard);
            if let Err(e) = self.buffer_pool.delete_page(old_root_id) {
                debug!("delete of old root {} deferred: {}", old_root_id, e);
            }
            debug!("tree emptied");
            return Ok(());
        }

        self.write_node(&mut guard, &node)
    }

    /// Point a child page at a new parent
    fn reparent(&self, page_id: PageId, parent_page_id: PageId) -> Result<(), BTreeError> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        let mut child: BTreeNode<K> = deserialize_node(&guard)?;
        child.parent_page_id = parent_page_id;
        self.write_node(&mut guard, &child)
    }

    /// Persist the root page ID for this index in the header page
    fn update_root_page_id(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::from_page(&guard);
        if !header.update_record(&self.index_name, root_page_id) {
            header.insert_record(&self.index_name, root_page_id);
        }
        header.write_to(&mut guard);
        guard.mark_dirty();
        Ok(())
    }

    fn write_node(
        &self,
        guard: &mut PageWriteGuard,
        node: &BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        serialize_node(node, guard)?;
        guard.mark_dirty();
        Ok(())
    }
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + Debug + 'static,
{
    /// Dump the tree as GraphViz DOT; debugging hook
    pub fn to_graphviz(&self) -> Result<String, BTreeError> {
        let mut out = String::from("digraph btree {\n");
        let root_id = *self.root_latch.read();
        if root_id != INVALID_PAGE_ID {
            self.dump_node(root_id, &mut out)?;
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn dump_node(&self, page_id: PageId, out: &mut String) -> Result<(), BTreeError> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let node: BTreeNode<K> = deserialize_node(&guard)?;
        drop(guard);

        if node.is_leaf {
            out.push_str(&format!(
                "  LEAF_{} [shape=box color=green label=\"{:?}\"];\n",
                page_id, node.keys
            ));
            if node.next_leaf != INVALID_PAGE_ID {
                out.push_str(&format!(
                    "  LEAF_{} -> LEAF_{} [style=dashed];\n",
                    page_id, node.next_leaf
                ));
            }
        } else {
            out.push_str(&format!(
                "  INT_{} [shape=box label=\"{:?}\"];\n",
                page_id, node.keys
            ));
            for &child_id in &node.children {
                self.dump_node(child_id, out)?;
                let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
                let child: BTreeNode<K> = deserialize_node(&child_guard)?;
                let prefix = if child.is_leaf { "LEAF" } else { "INT" };
                out.push_str(&format!("  INT_{} -> {}_{};\n", page_id, prefix, child_id));
            }
        }
        Ok(())
    }
}

impl BPlusTree<i64> {
    /// Bulk-load integer keys from a whitespace-separated file; test hook
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<(), BTreeError> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            if let Ok(key) = token.parse::<i64>() {
                self.insert(key, Rid::new(0, key as u32))?;
            }
        }
        Ok(())
    }

    /// Bulk-remove integer keys from a whitespace-separated file; test hook
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<(), BTreeError> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            if let Ok(key) = token.parse::<i64>() {
                self.remove(&key)?;
            }
        }
        Ok(())
    }
}
