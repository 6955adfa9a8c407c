use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, PageReadGuard, PageWriteGuard, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header::RootRegistry;
use crate::index::btree::iterator::BTreeIterator;
use crate::index::btree::node::{BTreeNode, WriteOp};
use crate::index::btree::serialization::{read_node, set_parent_page_id, write_node};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::Transaction;

type RootGuard<'a> = RwLockWriteGuard<'a, PageId>;

enum RootChange {
    Created,
    Moved,
    Deleted,
}

enum ReadTarget<'k, K> {
    Leftmost,
    Key(&'k K),
}

impl<K> Clone for ReadTarget<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for ReadTarget<'_, K> {}

/// Concurrent B+-tree index with unique keys, built on the buffer pool.
///
/// Readers latch-crab top-down with read latches, holding at most a parent
/// and child pair. Writers hold a chain of write latches from the deepest
/// unsafe ancestor to the leaf; the chain lives in the transaction's page
/// set and is released in acquisition order once the operation completes.
/// The `root_page_id` lock is taken before any page latch and released as
/// soon as the root can no longer be affected.
pub struct BTreeIndex<K> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    registry: RootRegistry,
    _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf nodes need at least two entries");
        assert!(internal_max_size >= 3, "internal nodes need at least three children");
        Self {
            index_name: index_name.into(),
            buffer_pool,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            leaf_max_size,
            internal_max_size,
            registry: RootRegistry::new(),
            _phantom: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let Some((guard, _)) = self.find_leaf_read(ReadTarget::Key(key))? else {
            return Ok(None);
        };
        let node: BTreeNode<K> = read_node(&guard)?;
        let result = node.leaf_find(key);
        let page_id = node.page_id;
        drop(guard);
        self.buffer_pool.unpin_page(page_id, false);
        Ok(result)
    }

    /// Insert a unique key. Returns `false` (leaving the tree untouched)
    /// when the key is already present.
    pub fn insert(&self, key: K, value: Rid, txn: &Transaction) -> Result<bool, BTreeError> {
        let mut root_guard = Some(self.root_page_id.write());
        let result = self.insert_inner(key, value, txn, &mut root_guard);
        self.release_pages(txn, &mut root_guard)?;
        result
    }

    /// Remove a key; removing an absent key is a no-op.
    pub fn remove(&self, key: &K, txn: &Transaction) -> Result<(), BTreeError> {
        let mut root_guard = Some(self.root_page_id.write());
        let result = if **root_guard.as_ref().expect("root latch held") == INVALID_PAGE_ID {
            Ok(())
        } else {
            self.remove_inner(key, txn, &mut root_guard)
        };
        self.release_pages(txn, &mut root_guard)?;
        result
    }

    /// Iterate the whole tree in ascending key order.
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        match self.find_leaf_read(ReadTarget::Leftmost)? {
            None => Ok(BTreeIterator::end(self.buffer_pool.clone())),
            Some((guard, _)) => {
                let node: BTreeNode<K> = read_node(&guard)?;
                Ok(BTreeIterator::new(self.buffer_pool.clone(), guard, node, 0))
            }
        }
    }

    /// Iterate starting at the first key >= `key`. Positions past the end
    /// of the containing leaf yield the end iterator.
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        match self.find_leaf_read(ReadTarget::Key(key))? {
            None => Ok(BTreeIterator::end(self.buffer_pool.clone())),
            Some((guard, _)) => {
                let node: BTreeNode<K> = read_node(&guard)?;
                let position = node.leaf_lower_bound(key);
                if position == node.size() {
                    let page_id = node.page_id;
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false);
                    return Ok(BTreeIterator::end(self.buffer_pool.clone()));
                }
                Ok(BTreeIterator::new(
                    self.buffer_pool.clone(),
                    guard,
                    node,
                    position,
                ))
            }
        }
    }

    /// Number of levels from the root to the leaves (0 for an empty tree).
    pub fn height(&self) -> Result<usize, BTreeError> {
        match self.find_leaf_read(ReadTarget::Leftmost)? {
            None => Ok(0),
            Some((guard, depth)) => {
                let page_id = guard.page_id;
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false);
                Ok(depth)
            }
        }
    }

    fn insert_inner(
        &self,
        key: K,
        value: Rid,
        txn: &Transaction,
        root_guard: &mut Option<RootGuard<'_>>,
    ) -> Result<bool, BTreeError> {
        if **root_guard.as_ref().expect("root latch held") == INVALID_PAGE_ID {
            // Start a new tree whose root is a single leaf.
            let (page, page_id) = self.buffer_pool.new_page()?;
            let mut guard = page.write_arc();
            let mut leaf = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.leaf_insert(key, value);
            write_node(&mut guard, &leaf)?;
            txn.add_to_page_set(guard);
            **root_guard.as_mut().expect("root latch held") = page_id;
            self.register_root(RootChange::Created, page_id)?;
            log::debug!("index {} rooted at page {}", self.index_name, page_id);
            return Ok(true);
        }

        self.find_leaf_write(&key, WriteOp::Insert, txn, root_guard)?;

        let mut pages = txn.page_set();
        let leaf_index = pages.len() - 1;
        let mut leaf: BTreeNode<K> = read_node(&pages[leaf_index])?;
        if !leaf.leaf_insert(key, value) {
            return Ok(false);
        }
        if leaf.size() <= self.leaf_max_size {
            write_node(&mut pages[leaf_index], &leaf)?;
            return Ok(true);
        }

        let (new_page, new_page_id) = self.buffer_pool.new_page()?;
        let mut new_guard = new_page.write_arc();
        let (separator, right) = leaf.split(new_page_id);
        write_node(&mut pages[leaf_index], &leaf)?;
        write_node(&mut new_guard, &right)?;
        pages.push(new_guard);
        self.insert_in_parent(&mut pages, root_guard, separator)?;
        Ok(true)
    }

    /// Insert `separator` (pointing at the new right sibling) into the
    /// parent of the split node. The split pair are the last two guards in
    /// `pages`; ancestors precede them.
    fn insert_in_parent(
        &self,
        pages: &mut Vec<PageWriteGuard>,
        root_guard: &mut Option<RootGuard<'_>>,
        separator: K,
    ) -> Result<(), BTreeError> {
        debug_assert!(pages.len() >= 2);
        let left_index = pages.len() - 2;
        let right_index = pages.len() - 1;
        let left_id = pages[left_index].page_id;
        let right_id = pages[right_index].page_id;
        let left_is_root = {
            let left: BTreeNode<K> = read_node(&pages[left_index])?;
            left.is_root()
        };

        if left_is_root {
            // The split node was the root: grow a new root above the pair.
            let (page, new_root_id) = self.buffer_pool.new_page()?;
            let mut guard = page.write_arc();
            let mut root = BTreeNode::new_internal(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.children.push(left_id);
            root.children.push(right_id);
            root.keys.push(separator);
            write_node(&mut guard, &root)?;
            set_parent_page_id(&mut pages[left_index], new_root_id);
            set_parent_page_id(&mut pages[right_index], new_root_id);
            pages.push(guard);
            **root_guard.as_mut().expect("root latch held across a root split") = new_root_id;
            self.register_root(RootChange::Moved, new_root_id)?;
            log::debug!("index {} root moved to page {}", self.index_name, new_root_id);
            return Ok(());
        }

        // The split pair is finished with: unlatch and unpin both, leaving
        // their parent as the deepest page in the chain.
        let right_guard = pages.pop().expect("right split page latched");
        drop(right_guard);
        self.buffer_pool.unpin_page(right_id, true);
        let left_guard = pages.pop().expect("left split page latched");
        drop(left_guard);
        self.buffer_pool.unpin_page(left_id, true);

        let parent_index = pages.len() - 1;
        let mut parent: BTreeNode<K> = read_node(&pages[parent_index])?;
        parent.internal_insert(separator, right_id);
        if parent.size() <= self.internal_max_size {
            write_node(&mut pages[parent_index], &parent)?;
            return Ok(());
        }

        let (new_page, new_page_id) = self.buffer_pool.new_page()?;
        let mut new_guard = new_page.write_arc();
        let (promoted, right_node) = parent.split(new_page_id);
        write_node(&mut pages[parent_index], &parent)?;
        write_node(&mut new_guard, &right_node)?;
        pages.push(new_guard);
        self.insert_in_parent(pages, root_guard, promoted)
    }

    fn remove_inner(
        &self,
        key: &K,
        txn: &Transaction,
        root_guard: &mut Option<RootGuard<'_>>,
    ) -> Result<(), BTreeError> {
        self.find_leaf_write(key, WriteOp::Remove, txn, root_guard)?;
        let mut pages = txn.page_set();
        let leaf_index = pages.len() - 1;
        self.remove_entry(&mut pages, root_guard, txn, leaf_index, key)
    }

    /// Remove `key` from the node at `node_index` in the latched chain,
    /// rebalancing upward as needed.
    fn remove_entry(
        &self,
        pages: &mut Vec<PageWriteGuard>,
        root_guard: &mut Option<RootGuard<'_>>,
        txn: &Transaction,
        node_index: usize,
        key: &K,
    ) -> Result<(), BTreeError> {
        let mut node: BTreeNode<K> = read_node(&pages[node_index])?;
        let removed = if node.is_leaf {
            node.leaf_remove(key)
        } else {
            let removed = node.internal_remove(key);
            debug_assert!(removed, "separator always present in the parent");
            removed
        };
        if !removed {
            return Ok(());
        }
        write_node(&mut pages[node_index], &node)?;

        if node.is_root() {
            if node.is_leaf && node.size() == 0 {
                // The last key left the tree.
                **root_guard.as_mut().expect("root latch held") = INVALID_PAGE_ID;
                txn.add_deleted_page(node.page_id);
                self.register_root(RootChange::Deleted, INVALID_PAGE_ID)?;
                log::debug!("index {} is now empty", self.index_name);
            } else if !node.is_leaf && node.size() == 1 {
                // An internal root with one child hands the root to it. The
                // surviving child is write-latched in the chain (it was the
                // left side of the merge that emptied the root).
                let promoted = node.children[0];
                let child_index = pages
                    .iter()
                    .position(|page| page.page_id == promoted)
                    .expect("surviving child latched in the crabbing chain");
                set_parent_page_id(&mut pages[child_index], INVALID_PAGE_ID);
                **root_guard.as_mut().expect("root latch held") = promoted;
                txn.add_deleted_page(node.page_id);
                self.register_root(RootChange::Moved, promoted)?;
                log::debug!("index {} root collapsed to page {}", self.index_name, promoted);
            }
            return Ok(());
        }

        if node.size() >= node.min_size() {
            return Ok(());
        }

        // Underflow: rebalance with a sibling found through the parent,
        // which is the previous page in the latched chain.
        debug_assert!(node_index > 0, "non-root underflow implies a latched parent");
        let parent_index = node_index - 1;
        let mut parent: BTreeNode<K> = read_node(&pages[parent_index])?;
        let position = parent
            .children
            .iter()
            .position(|&child| child == node.page_id)
            .expect("latched parent references this node");
        let (brother_id, middle_key, brother_is_right) = if position == parent.size() - 1 {
            (
                parent.children[position - 1],
                parent.keys[position - 1].clone(),
                false,
            )
        } else {
            (
                parent.children[position + 1],
                parent.keys[position].clone(),
                true,
            )
        };

        let brother_page = self.buffer_pool.fetch_page(brother_id)?;
        let brother_guard = brother_page.write_arc();
        pages.push(brother_guard);
        let brother_index = pages.len() - 1;
        let mut brother: BTreeNode<K> = read_node(&pages[brother_index])?;

        let max_size = if node.is_leaf {
            self.leaf_max_size
        } else {
            self.internal_max_size
        };

        if node.size() + brother.size() <= max_size {
            // Merge right into left so the leaf chain stitch is trivial,
            // then drop the separator from the parent.
            let (mut left, right, left_index) = if brother_is_right {
                (node, brother, node_index)
            } else {
                (brother, node, brother_index)
            };
            let right_id = right.page_id;
            left.merge_right(right, &middle_key);
            write_node(&mut pages[left_index], &left)?;
            txn.add_deleted_page(right_id);
            self.remove_entry(pages, root_guard, txn, parent_index, &middle_key)
        } else {
            // Redistribute one entry and rewrite the separator.
            let new_separator = if brother_is_right {
                node.borrow_from_right(&mut brother, &middle_key)
            } else {
                node.borrow_from_left(&mut brother, &middle_key)
            };
            write_node(&mut pages[node_index], &node)?;
            write_node(&mut pages[brother_index], &brother)?;
            let key_index = parent
                .keys
                .binary_search(&middle_key)
                .expect("separator present in the parent");
            parent.keys[key_index] = new_separator;
            write_node(&mut pages[parent_index], &parent)?;
            Ok(())
        }
    }

    /// Write-latching descent. Latches are collected in the transaction's
    /// page set; reaching a node that cannot split/underflow releases every
    /// ancestor (and the root latch) before the node joins the chain.
    fn find_leaf_write(
        &self,
        key: &K,
        op: WriteOp,
        txn: &Transaction,
        root_guard: &mut Option<RootGuard<'_>>,
    ) -> Result<(), BTreeError> {
        let mut current = **root_guard.as_ref().expect("root latch held at descent start");
        loop {
            let page = self.buffer_pool.fetch_page(current)?;
            let guard = page.write_arc();
            let node: BTreeNode<K> = read_node(&guard)?;
            if node.is_safe(op) {
                self.release_pages(txn, root_guard)?;
            }
            let next = if node.is_leaf {
                None
            } else {
                Some(node.find_child(key))
            };
            txn.add_to_page_set(guard);
            match next {
                None => return Ok(()),
                Some(child) => current = child,
            }
        }
    }

    /// Read-latching descent to a leaf, hand over hand. Returns the leaf's
    /// guard (pinned) and the depth walked, or `None` on an empty tree.
    fn find_leaf_read(
        &self,
        target: ReadTarget<'_, K>,
    ) -> Result<Option<(PageReadGuard, usize)>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_latch);

        let mut depth = 1;
        loop {
            let node: BTreeNode<K> = read_node(&guard)?;
            if node.is_leaf {
                return Ok(Some((guard, depth)));
            }
            let child_id = match target {
                ReadTarget::Leftmost => node.children[0],
                ReadTarget::Key(key) => node.find_child(key),
            };
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();
            let parent_id = node.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(parent_id, false);
            guard = child_guard;
            depth += 1;
        }
    }

    /// Release the whole latch chain: drop the root latch, then unlatch and
    /// unpin each page in acquisition order, finally removing pages the
    /// operation deleted from the buffer pool.
    fn release_pages(
        &self,
        txn: &Transaction,
        root_guard: &mut Option<RootGuard<'_>>,
    ) -> Result<(), BTreeError> {
        *root_guard = None;
        for guard in txn.take_page_set() {
            let page_id = guard.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, true);
        }
        for page_id in txn.take_deleted_pages() {
            // A concurrent iterator may still hold a transient pin; wait
            // for it to drain.
            while !self.buffer_pool.delete_page(page_id)? {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Keep the page-0 registry in step with root transitions.
    fn register_root(&self, change: RootChange, root_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            let applied = match change {
                RootChange::Created => {
                    self.registry
                        .insert_record(&mut guard, &self.index_name, root_page_id)
                }
                RootChange::Moved => {
                    self.registry
                        .update_record(&mut guard, &self.index_name, root_page_id)
                }
                RootChange::Deleted => self.registry.delete_record(&mut guard, &self.index_name),
            };
            debug_assert!(applied, "root registry out of step with the tree");
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }
}
