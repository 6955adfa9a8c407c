use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::read_node;
use crate::storage::buffer::BufferPoolManager;

struct LeafPosition<K> {
    guard: PageReadGuard,
    node: BTreeNode<K>,
    index: usize,
}

/// Forward iterator over the leaf chain. Owns exactly one read-latched,
/// pinned leaf at a time (none once exhausted); advancing past a leaf
/// releases it before the next leaf is latched.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    current: Option<LeafPosition<K>>,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        guard: PageReadGuard,
        node: BTreeNode<K>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            current: Some(LeafPosition { guard, node, index }),
        }
    }

    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            current: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    fn release_current(&mut self) {
        if let Some(LeafPosition { guard, node, .. }) = self.current.take() {
            drop(guard);
            self.buffer_pool.unpin_page(node.page_id, false);
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let position = self.current.as_mut()?;
            if position.index < position.node.size() {
                let item = (
                    position.node.keys[position.index].clone(),
                    position.node.values[position.index],
                );
                position.index += 1;
                return Some(item);
            }

            let next_page_id = position.node.next_page_id;
            self.release_current();
            if next_page_id == INVALID_PAGE_ID {
                return None;
            }

            let page = match self.buffer_pool.fetch_page(next_page_id) {
                Ok(page) => page,
                Err(e) => {
                    log::warn!("iterator lost leaf chain at page {}: {}", next_page_id, e);
                    return None;
                }
            };
            let guard = page.read_arc();
            let node = match read_node::<K>(&guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(next_page_id, false);
                    log::warn!("iterator lost leaf chain at page {}: {}", next_page_id, e);
                    return None;
                }
            };
            self.current = Some(LeafPosition {
                guard,
                node,
                index: 0,
            });
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(LeafPosition { guard, node, .. }) = self.current.take() {
            drop(guard);
            self.buffer_pool.unpin_page(node.page_id, false);
        }
    }
}
