use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

pub const LEAF_PAGE_TYPE: u8 = 1;
pub const INTERNAL_PAGE_TYPE: u8 = 2;

// Common header layout:
//   page_type: u8, size: u16, max_size: u16, page_id: i32, parent_page_id: i32
// Leaves append next_page_id: i32.
const PAGE_TYPE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const MAX_SIZE_OFFSET: usize = 3;
const PAGE_ID_OFFSET: usize = 5;
const PARENT_PAGE_ID_OFFSET: usize = 9;
const NEXT_PAGE_ID_OFFSET: usize = 13;
const INTERNAL_HEADER_SIZE: usize = 13;
const LEAF_HEADER_SIZE: usize = 17;

/// Patch the parent pointer in place without decoding the whole node.
pub fn set_parent_page_id(page: &mut Page, parent_page_id: PageId) {
    LittleEndian::write_i32(
        &mut page.data[PARENT_PAGE_ID_OFFSET..PARENT_PAGE_ID_OFFSET + 4],
        parent_page_id,
    );
}

fn write_key<K: Serialize>(data: &mut [u8], offset: usize, key: &K) -> Result<usize, BTreeError> {
    let bytes = bincode::serialize(key)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if offset + 2 + bytes.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    LittleEndian::write_u16(&mut data[offset..offset + 2], bytes.len() as u16);
    data[offset + 2..offset + 2 + bytes.len()].copy_from_slice(&bytes);
    Ok(offset + 2 + bytes.len())
}

fn read_key<K: DeserializeOwned>(data: &[u8], offset: usize) -> Result<(K, usize), BTreeError> {
    let len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
    if offset + 2 + len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    let key = bincode::deserialize(&data[offset + 2..offset + 2 + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
    Ok((key, offset + 2 + len))
}

fn write_i32(data: &mut [u8], offset: usize, value: i32) -> Result<usize, BTreeError> {
    if offset + 4 > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    LittleEndian::write_i32(&mut data[offset..offset + 4], value);
    Ok(offset + 4)
}

/// Serialize a node into its page.
pub fn write_node<K>(page: &mut Page, node: &BTreeNode<K>) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);
    page.data[PAGE_TYPE_OFFSET] = if node.is_leaf {
        LEAF_PAGE_TYPE
    } else {
        INTERNAL_PAGE_TYPE
    };
    LittleEndian::write_u16(&mut page.data[SIZE_OFFSET..SIZE_OFFSET + 2], node.size() as u16);
    LittleEndian::write_u16(
        &mut page.data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 2],
        node.max_size as u16,
    );
    LittleEndian::write_i32(&mut page.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4], node.page_id);
    LittleEndian::write_i32(
        &mut page.data[PARENT_PAGE_ID_OFFSET..PARENT_PAGE_ID_OFFSET + 4],
        node.parent_page_id,
    );

    if node.is_leaf {
        LittleEndian::write_i32(
            &mut page.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4],
            node.next_page_id,
        );
        let mut offset = LEAF_HEADER_SIZE;
        for (key, value) in node.keys.iter().zip(node.values.iter()) {
            offset = write_key(&mut page.data, offset, key)?;
            offset = write_i32(&mut page.data, offset, value.page_id)?;
            offset = write_i32(&mut page.data, offset, value.slot as i32)?;
        }
    } else {
        // Entry 0 has a child but no key: a zero-length key slot.
        let mut offset = INTERNAL_HEADER_SIZE;
        for (i, child) in node.children.iter().enumerate() {
            if i == 0 {
                if offset + 2 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u16(&mut page.data[offset..offset + 2], 0);
                offset += 2;
            } else {
                offset = write_key(&mut page.data, offset, &node.keys[i - 1])?;
            }
            offset = write_i32(&mut page.data, offset, *child)?;
        }
    }
    Ok(())
}

/// Deserialize the node stored in a page.
pub fn read_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
{
    let page_type = page.data[PAGE_TYPE_OFFSET];
    let size = LittleEndian::read_u16(&page.data[SIZE_OFFSET..SIZE_OFFSET + 2]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 2]) as usize;
    let page_id = LittleEndian::read_i32(&page.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4]);
    let parent_page_id =
        LittleEndian::read_i32(&page.data[PARENT_PAGE_ID_OFFSET..PARENT_PAGE_ID_OFFSET + 4]);

    match page_type {
        LEAF_PAGE_TYPE => {
            let mut node = BTreeNode::new_leaf(page_id, parent_page_id, max_size);
            node.next_page_id =
                LittleEndian::read_i32(&page.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4]);
            let mut offset = LEAF_HEADER_SIZE;
            for _ in 0..size {
                let (key, next) = read_key::<K>(&page.data, offset)?;
                let rid_page = LittleEndian::read_i32(&page.data[next..next + 4]);
                let rid_slot = LittleEndian::read_i32(&page.data[next + 4..next + 8]) as u32;
                offset = next + 8;
                node.keys.push(key);
                node.values.push(Rid::new(rid_page, rid_slot));
            }
            Ok(node)
        }
        INTERNAL_PAGE_TYPE => {
            let mut node = BTreeNode::new_internal(page_id, parent_page_id, max_size);
            let mut offset = INTERNAL_HEADER_SIZE;
            for i in 0..size {
                if i == 0 {
                    // Skip the unused key slot of entry 0.
                    let len =
                        LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
                    offset += 2 + len;
                } else {
                    let (key, next) = read_key::<K>(&page.data, offset)?;
                    node.keys.push(key);
                    offset = next;
                }
                let child = LittleEndian::read_i32(&page.data[offset..offset + 4]);
                offset += 4;
                node.children.push(child);
            }
            Ok(node)
        }
        _ => Err(BTreeError::InvalidPageFormat),
    }
}
