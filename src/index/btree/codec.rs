use std::mem;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Node header layout:
//   0      page type: u8 (1 = leaf, 2 = internal)
//   1..3   size: u16 (pair count)
//   3..5   max_size: u16
//   5..9   parent_page_id: u32
//   9..13  page_id: u32
//   13..17 next_leaf: u32 (leaves only)
//   17..19 offset where values/children start: u16
pub const NODE_HEADER_SIZE: usize = 19;

const LEAF_PAGE_TYPE: u8 = 1;
const INTERNAL_PAGE_TYPE: u8 = 2;

/// Serialize a node into page bytes
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Clone + Ord + Serialize,
{
    page.reset();

    page.data[0] = if node.is_leaf {
        LEAF_PAGE_TYPE
    } else {
        INTERNAL_PAGE_TYPE
    };
    LittleEndian::write_u16(&mut page.data[1..3], node.size() as u16);
    LittleEndian::write_u16(&mut page.data[3..5], node.max_size as u16);
    LittleEndian::write_u32(&mut page.data[5..9], node.parent_page_id);
    LittleEndian::write_u32(&mut page.data[9..13], node.page_id);
    LittleEndian::write_u32(&mut page.data[13..17], node.next_leaf);

    // keys: u16 length prefix + bincode bytes each
    let mut offset = NODE_HEADER_SIZE;
    for key in &node.keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
        if offset + 2 + key_bytes.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    LittleEndian::write_u16(&mut page.data[17..19], offset as u16);

    if node.is_leaf {
        for value in &node.values {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.page_id);
            LittleEndian::write_u32(&mut page.data[offset + 4..offset + 8], value.slot);
            offset += 8;
        }
    } else {
        for &child in &node.children {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], child);
            offset += 4;
        }
    }

    Ok(())
}

/// Deserialize a node from page bytes
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: Clone + Ord + DeserializeOwned,
{
    let is_leaf = match page.data[0] {
        LEAF_PAGE_TYPE => true,
        INTERNAL_PAGE_TYPE => false,
        _ => return Err(BTreeError::InvalidPageFormat),
    };

    let size = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[3..5]) as usize;
    let parent_page_id = LittleEndian::read_u32(&page.data[5..9]);
    let page_id = LittleEndian::read_u32(&page.data[9..13]);
    let next_leaf = LittleEndian::read_u32(&page.data[13..17]);
    let values_offset = LittleEndian::read_u16(&page.data[17..19]) as usize;

    let key_count = if is_leaf { size } else { size.saturating_sub(1) };

    let mut offset = NODE_HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        if offset + 2 > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + key_len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&page.data[offset..offset + key_len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        keys.push(key);
        offset += key_len;
    }

    let mut values = Vec::new();
    let mut children = Vec::new();
    let mut offset = values_offset;

    if is_leaf {
        values.reserve(size);
        for _ in 0..size {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            let rid_page = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            let rid_slot = LittleEndian::read_u32(&page.data[offset + 4..offset + 8]);
            values.push(Rid::new(rid_page, rid_slot));
            offset += 8;
        }
    } else {
        children.reserve(size);
        for _ in 0..size {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
            offset += 4;
        }
    }

    Ok(BTreeNode {
        page_id,
        parent_page_id,
        is_leaf,
        max_size,
        next_leaf,
        keys,
        children,
        values,
    })
}

/// Largest pair count a page can hold for a key type, used as the default
/// `max_size` when the caller does not pick a fan-out.
pub fn default_btree_order<K>() -> usize {
    let key_size = mem::size_of::<K>() + 2;
    let value_size = mem::size_of::<Rid>();
    let order = (PAGE_SIZE - NODE_HEADER_SIZE) / (key_size + value_size);
    order.max(3)
}
