//! In-memory B+ tree node encoding: slot 0 of a node page is a fixed
//! 15-byte metadata blob, the remaining slots carry keys/values (leaves) or
//! keys/children (internal nodes).
//!
//! Nodes are always re-parsed wholesale from a page and re-serialized
//! wholesale back to one, per the "always re-parse" read contract; the
//! slot directory inside a node page is therefore rebuilt from scratch on
//! every write rather than mutated incrementally.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Error, StorageError};
use crate::page::{Page, PageType, INVALID_PAGE_ID};
use crate::slotted_page::SlottedPage;

/// Tree order: a node overflows at `BTREE_ORDER` keys.
pub const BTREE_ORDER: usize = 50;
/// Minimum keys a non-root node must retain: `floor((BTREE_ORDER - 1) / 2)`.
pub const BTREE_MIN_KEYS: usize = 24;

const META_SLOT_SIZE: usize = 15;

#[derive(Debug, Clone)]
pub struct Node {
    pub page_id: u32,
    pub is_leaf: bool,
    pub parent: u32,
    pub prev: u32,
    pub next: u32,
    pub keys: Vec<Vec<u8>>,
    /// Leaf only: `values[i]` is the value for `keys[i]`.
    pub values: Vec<Vec<u8>>,
    /// Internal only: `children.len() == keys.len() + 1`.
    pub children: Vec<u32>,
}

impl Node {
    pub fn new_leaf(page_id: u32) -> Self {
        Self {
            page_id,
            is_leaf: true,
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_internal(page_id: u32) -> Self {
        Self {
            page_id,
            is_leaf: false,
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Byte size this node would serialize to: header + per-entry overhead,
    /// used to pick a byte-driven split point.
    pub fn serialized_size(&self) -> usize {
        let keys_size: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        if self.is_leaf {
            let values_size: usize = self.values.iter().map(|v| 2 + v.len()).sum();
            META_SLOT_SIZE + keys_size + values_size
        } else {
            META_SLOT_SIZE + keys_size + 4 * self.children.len()
        }
    }

    /// Binary search for the first key `>= target`. Returns `(index,
    /// found)`, mirroring the teacher's `find_slot` idiom.
    pub fn lower_bound(&self, target: &[u8]) -> (usize, bool) {
        let mut lo = 0usize;
        let mut hi = self.keys.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.keys[mid].as_slice().cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return (mid, true),
            }
        }
        (lo, false)
    }

    /// Route `key` to the index of the child that should contain it.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        debug_assert!(!self.is_leaf);
        let (idx, found) = self.lower_bound(key);
        let idx = if found { idx + 1 } else { idx };
        idx.min(self.children.len() - 1)
    }

    pub fn encode(&self) -> Result<Page, Error> {
        let page_type = if self.is_leaf {
            PageType::BTreeLeaf
        } else {
            PageType::BTreeInternal
        };
        let mut page = Page::new(self.page_id, page_type);
        {
            let mut sp = SlottedPage::new(&mut page);
            sp.insert(&self.encode_meta()).map_err(to_storage_error(self.page_id))?;
            if self.is_leaf {
                for i in 0..self.keys.len() {
                    sp.insert(&self.keys[i]).map_err(to_storage_error(self.page_id))?;
                    sp.insert(&self.values[i]).map_err(to_storage_error(self.page_id))?;
                }
            } else {
                for key in &self.keys {
                    sp.insert(key).map_err(to_storage_error(self.page_id))?;
                }
                sp.insert(&encode_children(&self.children))
                    .map_err(to_storage_error(self.page_id))?;
            }
        }
        page.item_count = if self.is_leaf {
            (1 + 2 * self.keys.len()) as u16
        } else {
            (2 + self.keys.len()) as u16
        };
        Ok(page)
    }

    pub fn decode(page: &Page) -> Result<Self, Error> {
        let mut scratch = page.clone();
        let sp = SlottedPage::new(&mut scratch);
        let meta_bytes = sp
            .get_data(0)
            .ok_or_else(|| corrupt(page.page_id, "missing node metadata slot"))?;
        let (is_leaf, key_count, parent, prev, next) = decode_meta(page.page_id, meta_bytes)?;

        let mut node = Node {
            page_id: page.page_id,
            is_leaf,
            parent,
            prev,
            next,
            keys: Vec::with_capacity(key_count),
            values: Vec::new(),
            children: Vec::new(),
        };

        if is_leaf {
            node.values.reserve(key_count);
            for i in 0..key_count {
                let key = sp
                    .get_data(1 + 2 * i)
                    .ok_or_else(|| corrupt(page.page_id, "missing leaf key slot"))?;
                let value = sp
                    .get_data(2 + 2 * i)
                    .ok_or_else(|| corrupt(page.page_id, "missing leaf value slot"))?;
                node.keys.push(key.to_vec());
                node.values.push(value.to_vec());
            }
        } else {
            for i in 0..key_count {
                let key = sp
                    .get_data(1 + i)
                    .ok_or_else(|| corrupt(page.page_id, "missing internal key slot"))?;
                node.keys.push(key.to_vec());
            }
            let trailer = sp
                .get_data(1 + key_count)
                .ok_or_else(|| corrupt(page.page_id, "missing internal children trailer"))?;
            node.children = decode_children(page.page_id, trailer, key_count + 1)?;
        }

        Ok(node)
    }

    fn encode_meta(&self) -> [u8; META_SLOT_SIZE] {
        let mut buf = [0u8; META_SLOT_SIZE];
        buf[0] = self.is_leaf as u8;
        buf[1..3].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[3..7].copy_from_slice(&self.parent.to_le_bytes());
        buf[7..11].copy_from_slice(&self.prev.to_le_bytes());
        buf[11..15].copy_from_slice(&self.next.to_le_bytes());
        buf
    }
}

fn decode_meta(page_id: u32, buf: &[u8]) -> Result<(bool, usize, u32, u32, u32), Error> {
    if buf.len() != META_SLOT_SIZE {
        return Err(corrupt(page_id, "node metadata slot has wrong length"));
    }
    let is_leaf = match buf[0] {
        0 => false,
        1 => true,
        other => return Err(corrupt(page_id, &format!("invalid isLeaf byte: {other}"))),
    };
    let key_count = (&buf[1..3]).read_u16::<LittleEndian>().unwrap() as usize;
    let parent = (&buf[3..7]).read_u32::<LittleEndian>().unwrap();
    let prev = (&buf[7..11]).read_u32::<LittleEndian>().unwrap();
    let next = (&buf[11..15]).read_u32::<LittleEndian>().unwrap();
    Ok((is_leaf, key_count, parent, prev, next))
}

fn encode_children(children: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(children.len() * 4);
    for &c in children {
        buf.write_u32::<LittleEndian>(c).unwrap();
    }
    buf
}

fn decode_children(page_id: u32, buf: &[u8], expected: usize) -> Result<Vec<u32>, Error> {
    if buf.len() != expected * 4 {
        return Err(corrupt(
            page_id,
            &format!("children trailer length {} != {}", buf.len(), expected * 4),
        ));
    }
    let mut out = Vec::with_capacity(expected);
    let mut cursor = buf;
    for _ in 0..expected {
        out.push(cursor.read_u32::<LittleEndian>().unwrap());
    }
    Ok(out)
}

fn corrupt(page_id: u32, detail: &str) -> Error {
    StorageError::CorruptPage {
        page_id,
        detail: detail.to_string(),
    }
    .into()
}

fn to_storage_error(page_id: u32) -> impl Fn(crate::slotted_page::SlottedPageError) -> Error {
    move |e| match e {
        crate::slotted_page::SlottedPageError::PageFull => StorageError::NoSpace(format!(
            "node page {page_id} is full"
        ))
        .into(),
        crate::slotted_page::SlottedPageError::Corrupt(detail) => {
            StorageError::CorruptPage { page_id, detail }.into()
        }
    }
}

/// Compute the byte-driven split point for a node about to overflow: the
/// first index at which the running left-side size crosses half the
/// node's total serialized size, clamped into `[1, key_count - 1]`.
pub fn split_point(node: &Node) -> usize {
    let total = node.serialized_size();
    let target = total / 2;
    let mut running = META_SLOT_SIZE;
    let mut split = node.keys.len() / 2;
    for i in 0..node.keys.len() {
        running += 2 + node.keys[i].len();
        if node.is_leaf {
            running += 2 + node.values[i].len();
        } else {
            running += 4;
        }
        if running >= target {
            split = i;
            break;
        }
    }
    split.clamp(1, node.keys.len().saturating_sub(1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips() {
        let mut node = Node::new_leaf(5);
        node.keys = vec![b"a".to_vec(), b"b".to_vec()];
        node.values = vec![b"1".to_vec(), b"2".to_vec()];
        node.next = 9;
        let page = node.encode().unwrap();
        let decoded = Node::decode(&page).unwrap();
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.values, node.values);
        assert_eq!(decoded.next, 9);
        assert!(decoded.is_leaf);
    }

    #[test]
    fn internal_round_trips() {
        let mut node = Node::new_internal(1);
        node.keys = vec![b"m".to_vec()];
        node.children = vec![2, 3];
        let page = node.encode().unwrap();
        let decoded = Node::decode(&page).unwrap();
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.children, node.children);
        assert!(!decoded.is_leaf);
    }

    #[test]
    fn lower_bound_finds_equal_and_insert_points() {
        let mut node = Node::new_leaf(1);
        node.keys = vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()];
        assert_eq!(node.lower_bound(b"d"), (1, true));
        assert_eq!(node.lower_bound(b"c"), (1, false));
        assert_eq!(node.lower_bound(b"z"), (3, false));
    }
}
