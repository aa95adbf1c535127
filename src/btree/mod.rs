//! A B+ tree keyed by raw byte strings, built directly on `Pager` pages.
//!
//! Each node is one page (`node::Node` is its in-memory shape); this module
//! owns search/insert/delete/range-scan and the split/merge mechanics that
//! keep a node's key count within `[BTREE_MIN_KEYS, BTREE_ORDER)`.
//!
//! `BTree` borrows its `Pager` mutably rather than owning it, so the borrow
//! checker enforces the single-writer rule: only one tree operation (on any
//! index sharing that pager) can be in flight at a time.

mod node;

pub use node::{Node, BTREE_MIN_KEYS, BTREE_ORDER};
use node::split_point;

use crate::errors::{Error, StorageError};
use crate::page::{PageType, INVALID_PAGE_ID};
use crate::pager::Pager;

pub struct BTree<'p> {
    pager: &'p mut Pager,
    root_page_id: u32,
}

impl<'p> BTree<'p> {
    /// Allocate a fresh, empty tree (a single empty leaf as root).
    pub fn create(pager: &'p mut Pager) -> Result<Self, Error> {
        let root_page = pager.alloc_page(PageType::BTreeLeaf)?;
        let root = Node::new_leaf(root_page.page_id);
        let page = root.encode()?;
        pager.write_page(page)?;
        Ok(Self {
            pager,
            root_page_id: root.page_id,
        })
    }

    /// Wrap an existing tree rooted at `root_page_id`.
    pub fn open(pager: &'p mut Pager, root_page_id: u32) -> Self {
        Self {
            pager,
            root_page_id,
        }
    }

    pub fn root_page_id(&self) -> u32 {
        self.root_page_id
    }

    fn load_node(&mut self, page_id: u32) -> Result<Node, Error> {
        let page = self.pager.read_page(page_id)?;
        Node::decode(&page)
    }

    fn save_node(&mut self, node: &Node) -> Result<(), Error> {
        let page = node.encode()?;
        self.pager.write_page(page)
    }

    fn find_leaf(&mut self, key: &[u8]) -> Result<Node, Error> {
        let mut current = self.load_node(self.root_page_id)?;
        while !current.is_leaf {
            let idx = current.child_index_for(key);
            let child_id = current.children[idx];
            current = self.load_node(child_id)?;
        }
        Ok(current)
    }

    pub fn search(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let leaf = self.find_leaf(key)?;
        let (idx, found) = leaf.lower_bound(key);
        Ok(if found {
            Some(leaf.values[idx].clone())
        } else {
            None
        })
    }

    /// Insert `key`/`value`, overwriting any existing value for `key`.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error> {
        let mut leaf = self.find_leaf(&key)?;
        let (idx, found) = leaf.lower_bound(&key);
        if found {
            leaf.values[idx] = value;
            self.save_node(&leaf)?;
            return Ok(());
        }

        leaf.keys.insert(idx, key);
        leaf.values.insert(idx, value);

        if leaf.keys.len() < BTREE_ORDER {
            self.save_node(&leaf)?;
            return Ok(());
        }

        self.split_leaf(leaf)
    }

    fn split_leaf(&mut self, mut leaf: Node) -> Result<(), Error> {
        let split = split_point(&leaf);
        let right_page = self.pager.alloc_page(PageType::BTreeLeaf)?;
        let mut right = Node::new_leaf(right_page.page_id);
        right.keys = leaf.keys.split_off(split);
        right.values = leaf.values.split_off(split);
        right.parent = leaf.parent;
        right.next = leaf.next;
        right.prev = leaf.page_id;
        leaf.next = right.page_id;

        if right.next != INVALID_PAGE_ID {
            let mut old_next = self.load_node(right.next)?;
            old_next.prev = right.page_id;
            self.save_node(&old_next)?;
        }

        let separator = right.keys[0].clone();
        let left_id = leaf.page_id;
        let right_id = right.page_id;
        let parent_id = leaf.parent;
        self.save_node(&leaf)?;
        self.save_node(&right)?;

        self.insert_into_parent(parent_id, separator, left_id, right_id)
    }

    /// Attach `right_id` (reached via `separator`) to `parent_id`'s child
    /// list next to `left_id`, creating a new root if `parent_id` is
    /// invalid (i.e. `left_id` was the root), splitting `parent_id` in turn
    /// if it overflows.
    fn insert_into_parent(
        &mut self,
        parent_id: u32,
        separator: Vec<u8>,
        left_id: u32,
        right_id: u32,
    ) -> Result<(), Error> {
        if parent_id == INVALID_PAGE_ID {
            let new_root_page = self.pager.alloc_page(PageType::BTreeInternal)?;
            let mut new_root = Node::new_internal(new_root_page.page_id);
            new_root.keys = vec![separator];
            new_root.children = vec![left_id, right_id];

            let mut left = self.load_node(left_id)?;
            left.parent = new_root.page_id;
            self.save_node(&left)?;
            let mut right = self.load_node(right_id)?;
            right.parent = new_root.page_id;
            self.save_node(&right)?;

            self.save_node(&new_root)?;
            self.root_page_id = new_root.page_id;
            return Ok(());
        }

        let mut parent = self.load_node(parent_id)?;
        let (pidx, _) = parent.lower_bound(&separator);
        parent.keys.insert(pidx, separator);
        parent.children.insert(pidx + 1, right_id);

        let mut right = self.load_node(right_id)?;
        right.parent = parent.page_id;
        self.save_node(&right)?;

        if parent.keys.len() < BTREE_ORDER {
            self.save_node(&parent)?;
            return Ok(());
        }

        self.split_internal(parent)
    }

    fn split_internal(&mut self, mut parent: Node) -> Result<(), Error> {
        let split = split_point(&parent);
        let separator = parent.keys[split].clone();
        let right_keys = parent.keys.split_off(split + 1);
        let right_children = parent.children.split_off(split + 1);
        parent.keys.pop(); // drop the promoted separator from the left side

        let new_right_page = self.pager.alloc_page(PageType::BTreeInternal)?;
        let mut new_right = Node::new_internal(new_right_page.page_id);
        new_right.parent = parent.parent;
        new_right.keys = right_keys;
        new_right.children = right_children;

        for &child_id in &new_right.children {
            let mut child = self.load_node(child_id)?;
            child.parent = new_right.page_id;
            self.save_node(&child)?;
        }

        let left_id = parent.page_id;
        let right_id = new_right.page_id;
        let parent_id = parent.parent;
        self.save_node(&parent)?;
        self.save_node(&new_right)?;

        self.insert_into_parent(parent_id, separator, left_id, right_id)
    }

    /// Delete `key`, returning whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, Error> {
        let mut leaf = self.find_leaf(key)?;
        let (idx, found) = leaf.lower_bound(key);
        if !found {
            return Ok(false);
        }
        leaf.keys.remove(idx);
        leaf.values.remove(idx);
        let leaf_id = leaf.page_id;
        self.save_node(&leaf)?;
        self.rebalance(leaf_id)?;
        Ok(true)
    }

    /// Restore the min-key invariant at `node_id`, propagating merges
    /// upward as needed, and collapse the root if it loses its last key.
    fn rebalance(&mut self, node_id: u32) -> Result<(), Error> {
        let node = self.load_node(node_id)?;

        if node.page_id == self.root_page_id {
            if !node.is_leaf && node.children.len() == 1 {
                let only_child = node.children[0];
                let mut child = self.load_node(only_child)?;
                child.parent = INVALID_PAGE_ID;
                self.save_node(&child)?;
                self.root_page_id = only_child;
                self.pager.free_page(node.page_id)?;
            }
            return Ok(());
        }

        if node.keys.len() >= BTREE_MIN_KEYS {
            return Ok(());
        }

        let parent_id = node.parent;
        let mut parent = self.load_node(parent_id)?;
        let my_idx = parent
            .children
            .iter()
            .position(|&c| c == node.page_id)
            .ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "node {} missing from parent {} children",
                    node.page_id, parent_id
                ))
            })?;

        let mut node = node;

        if my_idx > 0 {
            let left_id = parent.children[my_idx - 1];
            let mut left = self.load_node(left_id)?;
            if left.keys.len() > BTREE_MIN_KEYS {
                self.borrow_from_left(&mut node, &mut left, &mut parent, my_idx)?;
                self.save_node(&left)?;
                self.save_node(&node)?;
                self.save_node(&parent)?;
                return Ok(());
            }
        }

        if my_idx + 1 < parent.children.len() {
            let right_id = parent.children[my_idx + 1];
            let mut right = self.load_node(right_id)?;
            if right.keys.len() > BTREE_MIN_KEYS {
                self.borrow_from_right(&mut node, &mut right, &mut parent, my_idx)?;
                self.save_node(&right)?;
                self.save_node(&node)?;
                self.save_node(&parent)?;
                return Ok(());
            }
        }

        if my_idx > 0 {
            let left_id = parent.children[my_idx - 1];
            let mut left = self.load_node(left_id)?;
            self.merge_nodes(&mut left, &mut node, &parent.keys[my_idx - 1].clone())?;
            self.pager.free_page(node.page_id)?;
            parent.children.remove(my_idx);
            parent.keys.remove(my_idx - 1);
            self.save_node(&left)?;
            let parent_id = parent.page_id;
            self.save_node(&parent)?;
            self.rebalance(parent_id)?;
        } else {
            let right_id = parent.children[my_idx + 1];
            let mut right = self.load_node(right_id)?;
            self.merge_nodes(&mut node, &mut right, &parent.keys[my_idx].clone())?;
            self.pager.free_page(right.page_id)?;
            parent.children.remove(my_idx + 1);
            parent.keys.remove(my_idx);
            self.save_node(&node)?;
            let parent_id = parent.page_id;
            self.save_node(&parent)?;
            self.rebalance(parent_id)?;
        }
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        node: &mut Node,
        left: &mut Node,
        parent: &mut Node,
        my_idx: usize,
    ) -> Result<(), Error> {
        if node.is_leaf {
            let k = left.keys.pop().unwrap();
            let v = left.values.pop().unwrap();
            node.keys.insert(0, k);
            node.values.insert(0, v);
            parent.keys[my_idx - 1] = node.keys[0].clone();
        } else {
            let sep = parent.keys[my_idx - 1].clone();
            let borrowed_key = left.keys.pop().unwrap();
            let borrowed_child = left.children.pop().unwrap();
            node.keys.insert(0, sep);
            node.children.insert(0, borrowed_child);
            parent.keys[my_idx - 1] = borrowed_key;
            let mut child = self.load_node(borrowed_child)?;
            child.parent = node.page_id;
            self.save_node(&child)?;
        }
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        node: &mut Node,
        right: &mut Node,
        parent: &mut Node,
        my_idx: usize,
    ) -> Result<(), Error> {
        if node.is_leaf {
            let k = right.keys.remove(0);
            let v = right.values.remove(0);
            node.keys.push(k);
            node.values.push(v);
            parent.keys[my_idx] = right.keys[0].clone();
        } else {
            let sep = parent.keys[my_idx].clone();
            let borrowed_key = right.keys.remove(0);
            let borrowed_child = right.children.remove(0);
            node.keys.push(sep);
            node.children.push(borrowed_child);
            parent.keys[my_idx] = borrowed_key;
            let mut child = self.load_node(borrowed_child)?;
            child.parent = node.page_id;
            self.save_node(&child)?;
        }
        Ok(())
    }

    /// Merge `right` into `left` (leaf: splice keys/values and the leaf
    /// chain; internal: pull the `separator` down between the two key
    /// lists). `right`'s own page is freed by the caller.
    fn merge_nodes(&mut self, left: &mut Node, right: &mut Node, separator: &[u8]) -> Result<(), Error> {
        if left.is_leaf {
            left.keys.extend(right.keys.drain(..));
            left.values.extend(right.values.drain(..));
            left.next = right.next;
            if right.next != INVALID_PAGE_ID {
                let mut next_node = self.load_node(right.next)?;
                next_node.prev = left.page_id;
                self.save_node(&next_node)?;
            }
        } else {
            left.keys.push(separator.to_vec());
            left.keys.extend(right.keys.drain(..));
            for &child_id in &right.children {
                let mut child = self.load_node(child_id)?;
                child.parent = left.page_id;
                self.save_node(&child)?;
            }
            left.children.extend(right.children.drain(..));
        }
        Ok(())
    }

    fn leftmost_leaf(&mut self) -> Result<Node, Error> {
        let mut node = self.load_node(self.root_page_id)?;
        while !node.is_leaf {
            node = self.load_node(node.children[0])?;
        }
        Ok(node)
    }

    /// All entries with `start <= key < end`. `start: None` begins at the
    /// leftmost leaf; `end: None` runs to the end of the tree.
    pub fn search_range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        let mut leaf = match start {
            Some(start) => self.find_leaf(start)?,
            None => self.leftmost_leaf()?,
        };
        loop {
            for (k, v) in leaf.keys.iter().zip(leaf.values.iter()) {
                let above_start = start.map_or(true, |s| k.as_slice() >= s);
                let below_end = end.map_or(true, |e| k.as_slice() < e);
                if above_start && below_end {
                    out.push((k.clone(), v.clone()));
                }
            }
            if let Some(end) = end {
                if matches!(leaf.keys.last(), Some(last) if last.as_slice() >= end) {
                    break;
                }
            }
            if leaf.next == INVALID_PAGE_ID {
                break;
            }
            leaf = self.load_node(leaf.next)?;
        }
        Ok(out)
    }

    /// Every entry in key order, via the leaf chain.
    pub fn get_all(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        let mut leaf = self.leftmost_leaf()?;
        loop {
            for (k, v) in leaf.keys.iter().zip(leaf.values.iter()) {
                out.push((k.clone(), v.clone()));
            }
            if leaf.next == INVALID_PAGE_ID {
                break;
            }
            leaf = self.load_node(leaf.next)?;
        }
        Ok(out)
    }

    pub fn count(&mut self) -> Result<usize, Error> {
        let mut total = 0;
        let mut leaf = self.leftmost_leaf()?;
        loop {
            total += leaf.keys.len();
            if leaf.next == INVALID_PAGE_ID {
                break;
            }
            leaf = self.load_node(leaf.next)?;
        }
        Ok(total)
    }

    /// Number of levels from root to leaf, inclusive.
    pub fn height(&mut self) -> Result<usize, Error> {
        let mut h = 1;
        let mut node = self.load_node(self.root_page_id)?;
        while !node.is_leaf {
            h += 1;
            node = self.load_node(node.children[0])?;
        }
        Ok(h)
    }

    /// Check ascending keys, subtree key bounds, child-count consistency,
    /// parent pointers, and leaf-chain order, all the way down from the
    /// root. Collects every violation found rather than stopping at the
    /// first one; an empty result means the tree is healthy. Only I/O or
    /// decode failures (not invariant violations) surface as `Err`.
    pub fn verify(&mut self) -> Result<Vec<String>, Error> {
        let mut issues = Vec::new();
        let root = self.load_node(self.root_page_id)?;
        if root.parent != INVALID_PAGE_ID {
            issues.push("root has a non-null parent".to_string());
        }
        self.verify_subtree(self.root_page_id, None, None, &mut issues)?;
        self.verify_leaf_chain(&mut issues)?;
        Ok(issues)
    }

    fn verify_subtree(
        &mut self,
        node_id: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        issues: &mut Vec<String>,
    ) -> Result<(), Error> {
        let node = self.load_node(node_id)?;

        for w in node.keys.windows(2) {
            if w[0] >= w[1] {
                issues.push(format!("keys not strictly ascending in node {node_id}"));
            }
        }
        if let (Some(lb), Some(first)) = (lower, node.keys.first()) {
            if first.as_slice() <= lb {
                issues.push(format!(
                    "node {node_id} holds a key at or below its lower bound"
                ));
            }
        }
        if let (Some(ub), Some(last)) = (upper, node.keys.last()) {
            if last.as_slice() >= ub {
                issues.push(format!(
                    "node {node_id} holds a key at or above its upper bound"
                ));
            }
        }

        if !node.is_leaf {
            if node.children.len() != node.keys.len() + 1 {
                issues.push(format!(
                    "node {node_id} has {} children for {} keys",
                    node.children.len(),
                    node.keys.len()
                ));
            }
            for (i, &child_id) in node.children.iter().enumerate() {
                let child = self.load_node(child_id)?;
                if child.parent != node_id {
                    issues.push(format!(
                        "child {child_id} parent pointer does not point back to {node_id}"
                    ));
                }
                let child_lower = if i == 0 {
                    lower
                } else {
                    Some(node.keys[i - 1].as_slice())
                };
                let child_upper = if i == node.children.len() - 1 {
                    upper
                } else {
                    Some(node.keys[i].as_slice())
                };
                self.verify_subtree(child_id, child_lower, child_upper, issues)?;
            }
        }
        Ok(())
    }

    fn verify_leaf_chain(&mut self, issues: &mut Vec<String>) -> Result<(), Error> {
        let mut node = self.leftmost_leaf()?;
        let mut prev_id = INVALID_PAGE_ID;
        let mut last_key: Option<Vec<u8>> = None;
        let mut steps = 0u64;
        loop {
            steps += 1;
            if steps > 10_000_000 {
                issues.push("leaf chain cycle detected".to_string());
                break;
            }
            if node.prev != prev_id {
                issues.push(format!(
                    "leaf {} prev pointer does not match predecessor",
                    node.page_id
                ));
            }
            if let (Some(lk), Some(first)) = (&last_key, node.keys.first()) {
                if first <= lk {
                    issues.push("leaf chain keys not ascending across leaves".to_string());
                }
            }
            last_key = node.keys.last().cloned();
            prev_id = node.page_id;
            if node.next == INVALID_PAGE_ID {
                break;
            }
            node = self.load_node(node.next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PagerOptions;
    use tempfile::tempdir;

    fn open_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.mono");
        let pager = Pager::open(&path, PagerOptions::default()).unwrap();
        (dir, pager)
    }

    #[test]
    fn empty_tree_round_trip() {
        let (_dir, mut pager) = open_pager();
        let mut tree = BTree::create(&mut pager).unwrap();
        assert_eq!(tree.search(b"nope").unwrap(), None);
        assert_eq!(tree.count().unwrap(), 0);
        assert_eq!(tree.height().unwrap(), 1);
        assert!(tree.verify().unwrap().is_empty());
    }

    #[test]
    fn insert_search_delete_and_range() {
        let (_dir, mut pager) = open_pager();
        let mut tree = BTree::create(&mut pager).unwrap();

        for i in 0..300u32 {
            let key = format!("key-{i:04}").into_bytes();
            let value = format!("val-{i}").into_bytes();
            tree.insert(key, value).unwrap();
        }
        assert!(tree.verify().unwrap().is_empty());
        assert_eq!(tree.count().unwrap(), 300);
        assert!(tree.height().unwrap() > 1);

        assert_eq!(
            tree.search(b"key-0150").unwrap(),
            Some(b"val-150".to_vec())
        );
        assert_eq!(tree.search(b"key-9999").unwrap(), None);

        // overwrite
        tree.insert(b"key-0150".to_vec(), b"replaced".to_vec())
            .unwrap();
        assert_eq!(
            tree.search(b"key-0150").unwrap(),
            Some(b"replaced".to_vec())
        );

        let range = tree
            .search_range(Some(b"key-0100"), Some(b"key-0103"))
            .unwrap();
        assert_eq!(
            range,
            vec![
                (b"key-0100".to_vec(), b"val-100".to_vec()),
                (b"key-0101".to_vec(), b"val-101".to_vec()),
                (b"key-0102".to_vec(), b"val-102".to_vec()),
            ]
        );

        for i in 0..250u32 {
            let key = format!("key-{i:04}").into_bytes();
            assert!(tree.delete(&key).unwrap());
        }
        assert!(tree.verify().unwrap().is_empty());
        assert_eq!(tree.count().unwrap(), 50);
        assert!(!tree.delete(b"key-0010").unwrap());

        for (k, _) in tree.get_all().unwrap() {
            assert!(k.as_slice() >= b"key-0250".as_slice());
        }
    }

    #[test]
    fn delete_everything_collapses_to_empty_leaf_root() {
        let (_dir, mut pager) = open_pager();
        let mut tree = BTree::create(&mut pager).unwrap();
        for i in 0..120u32 {
            tree.insert(format!("k{i:03}").into_bytes(), vec![i as u8])
                .unwrap();
        }
        for i in 0..120u32 {
            assert!(tree.delete(format!("k{i:03}").into_bytes().as_slice()).unwrap());
        }
        assert!(tree.verify().unwrap().is_empty());
        assert_eq!(tree.count().unwrap(), 0);
        assert_eq!(tree.height().unwrap(), 1);
    }

    #[test]
    fn split_with_one_long_key_among_many_short_ones() {
        let (_dir, mut pager) = open_pager();
        let mut tree = BTree::create(&mut pager).unwrap();
        for i in 0..60u32 {
            tree.insert(format!("s{i:02}").into_bytes(), vec![1]).unwrap();
        }
        let long_key = vec![b'x'; 1500];
        tree.insert(long_key.clone(), vec![2]).unwrap();
        assert!(tree.verify().unwrap().is_empty());
        assert_eq!(tree.search(&long_key).unwrap(), Some(vec![2]));
    }

    #[test]
    fn reopen_preserves_tree_via_root_page_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.mono");
        let root_id = {
            let mut pager = Pager::open(&path, PagerOptions::default()).unwrap();
            let mut tree = BTree::create(&mut pager).unwrap();
            for i in 0..40u32 {
                tree.insert(format!("a{i:03}").into_bytes(), vec![i as u8])
                    .unwrap();
            }
            let root_id = tree.root_page_id();
            pager.checkpoint().unwrap();
            root_id
        };

        let mut pager = Pager::open(&path, PagerOptions::default()).unwrap();
        let mut tree = BTree::open(&mut pager, root_id);
        assert_eq!(tree.count().unwrap(), 40);
        assert!(tree.verify().unwrap().is_empty());
    }
}
